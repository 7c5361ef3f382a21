//! The SMTP submission listener: line protocol, state machine, STARTTLS,
//! AUTH, and `DATA` orchestration.

pub mod commands;
pub mod reply;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use server::SmtpServer;
pub use session::SmtpSession;
