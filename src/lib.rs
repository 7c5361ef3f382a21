//! smtp-gateway: an authenticated SMTP submission front door
//!
//! Accepts mail over SMTP (RFC 5321), requires STARTTLS + AUTH PLAIN
//! before any envelope is accepted, parses the submitted MIME message,
//! and hands each recipient off to an upstream email API. There is no
//! local queue and no local mailbox storage — a rejected submission is
//! rejected at the SMTP layer, not spooled for retry.
//!
//! # Modules
//!
//! - [`config`]: configuration loading and validation
//! - [`error`]: the crate's error taxonomy and SMTP reply mapping
//! - [`smtp`]: the line protocol, session state machine, and listener
//! - [`security`]: TLS, SASL credential decoding, and upstream auth
//! - [`mime`]: byte-oriented MIME parsing of submitted messages
//! - [`submit`]: fan-out to the upstream email delivery API
//! - [`metrics`]: in-process counters

pub mod config;
pub mod error;
pub mod metrics;
pub mod mime;
pub mod security;
pub mod smtp;
pub mod submit;

pub use config::Config;
pub use error::{MailError, Result};
