//! Parses a raw SMTP `DATA` byte blob into a structured message.

pub mod parser;
pub mod types;

pub use parser::MimeParser;
pub use types::{Attachment, ParsedMessage};
