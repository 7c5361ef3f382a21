//! Turns one parsed message into N per-recipient upstream HTTP calls.

pub mod client;

pub use client::{Submitter, SubmissionOutcome};
