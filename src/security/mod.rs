//! TLS, SASL credential decoding, and upstream credential validation.

pub mod dev_cert;
pub mod tls;
pub mod validator;

pub use tls::TlsConfig;
pub use validator::{decode_plain_auth, AuthMechanism, CredentialValidator};
