//! Generates a self-signed certificate/key pair for local STARTTLS testing.
//!
//! ```text
//! gen-dev-cert [domain] [cert-path] [key-path]
//! ```
//! Defaults to `localhost`, `dev-cert.pem`, `dev-key.pem`.

use smtp_gateway::security::dev_cert::generate_self_signed_cert;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let domain = args.get(1).map(String::as_str).unwrap_or("localhost");
    let cert_path = args.get(2).map(String::as_str).unwrap_or("dev-cert.pem");
    let key_path = args.get(3).map(String::as_str).unwrap_or("dev-key.pem");

    if let Err(e) = generate_self_signed_cert(domain, cert_path, key_path) {
        eprintln!("failed to generate certificate: {}", e);
        std::process::exit(1);
    }

    println!("wrote {} and {}", cert_path, key_path);
}
