//! Logging setup and log-safe rendering of key material.
//!
//! Secret keys must never reach a log line. Public keys are logged only as a
//! short fingerprint produced by [`fingerprint`].

use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

/// Short, log-safe fingerprint of a public key: the first 8 bytes of its
/// SHA-256 digest, hex encoded.
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}

/// Map a `-v` count to a default filter directive.
pub fn filter_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install a global `fmt` subscriber writing to stderr.
///
/// `RUST_LOG` wins over the verbosity-derived default. Calling this twice is
/// harmless: the second install is ignored.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_verbosity(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
