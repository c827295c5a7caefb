//! A node-local PMIx exchange engine: clients publish per-process
//! key/value data to their launch daemon over a Unix stream socket,
//! barrier through data-collecting fences, look up published service
//! endpoints and spawn new work, all over a tagged request/response
//! protocol with a self-describing wire codec.

pub mod client;
pub mod codec;
pub mod event;
pub mod logging;
pub mod server;
pub mod status;
pub mod types;
pub mod usock;

pub use crate::client::{Client, ClientConfig};
pub use crate::server::{SelfHost, Server, ServerConfig};
pub use crate::status::{PmixResult, Status};
pub use crate::types::{Info, Kval, Persistence, Range, Scope, Value};

/// Protocol version spoken by this implementation. Only the first two
/// dotted components participate in handshake compatibility checks.
pub const VERSION: &str = "1.0.0";

/// Compares the major.minor prefix of two dotted version strings.
pub fn version_matches(a: &str, b: &str) -> bool {
    fn major_minor(version: &str) -> &str {
        match version.match_indices('.').nth(1) {
            Some((idx, _)) => &version[..idx],
            None => version,
        }
    }
    major_minor(a) == major_minor(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_major_minor_comparison() {
        assert!(version_matches("1.0.0", "1.0.5"));
        assert!(version_matches("1.0", "1.0.17"));
        assert!(!version_matches("1.1.0", "1.0.0"));
        assert!(!version_matches("2.0.0", "1.0.0"));
    }
}
