//! Destination policy: which `host:port` pairs a session may connect to and
//! how many streams it may track at once.
//!
//! The policy layer is split into two types:
//!
//! - [`DestinationPolicy`]: a plain configuration struct holding the rules.
//! - [`PolicyEnforcer`]: the runtime counterpart, with the allowlist
//!   pre-computed for lookups.

use std::collections::HashSet;

/// Static destination access-control configuration.
///
/// # Destination Matching
///
/// | Pattern             | Matches                               |
/// |---------------------|---------------------------------------|
/// | `"*"`               | Any host and port (wildcard).         |
/// | `"example.com"`     | The exact hostname on **any** port.   |
/// | `"example.com:443"` | The exact hostname **and** port pair. |
///
/// An empty list means **no** destinations are allowed.
#[derive(Debug, Clone)]
pub struct DestinationPolicy {
    pub allowed_destinations: Vec<String>,
    /// Maximum number of Connecting + Active streams per session.
    pub max_streams: usize,
}

/// Default policy: allow all destinations, 256 streams per session.
impl Default for DestinationPolicy {
    fn default() -> Self {
        Self {
            allowed_destinations: vec!["*".to_string()],
            max_streams: 256,
        }
    }
}

/// Runtime policy checks for one stream manager.
#[derive(Debug)]
pub struct PolicyEnforcer {
    max_streams: usize,
    allowed_set: HashSet<String>,
    /// Fast-path flag: `true` when the wildcard `"*"` is present.
    allow_all: bool,
}

impl PolicyEnforcer {
    pub fn new(policy: &DestinationPolicy) -> Self {
        let allowed_set: HashSet<String> = policy
            .allowed_destinations
            .iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        Self {
            max_streams: policy.max_streams,
            allow_all: allowed_set.contains("*"),
            allowed_set,
        }
    }

    /// Check if a new stream to `host:port` is allowed while `tracked`
    /// streams already exist.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if the stream cap is reached or the
    /// destination is not in the allowlist.
    pub fn check_connect(&self, host: &str, port: u16, tracked: usize) -> Result<(), String> {
        if tracked >= self.max_streams {
            return Err(format!(
                "stream limit reached ({}/{})",
                tracked, self.max_streams
            ));
        }

        if self.allow_all {
            return Ok(());
        }

        let host = host.to_ascii_lowercase();
        let dest = format!("{host}:{port}");
        if self.allowed_set.contains(&dest) || self.allowed_set.contains(&host) {
            return Ok(());
        }

        Err(format!("destination not allowed: {host}:{port}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer(allowed: &[&str], max_streams: usize) -> PolicyEnforcer {
        PolicyEnforcer::new(&DestinationPolicy {
            allowed_destinations: allowed.iter().map(|s| s.to_string()).collect(),
            max_streams,
        })
    }

    #[test]
    fn test_allow_all() {
        let enforcer = PolicyEnforcer::new(&DestinationPolicy::default());
        assert!(enforcer.check_connect("example.com", 80, 0).is_ok());
        assert!(enforcer.check_connect("10.0.0.1", 443, 0).is_ok());
    }

    #[test]
    fn test_allow_specific() {
        let enforcer = enforcer(&["example.com", "db.internal:5432"], 10);
        assert!(enforcer.check_connect("example.com", 80, 0).is_ok());
        assert!(enforcer.check_connect("EXAMPLE.com", 8080, 0).is_ok());
        assert!(enforcer.check_connect("db.internal", 5432, 0).is_ok());
        assert!(enforcer.check_connect("db.internal", 22, 0).is_err());
        assert!(enforcer.check_connect("evil.com", 80, 0).is_err());
    }

    #[test]
    fn test_empty_allows_nothing() {
        let enforcer = enforcer(&[], 10);
        assert!(enforcer.check_connect("example.com", 80, 0).is_err());
    }

    #[test]
    fn test_stream_limit() {
        let enforcer = enforcer(&["*"], 2);
        assert!(enforcer.check_connect("example.com", 80, 1).is_ok());
        assert!(enforcer.check_connect("example.com", 80, 2).is_err());
    }
}
