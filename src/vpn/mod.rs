//! Route steering around the tunnel
//!
//! - `gateway`: flips the default route and guards the remote host route
//! - `blacklist`: protected subnets that always go via the original gateway

pub mod blacklist;
pub mod gateway;

pub use blacklist::BlacklistRouter;
pub use gateway::GatewaySwitcher;

use std::fmt;

/// Completion count of a best-effort batch of route operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub applied: usize,
    pub failed: usize,
}

impl Tally {
    pub fn record<T, E>(&mut self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.applied += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.applied + self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.applied, self.total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_record_and_display() {
        let mut tally = Tally::default();
        tally.record::<(), &str>(&Ok(()));
        tally.record::<(), &str>(&Err("boom"));
        tally.record::<(), &str>(&Ok(()));

        assert_eq!(tally.applied, 2);
        assert_eq!(tally.failed, 1);
        assert!(!tally.is_complete());
        assert_eq!(tally.to_string(), "2/3");
    }
}
