//! Pool sizing.

use serde::Deserialize;

/// Limits of one worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// Workers kept alive when idle.
    #[serde(default)]
    pub min_workers: usize,
    /// Upper bound on live workers; `0` means unbounded.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// How long a borrower waits for a free worker; `0` waits forever.
    #[serde(default)]
    pub wait_timeout_ms: u64,
}

fn default_max_workers() -> usize {
    8
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 0,
            max_workers: default_max_workers(),
            wait_timeout_ms: 0,
        }
    }
}

impl PoolConfig {
    /// Returns true if `total` live workers leave room for another.
    #[must_use]
    pub fn has_room(&self, total: usize) -> bool {
        self.max_workers == 0 || total < self.max_workers
    }

    /// Returns true if `total` live workers is more than allowed.
    #[must_use]
    pub fn is_over(&self, total: usize) -> bool {
        self.max_workers != 0 && total > self.max_workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_max_is_unbounded() {
        let config = PoolConfig {
            max_workers: 0,
            ..PoolConfig::default()
        };
        assert!(config.has_room(10_000));
        assert!(!config.is_over(10_000));
    }

    #[test]
    fn bounded_room() {
        let config = PoolConfig::default();
        assert!(config.has_room(7));
        assert!(!config.has_room(8));
        assert!(config.is_over(9));
    }
}
