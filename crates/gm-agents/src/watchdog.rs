//! Detection of host resource exhaustion in agent output.

use std::collections::HashMap;

/// Substrings (matched case-insensitively) that indicate the host, not the
/// agent, is in trouble.
pub const RESOURCE_ERROR_PATTERNS: &[&str] = &[
    "no space left on device",
    "enospc",
    "disk quota exceeded",
    "cannot allocate memory",
    "oserror: [errno 28]",
];

pub const DEFAULT_STRIKE_THRESHOLD: u32 = 2;

/// A pattern that has crossed the strike threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStrike {
    pub pattern: &'static str,
    pub count: u32,
}

impl ResourceStrike {
    pub fn describe(&self) -> String {
        format!("'{}' occurred {} times", self.pattern, self.count)
    }
}

/// Per-session strike counter. One instance per supervised subprocess.
#[derive(Debug, Clone)]
pub struct ResourceWatchdog {
    threshold: u32,
    counts: HashMap<&'static str, u32>,
}

impl Default for ResourceWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_STRIKE_THRESHOLD)
    }
}

impl ResourceWatchdog {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: HashMap::new(),
        }
    }

    /// Feed one output line. Returns the strike the first time any pattern
    /// reaches the threshold.
    pub fn observe(&mut self, line: &str) -> Option<ResourceStrike> {
        let lower = line.to_ascii_lowercase();
        for pattern in RESOURCE_ERROR_PATTERNS {
            if lower.contains(pattern) {
                let count = self.counts.entry(pattern).or_insert(0);
                *count += 1;
                if *count == self.threshold {
                    return Some(ResourceStrike {
                        pattern,
                        count: *count,
                    });
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_occurrence_does_not_trip() {
        let mut watchdog = ResourceWatchdog::default();
        assert!(watchdog
            .observe("write failed: No space left on device")
            .is_none());
    }

    #[test]
    fn second_occurrence_of_same_pattern_trips() {
        let mut watchdog = ResourceWatchdog::default();
        assert!(watchdog.observe("ENOSPC while writing blob").is_none());
        let strike = watchdog
            .observe("error: ENOSPC again")
            .expect("second strike should trip");
        assert_eq!(strike.pattern, "enospc");
        assert_eq!(strike.count, 2);
    }

    #[test]
    fn distinct_patterns_count_separately() {
        let mut watchdog = ResourceWatchdog::default();
        assert!(watchdog.observe("No space left on device").is_none());
        assert!(watchdog.observe("cannot allocate memory").is_none());
        assert!(watchdog.observe("cannot allocate memory").is_some());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let mut watchdog = ResourceWatchdog::default();
        assert!(watchdog.observe("NO SPACE LEFT ON DEVICE").is_none());
        assert!(watchdog.observe("no space left on device").is_some());
    }

    #[test]
    fn trip_fires_only_once_per_pattern() {
        let mut watchdog = ResourceWatchdog::default();
        assert!(watchdog.observe("disk quota exceeded").is_none());
        assert!(watchdog.observe("disk quota exceeded").is_some());
        assert!(watchdog.observe("disk quota exceeded").is_none());
    }

    #[test]
    fn ordinary_output_never_trips() {
        let mut watchdog = ResourceWatchdog::default();
        for _ in 0..10 {
            assert!(watchdog.observe("compiling gm-core v0.1.0").is_none());
        }
    }
}
