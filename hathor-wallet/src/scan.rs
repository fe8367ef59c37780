//! Address scanning policies: how many addresses the wallet keeps derived
//! ahead of use, and when to demand more.

use serde::{Deserialize, Serialize};

use hathor_common::constants::DEFAULT_GAP_LIMIT;

/// A request to derive and load `count` addresses starting at `next_index`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ScanRequest {
    pub next_index: u32,
    pub count: u32,
}

/// The two address-window policies.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ScanPolicy {
    /// Keep `gap` consecutive unused addresses ahead of the highest used
    /// index: the window must contain `[0, highest_used + gap]`.
    GapLimit { gap: u32 },
    /// The window is exactly `[start, end]`. It only ever grows, and only
    /// by explicit request.
    IndexLimit { start: u32, end: u32 },
}

impl Default for ScanPolicy {
    fn default() -> Self {
        ScanPolicy::GapLimit {
            gap: DEFAULT_GAP_LIMIT,
        }
    }
}

impl ScanPolicy {
    pub fn is_gap_limit(&self) -> bool {
        matches!(self, ScanPolicy::GapLimit { .. })
    }

    /// The highest address index this policy currently requires to exist,
    /// given the highest index with any transactions (`None` = no address
    /// used yet).
    fn required_top(&self, highest_used: Option<u32>) -> u32 {
        match self {
            // With no used address the window is the first `gap` addresses.
            ScanPolicy::GapLimit { gap } => match highest_used {
                Some(used) => used + gap,
                None => gap.saturating_sub(1),
            },
            ScanPolicy::IndexLimit { end, .. } => *end,
        }
    }

    /// What to load so the window is satisfied from the current persisted
    /// state. `loaded_count` is the number of derived addresses (highest
    /// index + 1). Returns `None` when the window is already satisfied.
    pub fn start_addresses(
        &self,
        loaded_count: u32,
        highest_used: Option<u32>,
    ) -> Option<ScanRequest> {
        let next_index = match self {
            ScanPolicy::GapLimit { .. } => loaded_count,
            ScanPolicy::IndexLimit { start, .. } => {
                loaded_count.max(*start)
            }
        };
        let required_top = self.required_top(highest_used);
        if next_index > required_top {
            return None;
        }
        Some(ScanRequest {
            next_index,
            count: required_top - next_index + 1,
        })
    }

    /// Re-check the window after an ingestion may have moved
    /// `highest_used`. Index-limit windows never move on their own.
    pub fn check_after_ingestion(
        &self,
        loaded_count: u32,
        highest_used: Option<u32>,
    ) -> Option<ScanRequest> {
        match self {
            ScanPolicy::GapLimit { .. } =>
                self.start_addresses(loaded_count, highest_used),
            ScanPolicy::IndexLimit { .. } => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_gap_limit_loads_first_window() {
        let policy = ScanPolicy::GapLimit { gap: 20 };
        assert_eq!(
            policy.start_addresses(0, None),
            Some(ScanRequest {
                next_index: 0,
                count: 20
            })
        );
    }

    #[test]
    fn satisfied_gap_limit_loads_nothing() {
        let policy = ScanPolicy::GapLimit { gap: 20 };
        assert_eq!(policy.start_addresses(20, None), None);
        // Index 0 used: window must now reach 20, so one more address.
        assert_eq!(
            policy.check_after_ingestion(20, Some(0)),
            Some(ScanRequest {
                next_index: 20,
                count: 1
            })
        );
    }

    #[test]
    fn gap_limit_closure() {
        // After any ingestion, max_index_in_store >= highest_used + gap.
        let policy = ScanPolicy::GapLimit { gap: 5 };
        let mut loaded = 0u32;
        for highest_used in [None, Some(0), Some(3), Some(7), Some(7)] {
            if let Some(request) =
                policy.check_after_ingestion(loaded, highest_used)
            {
                assert_eq!(request.next_index, loaded);
                loaded += request.count;
            }
            if let Some(used) = highest_used {
                assert!(loaded - 1 >= used + 5);
            }
            assert_eq!(policy.check_after_ingestion(loaded, highest_used), None);
        }
    }

    #[test]
    fn index_limit_window_is_exact() {
        let policy = ScanPolicy::IndexLimit { start: 0, end: 9 };
        assert_eq!(
            policy.start_addresses(0, None),
            Some(ScanRequest {
                next_index: 0,
                count: 10
            })
        );
        // Usage never grows the window.
        assert_eq!(policy.check_after_ingestion(10, Some(9)), None);
    }

    #[test]
    fn index_limit_resumes_partially_loaded_window() {
        let policy = ScanPolicy::IndexLimit { start: 0, end: 9 };
        assert_eq!(
            policy.start_addresses(4, None),
            Some(ScanRequest {
                next_index: 4,
                count: 6
            })
        );
        assert_eq!(policy.start_addresses(10, Some(2)), None);
    }
}
