//! Consecutive re-entry detection.

use serde::{Deserialize, Serialize};

/// Thresholds for back-to-back executions of one movement. Zero disables a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopThresholds {
    /// Warn once a movement is entered more than this many times in a row.
    pub warn_threshold: u32,
    /// Abort once a movement is entered more than this many times in a row.
    pub abort_threshold: u32,
}

impl Default for LoopThresholds {
    fn default() -> Self {
        Self {
            warn_threshold: 5,
            abort_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCheck {
    Ok,
    Warn { count: u32 },
    Abort { count: u32 },
}

#[derive(Debug, Clone)]
pub struct LoopDetector {
    thresholds: LoopThresholds,
    last: Option<String>,
    consecutive: u32,
}

impl LoopDetector {
    pub fn new(thresholds: LoopThresholds) -> Self {
        Self {
            thresholds,
            last: None,
            consecutive: 0,
        }
    }

    /// Record that `movement` is about to run and classify the streak.
    pub fn check(&mut self, movement: &str) -> LoopCheck {
        if self.last.as_deref() == Some(movement) {
            self.consecutive += 1;
        } else {
            self.last = Some(movement.to_string());
            self.consecutive = 1;
        }

        let count = self.consecutive;
        let LoopThresholds {
            warn_threshold,
            abort_threshold,
        } = self.thresholds;
        if abort_threshold > 0 && count > abort_threshold {
            LoopCheck::Abort { count }
        } else if warn_threshold > 0 && count > warn_threshold {
            LoopCheck::Warn { count }
        } else {
            LoopCheck::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(warn: u32, abort: u32) -> LoopDetector {
        LoopDetector::new(LoopThresholds {
            warn_threshold: warn,
            abort_threshold: abort,
        })
    }

    #[test]
    fn streak_warns_then_aborts() {
        let mut detector = detector(1, 3);
        assert_eq!(detector.check("fix"), LoopCheck::Ok);
        assert_eq!(detector.check("fix"), LoopCheck::Warn { count: 2 });
        assert_eq!(detector.check("fix"), LoopCheck::Warn { count: 3 });
        assert_eq!(detector.check("fix"), LoopCheck::Abort { count: 4 });
    }

    #[test]
    fn switching_movement_resets_streak() {
        let mut detector = detector(1, 2);
        detector.check("fix");
        detector.check("fix");
        assert_eq!(detector.check("review"), LoopCheck::Ok);
        assert_eq!(detector.check("fix"), LoopCheck::Ok);
        assert_eq!(detector.check("fix"), LoopCheck::Warn { count: 2 });
    }

    #[test]
    fn zero_thresholds_disable_checks() {
        let mut detector = detector(0, 0);
        for _ in 0..50 {
            assert_eq!(detector.check("fix"), LoopCheck::Ok);
        }
    }
}
