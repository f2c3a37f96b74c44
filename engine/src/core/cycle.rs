//! Cycle monitors: detect a named sequence of movements recurring back to back.

use crate::core::piece::LoopMonitor;

/// A monitor reached its threshold after the most recent movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTrigger {
    /// Position of the monitor in the piece's `loop_monitors`.
    pub monitor: usize,
    pub occurrences: u32,
}

#[derive(Debug, Clone)]
struct MonitorState {
    cycle: Vec<String>,
    threshold: u32,
    occurrences: u32,
    /// History length at which the last counted occurrence ended.
    last_end: Option<usize>,
}

/// Tracks executed movements against every configured cycle.
#[derive(Debug, Clone)]
pub struct CycleDetector {
    history: Vec<String>,
    monitors: Vec<MonitorState>,
}

impl CycleDetector {
    pub fn new(monitors: &[LoopMonitor]) -> Self {
        Self {
            history: Vec::new(),
            monitors: monitors
                .iter()
                .map(|monitor| MonitorState {
                    cycle: monitor.cycle.clone(),
                    threshold: monitor.threshold,
                    occurrences: 0,
                    last_end: None,
                })
                .collect(),
        }
    }

    /// Record a completed movement. Returns the first monitor whose cycle has
    /// now recurred `threshold` times without interruption; that monitor's
    /// count starts over.
    pub fn record(&mut self, movement: &str) -> Option<CycleTrigger> {
        self.history.push(movement.to_string());
        let end = self.history.len();
        let mut trigger = None;

        for (index, monitor) in self.monitors.iter_mut().enumerate() {
            let len = monitor.cycle.len();
            if len == 0 || end < len || self.history[end - len..] != monitor.cycle[..] {
                continue;
            }
            monitor.occurrences = match monitor.last_end {
                Some(previous) if previous + len == end => monitor.occurrences + 1,
                _ => 1,
            };
            monitor.last_end = Some(end);

            if monitor.occurrences >= monitor.threshold {
                let occurrences = monitor.occurrences;
                monitor.occurrences = 0;
                monitor.last_end = None;
                if trigger.is_none() {
                    trigger = Some(CycleTrigger {
                        monitor: index,
                        occurrences,
                    });
                }
            }
        }
        trigger
    }
}
