//! Ordered step accumulation for the in-flight turn.

use crate::{StepRecord, Trace};

/// Outcome of feeding one step into the accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccumulatorEvent {
    /// Step appended; the turn is still running.
    Appended { step_number: u64, sequence_gap: bool },
    /// Step appended and it carried the turn's final output.
    Completed { output: String, sequence_gap: bool },
    /// Step appended after the turn had already completed.
    AfterCompletion { step_number: u64 },
    /// No turn is armed; the step was dropped.
    Stale { step_number: u64 },
}

/// Protocol anomalies observed since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceDiagnostics {
    pub sequence_gaps: u32,
    pub after_completion: u32,
    pub stale_dropped: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Collecting,
    Completed,
}

/// Builds the trace for one turn from `step_update` messages.
///
/// Delivery is assumed to be in order; the accumulator never reorders,
/// it only flags a step whose number is not `previous + 1`.
#[derive(Debug)]
pub struct StepAccumulator {
    trace: Trace,
    phase: Phase,
    last_step: Option<u64>,
    sequence_gap: bool,
    diagnostics: TraceDiagnostics,
}

impl Default for StepAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StepAccumulator {
    /// Create an unarmed accumulator. Steps are dropped until `reset()`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            trace: Trace::new(),
            phase: Phase::Idle,
            last_step: None,
            sequence_gap: false,
            diagnostics: TraceDiagnostics {
                sequence_gaps: 0,
                after_completion: 0,
                stale_dropped: 0,
            },
        }
    }

    /// Clear the trace and arm for a new turn.
    pub fn reset(&mut self) {
        self.trace.clear();
        self.phase = Phase::Collecting;
        self.last_step = None;
        self.sequence_gap = false;
        self.diagnostics = TraceDiagnostics::default();
    }

    /// Stop accepting steps until the next `reset()`. The trace is kept.
    pub fn disarm(&mut self) {
        self.phase = Phase::Idle;
    }

    /// Feed one step.
    pub fn on_step(&mut self, step: StepRecord) -> AccumulatorEvent {
        let step_number = step.step_number;

        if self.phase == Phase::Idle {
            self.diagnostics.stale_dropped += 1;
            tracing::debug!(step_number, "dropping step outside of a turn");
            return AccumulatorEvent::Stale { step_number };
        }

        let expected = self.last_step.map_or(1, |n| n + 1);
        let sequence_gap = step_number != expected;
        if sequence_gap {
            self.sequence_gap = true;
            self.diagnostics.sequence_gaps += 1;
            tracing::warn!(expected, received = step_number, "step sequence gap");
        }
        self.last_step = Some(step_number);

        let output = step.final_output().map(str::to_owned);
        self.trace.push(step);

        match (self.phase, output) {
            (Phase::Completed, _) => {
                self.diagnostics.after_completion += 1;
                AccumulatorEvent::AfterCompletion { step_number }
            }
            (_, Some(output)) => {
                self.phase = Phase::Completed;
                AccumulatorEvent::Completed {
                    output,
                    sequence_gap,
                }
            }
            (_, None) => AccumulatorEvent::Appended {
                step_number,
                sequence_gap,
            },
        }
    }

    #[must_use]
    pub const fn trace(&self) -> &Trace {
        &self.trace
    }

    /// True once a step with a final output has been seen this turn.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.phase == Phase::Completed
    }

    /// True between `reset()` and `disarm()`.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.phase != Phase::Idle
    }

    #[must_use]
    pub const fn has_sequence_gap(&self) -> bool {
        self.sequence_gap
    }

    #[must_use]
    pub const fn diagnostics(&self) -> TraceDiagnostics {
        self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: u64) -> StepRecord {
        #[allow(clippy::cast_precision_loss)]
        let t = n as f64;
        StepRecord::new(n, t, t + 0.5)
    }

    #[test]
    fn test_in_order_steps_build_trace() {
        let mut acc = StepAccumulator::new();
        acc.reset();

        for n in 1..=4 {
            let event = acc.on_step(step(n));
            assert_eq!(
                event,
                AccumulatorEvent::Appended {
                    step_number: n,
                    sequence_gap: false
                }
            );
        }
        let event = acc.on_step(step(5).with_action_output("Summary: ok"));
        assert_eq!(
            event,
            AccumulatorEvent::Completed {
                output: "Summary: ok".into(),
                sequence_gap: false
            }
        );

        assert_eq!(acc.trace().step_numbers(), vec![1, 2, 3, 4, 5]);
        assert!(acc.is_completed());
        assert!(!acc.has_sequence_gap());
    }

    #[test]
    fn test_empty_action_output_does_not_complete() {
        let mut acc = StepAccumulator::new();
        acc.reset();
        let event = acc.on_step(step(1).with_action_output(""));
        assert!(matches!(event, AccumulatorEvent::Appended { .. }));
        assert!(!acc.is_completed());
    }

    #[test]
    fn test_steps_after_completion_are_flagged() {
        let mut acc = StepAccumulator::new();
        acc.reset();
        acc.on_step(step(1).with_action_output("done"));

        let event = acc.on_step(step(2).with_action_output("done again"));
        assert_eq!(event, AccumulatorEvent::AfterCompletion { step_number: 2 });
        assert_eq!(acc.trace().len(), 2);
        assert_eq!(acc.diagnostics().after_completion, 1);
    }

    #[test]
    fn test_sequence_gap_is_recorded() {
        let mut acc = StepAccumulator::new();
        acc.reset();
        acc.on_step(step(1));
        let event = acc.on_step(step(3));
        assert_eq!(
            event,
            AccumulatorEvent::Appended {
                step_number: 3,
                sequence_gap: true
            }
        );
        assert!(acc.has_sequence_gap());
        assert_eq!(acc.trace().step_numbers(), vec![1, 3]);
    }

    #[test]
    fn test_first_step_must_be_one() {
        let mut acc = StepAccumulator::new();
        acc.reset();
        let event = acc.on_step(step(2));
        assert!(matches!(
            event,
            AccumulatorEvent::Appended {
                sequence_gap: true,
                ..
            }
        ));
    }

    #[test]
    fn test_unarmed_accumulator_drops_steps() {
        let mut acc = StepAccumulator::new();
        assert_eq!(acc.on_step(step(1)), AccumulatorEvent::Stale { step_number: 1 });
        assert!(acc.trace().is_empty());
        assert_eq!(acc.diagnostics().stale_dropped, 1);
    }

    #[test]
    fn test_reset_discards_previous_turn() {
        let mut acc = StepAccumulator::new();
        acc.reset();
        acc.on_step(step(1));
        acc.on_step(step(2));
        acc.disarm();

        // Late steps from the abandoned turn.
        acc.on_step(step(3));
        acc.on_step(step(4));
        assert_eq!(acc.trace().step_numbers(), vec![1, 2]);

        acc.reset();
        assert!(acc.trace().is_empty());
        acc.on_step(step(1));
        assert_eq!(acc.trace().step_numbers(), vec![1]);
        assert!(!acc.has_sequence_gap());
    }
}
