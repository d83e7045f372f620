//! Training event observers.
//!
//! The trainer reports progress through a [`TrainingObserver`] handed to it
//! at construction instead of logging directly, so callers decide where the
//! events go. [`TracingObserver`] forwards them to `tracing`;
//! [`RecordingObserver`] keeps them in memory.

use std::sync::{Arc, Mutex};

use classifier_core::{PassMetrics, TrainingPhase};
use tracing::info;

/// Receives progress events from the trainer. Every method defaults to a no-op.
pub trait TrainingObserver: Send {
    fn on_phase_start(&mut self, _phase: TrainingPhase, _passes: usize, _samples: usize) {}

    /// The phase's pixel scaler was fitted to `[min, max]`
    fn on_scaler_fitted(&mut self, _phase: TrainingPhase, _min: u8, _max: u8) {}

    /// Loss of the batch that completed `iteration`, every score interval
    fn on_iteration(&mut self, _phase: TrainingPhase, _iteration: usize, _loss: f64) {}

    fn on_pass_end(&mut self, _metrics: &PassMetrics) {}

    fn on_phase_end(&mut self, _phase: TrainingPhase) {}
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TrainingObserver for NoopObserver {}

/// Logs events with `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TrainingObserver for TracingObserver {
    fn on_phase_start(&mut self, phase: TrainingPhase, passes: usize, samples: usize) {
        info!("Starting {}: {} passes over {} samples", phase, passes, samples);
    }

    fn on_scaler_fitted(&mut self, phase: TrainingPhase, min: u8, max: u8) {
        info!("{}: pixel scaler fitted to [{}, {}]", phase, min, max);
    }

    fn on_iteration(&mut self, _phase: TrainingPhase, iteration: usize, loss: f64) {
        info!("Score at iteration {} is {:.6}", iteration, loss);
    }

    fn on_pass_end(&mut self, metrics: &PassMetrics) {
        info!(
            "{} pass {}: loss={:.4}, acc={:.2}%",
            metrics.phase,
            metrics.pass,
            metrics.mean_loss,
            100.0 * metrics.accuracy
        );
    }

    fn on_phase_end(&mut self, phase: TrainingPhase) {
        info!("Finished {}", phase);
    }
}

/// A single observed event
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    PhaseStart {
        phase: TrainingPhase,
        passes: usize,
        samples: usize,
    },
    ScalerFitted {
        phase: TrainingPhase,
        min: u8,
        max: u8,
    },
    Iteration {
        phase: TrainingPhase,
        iteration: usize,
        loss: f64,
    },
    PassEnd(PassMetrics),
    PhaseEnd(TrainingPhase),
}

/// Stores events in a shared buffer; clones see the same events.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<TrainingEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far
    pub fn events(&self) -> Vec<TrainingEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn push(&self, event: TrainingEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl TrainingObserver for RecordingObserver {
    fn on_phase_start(&mut self, phase: TrainingPhase, passes: usize, samples: usize) {
        self.push(TrainingEvent::PhaseStart {
            phase,
            passes,
            samples,
        });
    }

    fn on_scaler_fitted(&mut self, phase: TrainingPhase, min: u8, max: u8) {
        self.push(TrainingEvent::ScalerFitted { phase, min, max });
    }

    fn on_iteration(&mut self, phase: TrainingPhase, iteration: usize, loss: f64) {
        self.push(TrainingEvent::Iteration {
            phase,
            iteration,
            loss,
        });
    }

    fn on_pass_end(&mut self, metrics: &PassMetrics) {
        self.push(TrainingEvent::PassEnd(*metrics));
    }

    fn on_phase_end(&mut self, phase: TrainingPhase) {
        self.push(TrainingEvent::PhaseEnd(phase));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_shares_buffer() {
        let recorder = RecordingObserver::new();
        let mut handle: Box<dyn TrainingObserver> = Box::new(recorder.clone());

        handle.on_phase_start(TrainingPhase::WarmupTraining, 100, 80);
        handle.on_phase_end(TrainingPhase::WarmupTraining);

        assert_eq!(
            recorder.events(),
            vec![
                TrainingEvent::PhaseStart {
                    phase: TrainingPhase::WarmupTraining,
                    passes: 100,
                    samples: 80
                },
                TrainingEvent::PhaseEnd(TrainingPhase::WarmupTraining),
            ]
        );
    }

    #[test]
    fn test_noop_observer() {
        let mut observer = NoopObserver;
        observer.on_iteration(TrainingPhase::AugmentedTraining, 100, 0.5);
    }
}
