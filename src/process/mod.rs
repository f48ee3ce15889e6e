//! Process - a group of phases sharing one output chain
//!
//! - Discrete: two or more phases, for instruments with explicit experiment boundaries
//! - Continuous: exactly one phase, for always-on measurement streams

pub mod phase;
pub mod topics;

pub use phase::{Message, Phase, PhaseKind, DEFAULT_MAXIMUM_MESSAGE_SIZE};
pub use topics::{InstanceIdentity, TopicContext, TopicRegistry};

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ErrorHolder, LabError};
use crate::output::OutputNode;
use crate::watcher::EventKind;

/// Pause between consecutive measurement batches
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessShape {
    Discrete,
    Continuous,
}

pub struct Process {
    shape: ProcessShape,
    phases: Vec<Phase>,
    output: Arc<OutputNode>,
    errors: Arc<ErrorHolder>,
    batch_pause: Duration,
}

impl Process {
    pub fn discrete(phases: Vec<Phase>, output: Arc<OutputNode>, errors: Arc<ErrorHolder>) -> Result<Self, LabError> {
        if phases.len() < 2 {
            return Err(LabError::adapter_build(format!(
                "a discrete process needs at least 2 phases, got {}",
                phases.len()
            )));
        }
        Ok(Self::build(ProcessShape::Discrete, phases, output, errors))
    }

    pub fn continuous(phases: Vec<Phase>, output: Arc<OutputNode>, errors: Arc<ErrorHolder>) -> Result<Self, LabError> {
        if phases.len() != 1 {
            return Err(LabError::adapter_build(format!(
                "a continuous process takes exactly 1 phase, got {}",
                phases.len()
            )));
        }
        Ok(Self::build(ProcessShape::Continuous, phases, output, errors))
    }

    fn build(shape: ProcessShape, phases: Vec<Phase>, output: Arc<OutputNode>, errors: Arc<ErrorHolder>) -> Self {
        Self {
            shape,
            phases,
            output,
            errors,
            batch_pause: DEFAULT_BATCH_PAUSE,
        }
    }

    pub fn with_batch_pause(mut self, pause: Duration) -> Self {
        self.batch_pause = pause;
        self
    }

    pub fn shape(&self) -> ProcessShape {
        self.shape
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn handles(&self, kind: EventKind) -> bool {
        self.phases.iter().any(|p| p.kind().event() == kind)
    }

    /// Run `data` through every phase bound to `kind` and transmit the result.
    ///
    /// Failures go to the error holder; returns whether every message went out.
    pub fn process_input(&self, kind: EventKind, data: &Value) -> bool {
        let mut delivered = true;

        for phase in self.phases.iter().filter(|p| p.kind().event() == kind) {
            let messages = match phase.update(data) {
                Ok(messages) => messages,
                Err(e) => {
                    self.errors.add_error(e);
                    delivered = false;
                    continue;
                }
            };

            let batched = phase.kind() == PhaseKind::Measure;
            for (idx, message) in messages.iter().enumerate() {
                if batched && idx > 0 && !self.batch_pause.is_zero() {
                    std::thread::sleep(self.batch_pause);
                }
                if !self.output.transmit(&message.topic, &message.payload, message.retain) {
                    warn!(topic = %message.topic, "Message not delivered");
                    delivered = false;
                }
            }
        }

        delivered
    }

    /// Clear the retained topics this process wrote.
    ///
    /// Experiment-scoped topics are only cleared while an experiment is active.
    pub fn stop(&self) {
        for phase in &self.phases {
            let experiment_id = phase.interpreter().and_then(|i| i.experiment_id());
            let ctx = TopicContext {
                experiment_id: experiment_id.as_deref(),
                measurement: None,
            };

            for name in phase.kind().topics() {
                if !phase.topics().is_clearable(name) {
                    continue;
                }
                match phase.topics().resolve(name, &ctx) {
                    Ok(topic) => {
                        self.output.flush(&topic);
                    }
                    Err(e) => debug!(topic = %name, error = %e, "Skipping flush"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::interpreter::{Interpreter, Passthrough};
    use crate::output::sinks::MemorySink;
    use serde_json::json;

    struct Fixture {
        topics: Arc<TopicRegistry>,
        interpreter: Arc<Passthrough>,
        sink: Arc<MemorySink>,
        output: Arc<OutputNode>,
        errors: Arc<ErrorHolder>,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(MemorySink::new("memory", 1000));
        Fixture {
            topics: Arc::new(TopicRegistry::standard(&InstanceIdentity::new("lab", "reader", "r1"))),
            interpreter: Arc::new(Passthrough::new("od")),
            output: Arc::new(OutputNode::new(sink.clone())),
            sink,
            errors: Arc::new(ErrorHolder::new()),
        }
    }

    impl Fixture {
        fn phase(&self, kind: PhaseKind) -> Phase {
            let interpreter: Arc<dyn Interpreter> = self.interpreter.clone();
            Phase::new(kind, self.topics.clone(), Some(interpreter))
        }
    }

    #[test]
    fn test_cardinality_checks() {
        let f = fixture();
        let err = Process::discrete(vec![f.phase(PhaseKind::Start)], f.output.clone(), f.errors.clone())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::AdapterBuild);

        let two = vec![f.phase(PhaseKind::Measure), f.phase(PhaseKind::Initialise)];
        assert!(Process::continuous(two, f.output.clone(), f.errors.clone()).is_err());
        assert!(Process::continuous(vec![], f.output.clone(), f.errors.clone()).is_err());

        // errors are raised, never routed through the holder
        assert!(f.errors.is_empty());
    }

    #[test]
    fn test_process_input_routes_by_kind() {
        let f = fixture();
        let process = Process::discrete(
            vec![f.phase(PhaseKind::Start), f.phase(PhaseKind::Stop)],
            f.output.clone(),
            f.errors.clone(),
        )
        .unwrap();

        assert!(process.handles(EventKind::Start));
        assert!(!process.handles(EventKind::Measurement));

        assert!(process.process_input(EventKind::Start, &Value::Null));
        assert_eq!(f.sink.len(), 3);

        // nothing bound to measurement: no output, no error
        assert!(process.process_input(EventKind::Measurement, &json!("1")));
        assert_eq!(f.sink.len(), 3);
    }

    #[test]
    fn test_phase_failure_goes_to_holder() {
        let f = fixture();
        let process = Process::discrete(
            vec![f.phase(PhaseKind::Start), f.phase(PhaseKind::Measure)],
            f.output.clone(),
            f.errors.clone(),
        )
        .unwrap();

        assert!(!process.process_input(EventKind::Measurement, &json!("1")));
        assert!(f.sink.is_empty());
        assert_eq!(f.errors.get_unseen_errors()[0].0.kind(), ErrorKind::AdapterLogic);
    }

    #[test]
    fn test_batches_are_transmitted_separately() {
        let f = fixture();
        let process = Process::discrete(
            vec![
                f.phase(PhaseKind::Start),
                f.phase(PhaseKind::Measure).with_maximum_message_size(100),
            ],
            f.output.clone(),
            f.errors.clone(),
        )
        .unwrap()
        .with_batch_pause(Duration::from_millis(1));

        process.process_input(EventKind::Start, &Value::Null);
        let before = f.sink.len();

        let rows: Vec<Value> = (0..250).map(|i| json!({"value": i})).collect();
        assert!(process.process_input(EventKind::Measurement, &Value::Array(rows)));

        let sizes: Vec<usize> = f.sink.snapshot()[before..]
            .iter()
            .map(|m| m.payload.as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn test_stop_flushes_clearable_topics() {
        let f = fixture();
        let process = Process::discrete(
            vec![f.phase(PhaseKind::Start), f.phase(PhaseKind::Measure)],
            f.output.clone(),
            f.errors.clone(),
        )
        .unwrap();

        process.process_input(EventKind::Start, &Value::Null);
        let id = f.interpreter.experiment_id().unwrap();
        let before = f.sink.len();

        process.stop();

        let flushed: Vec<String> = f.sink.snapshot()[before..].iter().map(|m| m.topic.clone()).collect();
        assert_eq!(
            flushed,
            vec![
                "lab/reader/r1/running".to_string(),
                format!("lab/reader/r1/experiment/{}/start", id),
            ]
        );
        assert!(f.sink.snapshot()[before..].iter().all(|m| m.payload.is_null() && m.retain));
    }
}
