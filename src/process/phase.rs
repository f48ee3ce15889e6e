//! Phase - one lifecycle action turned into addressed messages

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::topics::{names, TopicContext, TopicRegistry};
use crate::error::LabError;
use crate::interpreter::Interpreter;
use crate::watcher::EventKind;

pub const DEFAULT_MAXIMUM_MESSAGE_SIZE: usize = 100;

/// Measurement name used when a point does not carry one
const UNNAMED_MEASUREMENT: &str = "measurement";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    Initialise,
    Start,
    Measure,
    Stop,
}

impl PhaseKind {
    /// Watcher event this phase reacts to
    pub fn event(&self) -> EventKind {
        match self {
            PhaseKind::Initialise => EventKind::Initialise,
            PhaseKind::Start => EventKind::Start,
            PhaseKind::Measure => EventKind::Measurement,
            PhaseKind::Stop => EventKind::Stop,
        }
    }

    /// Topics this phase writes to
    pub fn topics(&self) -> &'static [&'static str] {
        match self {
            PhaseKind::Initialise => &[names::DETAILS],
            PhaseKind::Start => &[names::RUNNING, names::EXPERIMENT_START],
            PhaseKind::Measure => &[names::MEASUREMENT],
            PhaseKind::Stop => &[names::EXPERIMENT_STOP],
        }
    }
}

/// One addressed payload
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Value,
    pub retain: bool,
}

impl Message {
    pub fn retained(topic: String, payload: Value) -> Self {
        Self {
            topic,
            payload,
            retain: true,
        }
    }

    pub fn transient(topic: String, payload: Value) -> Self {
        Self {
            topic,
            payload,
            retain: false,
        }
    }
}

pub struct Phase {
    kind: PhaseKind,
    topics: Arc<TopicRegistry>,
    interpreter: Option<Arc<dyn Interpreter>>,
    maximum_message_size: usize,
}

impl Phase {
    pub fn new(kind: PhaseKind, topics: Arc<TopicRegistry>, interpreter: Option<Arc<dyn Interpreter>>) -> Self {
        Self {
            kind,
            topics,
            interpreter,
            maximum_message_size: DEFAULT_MAXIMUM_MESSAGE_SIZE,
        }
    }

    pub fn with_maximum_message_size(mut self, size: usize) -> Self {
        self.maximum_message_size = size.max(1);
        self
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    pub fn interpreter(&self) -> Option<&Arc<dyn Interpreter>> {
        self.interpreter.as_ref()
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    /// Turn one event payload into the messages to transmit, in order.
    pub fn update(&self, data: &Value) -> Result<Vec<Message>, LabError> {
        match self.kind {
            PhaseKind::Initialise => self.initialise(data),
            PhaseKind::Start => self.start(data),
            PhaseKind::Measure => self.measure(data),
            PhaseKind::Stop => self.stop(data),
        }
    }

    fn resolve(&self, name: &str, ctx: TopicContext<'_>) -> Result<String, LabError> {
        self.topics.resolve(name, &ctx)
    }

    fn initialise(&self, data: &Value) -> Result<Vec<Message>, LabError> {
        let topic = self.resolve(names::DETAILS, TopicContext::default())?;
        Ok(vec![Message::retained(topic, data.clone())])
    }

    fn start(&self, data: &Value) -> Result<Vec<Message>, LabError> {
        let payload = match &self.interpreter {
            Some(interpreter) => interpreter.metadata(data)?,
            None => data.clone(),
        };
        let experiment_id = payload
            .get("experiment_id")
            .and_then(Value::as_str)
            .ok_or_else(|| LabError::adapter_logic("start payload has no experiment_id"))?;
        let ctx = TopicContext::experiment(experiment_id);

        Ok(vec![
            Message::retained(self.resolve(names::RUNNING, ctx)?, Value::Bool(true)),
            Message::retained(self.resolve(names::EXPERIMENT_STOP, ctx)?, Value::Null),
            Message::retained(self.resolve(names::EXPERIMENT_START, ctx)?, payload.clone()),
        ])
    }

    fn stop(&self, data: &Value) -> Result<Vec<Message>, LabError> {
        let experiment_id = self
            .interpreter
            .as_ref()
            .and_then(|i| i.experiment_id())
            .or_else(|| data.get("experiment_id").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| LabError::adapter_logic("stop received without an active experiment"))?;
        let ctx = TopicContext::experiment(&experiment_id);

        let messages = vec![
            Message::retained(self.resolve(names::EXPERIMENT_STOP, ctx)?, data.clone()),
            Message::retained(self.resolve(names::RUNNING, ctx)?, Value::Bool(false)),
            Message::retained(self.resolve(names::EXPERIMENT_START, ctx)?, Value::Null),
        ];

        if let Some(interpreter) = &self.interpreter {
            interpreter.experiment_stop();
        }
        Ok(messages)
    }

    fn measure(&self, data: &Value) -> Result<Vec<Message>, LabError> {
        let interpreter = self
            .interpreter
            .as_ref()
            .ok_or_else(|| LabError::adapter_logic("measure phase has no interpreter"))?;
        let experiment_id = interpreter
            .experiment_id()
            .ok_or_else(|| LabError::adapter_logic("measurement received before experiment start"))?;

        let parsed = match interpreter.measurement(data)? {
            Some(Value::Array(entries)) if entries.is_empty() => None,
            other => other,
        };
        let Some(parsed) = parsed else {
            return Err(LabError::adapter_logic(
                "could not parse measurement, metadata may have been confused with measurement",
            ));
        };

        match parsed {
            Value::Array(entries) => {
                let mut messages = Vec::new();
                for (name, group) in group_by_measurement(entries) {
                    let topic = self.resolve(names::MEASUREMENT, TopicContext::measurement(&experiment_id, &name))?;
                    for chunk in group.chunks(self.maximum_message_size) {
                        messages.push(Message::transient(topic.clone(), Value::Array(chunk.to_vec())));
                    }
                }
                Ok(messages)
            }
            single => {
                let name = measurement_name(&single).to_string();
                let topic = self.resolve(names::MEASUREMENT, TopicContext::measurement(&experiment_id, &name))?;
                Ok(vec![Message::transient(topic, single)])
            }
        }
    }
}

fn measurement_name(entry: &Value) -> &str {
    entry
        .get("measurement")
        .and_then(Value::as_str)
        .unwrap_or(UNNAMED_MEASUREMENT)
}

/// Group entries by measurement name, keeping first-appearance order of
/// names and original order within each group.
fn group_by_measurement(entries: Vec<Value>) -> Vec<(String, Vec<Value>)> {
    let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        let name = measurement_name(&entry).to_string();
        match index.get(&name) {
            Some(&slot) => groups[slot].1.push(entry),
            None => {
                index.insert(name.clone(), groups.len());
                groups.push((name, vec![entry]));
            }
        }
    }
    groups
}
