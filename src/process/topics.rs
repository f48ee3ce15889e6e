//! Topic registry - symbolic topic names mapped to rendering functions

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::LabError;

/// Symbolic names of the standard topics
pub mod names {
    pub const DETAILS: &str = "details";
    pub const EXPERIMENT_START: &str = "experiment.start";
    pub const EXPERIMENT_STOP: &str = "experiment.stop";
    pub const RUNNING: &str = "running";
    pub const MEASUREMENT: &str = "experiment.measurement";
    pub const ERROR: &str = "error";
}

/// Who an instrument instance is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub institute: String,
    pub equipment_id: String,
    pub instance_id: String,
}

impl InstanceIdentity {
    pub fn new(
        institute: impl Into<String>,
        equipment_id: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            institute: institute.into(),
            equipment_id: equipment_id.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn base_topic(&self) -> String {
        format!("{}/{}/{}", self.institute, self.equipment_id, self.instance_id)
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_topic())
    }
}

/// Values a renderer may need
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicContext<'a> {
    pub experiment_id: Option<&'a str>,
    pub measurement: Option<&'a str>,
}

impl<'a> TopicContext<'a> {
    pub fn experiment(experiment_id: &'a str) -> Self {
        Self {
            experiment_id: Some(experiment_id),
            measurement: None,
        }
    }

    pub fn measurement(experiment_id: &'a str, measurement: &'a str) -> Self {
        Self {
            experiment_id: Some(experiment_id),
            measurement: Some(measurement),
        }
    }
}

pub type Renderer = Box<dyn Fn(&TopicContext<'_>) -> Result<String, LabError> + Send + Sync>;

#[derive(Default)]
pub struct TopicRegistry {
    renderers: HashMap<String, Renderer>,
    clearable: HashSet<String>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard topic tree under `{institute}/{equipment_id}/{instance_id}`:
    ///
    /// | name | topic | clearable |
    /// |---|---|---|
    /// | `details` | `base/details` | yes |
    /// | `running` | `base/running` | yes |
    /// | `experiment.start` | `base/experiment/{id}/start` | yes |
    /// | `experiment.stop` | `base/experiment/{id}/stop` | yes |
    /// | `experiment.measurement` | `base/experiment/{id}/measurement/{name}` | no |
    /// | `error` | `base/error` | no |
    pub fn standard(identity: &InstanceIdentity) -> Self {
        let base = identity.base_topic();
        let mut registry = Self::new();

        let details = format!("{}/details", base);
        registry.register(names::DETAILS, true, move |_| Ok(details.clone()));

        let running = format!("{}/running", base);
        registry.register(names::RUNNING, true, move |_| Ok(running.clone()));

        let error = format!("{}/error", base);
        registry.register(names::ERROR, false, move |_| Ok(error.clone()));

        for (name, suffix) in [(names::EXPERIMENT_START, "start"), (names::EXPERIMENT_STOP, "stop")] {
            let base = base.clone();
            registry.register(name, true, move |ctx| {
                let id = require(ctx.experiment_id, name, "experiment id")?;
                Ok(format!("{}/experiment/{}/{}", base, id, suffix))
            });
        }

        registry.register(names::MEASUREMENT, false, move |ctx| {
            let id = require(ctx.experiment_id, names::MEASUREMENT, "experiment id")?;
            let measurement = require(ctx.measurement, names::MEASUREMENT, "measurement name")?;
            Ok(format!("{}/experiment/{}/measurement/{}", base, id, measurement))
        });

        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        clearable: bool,
        renderer: impl Fn(&TopicContext<'_>) -> Result<String, LabError> + Send + Sync + 'static,
    ) {
        let name = name.into();
        if clearable {
            self.clearable.insert(name.clone());
        } else {
            self.clearable.remove(&name);
        }
        self.renderers.insert(name, Box::new(renderer));
    }

    pub fn resolve(&self, name: &str, ctx: &TopicContext<'_>) -> Result<String, LabError> {
        let renderer = self
            .renderers
            .get(name)
            .ok_or_else(|| LabError::adapter_logic(format!("unknown topic '{}'", name)))?;
        renderer(ctx)
    }

    pub fn is_clearable(&self, name: &str) -> bool {
        self.clearable.contains(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.renderers.contains_key(name)
    }
}

fn require<'a>(value: Option<&'a str>, topic: &str, what: &str) -> Result<&'a str, LabError> {
    value.ok_or_else(|| LabError::adapter_logic(format!("topic '{}' needs an {}", topic, what)))
}
