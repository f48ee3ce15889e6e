//! 配置 - 从 JSON 构建输出链和仪器适配器
//!
//! ```json
//! {
//!   "outputs": [
//!     {"name": "broker", "plugin": "http", "params": {"endpoint": "http://localhost:8080/ingest"}, "fallback": "outbox"},
//!     {"name": "outbox", "plugin": "file"}
//!   ],
//!   "equipment": [
//!     {"adapter": "csv",
//!      "instance": {"institute": "ncl", "equipment_id": "fluent", "instance_id": "fluent-1"},
//!      "requirements": {"path": "/data/fluent/run.csv"},
//!      "experiment_timeout_secs": 600}
//!   ]
//! }
//! ```
//!
//! 输出链的头是 `outputs` 的第一项。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::adapter::{AdapterSettings, EquipmentAdapter, ProcessLayout};
use crate::error::{ErrorHolder, LabError};
use crate::fleet::{FleetContext, FleetSettings, FleetSupervisor};
use crate::interpreter::{Interpreter, Passthrough};
use crate::output::sinks::{FileSink, HttpSink, LogSink, MemorySink};
use crate::output::{OutputNode, ReconnectPolicy, Sink};
use crate::process::{InstanceIdentity, TopicRegistry, DEFAULT_MAXIMUM_MESSAGE_SIZE};
use crate::watcher::csv::DEFAULT_DELIMITER;
use crate::watcher::{
    CsvWatcher, EventWatcher, FileWatchOptions, FileWatcher, FixedPayload, HttpFetcher, HttpTarget, PollingWatcher,
};

/// 输出端插件
pub const SINK_PLUGINS: &[&str] = &["memory", "file", "http", "log"];

/// 仪器适配器代码
pub const ADAPTER_CODES: &[&str] = &["file", "csv", "polling", "http"];

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub outputs: Vec<SinkSpec>,
    #[serde(default)]
    pub equipment: Vec<EquipmentSpec>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSpec {
    pub name: String,
    pub plugin: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquipmentSpec {
    pub adapter: String,
    pub instance: InstanceIdentity,
    #[serde(default)]
    pub requirements: Map<String, Value>,
    #[serde(default)]
    pub simulation: Option<SimulationSpec>,
    #[serde(default)]
    pub experiment_timeout_secs: Option<u64>,
    #[serde(default = "default_maximum_message_size")]
    pub maximum_message_size: usize,
    /// 使用哪条输出链，默认是第一项
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSpec {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_error_threshold")]
    pub error_threshold: usize,
    #[serde(default = "default_error_timeframe_secs")]
    pub error_timeframe_secs: u64,
    #[serde(default = "default_disable_cooldown_secs")]
    pub disable_cooldown_secs: u64,
    #[serde(default = "default_restart_limit")]
    pub restart_limit: usize,
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            error_timeframe_secs: default_error_timeframe_secs(),
            disable_cooldown_secs: default_disable_cooldown_secs(),
            restart_limit: default_restart_limit(),
            restart_window_secs: default_restart_window_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn error_holder(&self) -> ErrorHolder {
        ErrorHolder::with_limits(self.error_threshold, Duration::from_secs(self.error_timeframe_secs))
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            disable_cooldown: Duration::from_secs(self.disable_cooldown_secs),
            restart_limit: self.restart_limit,
            restart_window: Duration::from_secs(self.restart_window_secs),
            ..FleetSettings::default()
        }
    }
}

fn default_maximum_message_size() -> usize {
    DEFAULT_MAXIMUM_MESSAGE_SIZE
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_error_threshold() -> usize {
    ErrorHolder::DEFAULT_THRESHOLD
}

fn default_error_timeframe_secs() -> u64 {
    ErrorHolder::DEFAULT_TIMEFRAME.as_secs()
}

fn default_disable_cooldown_secs() -> u64 {
    crate::fleet::DEFAULT_DISABLE_COOLDOWN.as_secs()
}

fn default_restart_limit() -> usize {
    crate::adapter::policy::DEFAULT_RESTART_LIMIT
}

fn default_restart_window_secs() -> u64 {
    crate::adapter::policy::DEFAULT_RESTART_WINDOW.as_secs()
}

/// 默认配置文件路径 ~/.config/lab-relay/fleet.json
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("lab-relay")
        .join("fleet.json")
}

pub fn load_config(path: &Path) -> Result<FleetConfig> {
    let content = fs::read_to_string(path).with_context(|| format!("Cannot read config {}", path.display()))?;
    let config: FleetConfig =
        serde_json::from_str(&content).with_context(|| format!("Cannot parse config {}", path.display()))?;
    Ok(config)
}

/// 构建好但尚未启动的集群
pub struct BuiltFleet {
    pub outputs: HashMap<String, Arc<OutputNode>>,
    pub supervisor: FleetSupervisor,
}

/// 按配置构建整个集群；任何配置错误都是 AdapterBuildError
pub fn build_fleet(config: &FleetConfig) -> Result<BuiltFleet, LabError> {
    let head_name = config
        .outputs
        .first()
        .map(|spec| spec.name.clone())
        .ok_or_else(|| LabError::adapter_build("no outputs configured"))?;

    let outputs = build_outputs(&config.outputs)?;
    let head = outputs
        .get(&head_name)
        .cloned()
        .ok_or_else(|| LabError::adapter_build(format!("output '{}' was not built", head_name)))?;

    let fleet_errors = Arc::new(config.supervisor.error_holder());
    for node in outputs.values() {
        node.set_error_holder(Arc::clone(&fleet_errors));
    }
    let ctx = FleetContext::new(head, fleet_errors, config.supervisor.fleet_settings());

    let mut adapters = Vec::with_capacity(config.equipment.len());
    let mut overrides = Vec::new();
    let mut seen = HashSet::new();
    for spec in &config.equipment {
        if !seen.insert(spec.instance.base_topic()) {
            return Err(LabError::adapter_build(format!(
                "instance {} is configured twice",
                spec.instance
            )));
        }
        let output = match &spec.output {
            Some(name) => {
                let node = outputs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| LabError::adapter_build(format!("{}: unknown output '{}'", spec.instance, name)))?;
                overrides.push(Arc::clone(&node));
                node
            }
            None => Arc::clone(&ctx.output),
        };
        adapters.push(build_adapter(spec, output, &config.supervisor)?);
    }

    // 覆盖的输出链也由集群负责连接和熔断恢复
    let ctx = ctx.with_outputs(overrides);
    Ok(BuiltFleet {
        outputs,
        supervisor: FleetSupervisor::new(ctx, adapters),
    })
}

/// 构建所有输出节点，按名字解析 fallback 引用
pub fn build_outputs(specs: &[SinkSpec]) -> Result<HashMap<String, Arc<OutputNode>>, LabError> {
    let mut by_name: HashMap<&str, &SinkSpec> = HashMap::new();
    for spec in specs {
        if by_name.insert(spec.name.as_str(), spec).is_some() {
            return Err(LabError::adapter_build(format!("output '{}' is defined twice", spec.name)));
        }
    }

    let mut built = HashMap::new();
    for spec in specs {
        let mut visiting = Vec::new();
        build_node(spec, &by_name, &mut built, &mut visiting)?;
    }
    Ok(built)
}

fn build_node(
    spec: &SinkSpec,
    by_name: &HashMap<&str, &SinkSpec>,
    built: &mut HashMap<String, Arc<OutputNode>>,
    visiting: &mut Vec<String>,
) -> Result<Arc<OutputNode>, LabError> {
    if let Some(node) = built.get(&spec.name) {
        return Ok(Arc::clone(node));
    }
    if visiting.contains(&spec.name) {
        visiting.push(spec.name.clone());
        return Err(LabError::adapter_build(format!(
            "fallback cycle: {}",
            visiting.join(" -> ")
        )));
    }
    visiting.push(spec.name.clone());

    let mut node = OutputNode::new(build_sink(spec)?);
    if let Some(attempts) = spec.params.get("reconnect_attempts").and_then(Value::as_u64) {
        node = node.with_reconnect_policy(ReconnectPolicy {
            attempts: attempts.max(1) as u32,
            ..ReconnectPolicy::default()
        });
    }
    if let Some(fallback) = &spec.fallback {
        let fallback_spec = by_name.get(fallback.as_str()).ok_or_else(|| {
            LabError::adapter_build(format!("output '{}' falls back to unknown output '{}'", spec.name, fallback))
        })?;
        node = node.with_fallback(build_node(fallback_spec, by_name, built, visiting)?);
    }

    visiting.pop();
    let node = Arc::new(node);
    built.insert(spec.name.clone(), Arc::clone(&node));
    debug!(sink = %spec.name, plugin = %spec.plugin, "Output built");
    Ok(node)
}

fn build_sink(spec: &SinkSpec) -> Result<Arc<dyn Sink>, LabError> {
    let param = |key: &str| spec.params.get(key);
    let sink: Arc<dyn Sink> = match spec.plugin.as_str() {
        "memory" => {
            let capacity = param("capacity")
                .and_then(Value::as_u64)
                .map_or(MemorySink::DEFAULT_CAPACITY, |c| c as usize);
            Arc::new(MemorySink::new(&spec.name, capacity))
        }
        "file" => {
            let path = param("path")
                .and_then(Value::as_str)
                .map_or_else(FileSink::default_path, PathBuf::from);
            Arc::new(FileSink::new(&spec.name, path))
        }
        "http" => {
            let endpoint = param("endpoint")
                .and_then(Value::as_str)
                .ok_or_else(|| LabError::adapter_build(format!("output '{}' needs params.endpoint", spec.name)))?;
            let sink = match param("timeout_secs").and_then(Value::as_u64) {
                Some(secs) => HttpSink::with_timeout(&spec.name, endpoint, Duration::from_secs(secs)),
                None => HttpSink::new(&spec.name, endpoint),
            }
            .map_err(|e| LabError::adapter_build(format!("output '{}': {:#}", spec.name, e)))?;
            Arc::new(sink)
        }
        "log" => Arc::new(LogSink::new(&spec.name)),
        other => {
            return Err(LabError::adapter_build(format!(
                "output '{}' uses unknown plugin '{}' (known: {})",
                spec.name,
                other,
                SINK_PLUGINS.join(", ")
            )))
        }
    };
    Ok(sink)
}

/// 按适配器代码构建一台仪器
pub fn build_adapter(
    spec: &EquipmentSpec,
    output: Arc<OutputNode>,
    supervisor: &SupervisorConfig,
) -> Result<EquipmentAdapter, LabError> {
    let name = spec.instance.base_topic();
    let req = &spec.requirements;
    let errors = Arc::new(supervisor.error_holder());

    let measurement = req
        .get("measurement")
        .and_then(Value::as_str)
        .unwrap_or(spec.instance.equipment_id.as_str())
        .to_string();
    let continuous = req.get("continuous").and_then(Value::as_bool).unwrap_or(false);
    let interpreter: Arc<dyn Interpreter> = if continuous {
        Arc::new(Passthrough::continuous(measurement, spec.instance.instance_id.clone()))
    } else {
        Arc::new(Passthrough::new(measurement))
    };

    let mut metadata = match req.get("metadata") {
        Some(Value::Object(extra)) => extra.clone(),
        _ => Map::new(),
    };
    metadata.insert("institute".into(), json!(spec.instance.institute));
    metadata.insert("equipment_id".into(), json!(spec.instance.equipment_id));
    metadata.insert("instance_id".into(), json!(spec.instance.instance_id));
    let metadata = Value::Object(metadata);

    let mut required = vec!["institute".to_string(), "equipment_id".to_string(), "instance_id".to_string()];
    if let Some(Value::Array(fields)) = req.get("required_metadata") {
        required.extend(fields.iter().filter_map(Value::as_str).map(str::to_string));
    }

    let interval_ms = |key: &str| Duration::from_millis(req.get(key).and_then(Value::as_u64).unwrap_or(DEFAULT_POLL_INTERVAL_MS));
    let holder = Some(Arc::clone(&errors));

    let watcher: Arc<dyn EventWatcher> = match &spec.simulation {
        Some(simulation) => {
            let payload = FixedPayload::new(interpreter.simulate()).with_start(json!({ "simulated": true }));
            Arc::new(PollingWatcher::new(
                name.clone(),
                payload,
                Duration::from_millis(simulation.interval_ms),
                metadata.clone(),
                holder,
            ))
        }
        None => match spec.adapter.as_str() {
            "file" => Arc::new(FileWatcher::new(
                file_options(spec, false)?,
                metadata.clone(),
                holder,
            )),
            "csv" => {
                let delimiter = req
                    .get("delimiter")
                    .and_then(Value::as_str)
                    .and_then(|d| d.chars().next())
                    .unwrap_or(DEFAULT_DELIMITER);
                Arc::new(CsvWatcher::new(file_options(spec, true)?, delimiter, metadata.clone(), holder))
            }
            "polling" => {
                let payload = req.get("payload").cloned().unwrap_or_else(|| json!({ "value": 42 }));
                Arc::new(PollingWatcher::new(
                    name.clone(),
                    FixedPayload::new(payload),
                    interval_ms("interval_ms"),
                    metadata.clone(),
                    holder,
                ))
            }
            "http" => {
                let targets = http_targets(spec)?;
                Arc::new(PollingWatcher::new(
                    name.clone(),
                    HttpFetcher::new(targets)?,
                    interval_ms("interval_ms"),
                    metadata.clone(),
                    holder,
                ))
            }
            other => {
                return Err(LabError::adapter_build(format!(
                    "{}: unknown adapter code '{}' (known: {})",
                    spec.instance,
                    other,
                    ADAPTER_CODES.join(", ")
                )))
            }
        },
    };

    EquipmentAdapter::builder(name)
        .watcher(watcher)
        .interpreter(interpreter)
        .output(output)
        .topics(Arc::new(TopicRegistry::standard(&spec.instance)))
        .errors(errors)
        .metadata(metadata, required)
        .layout(if continuous {
            ProcessLayout::Continuous
        } else {
            ProcessLayout::Discrete
        })
        .maximum_message_size(spec.maximum_message_size)
        .settings(AdapterSettings {
            experiment_timeout: spec.experiment_timeout_secs.map(Duration::from_secs),
            restart_limit: supervisor.restart_limit,
            restart_window: Duration::from_secs(supervisor.restart_window_secs),
            ..AdapterSettings::default()
        })
        .build()
}

fn file_options(spec: &EquipmentSpec, last_line_default: bool) -> Result<FileWatchOptions, LabError> {
    let req = &spec.requirements;
    let path = req
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| LabError::adapter_build(format!("{}: requirements.path is missing", spec.instance)))?;

    let mut options = FileWatchOptions::new(path).last_line_only(
        req.get("last_line_only")
            .and_then(Value::as_bool)
            .unwrap_or(last_line_default),
    );
    if let Some(ms) = req.get("debounce_ms").and_then(Value::as_u64) {
        options = options.debounce(Duration::from_millis(ms));
    }
    Ok(options)
}

fn http_targets(spec: &EquipmentSpec) -> Result<Vec<HttpTarget>, LabError> {
    let req = &spec.requirements;
    if let Some(url) = req.get("url").and_then(Value::as_str) {
        return Ok(vec![HttpTarget::new(url, crate::watcher::EventKind::Measurement)]);
    }
    match req.get("targets") {
        Some(targets) => serde_json::from_value(targets.clone())
            .map_err(|e| LabError::adapter_build(format!("{}: invalid requirements.targets: {}", spec.instance, e))),
        None => Err(LabError::adapter_build(format!(
            "{}: requirements.url or requirements.targets is missing",
            spec.instance
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sink(name: &str, plugin: &str, fallback: Option<&str>) -> SinkSpec {
        SinkSpec {
            name: name.to_string(),
            plugin: plugin.to_string(),
            params: Value::Null,
            fallback: fallback.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: FleetConfig = serde_json::from_str(
            r#"{
                "outputs": [{"name": "log", "plugin": "log"}],
                "equipment": [{
                    "adapter": "polling",
                    "instance": {"institute": "ncl", "equipment_id": "dummy", "instance_id": "d1"}
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.equipment[0].maximum_message_size, DEFAULT_MAXIMUM_MESSAGE_SIZE);
        assert_eq!(config.supervisor.error_threshold, 3);
        assert!(config.equipment[0].simulation.is_none());
    }

    #[test]
    fn test_fallback_chain_is_linked() {
        let outputs = build_outputs(&[
            sink("primary", "log", Some("buffer")),
            sink("buffer", "memory", None),
        ])
        .unwrap();

        let primary = &outputs["primary"];
        assert_eq!(primary.fallback().unwrap().name(), "buffer");
        assert!(Arc::ptr_eq(primary.fallback().unwrap(), &outputs["buffer"]));
    }

    #[test]
    fn test_fallback_cycle_is_build_error() {
        let err = build_outputs(&[
            sink("a", "log", Some("b")),
            sink("b", "memory", Some("a")),
        ])
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::AdapterBuild);
        assert!(err.message().contains("a -> b -> a"));
    }

    #[test]
    fn test_unknown_plugin_and_fallback() {
        let err = build_outputs(&[sink("a", "kafka", None)]).err().unwrap();
        assert!(err.message().contains("unknown plugin 'kafka'"));

        let err = build_outputs(&[sink("a", "log", Some("ghost"))]).err().unwrap();
        assert!(err.message().contains("unknown output 'ghost'"));
    }

    #[test]
    fn test_http_sink_needs_endpoint() {
        assert!(build_outputs(&[sink("a", "http", None)]).is_err());
    }

    #[test]
    fn test_unknown_adapter_code() {
        let config = FleetConfig {
            outputs: vec![sink("log", "log", None)],
            equipment: vec![EquipmentSpec {
                adapter: "modbus".to_string(),
                instance: InstanceIdentity::new("ncl", "x", "x1"),
                requirements: Map::new(),
                simulation: None,
                experiment_timeout_secs: None,
                maximum_message_size: 100,
                output: None,
            }],
            supervisor: SupervisorConfig::default(),
        };
        let err = build_fleet(&config).err().unwrap();
        assert!(err.message().contains("unknown adapter code 'modbus'"));
    }

    #[test]
    fn test_missing_path_requirement() {
        let spec = EquipmentSpec {
            adapter: "csv".to_string(),
            instance: InstanceIdentity::new("ncl", "fluent", "f1"),
            requirements: Map::new(),
            simulation: None,
            experiment_timeout_secs: None,
            maximum_message_size: 100,
            output: None,
        };
        let output = Arc::new(OutputNode::new(MemorySink::new("m", 10)));
        let err = build_adapter(&spec, output, &SupervisorConfig::default()).err().unwrap();
        assert!(err.message().contains("requirements.path"));
    }

    #[test]
    fn test_simulation_replaces_real_source() {
        let mut spec: EquipmentSpec = serde_json::from_value(json!({
            "adapter": "csv",
            "instance": {"institute": "ncl", "equipment_id": "fluent", "instance_id": "f1"},
            "simulation": {"interval_ms": 50}
        }))
        .unwrap();
        let output = Arc::new(OutputNode::new(MemorySink::new("m", 10)));

        // no path needed when simulated
        assert!(build_adapter(&spec, output.clone(), &SupervisorConfig::default()).is_ok());

        spec.simulation = None;
        assert!(build_adapter(&spec, output, &SupervisorConfig::default()).is_err());
    }

    #[test]
    fn test_build_fleet() {
        let config: FleetConfig = serde_json::from_value(json!({
            "outputs": [
                {"name": "primary", "plugin": "log", "fallback": "buffer"},
                {"name": "buffer", "plugin": "memory", "params": {"capacity": 10}}
            ],
            "equipment": [
                {"adapter": "polling", "instance": {"institute": "ncl", "equipment_id": "dummy", "instance_id": "d1"}},
                {"adapter": "polling", "instance": {"institute": "ncl", "equipment_id": "dummy", "instance_id": "d2"},
                 "requirements": {"continuous": true}, "output": "buffer"}
            ]
        }))
        .unwrap();

        let built = build_fleet(&config).unwrap();
        assert_eq!(built.outputs.len(), 2);
        assert_eq!(built.supervisor.adapters().len(), 2);
        assert_eq!(built.supervisor.context().output.name(), "primary");
        assert_eq!(built.supervisor.context().outputs.len(), 1);
        assert_eq!(built.supervisor.context().nodes().len(), 2);
    }

    #[test]
    fn test_override_outside_head_chain_is_managed() {
        let config: FleetConfig = serde_json::from_value(json!({
            "outputs": [
                {"name": "primary", "plugin": "log"},
                {"name": "archive", "plugin": "memory"}
            ],
            "equipment": [
                {"adapter": "polling", "instance": {"institute": "ncl", "equipment_id": "dummy", "instance_id": "d1"},
                 "output": "archive"}
            ]
        }))
        .unwrap();

        let built = build_fleet(&config).unwrap();
        let names: Vec<String> = built
            .supervisor
            .context()
            .nodes()
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(names, vec!["primary", "archive"]);
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let config: FleetConfig = serde_json::from_value(json!({
            "outputs": [{"name": "log", "plugin": "log"}],
            "equipment": [
                {"adapter": "polling", "instance": {"institute": "ncl", "equipment_id": "dummy", "instance_id": "d1"}},
                {"adapter": "polling", "instance": {"institute": "ncl", "equipment_id": "dummy", "instance_id": "d1"}}
            ]
        }))
        .unwrap();
        assert!(build_fleet(&config).is_err());
    }

    #[test]
    fn test_load_config_reports_path() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("fleet.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("fleet.json"));
    }
}
