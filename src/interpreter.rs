//! 解释器 - 把仪器原始数据翻译成 metadata / measurement
//!
//! 具体仪器的解析逻辑不在这里，这里只有接口、共用的实验状态，以及一个
//! 通用的 `Passthrough` 实现（CSV 行、JSON 文本、订阅数据点都能处理）。

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::LabError;

/// 仪器数据解释器
pub trait Interpreter: Send + Sync {
    /// 实验开始的 metadata，必须包含 `experiment_id` 和 `timestamp`
    fn metadata(&self, raw: &Value) -> Result<Value, LabError>;

    /// 解析测量数据；单个对象或对象数组，`None` 表示没解析出任何东西
    fn measurement(&self, raw: &Value) -> Result<Option<Value>, LabError>;

    /// 模拟模式下使用的一条测量原始数据
    fn simulate(&self) -> Value;

    fn experiment_id(&self) -> Option<String>;

    fn last_measurement_time(&self) -> Option<DateTime<Utc>>;

    /// 清除当前实验标记
    fn experiment_stop(&self);
}

/// 解释器共用的实验状态
#[derive(Debug, Default)]
pub struct InterpreterState {
    inner: Mutex<StateInner>,
}

#[derive(Debug, Default)]
struct StateInner {
    experiment_id: Option<String>,
    last_measurement: Option<DateTime<Utc>>,
}

impl InterpreterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始新实验，同时重置测量计时
    pub fn begin(&self, experiment_id: impl Into<String>) {
        let mut inner = self.lock();
        inner.experiment_id = Some(experiment_id.into());
        inner.last_measurement = Some(Utc::now());
    }

    pub fn touch(&self) {
        self.lock().last_measurement = Some(Utc::now());
    }

    pub fn end(&self) {
        let mut inner = self.lock();
        inner.experiment_id = None;
        inner.last_measurement = None;
    }

    pub fn experiment_id(&self) -> Option<String> {
        self.lock().experiment_id.clone()
    }

    pub fn last_measurement_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_measurement
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// 通用解释器：不认识具体仪器，只把数据整理成 influx 风格的点
///
/// 点的格式：`{measurement, tags: {experiment_id, ..}, fields, timestamp}`
pub struct Passthrough {
    measurement: String,
    fixed_id: Option<String>,
    header: Mutex<Option<Vec<String>>>,
    state: InterpreterState,
}

impl Passthrough {
    /// 离散实验：每次 metadata 生成新的实验 id
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            fixed_id: None,
            header: Mutex::new(None),
            state: InterpreterState::new(),
        }
    }

    /// 连续测量：实验 id 固定，创建即处于实验中
    pub fn continuous(measurement: impl Into<String>, experiment_id: impl Into<String>) -> Self {
        let experiment_id = experiment_id.into();
        let interpreter = Self {
            fixed_id: Some(experiment_id.clone()),
            ..Self::new(measurement)
        };
        interpreter.state.begin(experiment_id);
        interpreter
    }

    /// 识别出的 CSV 表头
    pub fn header(&self) -> Option<Vec<String>> {
        self.lock_header().clone()
    }

    fn lock_header(&self) -> MutexGuard<'_, Option<Vec<String>>> {
        self.header.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn point(&self, experiment_id: &str, mut tags: Map<String, Value>, fields: Map<String, Value>, timestamp: Option<&Value>) -> Value {
        tags.insert("experiment_id".into(), Value::String(experiment_id.to_string()));
        json!({
            "measurement": self.measurement,
            "tags": tags,
            "fields": fields,
            "timestamp": timestamp.cloned().unwrap_or_else(|| json!(Utc::now().to_rfc3339())),
        })
    }

    fn row_point(&self, experiment_id: &str, row: &[Value]) -> Option<Value> {
        let cells: Vec<String> = row.iter().map(cell_text).collect();
        let header = self.lock_header().clone();
        if header.as_deref() == Some(cells.as_slice()) {
            return None;
        }

        let fields: Map<String, Value> = cells
            .iter()
            .enumerate()
            .map(|(idx, cell)| {
                let key = header
                    .as_ref()
                    .and_then(|h| h.get(idx).cloned())
                    .unwrap_or_else(|| format!("col{}", idx));
                (key, parse_cell(cell))
            })
            .collect();
        Some(self.point(experiment_id, Map::new(), fields, None))
    }

    fn object_point(&self, experiment_id: &str, object: &Map<String, Value>) -> Option<Value> {
        // 订阅数据点 {node, value, timestamp}
        if let (Some(node), Some(value)) = (object.get("node"), object.get("value")) {
            let mut tags = Map::new();
            tags.insert("node".into(), node.clone());
            let mut fields = Map::new();
            fields.insert("value".into(), value.clone());
            return Some(self.point(experiment_id, tags, fields, object.get("timestamp")));
        }

        // 已经是点格式
        if let Some(Value::Object(fields)) = object.get("fields") {
            let tags = match object.get("tags") {
                Some(Value::Object(tags)) => tags.clone(),
                _ => Map::new(),
            };
            return Some(self.point(experiment_id, tags, fields.clone(), object.get("timestamp")));
        }

        let fields: Map<String, Value> = object
            .iter()
            .filter(|(key, _)| key.as_str() != "timestamp")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if fields.is_empty() {
            return None;
        }
        Some(self.point(experiment_id, Map::new(), fields, object.get("timestamp")))
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_cell(cell: &str) -> Value {
    if let Ok(n) = cell.parse::<i64>() {
        return json!(n);
    }
    match cell.parse::<f64>() {
        Ok(f) if f.is_finite() => json!(f),
        _ => Value::String(cell.to_string()),
    }
}

impl Interpreter for Passthrough {
    fn metadata(&self, raw: &Value) -> Result<Value, LabError> {
        let experiment_id = self
            .fixed_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut metadata = match raw {
            Value::Object(object) => object.clone(),
            Value::Array(rows) => {
                // CSV：第一行是表头
                let mut metadata = Map::new();
                if let Some(Value::Array(first)) = rows.first() {
                    let header: Vec<String> = first.iter().map(cell_text).collect();
                    metadata.insert("columns".into(), json!(header));
                    *self.lock_header() = Some(header);
                }
                metadata
            }
            Value::Null => Map::new(),
            other => {
                let mut metadata = Map::new();
                metadata.insert("source".into(), other.clone());
                metadata
            }
        };

        metadata.insert("experiment_id".into(), json!(experiment_id));
        metadata.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        self.state.begin(experiment_id);

        Ok(Value::Object(metadata))
    }

    fn measurement(&self, raw: &Value) -> Result<Option<Value>, LabError> {
        let experiment_id = self
            .state
            .experiment_id()
            .ok_or_else(|| LabError::interpreter("measurement received outside an experiment"))?;

        let parsed = match raw {
            Value::Null => None,
            Value::Array(items) => {
                let points: Vec<Value> = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::Array(row) => self.row_point(&experiment_id, row),
                        Value::Object(object) => self.object_point(&experiment_id, object),
                        _ => None,
                    })
                    .collect();
                (!points.is_empty()).then_some(Value::Array(points))
            }
            Value::Object(object) => self.object_point(&experiment_id, object),
            Value::String(text) if text.trim().is_empty() => None,
            Value::String(text) => match serde_json::from_str::<Value>(text.trim()) {
                Ok(Value::Object(object)) => self.object_point(&experiment_id, &object),
                Ok(Value::Number(n)) => {
                    let mut fields = Map::new();
                    fields.insert("value".into(), Value::Number(n));
                    Some(self.point(&experiment_id, Map::new(), fields, None))
                }
                _ => {
                    let mut fields = Map::new();
                    fields.insert("value".into(), Value::String(text.trim().to_string()));
                    Some(self.point(&experiment_id, Map::new(), fields, None))
                }
            },
            scalar => {
                let mut fields = Map::new();
                fields.insert("value".into(), scalar.clone());
                Some(self.point(&experiment_id, Map::new(), fields, None))
            }
        };

        if parsed.is_some() {
            self.state.touch();
        }
        Ok(parsed)
    }

    fn simulate(&self) -> Value {
        match self.header() {
            Some(header) => {
                let row: Vec<String> = (0..header.len()).map(|i| format!("{}", i)).collect();
                json!([row])
            }
            None => json!({ "value": 0.0, "simulated": true }),
        }
    }

    fn experiment_id(&self) -> Option<String> {
        self.state.experiment_id()
    }

    fn last_measurement_time(&self) -> Option<DateTime<Utc>> {
        self.state.last_measurement_time()
    }

    fn experiment_stop(&self) {
        self.state.end();
        // 连续测量没有实验边界，回到固定 id
        if let Some(fixed) = &self.fixed_id {
            self.state.begin(fixed.clone());
        }
    }
}
