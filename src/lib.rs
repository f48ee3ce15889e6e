//! Lab Relay - 实验室仪器数据采集与可靠转发

pub mod adapter;
pub mod config;
pub mod error;
pub mod fleet;
pub mod interpreter;
pub mod output;
pub mod process;
pub mod signal;
pub mod watcher;

pub use adapter::{AdapterBuilder, AdapterExit, AdapterSettings, EquipmentAdapter, ProcessLayout};
pub use config::{build_fleet, load_config, FleetConfig};
pub use error::{ErrorHolder, ErrorKind, ErrorRecord, LabError, Severity};
pub use fleet::{FleetContext, FleetExit, FleetSettings, FleetSupervisor};
pub use interpreter::{Interpreter, InterpreterState, Passthrough};
pub use output::{OutputNode, ReconnectPolicy, Sink};
pub use process::{InstanceIdentity, Message, Phase, PhaseKind, Process, TopicRegistry};
pub use signal::StopSignal;
pub use watcher::{EventKind, EventWatcher};
