//! 具体输出端实现

pub mod file;
pub mod http;
pub mod log;
pub mod memory;

pub use file::FileSink;
pub use http::HttpSink;
pub use log::LogSink;
pub use memory::MemorySink;
