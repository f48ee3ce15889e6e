//! 本地文件输出端 - 将消息追加到 JSONL 文件，支持存储转发回放

use anyhow::{Context, Result};
use fs2::FileExt;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::output::{BufferedMessage, Sink};

/// 本地文件输出端
///
/// 每次读写都对文件加独占锁，可与 `labrelay drain` 等外部进程并发使用。
pub struct FileSink {
    name: String,
    path: PathBuf,
    connected: AtomicBool,
}

impl FileSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            connected: AtomicBool::new(false),
        }
    }

    /// 默认存储路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("lab-relay")
            .join("outbox.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, message: &BufferedMessage) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        file.lock_exclusive()?;
        let written = writeln!(file, "{}", serde_json::to_string(message)?);
        file.unlock()?;
        written?;
        Ok(())
    }

    /// 持锁取出最早的 `limit` 条记录（`None` 为全部），剩余记录原地写回
    ///
    /// 读取中途出错时不改动文件；无法解析的行（包括非 UTF-8）跳过并告警。
    fn take(&self, limit: Option<usize>) -> Result<Vec<BufferedMessage>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.lock_exclusive()?;
        let taken = self.take_locked(&mut file, limit);
        file.unlock()?;
        taken
    }

    fn take_locked(&self, file: &mut File, limit: Option<usize>) -> Result<Vec<BufferedMessage>> {
        let mut records = Vec::new();
        for line in BufReader::new(&*file).split(b'\n') {
            let line = line.with_context(|| format!("failed to read {}", self.path.display()))?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<BufferedMessage>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %self.path.display(), error = %e, "Skipping corrupt outbox line"),
            }
        }

        let count = limit.map_or(records.len(), |n| n.min(records.len()));
        let rest = records.split_off(count);

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        if !rest.is_empty() {
            let mut writer = BufWriter::new(&*file);
            for record in &rest {
                writeln!(writer, "{}", serde_json::to_string(record)?)?;
            }
            writer.flush()?;
        }

        Ok(records)
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn transmit(&self, topic: &str, payload: &Value, retain: bool) -> Result<()> {
        self.append(&BufferedMessage::new(topic, payload.clone(), retain))?;
        debug!(sink = %self.name, topic = %topic, "Message stored to outbox");
        Ok(())
    }

    fn pop(&self) -> Option<BufferedMessage> {
        match self.take(Some(1)) {
            Ok(records) => records.into_iter().next(),
            Err(e) => {
                warn!(sink = %self.name, error = %e, "Failed to read outbox");
                None
            }
        }
    }

    fn pop_all(&self) -> Vec<BufferedMessage> {
        self.take(None).unwrap_or_else(|e| {
            warn!(sink = %self.name, error = %e, "Failed to drain outbox");
            Vec::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_transmit_appends_jsonl() {
        let temp = tempdir().unwrap();
        let sink = FileSink::new("outbox", temp.path().join("outbox.jsonl"));
        sink.connect().unwrap();

        sink.transmit("lab/a", &json!({"v": 1}), false).unwrap();
        sink.transmit("lab/b", &json!(true), true).unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_pop_all_drains_file() {
        let temp = tempdir().unwrap();
        let sink = FileSink::new("outbox", temp.path().join("nested").join("outbox.jsonl"));
        sink.connect().unwrap();

        sink.transmit("lab/a", &json!(1), false).unwrap();
        sink.transmit("lab/b", &json!(2), true).unwrap();

        let drained = sink.pop_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].topic, "lab/a");
        assert!(drained[1].retain);
        assert!(sink.pop_all().is_empty());
    }

    #[test]
    fn test_pop_takes_oldest_and_keeps_rest() {
        let temp = tempdir().unwrap();
        let sink = FileSink::new("outbox", temp.path().join("outbox.jsonl"));

        sink.transmit("first", &json!(1), false).unwrap();
        sink.transmit("second", &json!(2), false).unwrap();

        assert_eq!(sink.pop().unwrap().topic, "first");
        let rest = sink.pop_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].topic, "second");
    }

    #[test]
    fn test_missing_file_pops_nothing() {
        let temp = tempdir().unwrap();
        let sink = FileSink::new("outbox", temp.path().join("absent.jsonl"));
        assert!(sink.pop().is_none());
        assert!(sink.pop_all().is_empty());
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("outbox.jsonl");
        let sink = FileSink::new("outbox", &path);
        sink.transmit("ok", &json!(1), false).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();

        let drained = sink.pop_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].topic, "ok");
    }

    #[test]
    fn test_non_utf8_line_does_not_hide_later_records() {
        // Given: a record, a line of raw non-UTF-8 bytes, then another record
        let temp = tempdir().unwrap();
        let path = temp.path().join("outbox.jsonl");
        let sink = FileSink::new("outbox", &path);
        sink.transmit("before", &json!(1), false).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"\xff\xfe\x00garbage\n")
            .unwrap();
        sink.transmit("after", &json!(2), false).unwrap();

        // When: the outbox is drained
        let drained = sink.pop_all();

        // Then: both good records survive and the file is empty
        let topics: Vec<&str> = drained.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["before", "after"]);
        assert!(sink.pop_all().is_empty());
    }

    #[test]
    fn test_pop_keeps_rest_in_place() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("outbox.jsonl");
        let sink = FileSink::new("outbox", &path);
        for i in 0..3 {
            sink.transmit(&format!("t{}", i), &json!(i), false).unwrap();
        }

        assert_eq!(sink.pop().unwrap().topic, "t0");
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_pop_does_not_lose_concurrent_appends() {
        // Given: a writer appending while a reader pops one record at a time
        let temp = tempdir().unwrap();
        let path = temp.path().join("outbox.jsonl");
        let total = 200;

        let writer = {
            let path = path.clone();
            std::thread::spawn(move || {
                let sink = FileSink::new("writer", path);
                for i in 0..total {
                    sink.transmit("lab/seq", &json!(i), false).unwrap();
                }
            })
        };

        let reader = FileSink::new("reader", &path);
        let mut seen = Vec::new();
        while !writer.is_finished() {
            if let Some(message) = reader.pop() {
                seen.push(message.payload.as_i64().unwrap());
            }
        }
        writer.join().unwrap();
        seen.extend(reader.pop_all().iter().map(|m| m.payload.as_i64().unwrap()));

        // Then: every record is seen exactly once, in order
        assert_eq!(seen, (0..total).collect::<Vec<i64>>());
    }
}
