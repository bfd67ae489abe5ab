// training_log.rs - 训练日志模块
//
// 两类输出:
// - 每线程纯文本日志 (actor-<i> / evaluator-<i> / learner), 带相对时间戳
// - learner.jsonl 结构化记录, 每步一个 JSON 对象, 断点续训从末行恢复

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

// ==============================================================================
// --- 文本日志 ---
// ==============================================================================

pub struct FileLogger {
    file: Mutex<File>,
    start: Instant,
}

impl FileLogger {
    /// 在实验目录下创建/追加名为 name 的日志文件
    pub fn new(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log file {:?}", path))?;
        Ok(Self { file: Mutex::new(file), start: Instant::now() })
    }

    pub fn print(&self, msg: &str) {
        let elapsed = self.start.elapsed().as_secs_f64();
        let mut file = self.file.lock().expect("log file mutex poisoned");
        // 日志写失败不应打断训练
        let _ = writeln!(file, "[{:10.3}] {}", elapsed, msg);
    }
}

/// 文件日志或空日志 (线程数多时只给前若干个线程开文件)
pub enum Logger {
    File(FileLogger),
    Noop,
}

impl Logger {
    pub fn print(&self, msg: &str) {
        if let Logger::File(logger) = self {
            logger.print(msg);
        }
    }
}

// ==============================================================================
// --- JSONL 结构化日志 ---
// ==============================================================================

pub struct DataLoggerJsonLines {
    file: Mutex<File>,
    start: Instant,
    /// 续训时从上次日志继承的相对时间偏移 (秒)
    start_offset: f64,
}

impl DataLoggerJsonLines {
    pub fn new(dir: &Path, name: &str, start_offset: f64) -> Result<Self> {
        let path = dir.join(format!("{}.jsonl", name));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open data log {:?}", path))?;
        Ok(Self { file: Mutex::new(file), start: Instant::now(), start_offset })
    }

    /// 写入一条记录, 自动补充 time_abs / time_rel 字段
    pub fn write(&self, mut record: Map<String, Value>) -> Result<()> {
        let time_abs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let time_rel = self.start_offset + self.start.elapsed().as_secs_f64();
        record.insert("time_abs".to_string(), Value::from(time_abs));
        record.insert("time_rel".to_string(), Value::from(time_rel));

        let mut file = self.file.lock().expect("data log mutex poisoned");
        writeln!(file, "{}", Value::Object(record)).context("write data log record")
    }
}

// ==============================================================================
// --- 断点续训信息 ---
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartInfo {
    /// 上次运行累计的相对时间 (秒), 作为本次 time_rel 的起点
    pub start_elapsed: f64,
    pub start_step: i64,
    pub total_trajectories: i64,
}

impl StartInfo {
    pub fn fresh() -> Self {
        Self { start_elapsed: 0.0, start_step: 1, total_trajectories: 0 }
    }
}

/// 从 learner.jsonl 的最后一个非空行恢复运行进度
pub fn read_start_info(dir: &Path) -> Result<StartInfo> {
    let path = dir.join("learner.jsonl");
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("read {:?}", path))?;
    let last_line = contents
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .context("learner.jsonl has no records")?;

    let record: Value = serde_json::from_str(last_line).context("parse last learner record")?;
    let Some(time_rel) = record.get("time_rel").and_then(Value::as_f64) else {
        bail!("learner record is missing time_rel");
    };
    let Some(step) = record.get("step").and_then(Value::as_i64) else {
        bail!("learner record is missing step");
    };
    let Some(total_trajectories) = record.get("total_trajectories").and_then(Value::as_i64) else {
        bail!("learner record is missing total_trajectories");
    };

    Ok(StartInfo { start_elapsed: time_rel, start_step: step + 1, total_trajectories })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_from_last_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("learner.jsonl"),
            "{\"time_rel\":900,\"step\":10,\"total_trajectories\":500}\n\
             {\"time_rel\":1800,\"step\":42,\"total_trajectories\":1000}\n\n",
        )
        .unwrap();
        let info = read_start_info(dir.path()).unwrap();
        assert_eq!(info.start_step, 43);
        assert_eq!(info.total_trajectories, 1000);
        assert!((info.start_elapsed - 1800.0).abs() < 1e-9);
    }

    #[test]
    fn test_resume_requires_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("learner.jsonl"), "{\"step\":42}\n").unwrap();
        assert!(read_start_info(dir.path()).is_err());
    }

    #[test]
    fn test_data_logger_appends_time_fields() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DataLoggerJsonLines::new(dir.path(), "learner", 100.0).unwrap();
        let mut record = Map::new();
        record.insert("step".to_string(), Value::from(1));
        logger.write(record).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("learner.jsonl")).unwrap();
        let parsed: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["step"], 1);
        assert!(parsed["time_rel"].as_f64().unwrap() >= 100.0);
        assert!(parsed["time_abs"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_file_logger_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileLogger::new(dir.path(), "actor-0").unwrap();
        logger.print("hello");
        let contents = std::fs::read_to_string(dir.path().join("actor-0")).unwrap();
        assert!(contents.contains("hello"));
    }
}
