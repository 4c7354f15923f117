use crate::installer::LogLevel;
use anyhow::Result;
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// 持久化诊断日志：安装成功时写入完整输出（info），失败时写入错误文本（error）
pub trait LogSink: Send + Sync {
    fn write(&self, channel: &str, text: &str, is_error: bool, level: LogLevel) -> Result<()>;
}

/// 按日期分目录写入：base_dir/YYYY/MM/DD/<channel>.log
pub struct FileLogSink {
    base_dir: PathBuf,
}

impl FileLogSink {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn log_path(&self, channel: &str) -> PathBuf {
        let now = Local::now();
        let year = now.format("%Y").to_string();
        let month = now.format("%m").to_string();
        let day = now.format("%d").to_string();

        // channel 来自调用方，去掉路径分隔符
        let file_name: String = channel
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();

        self.base_dir
            .join(year)
            .join(month)
            .join(day)
            .join(format!("{}.log", file_name))
    }
}

impl LogSink for FileLogSink {
    fn write(&self, channel: &str, text: &str, is_error: bool, level: LogLevel) -> Result<()> {
        let path = self.log_path(channel);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let now = Local::now();
        let mut entry = format!(
            "[{}] [{}]{} ",
            now.format("%Y-%m-%d %H:%M:%S"),
            level.as_str(),
            if is_error { " [stderr]" } else { "" }
        );
        entry.push_str(text);
        if !entry.ends_with('\n') {
            entry.push('\n');
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(entry.as_bytes())?;
        Ok(())
    }
}

/// 一条内存日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub channel: String,
    pub text: String,
    pub is_error: bool,
    pub level: LogLevel,
}

/// 仅保存在内存中的日志，便于嵌入方读取
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn entries_at(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn write(&self, channel: &str, text: &str, is_error: bool, level: LogLevel) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("日志缓冲区锁已损坏"))?;
        entries.push(LogEntry {
            channel: channel.to_string(),
            text: text.to_string(),
            is_error,
            level,
        });
        Ok(())
    }
}
