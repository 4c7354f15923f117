//! 安装流程相关数据类型定义

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::registry::RegistryMiss;

/// descriptor.options 中指定版本管理器的键
pub const MANAGER_NAME_OPTION: &str = "managerName";
/// 安装前检查的命令；在 profile 环境中已可用时跳过安装
pub const CHECK_COMMAND_OPTION: &str = "checkCommand";
/// 安装完成后执行的 shell 命令
pub const POST_INSTALL_OPTION: &str = "postInstall";
/// shell 包族的安装命令
pub const SOURCE_OPTION: &str = "source";

/// 要安装的软件包：name 为包族（如 "node"），options 为管理器相关参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl PackageDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: HashMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }

    pub fn manager_name(&self) -> Option<&str> {
        self.option(MANAGER_NAME_OPTION)
    }

    /// 去掉首尾空白后非空的参数
    pub fn non_empty_option(&self, key: &str) -> Option<&str> {
        self.option(key).map(str::trim).filter(|v| !v.is_empty())
    }
}

/// 一次安装请求；channel 在并发安装间必须唯一
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub descriptor: PackageDescriptor,
    pub script_path: PathBuf,
    pub channel: String,
}

/// 推送给 UI 的一段输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub channel: String,
    pub data: ChunkData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkData {
    pub chunk: String,
    /// 是否为完整的一行（仅在开启 line_buffered 时可能为 true）
    pub ln: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstallStatus {
    Installed,
    /// checkCommand 已可用，未执行安装
    AlreadyInstalled,
}

/// install() 的结果；local_path 目前总是 None
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub name: String,
    pub local_path: Option<PathBuf>,
    /// 注册表未命中时为 None
    #[serde(skip)]
    pub status: Option<InstallStatus>,
    /// 注册表未命中时记录原因，不参与序列化
    #[serde(skip)]
    pub skipped: Option<RegistryMiss>,
}

impl InstallResult {
    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// 进程执行结果：合并后的完整输出与退出码
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub transcript: String,
    /// 被信号终止时为 None
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// 日志级别（写入 LogSink）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}
