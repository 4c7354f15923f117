//! 安装流程的错误类型

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstallError {
    /// 外部进程无法启动，或在输出过程中出错；携带已捕获的错误文本
    #[error("{0}")]
    Spawn(String),

    #[error("无法写入 shell 配置文件 {path}: {source}")]
    ProfileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("无法加载 shell 配置文件 {path}: {reason}")]
    ProfileLoad { path: PathBuf, reason: String },

    #[error("不支持的 Node 版本管理器: {0}")]
    UnsupportedManager(String),

    #[error("安装脚本不存在: {0}")]
    ScriptNotFound(PathBuf),

    #[error("安装参数无效: {0}")]
    InvalidDescriptor(String),

    #[error("命令 `{command}` 退出码 {code:?}")]
    NonZeroExit { command: String, code: Option<i32> },

    #[error("通道 {0} 上已有安装任务在运行")]
    ChannelBusy(String),

    #[error("安装已取消")]
    Cancelled,

    #[error("无法解析输出: {0}")]
    Parse(String),

    #[error("读取软件包目录失败: {0}")]
    Catalog(String),

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, InstallError>;
