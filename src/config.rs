use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 默认输出通道（UI 侧按此 id 区分安装日志）
    pub channel: String,
    /// 执行 profile 时使用的 shell
    pub shell: String,
    /// 手动指定 profile 路径，未设置时按 shell 推断
    pub profile_path: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub catalog_path: Option<PathBuf>,
    pub node_mirror: String,
    pub fnm_program: String,
    pub npm_program: String,
    /// 按行切分输出并标记 ln = true
    pub line_buffered: bool,
    /// nvm 脚本非零退出时视为失败（默认沿用旧行为：只要退出即成功）
    pub fail_on_nonzero_exit: bool,
    /// 取消时 SIGINT 之后等待多少秒再升级为 SIGTERM
    pub cancel_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let home = home_dir();
        Self {
            channel: "package-installer".to_string(),
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            profile_path: None,
            log_dir: home.join(".devkit/logs"),
            catalog_path: None,
            node_mirror: "https://nodejs.org/dist".to_string(),
            fnm_program: "fnm".to_string(),
            npm_program: "npm".to_string(),
            line_buffered: false,
            fail_on_nonzero_exit: false,
            cancel_grace_secs: 5,
        }
    }
}

impl Config {
    /// 配置文件路径：DEVKIT_CONFIG 优先，其次 ~/.config/devkit/config.toml
    pub fn default_path() -> PathBuf {
        match std::env::var_os("DEVKIT_CONFIG") {
            Some(p) => PathBuf::from(p),
            None => home_dir().join(".config/devkit/config.toml"),
        }
    }

    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// 实际使用的 profile 路径
    pub fn resolved_profile_path(&self) -> PathBuf {
        match &self.profile_path {
            Some(p) => p.clone(),
            None => crate::profile::default_profile_path(&self.shell, &home_dir()),
        }
    }
}

pub(crate) fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}
