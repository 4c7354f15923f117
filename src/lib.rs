//! 开发工具链安装核心：驱动 nvm / npm 等外部安装流程，实时转发输出，
//! 并维护 shell profile，使新装的工具在当前进程和后续会话中可用。

pub mod catalog;
pub mod config;
pub mod error;
pub mod installer;
pub mod log_sink;
pub mod node_manager;
pub mod npm;
pub mod profile;

pub use config::Config;
pub use error::{InstallError, Result};
pub use installer::{InstallResult, OutputChunk, PackageDescriptor, PackageInstaller};
pub use node_manager::{get_node_manager, NodeManager, VersionDescriptor};
pub use profile::{ProfileManager, ShellProfile};
