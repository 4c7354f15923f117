//! 安装流程注册表：包族 → 安装流程，包族 + 管理器 → 管理器安装流程

use super::routines::{
    FamilyRoutine, ManagerRoutine, NodeFamily, NpmGlobal, NvmInstall, ShellScript,
};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageFamily {
    Node,
    Npm,
    Shell,
}

impl PackageFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageFamily::Node => "node",
            PackageFamily::Npm => "npm",
            PackageFamily::Shell => "shell",
        }
    }
}

impl fmt::Display for PackageFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageFamily {
    type Err = RegistryMiss;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(PackageFamily::Node),
            "npm" => Ok(PackageFamily::Npm),
            "shell" => Ok(PackageFamily::Shell),
            _ => Err(RegistryMiss::UnknownFamily(s.to_string())),
        }
    }
}

/// 通过安装脚本安装运行时的管理器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerKind {
    Nvm,
}

impl ManagerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerKind::Nvm => "nvm",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "nvm" => Some(ManagerKind::Nvm),
            _ => None,
        }
    }
}

/// 注册表未命中：安装步骤被跳过，但不视为错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryMiss {
    #[error("未注册包族 `{0}` 的安装流程")]
    UnknownFamily(String),

    #[error("包族 `{family}` 未注册管理器 `{manager}` 的安装流程")]
    UnknownManager { family: String, manager: String },
}

pub struct InstallerRegistry {
    families: HashMap<PackageFamily, Box<dyn FamilyRoutine>>,
    managers: HashMap<(PackageFamily, ManagerKind), Box<dyn ManagerRoutine>>,
}

impl Default for InstallerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl InstallerRegistry {
    pub fn empty() -> Self {
        Self {
            families: HashMap::new(),
            managers: HashMap::new(),
        }
    }

    /// node → 按管理器分派（nvm），npm → 直接执行 npm 全局操作，
    /// shell → 执行目录条目给出的安装命令
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register_family(PackageFamily::Node, NodeFamily);
        registry.register_family(PackageFamily::Npm, NpmGlobal);
        registry.register_family(PackageFamily::Shell, ShellScript);
        registry.register_manager(PackageFamily::Node, ManagerKind::Nvm, NvmInstall);
        registry
    }

    pub fn register_family(&mut self, family: PackageFamily, routine: impl FamilyRoutine + 'static) {
        self.families.insert(family, Box::new(routine));
    }

    pub fn register_manager(
        &mut self,
        family: PackageFamily,
        manager: ManagerKind,
        routine: impl ManagerRoutine + 'static,
    ) {
        self.managers.insert((family, manager), Box::new(routine));
    }

    pub fn resolve(&self, family_name: &str) -> Result<&dyn FamilyRoutine, RegistryMiss> {
        let family: PackageFamily = family_name.parse()?;
        self.families
            .get(&family)
            .map(|r| r.as_ref())
            .ok_or_else(|| RegistryMiss::UnknownFamily(family_name.to_string()))
    }

    pub fn resolve_manager(
        &self,
        family_name: &str,
        manager_name: &str,
    ) -> Result<&dyn ManagerRoutine, RegistryMiss> {
        let miss = || RegistryMiss::UnknownManager {
            family: family_name.to_string(),
            manager: manager_name.to_string(),
        };
        let family: PackageFamily = family_name.parse()?;
        let manager = ManagerKind::parse(manager_name).ok_or_else(miss)?;
        self.managers
            .get(&(family, manager))
            .map(|r| r.as_ref())
            .ok_or_else(miss)
    }
}
