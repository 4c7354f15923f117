//! 内置软件包目录（data.json）
//!
//! 只读：按名称查找软件包元数据，并为 PackageDescriptor 提供默认 options。

use crate::error::{InstallError, Result};
use crate::installer::PackageDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub bases: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    pub url: Option<String>,
    #[serde(default)]
    pub recommended: bool,
    #[serde(default)]
    pub is_internal: bool,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// 安装时使用的包族；未设置时与 name 相同
    pub family: Option<String>,
    pub version: Option<String>,
    /// 安装时的默认参数，例如 {"managerName": "nvm"} 或
    /// {"source": "...", "checkCommand": "...", "postInstall": "..."}
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl CatalogEntry {
    pub fn descriptor(&self) -> PackageDescriptor {
        PackageDescriptor {
            name: self.family.clone().unwrap_or_else(|| self.name.clone()),
            options: self.options.clone(),
        }
    }
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| InstallError::Catalog(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| InstallError::Catalog(e.to_string()))
    }

    pub fn find(&self, name: &str) -> Option<&CatalogEntry> {
        self.bases.iter().find(|entry| entry.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: &str = r#"{
        "bases": [
            {
                "name": "node",
                "title": "Node.js",
                "description": "JavaScript runtime",
                "icon": "node.png",
                "recommended": true,
                "isInternal": false,
                "type": "tool",
                "version": null,
                "options": {"managerName": "nvm"}
            },
            {"name": "git", "title": "Git"},
            {
                "name": "rustup",
                "title": "Rust",
                "family": "shell",
                "options": {
                    "source": "curl -sSf https://sh.rustup.rs | sh -s -- -y",
                    "checkCommand": "rustup",
                    "postInstall": "rustup component add clippy"
                }
            }
        ]
    }"#;

    #[test]
    fn test_find_and_seed_descriptor() {
        let catalog = Catalog::parse(DATA).unwrap();
        let node = catalog.find("node").unwrap();
        assert_eq!(node.title, "Node.js");
        assert_eq!(node.kind.as_deref(), Some("tool"));
        assert!(node.recommended);

        let descriptor = node.descriptor();
        assert_eq!(descriptor.name, "node");
        assert_eq!(descriptor.manager_name(), Some("nvm"));

        assert!(catalog.find("git").unwrap().options.is_empty());
        assert!(catalog.find("python").is_none());
    }

    #[test]
    fn test_family_overrides_descriptor_name() {
        let catalog = Catalog::parse(DATA).unwrap();
        let descriptor = catalog.find("rustup").unwrap().descriptor();
        assert_eq!(descriptor.name, "shell");
        assert_eq!(descriptor.option("checkCommand"), Some("rustup"));
        assert_eq!(
            descriptor.option("postInstall"),
            Some("rustup component add clippy")
        );
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Catalog::load(&dir.path().join("data.json")).unwrap_err();
        assert!(matches!(err, InstallError::Catalog(_)));
    }
}
