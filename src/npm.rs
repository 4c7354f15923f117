//! 全局 npm 依赖查询

use crate::error::{InstallError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalNpmDependency {
    pub name: String,
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NpmLsOutput {
    #[serde(default)]
    dependencies: BTreeMap<String, NpmLsEntry>,
}

#[derive(Debug, Deserialize)]
struct NpmLsEntry {
    version: Option<String>,
}

/// `npm ls -g --depth=0 --json`
pub async fn list_global_dependencies(npm_program: &str) -> Result<Vec<GlobalNpmDependency>> {
    let program = npm_program.to_string();
    let output = tokio::task::spawn_blocking(move || {
        duct::cmd(program.as_str(), ["ls", "-g", "--depth=0", "--json"])
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            // 存在 extraneous / missing 依赖时 npm ls 退出码非零，但 JSON 仍然完整
            .unchecked()
            .run()
    })
    .await
    .map_err(|e| InstallError::Spawn(e.to_string()))?
    .map_err(|e| InstallError::Spawn(format!("无法执行 {} ls: {}", npm_program, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        return Err(InstallError::Spawn(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    parse_npm_ls(&stdout)
}

fn parse_npm_ls(json: &str) -> Result<Vec<GlobalNpmDependency>> {
    let parsed: NpmLsOutput = serde_json::from_str(json)
        .map_err(|e| InstallError::Parse(format!("npm ls: {}", e)))?;
    Ok(parsed
        .dependencies
        .into_iter()
        .map(|(name, entry)| GlobalNpmDependency {
            name,
            version: entry.version,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_npm_ls() {
        let json = r#"{
            "name": "lib",
            "dependencies": {
                "typescript": {"version": "5.4.5", "overridden": false},
                "corepack": {"version": "0.25.2"},
                "broken": {"missing": true}
            }
        }"#;
        let deps = parse_npm_ls(json).unwrap();
        assert_eq!(
            deps,
            vec![
                GlobalNpmDependency { name: "broken".into(), version: None },
                GlobalNpmDependency { name: "corepack".into(), version: Some("0.25.2".into()) },
                GlobalNpmDependency { name: "typescript".into(), version: Some("5.4.5".into()) },
            ]
        );
    }

    #[test]
    fn test_parse_npm_ls_without_dependencies() {
        assert!(parse_npm_ls("{}").unwrap().is_empty());
        assert!(parse_npm_ls("not json").is_err());
    }
}
