//! Node 版本管理器抽象（nvm / fnm）
//!
//! 版本列表同时用于 UI 展示和安装目标校验。nvm 读取 Node 官方发布索引
//! （nvm ls-remote 使用的同一份 index.json），fnm 调用本地 `fnm ls-remote`。

use crate::config::Config;
use crate::error::{InstallError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// 一个可安装的 Node 版本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub version: String,
    /// LTS 代号，例如 "Iron"
    pub lts: Option<String>,
    pub date: Option<String>,
}

#[async_trait]
pub trait NodeManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// 可用版本，按发布先后从新到旧
    async fn get_node_versions_list(&self) -> Result<Vec<VersionDescriptor>>;
}

/// 按名称选择管理器；未知名称直接失败，不做任何 I/O
pub fn get_node_manager(name: &str, config: &Config) -> Result<Box<dyn NodeManager>> {
    match name {
        "nvm" => Ok(Box::new(NvmManager::new(config.node_mirror.clone()))),
        "fnm" => Ok(Box::new(FnmManager::new(config.fnm_program.clone()))),
        _ => Err(InstallError::UnsupportedManager(name.to_string())),
    }
}

pub struct NvmManager {
    client: Client,
    mirror: String,
}

#[derive(Debug, Deserialize)]
struct DistEntry {
    version: String,
    date: Option<String>,
    #[serde(default)]
    lts: LtsField,
}

/// index.json 中的 lts 字段：非 LTS 为 false，LTS 为代号
#[derive(Debug, Deserialize, Default)]
#[serde(untagged)]
enum LtsField {
    #[default]
    None,
    Flag(bool),
    Name(String),
}

impl LtsField {
    fn into_name(self) -> Option<String> {
        match self {
            LtsField::Name(name) => Some(name),
            LtsField::None | LtsField::Flag(_) => None,
        }
    }
}

impl NvmManager {
    pub fn new(mirror: String) -> Self {
        Self {
            client: Client::new(),
            mirror,
        }
    }

    fn index_url(&self) -> String {
        format!("{}/index.json", self.mirror.trim_end_matches('/'))
    }
}

#[async_trait]
impl NodeManager for NvmManager {
    fn name(&self) -> &'static str {
        "nvm"
    }

    async fn get_node_versions_list(&self) -> Result<Vec<VersionDescriptor>> {
        let url = self.index_url();
        log::debug!("获取 Node 版本列表: {}", url);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body = response.text().await?;
        parse_dist_index(&body)
    }
}

fn parse_dist_index(body: &str) -> Result<Vec<VersionDescriptor>> {
    let entries: Vec<DistEntry> = serde_json::from_str(body)
        .map_err(|e| InstallError::Parse(format!("Node 发布索引: {}", e)))?;
    let mut versions: Vec<VersionDescriptor> = entries
        .into_iter()
        .map(|entry| VersionDescriptor {
            version: entry.version,
            lts: entry.lts.into_name(),
            date: entry.date,
        })
        .collect();
    sort_newest_first(&mut versions);
    Ok(versions)
}

pub struct FnmManager {
    program: String,
}

impl FnmManager {
    pub fn new(program: String) -> Self {
        Self { program }
    }
}

#[async_trait]
impl NodeManager for FnmManager {
    fn name(&self) -> &'static str {
        "fnm"
    }

    async fn get_node_versions_list(&self) -> Result<Vec<VersionDescriptor>> {
        let program = self.program.clone();
        let output = tokio::task::spawn_blocking(move || {
            duct::cmd(program.as_str(), ["ls-remote"])
                .stdin_null()
                .stderr_capture()
                .stdout_capture()
                .unchecked()
                .run()
        })
        .await
        .map_err(|e| InstallError::Spawn(e.to_string()))?
        .map_err(|e| InstallError::Spawn(format!("无法执行 {} ls-remote: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(InstallError::Spawn(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(parse_fnm_ls_remote(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// 解析 `fnm ls-remote`：每行形如 `v20.11.0 (Iron)` 或 `v21.6.0`
fn parse_fnm_ls_remote(stdout: &str) -> Vec<VersionDescriptor> {
    let mut versions: Vec<VersionDescriptor> = stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let mut parts = line.splitn(2, char::is_whitespace);
            let version = parts.next()?.trim();
            parse_version(version)?;
            let lts = parts
                .next()
                .map(|rest| rest.trim().trim_start_matches('(').trim_end_matches(')').trim())
                .filter(|name| !name.is_empty())
                .map(str::to_string);
            Some(VersionDescriptor {
                version: version.to_string(),
                lts,
                date: None,
            })
        })
        .collect();
    sort_newest_first(&mut versions);
    versions
}

/// "v20.11.0" → (20, 11, 0)
fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.strip_prefix('v').unwrap_or(version).split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some((major, minor, patch))
}

fn sort_newest_first(versions: &mut [VersionDescriptor]) {
    versions.sort_by(|a, b| parse_version(&b.version).cmp(&parse_version(&a.version)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_manager() {
        let err = get_node_manager("unsupported-tool", &Config::default())
            .err()
            .unwrap();
        assert!(matches!(err, InstallError::UnsupportedManager(ref n) if n == "unsupported-tool"));
        assert!(err.to_string().contains("unsupported-tool"));
    }

    #[test]
    fn test_known_managers() {
        let config = Config::default();
        assert_eq!(get_node_manager("nvm", &config).unwrap().name(), "nvm");
        assert_eq!(get_node_manager("fnm", &config).unwrap().name(), "fnm");
    }

    #[test]
    fn test_index_url_trims_slash() {
        let nvm = NvmManager::new("https://npmmirror.com/mirrors/node/".to_string());
        assert_eq!(nvm.index_url(), "https://npmmirror.com/mirrors/node/index.json");
    }

    #[test]
    fn test_parse_dist_index() {
        let body = r#"[
            {"version":"v20.11.1","date":"2024-02-14","files":[],"lts":"Iron","security":true},
            {"version":"v21.6.2","date":"2024-02-14","files":[],"lts":false,"security":true},
            {"version":"v9.11.2","date":"2018-06-12","files":[],"lts":false}
        ]"#;
        let versions = parse_dist_index(body).unwrap();
        let names: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(names, vec!["v21.6.2", "v20.11.1", "v9.11.2"]);
        assert_eq!(versions[1].lts.as_deref(), Some("Iron"));
        assert_eq!(versions[0].lts, None);
        assert_eq!(versions[2].date.as_deref(), Some("2018-06-12"));
    }

    #[test]
    fn test_parse_fnm_ls_remote() {
        let stdout = "v18.19.1 (Hydrogen)\nv20.11.1 (Iron)\nv21.6.2\n\nnot-a-version\n";
        let versions = parse_fnm_ls_remote(stdout);
        assert_eq!(
            versions,
            vec![
                VersionDescriptor { version: "v21.6.2".into(), lts: None, date: None },
                VersionDescriptor { version: "v20.11.1".into(), lts: Some("Iron".into()), date: None },
                VersionDescriptor {
                    version: "v18.19.1".into(),
                    lts: Some("Hydrogen".into()),
                    date: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_fnm_missing_program() {
        let fnm = FnmManager::new("/nonexistent/devkit-fnm".to_string());
        let err = fnm.get_node_versions_list().await.unwrap_err();
        assert!(matches!(err, InstallError::Spawn(_)));
    }
}
