//! shell 配置文件（profile）管理
//!
//! 负责在安装脚本运行前保证 profile 存在、以幂等方式追加内容，
//! 以及在当前进程中“执行” profile：用 shell source 一次，再把导出的
//! 环境变量合并回本进程，使新装的工具无需重启即可使用。

use crate::error::{InstallError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// 新建 profile 的权限
const PROFILE_MODE: u32 = 0o644;

/// shell 自己维护、不应写回本进程的变量
const SHELL_BOOKKEEPING_VARS: [&str; 4] = ["_", "SHLVL", "PWD", "OLDPWD"];

const BASH_FLAGS: &[&str] = &["--norc", "--noprofile", "-i"];
const ZSH_FLAGS: &[&str] = &["-f", "-i"];
const SH_FLAGS: &[&str] = &["-i"];

/// 安装流程依赖的 profile 操作
#[async_trait]
pub trait ShellProfile: Send + Sync {
    /// 目标 profile 路径
    fn path(&self) -> &Path;

    /// 不存在则创建；返回是否新建
    async fn ensure_exists(&self) -> Result<bool>;

    /// 把 profile 导出的环境变量应用到当前进程；返回发生变化的变量名
    async fn execute(&self, profile: &Path) -> Result<Vec<String>>;

    /// source 本 profile 后 `command -v program` 是否成功（可执行文件或 shell 函数均算）
    async fn command_exists(&self, program: &str) -> Result<bool>;
}

/// 根据 shell 推断默认 profile 路径
pub fn default_profile_path(shell: &str, home: &Path) -> PathBuf {
    let shell_name = Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(shell);
    match shell_name {
        "zsh" => home.join(".zshrc"),
        "fish" => home.join(".config/fish/config.fish"),
        _ => home.join(".bashrc"),
    }
}

/// 用于 source POSIX profile 的 shell 及其启动参数
///
/// bash / zsh 沿用用户的 shell，其余（fish 等）改用 /bin/sh。一律以交互模式
/// 启动并跳过 shell 自身的 rc 文件，这样 `case $- in *i*)` 守卫不会提前 return。
fn sourcing_shell(shell: &str) -> (String, &'static [&'static str]) {
    let shell_name = Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(shell);
    match shell_name {
        "bash" => (shell.to_string(), BASH_FLAGS),
        "zsh" => (shell.to_string(), ZSH_FLAGS),
        _ => ("/bin/sh".to_string(), SH_FLAGS),
    }
}

/// 同一路径的 profile 在整个进程内共用一把锁
fn profile_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

#[derive(Debug, Clone)]
pub struct ProfileManager {
    path: PathBuf,
    shell: String,
    // 所有写文件 / 改环境变量的操作串行执行；不同通道的安装器共享
    lock: Arc<Mutex<()>>,
}

impl ProfileManager {
    pub fn new(path: impl Into<PathBuf>, shell: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            lock: profile_lock(&path),
            path,
            shell: shell.into(),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.resolved_profile_path(), config.shell.clone())
    }

    /// 追加一行；已存在相同的行则不做任何修改
    pub async fn append_line(&self, line: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        self.create_if_missing().await?;

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.write_error(e))?;
        let wanted = line.trim_end_matches('\n');
        if content.lines().any(|l| l == wanted) {
            return Ok(false);
        }

        let mut addition = String::new();
        if !content.is_empty() && !content.ends_with('\n') {
            addition.push('\n');
        }
        addition.push_str(wanted);
        addition.push('\n');

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.write_error(e))?;
        file.write_all(addition.as_bytes())
            .await
            .map_err(|e| self.write_error(e))?;
        file.flush().await.map_err(|e| self.write_error(e))?;
        log::debug!("已追加到 {}: {}", self.path.display(), wanted);
        Ok(true)
    }

    async fn create_if_missing(&self) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.write_error(e))?;
        }
        let created = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(PROFILE_MODE)
            .open(&self.path)
            .await;
        match created {
            Ok(_) => {
                log::info!("已创建 profile: {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(self.write_error(e)),
        }
    }

    fn write_error(&self, source: std::io::Error) -> InstallError {
        InstallError::ProfileWrite {
            path: self.path.clone(),
            source,
        }
    }

    /// 在交互式子 shell 中执行 script（`$1`、`$2`… 依次为 args）
    ///
    /// 子进程以新会话启动，交互式 shell 拿不到控制终端，也就不会抢占前台进程组。
    fn interactive_shell(&self, script: &str, args: Vec<OsString>) -> duct::Expression {
        let (program, flags) = sourcing_shell(&self.shell);
        let mut argv: Vec<OsString> = flags.iter().map(OsString::from).collect();
        argv.push("-c".into());
        argv.push(script.into());
        argv.push(program.clone().into());
        argv.extend(args);

        duct::cmd(program, argv)
            .stdin_null()
            .stderr_null()
            .unchecked()
            .before_spawn(|cmd| {
                unsafe {
                    cmd.pre_exec(|| {
                        if libc::setsid() == -1 {
                            return Err(io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
                Ok(())
            })
    }

    /// source profile 并以 NUL 分隔导出全部环境变量
    async fn source_environment(&self, profile: &Path) -> Result<BTreeMap<String, String>> {
        if !profile.is_file() {
            return Err(InstallError::ProfileLoad {
                path: profile.to_path_buf(),
                reason: "文件不存在".to_string(),
            });
        }

        let load_error = |reason: String| InstallError::ProfileLoad {
            path: profile.to_path_buf(),
            reason,
        };
        let expr = self.interactive_shell(
            ". \"$1\" >/dev/null 2>&1; env -0",
            vec![profile.as_os_str().to_owned()],
        );
        let output = tokio::task::spawn_blocking(move || expr.stdout_capture().run())
            .await
            .map_err(|e| load_error(e.to_string()))?
            .map_err(|e| load_error(e.to_string()))?;

        if output.stdout.is_empty() {
            return Err(InstallError::ProfileLoad {
                path: profile.to_path_buf(),
                reason: format!(
                    "{} 未输出环境变量 (exit {:?})",
                    sourcing_shell(&self.shell).0,
                    output.status.code()
                ),
            });
        }
        Ok(parse_env_dump(&output.stdout))
    }
}

#[async_trait]
impl ShellProfile for ProfileManager {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_exists(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        self.create_if_missing().await
    }

    async fn execute(&self, profile: &Path) -> Result<Vec<String>> {
        let sourced = self.source_environment(profile).await?;

        let _guard = self.lock.lock().await;
        let mut changed = Vec::new();
        for (key, value) in sourced {
            if SHELL_BOOKKEEPING_VARS.contains(&key.as_str()) {
                continue;
            }
            let value = if is_path_like(&key) {
                dedupe_path_list(&value)
            } else {
                value
            };
            if std::env::var_os(&key).as_deref() != Some(std::ffi::OsStr::new(&value)) {
                std::env::set_var(&key, &value);
                changed.push(key);
            }
        }
        log::debug!("执行 {} 后变化的变量: {:?}", profile.display(), changed);
        Ok(changed)
    }

    async fn command_exists(&self, program: &str) -> Result<bool> {
        let expr = self.interactive_shell(
            "[ -f \"$1\" ] && . \"$1\" >/dev/null 2>&1; command -v \"$2\" >/dev/null 2>&1",
            vec![self.path.as_os_str().to_owned(), program.into()],
        );
        let output = tokio::task::spawn_blocking(move || expr.stdout_null().run())
            .await
            .map_err(|e| InstallError::Spawn(e.to_string()))?
            .map_err(|e| InstallError::Spawn(format!("无法检查命令 {}: {}", program, e)))?;
        Ok(output.status.success())
    }
}

/// 解析 `env -0` 的输出
fn parse_env_dump(raw: &[u8]) -> BTreeMap<String, String> {
    raw.split(|b| *b == 0)
        .filter_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (key, value) = entry.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn is_path_like(key: &str) -> bool {
    key.ends_with("PATH")
}

/// 去掉 `:` 分隔列表中的重复项，保留首次出现的位置
fn dedupe_path_list(value: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    value
        .split(':')
        .filter(|entry| seen.insert(*entry))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_path() {
        let home = Path::new("/home/u");
        assert_eq!(default_profile_path("/bin/zsh", home), home.join(".zshrc"));
        assert_eq!(default_profile_path("/usr/bin/bash", home), home.join(".bashrc"));
        assert_eq!(
            default_profile_path("/usr/local/bin/fish", home),
            home.join(".config/fish/config.fish")
        );
        assert_eq!(default_profile_path("/bin/sh", home), home.join(".bashrc"));
    }

    #[test]
    fn test_dedupe_path_list() {
        assert_eq!(dedupe_path_list("/a:/b:/a:/c:/b"), "/a:/b:/c");
        assert_eq!(dedupe_path_list("/only"), "/only");
    }

    #[test]
    fn test_parse_env_dump_keeps_multiline_values() {
        let raw = b"A=1\0B=line1\nline2\0=bad\0C=x=y\0";
        let env = parse_env_dump(raw);
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("line1\nline2"));
        assert_eq!(env.get("C").map(String::as_str), Some("x=y"));
        assert_eq!(env.len(), 3);
    }

    #[tokio::test]
    async fn test_ensure_exists_creates_then_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/.bashrc");
        let manager = ProfileManager::new(&path, "/bin/sh");

        assert!(manager.ensure_exists().await.unwrap());
        assert!(path.is_file());
        std::fs::write(&path, "export KEEP=1\n").unwrap();

        assert!(!manager.ensure_exists().await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "export KEEP=1\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ensure_exists_uses_profile_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".zshrc");
        ProfileManager::new(&path, "/bin/sh").ensure_exists().await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        // umask 只会去掉权限位
        assert_eq!(mode & !PROFILE_MODE, 0);
    }

    #[tokio::test]
    async fn test_ensure_exists_reports_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let manager = ProfileManager::new(blocker.join(".bashrc"), "/bin/sh");

        let err = manager.ensure_exists().await.unwrap_err();
        assert!(matches!(err, InstallError::ProfileWrite { .. }));
    }

    #[tokio::test]
    async fn test_append_line_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".bashrc");
        std::fs::write(&path, "alias ll='ls -l'").unwrap();
        let manager = ProfileManager::new(&path, "/bin/sh");
        let line = "export NVM_DIR=\"$HOME/.nvm\"";

        assert!(manager.append_line(line).await.unwrap());
        let once = std::fs::read_to_string(&path).unwrap();
        assert!(!manager.append_line(line).await.unwrap());
        let twice = std::fs::read_to_string(&path).unwrap();

        assert_eq!(once, twice);
        assert_eq!(once, format!("alias ll='ls -l'\n{}\n", line));
    }

    #[tokio::test]
    async fn test_execute_applies_exports_once() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join(".bashrc");
        std::fs::write(
            &profile,
            "export DEVKIT_TEST_EXEC_HOME=/opt/devkit\n\
             export DEVKIT_TEST_EXEC_PATH=\"/opt/devkit/bin:$DEVKIT_TEST_EXEC_PATH\"\n\
             echo noise\n",
        )
        .unwrap();
        std::env::set_var("DEVKIT_TEST_EXEC_PATH", "/usr/bin");
        let manager = ProfileManager::new(&profile, "/bin/sh");

        let changed = manager.execute(&profile).await.unwrap();
        assert!(changed.contains(&"DEVKIT_TEST_EXEC_HOME".to_string()));
        assert_eq!(std::env::var("DEVKIT_TEST_EXEC_HOME").unwrap(), "/opt/devkit");
        let first_path = std::env::var("DEVKIT_TEST_EXEC_PATH").unwrap();
        assert_eq!(first_path, "/opt/devkit/bin:/usr/bin");

        // 再执行一次：前置的目录已存在，去重后环境不变
        let changed = manager.execute(&profile).await.unwrap();
        assert!(!changed.iter().any(|k| k.starts_with("DEVKIT_TEST_EXEC")));
        assert_eq!(std::env::var("DEVKIT_TEST_EXEC_PATH").unwrap(), first_path);
    }

    #[tokio::test]
    async fn test_execute_missing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProfileManager::new(dir.path().join(".bashrc"), "/bin/sh");
        let err = manager
            .execute(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::ProfileLoad { .. }));
    }

    #[test]
    fn test_sourcing_shell_falls_back_to_sh() {
        assert_eq!(sourcing_shell("/usr/bin/bash").0, "/usr/bin/bash");
        assert_eq!(sourcing_shell("/bin/zsh").0, "/bin/zsh");
        assert_eq!(sourcing_shell("/usr/bin/fish").0, "/bin/sh");
        assert_eq!(sourcing_shell("").0, "/bin/sh");
        assert!(sourcing_shell("/bin/bash").1.contains(&"-i"));
    }

    #[tokio::test]
    async fn test_execute_gets_past_interactive_guard() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join(".bashrc");
        std::fs::write(
            &profile,
            "case $- in\n    *i*) ;;\n      *) return;;\nesac\n\
             export DEVKIT_TEST_GUARD_NVM_DIR=\"/home/u/.nvm\"\n",
        )
        .unwrap();

        for shell in ["/bin/sh", "/bin/bash"] {
            if !Path::new(shell).exists() {
                continue;
            }
            std::env::remove_var("DEVKIT_TEST_GUARD_NVM_DIR");
            let manager = ProfileManager::new(&profile, shell);

            let changed = manager.execute(&profile).await.unwrap();
            assert!(
                changed.contains(&"DEVKIT_TEST_GUARD_NVM_DIR".to_string()),
                "{}",
                shell
            );
            assert_eq!(
                std::env::var("DEVKIT_TEST_GUARD_NVM_DIR").as_deref(),
                Ok("/home/u/.nvm")
            );
        }
    }

    #[tokio::test]
    async fn test_execute_posix_profile_for_fish_user() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join(".profile");
        std::fs::write(&profile, "export DEVKIT_TEST_FISH_USER=1\n").unwrap();
        let manager = ProfileManager::new(dir.path().join(".config/fish/config.fish"), "/usr/bin/fish");

        manager.execute(&profile).await.unwrap();
        assert_eq!(std::env::var("DEVKIT_TEST_FISH_USER").as_deref(), Ok("1"));
    }

    #[test]
    fn test_managers_for_same_profile_share_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config {
            profile_path: Some(dir.path().join(".bashrc")),
            ..crate::config::Config::default()
        };
        // 每个通道的 PackageInstaller 都通过 from_config 创建自己的 ProfileManager
        let first = ProfileManager::from_config(&config);
        let second = ProfileManager::from_config(&config);
        let other = ProfileManager::new(dir.path().join(".zshrc"), "/bin/zsh");

        assert!(Arc::ptr_eq(&first.lock, &second.lock));
        assert!(!Arc::ptr_eq(&first.lock, &other.lock));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_from_separate_managers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".bashrc");

        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = ProfileManager::new(&path, "/bin/sh");
            tasks.push(tokio::spawn(async move {
                manager.ensure_exists().await.unwrap();
                manager.append_line(&format!("export DEVKIT_{}=1", i)).await.unwrap();
                manager.append_line("export NVM_DIR=\"$HOME/.nvm\"").await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 9);
        assert_eq!(content.matches("NVM_DIR").count(), 1);
    }

    #[tokio::test]
    async fn test_command_exists_sees_profile_path_and_functions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let tool = bin.join("devkit-fake-tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let profile = dir.path().join(".bashrc");
        std::fs::write(
            &profile,
            format!(
                "case $- in *i*) ;; *) return;; esac\n\
                 export PATH=\"{}:$PATH\"\n\
                 devkit_fake_fn() {{ :; }}\n",
                bin.display()
            ),
        )
        .unwrap();
        let manager = ProfileManager::new(&profile, "/bin/sh");

        assert!(manager.command_exists("devkit-fake-tool").await.unwrap());
        assert!(manager.command_exists("devkit_fake_fn").await.unwrap());
        assert!(!manager.command_exists("devkit-surely-missing-tool").await.unwrap());
    }

    #[tokio::test]
    async fn test_command_exists_without_profile() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProfileManager::new(dir.path().join(".bashrc"), "/bin/sh");
        assert!(manager.command_exists("sh").await.unwrap());
        assert!(!manager.command_exists("devkit-surely-missing-tool").await.unwrap());
    }
}
