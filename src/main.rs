use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use devkit_installer::catalog::Catalog;
use devkit_installer::installer::{InstallStatus, MANAGER_NAME_OPTION};
use devkit_installer::log_sink::FileLogSink;
use devkit_installer::profile::{ProfileManager, ShellProfile};
use devkit_installer::{get_node_manager, npm, Config, PackageDescriptor, PackageInstaller};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "devkit")]
#[command(about = "安装 / 升级 / 卸载开发工具链组件", long_about = None)]
struct Cli {
    /// 配置文件路径（默认 ~/.config/devkit/config.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 安装软件包：node 通过管理器脚本安装，npm 直接操作全局依赖
    Install {
        /// 包族名称，例如 node / npm
        name: String,

        /// 安装脚本路径（nvm install.sh）
        #[arg(long)]
        script: Option<PathBuf>,

        /// 版本管理器，例如 nvm
        #[arg(long)]
        manager: Option<String>,

        /// 额外参数 KEY=VALUE，可重复
        #[arg(long = "option", value_parser = parse_key_val)]
        options: Vec<(String, String)>,

        /// 输出通道 id
        #[arg(long)]
        channel: Option<String>,

        /// 以 JSON 行输出每个输出块
        #[arg(long)]
        json: bool,
    },
    /// 列出可安装的 Node 版本
    Versions {
        /// nvm 或 fnm
        manager: String,

        #[arg(long)]
        limit: Option<usize>,
    },
    /// 列出全局 npm 依赖
    NpmList,
    /// 查看软件包目录中的条目
    Info { name: String },
    /// 确保 shell profile 存在并输出其路径
    Profile {
        /// 追加一行（已存在相同的行则不修改）
        #[arg(long)]
        append: Option<String>,
    },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("参数应为 KEY=VALUE: {}", s))?;
    if key.is_empty() {
        return Err(format!("参数名不能为空: {}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Install {
            name,
            script,
            manager,
            options,
            channel,
            json,
        } => {
            let mut descriptor = load_catalog(&config)?
                .and_then(|catalog| catalog.find(&name).map(|entry| entry.descriptor()))
                .unwrap_or_else(|| PackageDescriptor::new(&name));
            if let Some(manager) = manager {
                descriptor
                    .options
                    .insert(MANAGER_NAME_OPTION.to_string(), manager);
            }
            descriptor.options.extend(options);

            let channel = channel.unwrap_or_else(|| config.channel.clone());
            run_install(&config, descriptor, script.unwrap_or_default(), channel, json).await?;
        }
        Commands::Versions { manager, limit } => {
            let node_manager = get_node_manager(&manager, &config)?;
            let versions = node_manager.get_node_versions_list().await?;
            let limit = limit.unwrap_or(versions.len());
            for v in versions.iter().take(limit) {
                println!(
                    "{:<12} {:<10} {}",
                    v.version,
                    v.lts.as_deref().unwrap_or("-"),
                    v.date.as_deref().unwrap_or("")
                );
            }
        }
        Commands::NpmList => {
            for dep in npm::list_global_dependencies(&config.npm_program).await? {
                println!("{}@{}", dep.name, dep.version.as_deref().unwrap_or("?"));
            }
        }
        Commands::Info { name } => {
            let catalog =
                load_catalog(&config)?.ok_or_else(|| anyhow!("未配置 catalog_path"))?;
            let entry = catalog
                .find(&name)
                .ok_or_else(|| anyhow!("软件包目录中没有 {}", name))?;
            println!("{}", serde_json::to_string_pretty(entry)?);
        }
        Commands::Profile { append } => run_profile(&config, append.as_deref()).await?,
    }

    Ok(())
}

async fn run_profile(config: &Config, append: Option<&str>) -> Result<()> {
    let profile = ProfileManager::from_config(config);
    let created = profile.ensure_exists().await?;
    println!(
        "{}{}",
        profile.path().display(),
        if created { " (已创建)" } else { "" }
    );
    if let Some(line) = append {
        if profile.append_line(line).await? {
            println!("已追加: {}", line);
        } else {
            println!("已存在，未修改: {}", line);
        }
    }
    Ok(())
}

fn load_catalog(config: &Config) -> Result<Option<Catalog>> {
    match &config.catalog_path {
        Some(path) => Ok(Some(Catalog::load(path)?)),
        None => Ok(None),
    }
}

async fn run_install(
    config: &Config,
    descriptor: PackageDescriptor,
    script: PathBuf,
    channel: String,
    json: bool,
) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(FileLogSink::new(config.log_dir.clone()));
    let installer = Arc::new(PackageInstaller::new(config, channel, events_tx, sink));

    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(chunk) = events_rx.recv().await {
            if json {
                match serde_json::to_string(&chunk) {
                    Ok(line) => {
                        let _ = writeln!(stdout, "{}", line);
                    }
                    Err(e) => log::warn!("无法序列化输出块: {}", e),
                }
            } else {
                let _ = write!(stdout, "{}", chunk.data.chunk);
            }
            let _ = stdout.flush();
        }
    });

    // Ctrl+C 取消当前安装
    let ctrl_c = {
        let installer = installer.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && installer.cancel() {
                eprintln!("\n正在取消安装...");
            }
        })
    };

    let result = installer.install(&descriptor, &script).await;

    ctrl_c.abort();
    let _ = ctrl_c.await;
    // 释放最后一个发送端，输出任务随之结束
    drop(installer);
    printer.await?;

    let result = result?;
    if let Some(miss) = &result.skipped {
        eprintln!("警告: {}", miss);
    }
    if result.status == Some(InstallStatus::AlreadyInstalled) {
        eprintln!("{} 已安装，未重复执行", descriptor.name);
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("managerName=nvm").unwrap(),
            ("managerName".to_string(), "nvm".to_string())
        );
        assert_eq!(
            parse_key_val("postInstall=a=b").unwrap(),
            ("postInstall".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_profile_append_flag() {
        let cli = Cli::try_parse_from(["devkit", "profile", "--append", "export A=1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Profile { append: Some(ref line) } if line == "export A=1"
        ));
        let cli = Cli::try_parse_from(["devkit", "profile"]).unwrap();
        assert!(matches!(cli.command, Commands::Profile { append: None }));
    }

    #[tokio::test]
    async fn test_run_profile_appends_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".bashrc");
        let config = Config {
            profile_path: Some(path.clone()),
            ..Config::default()
        };

        run_profile(&config, Some("export NVM_DIR=\"$HOME/.nvm\"")).await.unwrap();
        run_profile(&config, Some("export NVM_DIR=\"$HOME/.nvm\"")).await.unwrap();
        run_profile(&config, None).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "export NVM_DIR=\"$HOME/.nvm\"\n"
        );
    }
}
