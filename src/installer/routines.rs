//! 各包族 / 管理器的安装流程

use super::parser::profile_path_from_transcript;
use super::registry::{InstallerRegistry, PackageFamily, RegistryMiss};
use super::streaming::CancelHandle;
use super::types::{
    InstallRequest, InstallStatus, PackageDescriptor, CHECK_COMMAND_OPTION, POST_INSTALL_OPTION,
    SOURCE_OPTION,
};
use super::InstallSession;
use crate::error::{InstallError, Result};
use async_trait::async_trait;
use std::str::FromStr;

/// 安装流程执行时可用的上下文
pub struct InstallContext<'a> {
    pub registry: &'a InstallerRegistry,
    pub session: &'a InstallSession,
    pub request: &'a InstallRequest,
    pub cancel: &'a CancelHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutineOutcome {
    Finished(InstallStatus),
    /// 下一级分派未命中，步骤被跳过
    Skipped(RegistryMiss),
}

#[async_trait]
pub trait FamilyRoutine: Send + Sync {
    async fn install(&self, ctx: &InstallContext<'_>) -> Result<RoutineOutcome>;
}

#[async_trait]
pub trait ManagerRoutine: Send + Sync {
    async fn install(&self, ctx: &InstallContext<'_>) -> Result<InstallStatus>;
}

/// descriptor 带有 checkCommand，且该命令在 profile 环境中已可用
async fn already_installed(ctx: &InstallContext<'_>) -> Result<bool> {
    let Some(command) = ctx.request.descriptor.non_empty_option(CHECK_COMMAND_OPTION) else {
        return Ok(false);
    };
    let found = ctx.session.profile().command_exists(command).await?;
    if found {
        log::info!("[{}] {} 已可用，跳过安装", ctx.session.channel(), command);
    }
    Ok(found)
}

/// 执行 postInstall
///
/// 先让 profile 在本进程生效，postInstall 才能找到刚装好的命令。
async fn run_post_install(ctx: &InstallContext<'_>) -> Result<()> {
    let Some(command) = ctx.request.descriptor.non_empty_option(POST_INSTALL_OPTION) else {
        return Ok(());
    };
    let profile = ctx.session.profile();
    if profile.path().is_file() {
        profile.execute(profile.path()).await?;
    }
    let args = vec!["-c".to_string(), command.to_string()];
    ctx.session
        .run_streaming("sh", &args, ctx.cancel, true)
        .await?;
    Ok(())
}

/// node：根据 options.managerName 再分派一次
pub struct NodeFamily;

#[async_trait]
impl FamilyRoutine for NodeFamily {
    async fn install(&self, ctx: &InstallContext<'_>) -> Result<RoutineOutcome> {
        let manager = ctx.request.descriptor.manager_name().unwrap_or_default();
        match ctx
            .registry
            .resolve_manager(PackageFamily::Node.as_str(), manager)
        {
            Ok(routine) => Ok(RoutineOutcome::Finished(routine.install(ctx).await?)),
            Err(miss) => Ok(RoutineOutcome::Skipped(miss)),
        }
    }
}

/// 通过 nvm 安装脚本安装
///
/// 1. checkCommand 已可用则直接返回
/// 2. 保证 profile 存在（脚本会往里追加 source 语句）
/// 3. `sh <script>`，输出实时转发
/// 4. 输出中若出现 nvm 写 profile 的提示，则在当前进程执行该 profile
/// 5. 执行 postInstall
pub struct NvmInstall;

#[async_trait]
impl ManagerRoutine for NvmInstall {
    async fn install(&self, ctx: &InstallContext<'_>) -> Result<InstallStatus> {
        if already_installed(ctx).await? {
            return Ok(InstallStatus::AlreadyInstalled);
        }

        let script = &ctx.request.script_path;
        if !script.is_file() {
            return Err(InstallError::ScriptNotFound(script.clone()));
        }

        let profile = ctx.session.profile();
        profile.ensure_exists().await?;

        let args = vec![script.to_string_lossy().into_owned()];
        let output = ctx
            .session
            .run_streaming("sh", &args, ctx.cancel, ctx.session.fail_on_nonzero_exit())
            .await?;

        if let Some(nvm_profile) = profile_path_from_transcript(&output.transcript) {
            // 让 nvm 的环境变量在当前进程立即生效
            log::info!("nvm 已写入 {}，在当前进程中执行", nvm_profile.display());
            profile.execute(&nvm_profile).await?;
        }
        run_post_install(ctx).await?;
        Ok(InstallStatus::Installed)
    }
}

/// 由软件包目录驱动的 shell 安装：`sh -c <source>`，随后执行 postInstall
pub struct ShellScript;

#[async_trait]
impl FamilyRoutine for ShellScript {
    async fn install(&self, ctx: &InstallContext<'_>) -> Result<RoutineOutcome> {
        let source = ctx
            .request
            .descriptor
            .non_empty_option(SOURCE_OPTION)
            .ok_or_else(|| InstallError::InvalidDescriptor("缺少 source".to_string()))?;
        if already_installed(ctx).await? {
            return Ok(RoutineOutcome::Finished(InstallStatus::AlreadyInstalled));
        }

        ctx.session.profile().ensure_exists().await?;
        let args = vec!["-c".to_string(), source.to_string()];
        ctx.session
            .run_streaming("sh", &args, ctx.cancel, true)
            .await?;
        run_post_install(ctx).await?;
        Ok(RoutineOutcome::Finished(InstallStatus::Installed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpmAction {
    Install,
    Update,
    Reinstall,
    Uninstall,
}

impl FromStr for NpmAction {
    type Err = InstallError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "install" => Ok(NpmAction::Install),
            "update" => Ok(NpmAction::Update),
            "reinstall" => Ok(NpmAction::Reinstall),
            "uninstall" => Ok(NpmAction::Uninstall),
            _ => Err(InstallError::InvalidDescriptor(format!("未知的 npm 操作: {}", s))),
        }
    }
}

/// npm 全局依赖的安装 / 更新 / 重装 / 卸载
pub struct NpmGlobal;

impl NpmGlobal {
    pub const PACKAGE_OPTION: &'static str = "packageName";
    pub const ACTION_OPTION: &'static str = "action";
    pub const VERSION_OPTION: &'static str = "version";

    /// 由 descriptor 生成 npm 参数
    pub fn npm_args(descriptor: &PackageDescriptor) -> Result<Vec<String>> {
        let package = descriptor
            .non_empty_option(Self::PACKAGE_OPTION)
            .ok_or_else(|| InstallError::InvalidDescriptor("缺少 packageName".to_string()))?;
        if package.starts_with('-') {
            return Err(InstallError::InvalidDescriptor(format!(
                "非法的包名: {}",
                package
            )));
        }

        let action = match descriptor.option(Self::ACTION_OPTION) {
            Some(a) => a.parse()?,
            None => NpmAction::Install,
        };
        let version = descriptor.non_empty_option(Self::VERSION_OPTION);

        let args = match (action, version) {
            (NpmAction::Install, Some(v)) => vec!["install".into(), "-g".into(), format!("{}@{}", package, v)],
            (NpmAction::Install, None) => vec!["install".into(), "-g".into(), package.to_string()],
            (NpmAction::Update, _) => vec!["update".into(), "-g".into(), package.to_string()],
            (NpmAction::Reinstall, Some(v)) => vec!["install".into(), "-g".into(), format!("{}@{}", package, v)],
            (NpmAction::Reinstall, None) => {
                return Err(InstallError::InvalidDescriptor(format!(
                    "重装 {} 需要指定 version",
                    package
                )))
            }
            (NpmAction::Uninstall, _) => vec!["uninstall".into(), "-g".into(), package.to_string()],
        };
        Ok(args)
    }
}

#[async_trait]
impl FamilyRoutine for NpmGlobal {
    async fn install(&self, ctx: &InstallContext<'_>) -> Result<RoutineOutcome> {
        let args = Self::npm_args(&ctx.request.descriptor)?;
        ctx.session
            .run_streaming(ctx.session.npm_program(), &args, ctx.cancel, true)
            .await?;
        Ok(RoutineOutcome::Finished(InstallStatus::Installed))
    }
}
