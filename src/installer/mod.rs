//! 安装编排模块：解析安装流程、驱动外部脚本、转发输出、处理 profile

pub mod parser;
pub mod registry;
pub mod routines;
pub mod streaming;
pub mod types;

// 重新导出常用类型
pub use registry::{InstallerRegistry, ManagerKind, PackageFamily, RegistryMiss};
pub use routines::{FamilyRoutine, InstallContext, ManagerRoutine, RoutineOutcome};
pub use streaming::{CancelHandle, ProcessRunner};
pub use types::{
    ChunkData, InstallRequest, InstallResult, InstallStatus, LogLevel, OutputChunk,
    PackageDescriptor, ProcessOutput, CHECK_COMMAND_OPTION, MANAGER_NAME_OPTION,
    POST_INSTALL_OPTION, SOURCE_OPTION,
};

use crate::config::Config;
use crate::error::{InstallError, Result};
use crate::log_sink::LogSink;
use crate::profile::{ProfileManager, ShellProfile};
use parser::LineBuffer;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// 一个通道上的安装环境：进程执行、输出转发、日志、profile
pub struct InstallSession {
    channel: String,
    runner: ProcessRunner,
    profile: Arc<dyn ShellProfile>,
    log_sink: Arc<dyn LogSink>,
    events: mpsc::UnboundedSender<OutputChunk>,
    line_buffered: bool,
    fail_on_nonzero_exit: bool,
    npm_program: String,
}

impl InstallSession {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn profile(&self) -> &dyn ShellProfile {
        self.profile.as_ref()
    }

    pub fn fail_on_nonzero_exit(&self) -> bool {
        self.fail_on_nonzero_exit
    }

    pub fn npm_program(&self) -> &str {
        &self.npm_program
    }

    /// 执行命令并把输出实时推送到通道
    ///
    /// 返回前会等待所有输出块转发完毕。成功时完整输出以 info 级别写入日志，
    /// 失败时错误文本以 error 级别写入日志。
    pub async fn run_streaming(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancelHandle,
        require_success: bool,
    ) -> Result<ProcessOutput> {
        let (output_tx, mut output_rx) = mpsc::unbounded_channel::<String>();
        let events = self.events.clone();
        let channel = self.channel.clone();
        let line_buffered = self.line_buffered;

        let forwarder = tokio::spawn(async move {
            let send = |data: ChunkData| {
                let _ = events.send(OutputChunk {
                    channel: channel.clone(),
                    data,
                });
            };
            let mut lines = LineBuffer::default();
            while let Some(text) = output_rx.recv().await {
                if line_buffered {
                    for data in lines.push(&text) {
                        send(data);
                    }
                } else {
                    send(ChunkData {
                        chunk: text,
                        ln: false,
                    });
                }
            }
            if let Some(rest) = lines.finish() {
                send(rest);
            }
        });

        let result = self.runner.run(program, args, output_tx, cancel).await;
        // 输出全部转发完成后才向调用方报告结果
        if let Err(e) = forwarder.await {
            log::warn!("[{}] 输出转发任务异常退出: {}", self.channel, e);
        }

        match result {
            Ok(output) => {
                log::info!("[{}] {} 输出:\n{}", self.channel, program, output.transcript);
                self.record(&output.transcript, false, LogLevel::Info);
                if require_success && !output.success() {
                    let err = InstallError::NonZeroExit {
                        command: format!("{} {}", program, args.join(" ")),
                        code: output.exit_code,
                    };
                    self.record(&err.to_string(), true, LogLevel::Error);
                    return Err(err);
                }
                Ok(output)
            }
            Err(err) => {
                log::error!("[{}] {} 执行失败: {}", self.channel, program, err);
                self.record(&err.to_string(), true, LogLevel::Error);
                Err(err)
            }
        }
    }

    fn record(&self, text: &str, is_error: bool, level: LogLevel) {
        if let Err(e) = self.log_sink.write(&self.channel, text, is_error, level) {
            log::warn!("[{}] 写入安装日志失败: {}", self.channel, e);
        }
    }
}

/// 安装入口；一个实例对应一个输出通道，同一时间只运行一个安装
pub struct PackageInstaller {
    registry: InstallerRegistry,
    session: InstallSession,
    active: Mutex<Option<CancelHandle>>,
}

/// 安装结束（含出错、取消）时释放通道
struct ActiveInstall<'a> {
    slot: &'a Mutex<Option<CancelHandle>>,
}

impl Drop for ActiveInstall<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

impl PackageInstaller {
    pub fn new(
        config: &Config,
        channel: impl Into<String>,
        events: mpsc::UnboundedSender<OutputChunk>,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        let session = InstallSession {
            channel: channel.into(),
            runner: ProcessRunner::new(Duration::from_secs(config.cancel_grace_secs)),
            profile: Arc::new(ProfileManager::from_config(config)),
            log_sink,
            events,
            line_buffered: config.line_buffered,
            fail_on_nonzero_exit: config.fail_on_nonzero_exit,
            npm_program: config.npm_program.clone(),
        };
        Self {
            registry: InstallerRegistry::with_defaults(),
            session,
            active: Mutex::new(None),
        }
    }

    pub fn with_profile(mut self, profile: Arc<dyn ShellProfile>) -> Self {
        self.session.profile = profile;
        self
    }

    pub fn with_registry(mut self, registry: InstallerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.session.runner = runner;
        self
    }

    pub fn channel(&self) -> &str {
        self.session.channel()
    }

    /// 取消当前安装；没有正在运行的安装时返回 false
    pub fn cancel(&self) -> bool {
        let slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    fn begin(&self, cancel: CancelHandle) -> Result<ActiveInstall<'_>> {
        let mut slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(InstallError::ChannelBusy(self.session.channel.clone()));
        }
        *slot = Some(cancel);
        Ok(ActiveInstall { slot: &self.active })
    }

    /// 安装 / 升级 / 卸载一个软件包
    ///
    /// 注册表未命中时不报错：直接返回 `{ name, localPath: null }`，
    /// 并在 `skipped` 中记录原因。checkCommand 已可用时 `status` 为
    /// `AlreadyInstalled`，不运行任何安装命令。
    pub async fn install(
        &self,
        descriptor: &PackageDescriptor,
        script_path: &Path,
    ) -> Result<InstallResult> {
        let request = InstallRequest {
            descriptor: descriptor.clone(),
            script_path: script_path.to_path_buf(),
            channel: self.session.channel.clone(),
        };
        self.install_request(&request).await
    }

    pub async fn install_request(&self, request: &InstallRequest) -> Result<InstallResult> {
        if request.channel != self.session.channel {
            return Err(InstallError::InvalidDescriptor(format!(
                "请求通道 {} 与安装器通道 {} 不一致",
                request.channel, self.session.channel
            )));
        }

        let cancel = CancelHandle::new();
        let _active = self.begin(cancel.clone())?;
        let name = request.descriptor.name.clone();
        log::debug!("[{}] 开始安装 {}", self.session.channel, name);

        let outcome = match self.registry.resolve(&name) {
            Ok(routine) => {
                let ctx = InstallContext {
                    registry: &self.registry,
                    session: &self.session,
                    request,
                    cancel: &cancel,
                };
                routine.install(&ctx).await?
            }
            Err(miss) => RoutineOutcome::Skipped(miss),
        };
        let (status, skipped) = match outcome {
            RoutineOutcome::Finished(status) => (Some(status), None),
            RoutineOutcome::Skipped(miss) => (None, Some(miss)),
        };

        if let Some(miss) = &skipped {
            log::warn!("[{}] {}，跳过安装步骤", self.session.channel, miss);
        }

        // TODO: 解析 nvm 安装后的 node 可执行文件路径并填入 local_path
        Ok(InstallResult {
            name,
            local_path: None,
            status,
            skipped,
        })
    }
}
