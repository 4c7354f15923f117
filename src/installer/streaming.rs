//! 流式命令执行（安装脚本 / npm）

use super::parser::Utf8ChunkDecoder;
use super::types::ProcessOutput;
use crate::error::{InstallError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};

/// 让 stderr 与 stdout 共用一根管道，保证输出顺序与写入顺序一致
const MERGE_STREAMS: &str = "exec \"$@\" 2>&1";

const READ_BUFFER_SIZE: usize = 4096;

/// 取消句柄：每次安装一个，可跨任务克隆
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求取消；进程尚未启动时会直接阻止启动
    pub fn cancel(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        // notify_one 会保留一个 permit，取消发生在 await 之前也不会丢
        self.inner.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

/// 启动外部命令，把合并后的输出逐块推入 channel
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// 用于合并输出流的 POSIX shell
    shell: PathBuf,
    /// SIGINT 之后等待多久再升级为 SIGTERM
    grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProcessRunner {
    pub fn new(grace: Duration) -> Self {
        Self {
            shell: PathBuf::from("sh"),
            grace,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// 执行命令直到退出
    ///
    /// 每读到一块输出就发送到 `output_tx`；函数返回时 `output_tx` 已被丢弃，
    /// 接收端读到 None 即表示输出结束。进程退出即视为成功，不检查退出码。
    /// 读取出错时立即停止发送并返回 `InstallError::Spawn`。
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        output_tx: mpsc::UnboundedSender<String>,
        cancel: &CancelHandle,
    ) -> Result<ProcessOutput> {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(MERGE_STREAMS).arg("sh").arg(program).args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // 独立进程组，方便统一终止 sh 及其子进程
        cmd.process_group(0);
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| InstallError::Spawn(format!("无法启动 {}: {}", program, e)))?;
        log::debug!("已启动 {} (pid {:?})", program, child.id());

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            return Err(InstallError::Spawn(format!("{} 的输出管道不可用", program)));
        };

        let mut transcript = String::new();
        let mut out_buf = [0u8; READ_BUFFER_SIZE];
        let mut err_buf = [0u8; READ_BUFFER_SIZE];
        let mut out_decoder = Utf8ChunkDecoder::default();
        let mut err_decoder = Utf8ChunkDecoder::default();
        let mut out_open = true;
        let mut err_open = true;

        let emit = |text: String, transcript: &mut String| {
            if text.is_empty() {
                return;
            }
            transcript.push_str(&text);
            let _ = output_tx.send(text);
        };

        while out_open || err_open {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("取消 {}，终止进程组", program);
                    terminate_process_group(&mut child, self.grace).await;
                    return Err(InstallError::Cancelled);
                }
                read = stdout.read(&mut out_buf), if out_open => match read {
                    Ok(0) => {
                        out_open = false;
                        if let Some(rest) = out_decoder.finish() {
                            emit(rest, &mut transcript);
                        }
                    }
                    Ok(n) => emit(out_decoder.decode(&out_buf[..n]), &mut transcript),
                    Err(e) => {
                        let _ = child.start_kill();
                        return Err(InstallError::Spawn(format!("读取 {} 输出失败: {}", program, e)));
                    }
                },
                read = stderr.read(&mut err_buf), if err_open => match read {
                    Ok(0) => {
                        err_open = false;
                        if let Some(rest) = err_decoder.finish() {
                            emit(rest, &mut transcript);
                        }
                    }
                    Ok(n) => emit(err_decoder.decode(&err_buf[..n]), &mut transcript),
                    Err(e) => {
                        let _ = child.start_kill();
                        return Err(InstallError::Spawn(format!("读取 {} 输出失败: {}", program, e)));
                    }
                },
            }
        }

        // 输出已关闭但进程可能仍在运行（例如关闭了 stdout 的后台进程）
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                terminate_process_group(&mut child, self.grace).await;
                return Err(InstallError::Cancelled);
            }
            status = child.wait() => status
                .map_err(|e| InstallError::Spawn(format!("等待 {} 退出失败: {}", program, e)))?,
        };

        log::debug!("{} 已退出: {:?}", program, status.code());
        Ok(ProcessOutput {
            transcript,
            exit_code: status.code(),
        })
    }
}

/// 信号阶梯（均针对整个进程组）：SIGINT → grace 后 SIGTERM → 1 秒后 SIGKILL
async fn terminate_process_group(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // 已退出
        return;
    };
    let pgid = -(pid as i32);

    signal_group(pgid, libc::SIGINT);
    if wait_for_exit(child, grace).await {
        return;
    }
    log::warn!("进程组 {} 未响应 SIGINT，发送 SIGTERM", pid);
    signal_group(pgid, libc::SIGTERM);
    if wait_for_exit(child, Duration::from_secs(1)).await {
        return;
    }
    log::warn!("进程组 {} 未响应 SIGTERM，发送 SIGKILL", pid);
    signal_group(pgid, libc::SIGKILL);
    let _ = child.wait().await;
}

fn signal_group(pgid: i32, signal: libc::c_int) {
    unsafe {
        libc::kill(pgid, signal);
    }
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, child.wait()).await.is_ok()
}
