use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use tnet_process::ServiceKind;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
};

use crate::logs::LogSink;
use crate::secret;

/// Opaque reference to a process launched by a [`ProcessSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(pub u64);

pub struct LaunchRequest<'a> {
    pub kind: ServiceKind,
    pub args: &'a [String],
    /// Console output of the launched process goes here.
    pub logs: LogSink,
}

/// Boundary to whatever actually runs tunnel processes.
#[async_trait::async_trait]
pub trait ProcessSupervisor: Send + Sync + 'static {
    async fn launch(&self, req: LaunchRequest<'_>) -> anyhow::Result<ProcessHandle>;

    /// Terminating a handle that already exited is a no-op.
    async fn terminate(&self, handle: ProcessHandle) -> anyhow::Result<()>;

    async fn is_alive(&self, handle: ProcessHandle) -> bool;

    /// How a process that is no longer alive ended, when the supervisor knows.
    async fn exit_status(&self, _handle: ProcessHandle) -> Option<String> {
        None
    }
}

#[derive(Debug)]
struct ChildEntry {
    pid: Option<u32>,
    /// `Some(code)` once the waiter observed the exit; `code` is `None` for signals.
    exited: Option<Option<i32>>,
    /// `ExitStatus` rendering, e.g. `exit status: 3` or `signal: 9 (SIGKILL)`.
    exit_detail: Option<String>,
    logs: LogSink,
}

/// Runs `<binary...> <kind> <args...>` as child processes, each in its own
/// session so the whole tree can be signalled.
#[derive(Debug, Clone)]
pub struct CommandSupervisor {
    binary: Arc<Vec<String>>,
    early_exit: Duration,
    term_grace: Duration,
    next_handle: Arc<AtomicU64>,
    children: Arc<Mutex<HashMap<ProcessHandle, ChildEntry>>>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Children must not outlive a crashed control plane.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // setsid() in pre_exec makes pgid == pid.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

impl CommandSupervisor {
    pub fn new(binary: Vec<String>, early_exit: Duration, term_grace: Duration) -> Self {
        Self {
            binary: Arc::new(binary),
            early_exit,
            term_grace,
            next_handle: Arc::new(AtomicU64::new(1)),
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn exit_code(&self, handle: ProcessHandle) -> Option<Option<i32>> {
        let children = self.children.lock().await;
        match children.get(&handle) {
            Some(e) => e.exited,
            None => Some(None),
        }
    }

    async fn wait_exit(&self, handle: ProcessHandle, within: Duration) -> Option<Option<i32>> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if let Some(code) = self.exit_code(handle).await {
                return Some(code);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

#[async_trait::async_trait]
impl ProcessSupervisor for CommandSupervisor {
    async fn launch(&self, req: LaunchRequest<'_>) -> anyhow::Result<ProcessHandle> {
        let (program, base_args) = self
            .binary
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("no tnet binary configured"))?;

        let mut cmd = Command::new(program);
        cmd.args(base_args)
            .arg(req.kind.as_str())
            .args(req.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {program} {}", req.kind))?;
        let pid = child.id();
        let handle = ProcessHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        req.logs
            .emit(format!(
                "[tnet-control] spawned {} (pid {})",
                req.kind,
                pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
            ))
            .await;

        if let Some(out) = child.stdout.take() {
            let sink = req.logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(format!("[stdout] {line}")).await;
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let sink = req.logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(format!("[stderr] {line}")).await;
                }
            });
        }

        self.children.lock().await.insert(
            handle,
            ChildEntry {
                pid,
                exited: None,
                exit_detail: None,
                logs: req.logs.clone(),
            },
        );

        let children = self.children.clone();
        tokio::spawn(async move {
            let res = child.wait().await;
            let code = res.as_ref().ok().and_then(|s| s.code());
            let logs = {
                let mut map = children.lock().await;
                let Some(e) = map.get_mut(&handle) else {
                    return;
                };
                e.exited = Some(code);
                e.exit_detail = res.as_ref().ok().map(|s| s.to_string());
                e.logs.clone()
            };
            match res {
                Ok(status) => logs.emit(format!("[tnet-control] process exited: {status}")).await,
                Err(e) => logs.emit(format!("[tnet-control] wait failed: {e}")).await,
            }
        });

        if !self.early_exit.is_zero()
            && let Some(code) = self.wait_exit(handle, self.early_exit).await
        {
            self.children.lock().await.remove(&handle);
            let (tail, _) = req.logs.tail(0, 5).await;
            let code = code
                .map(|c| format!("exit code {c}"))
                .unwrap_or_else(|| "signal".to_string());
            anyhow::bail!(
                "{} exited right after launch ({code}){}",
                req.kind,
                if tail.is_empty() {
                    String::new()
                } else {
                    format!(": {}", secret::mask_text(&tail.join(" | ")))
                }
            );
        }

        tracing::debug!(kind = %req.kind, ?pid, handle = handle.0, "process launched");
        Ok(handle)
    }

    async fn terminate(&self, handle: ProcessHandle) -> anyhow::Result<()> {
        let (pid, logs) = {
            let children = self.children.lock().await;
            let Some(e) = children.get(&handle) else {
                return Ok(());
            };
            if e.exited.is_some() {
                drop(children);
                self.children.lock().await.remove(&handle);
                return Ok(());
            }
            (e.pid, e.logs.clone())
        };

        let Some(pid) = pid else {
            anyhow::bail!("process has no pid, cannot signal it");
        };

        logs.emit("[tnet-control] stop: sent SIGTERM").await;
        #[cfg(unix)]
        signal_group(pid, libc::SIGTERM);

        if self.wait_exit(handle, self.term_grace).await.is_none() {
            logs.emit("[tnet-control] stop: sent SIGKILL (grace expired)")
                .await;
            #[cfg(unix)]
            signal_group(pid, libc::SIGKILL);

            if self.wait_exit(handle, Duration::from_secs(2)).await.is_none() {
                anyhow::bail!("process {pid} did not exit after SIGKILL");
            }
        }

        self.children.lock().await.remove(&handle);
        Ok(())
    }

    async fn is_alive(&self, handle: ProcessHandle) -> bool {
        self.exit_code(handle).await.is_none()
    }

    async fn exit_status(&self, handle: ProcessHandle) -> Option<String> {
        let children = self.children.lock().await;
        children.get(&handle)?.exit_detail.clone()
    }
}
