use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tnet_process::{InstanceAction, InstanceEvent, InstanceId, InstanceStatus, InstanceView, ServiceKind};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::args::{self, ServiceConfiguration};
use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult, format_error_chain};
use crate::logs::{DEFAULT_LOG_MAX_LINES, LogSink};
use crate::secret;
use crate::store::{InstanceStore, ServiceInstance};
use crate::supervisor::{LaunchRequest, ProcessHandle, ProcessSupervisor};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub launch_timeout: Duration,
    pub terminate_timeout: Duration,
    pub log_max_lines: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(10),
            terminate_timeout: Duration::from_secs(10),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
        }
    }
}

impl From<&ControlConfig> for LifecycleSettings {
    fn from(cfg: &ControlConfig) -> Self {
        Self {
            launch_timeout: cfg.launch_timeout,
            terminate_timeout: cfg.terminate_timeout,
            log_max_lines: cfg.log_max_lines,
        }
    }
}

/// Result of a create: the instance is always stored, even when the launch
/// failed.
#[derive(Debug)]
pub struct CreateOutcome {
    pub instance: ServiceInstance,
    pub launch_error: Option<ControlError>,
}

type SlotKey = (ServiceKind, InstanceId);

type PendingLaunch = JoinHandle<anyhow::Result<ProcessHandle>>;

/// Per-instance serialization point. Holding `state` is holding the
/// instance's transition lock.
struct Slot {
    /// Bumped after every successful launch; lets a queued start notice that
    /// an overlapping start already did the work.
    launches: AtomicU64,
    logs: LogSink,
    state: tokio::sync::Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    handle: Option<ProcessHandle>,
    /// A launch that outlived `launch_timeout`. It keeps running in its own
    /// task and is collected before the next transition.
    pending: Option<PendingLaunch>,
}

pub struct LifecycleController {
    store: Arc<InstanceStore>,
    supervisor: Arc<dyn ProcessSupervisor>,
    slots: Mutex<HashMap<SlotKey, Arc<Slot>>>,
    events: broadcast::Sender<InstanceEvent>,
    settings: LifecycleSettings,
}

impl LifecycleController {
    pub fn new(
        store: Arc<InstanceStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
        settings: LifecycleSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            supervisor,
            slots: Mutex::new(HashMap::new()),
            events,
            settings,
        }
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    fn slot(&self, kind: ServiceKind, id: &InstanceId, args: &[String]) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry((kind, id.clone()))
            .or_insert_with(|| {
                Arc::new(Slot {
                    launches: AtomicU64::new(0),
                    logs: LogSink::with_secrets(
                        self.settings.log_max_lines,
                        secret::crypt_key_values(args),
                    ),
                    state: tokio::sync::Mutex::new(SlotState::default()),
                })
            })
            .clone()
    }

    fn existing_slot(&self, kind: ServiceKind, id: &InstanceId) -> Option<Arc<Slot>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&(kind, id.clone())).cloned()
    }

    fn forget_slot(&self, kind: ServiceKind, id: &InstanceId, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let key = (kind, id.clone());
        if slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&key);
        }
    }

    /// Resolves the instance's slot and the launch count seen before queueing
    /// on its lock. Callers re-read the instance once they hold the lock since
    /// a delete may have completed while they waited.
    fn prepare(&self, kind: ServiceKind, id: &InstanceId) -> ControlResult<(Arc<Slot>, u64)> {
        let instance = self.store.get(kind, id)?;
        let slot = self.slot(kind, id, &instance.args);
        let seen = slot.launches.load(Ordering::SeqCst);
        Ok((slot, seen))
    }

    fn publish(&self, kind: ServiceKind, id: &InstanceId, action: InstanceAction, status: InstanceStatus) {
        // No subscribers is fine.
        let _ = self.events.send(InstanceEvent {
            kind,
            id: id.clone(),
            action,
            status,
        });
    }

    async fn set_status(
        &self,
        kind: ServiceKind,
        id: &InstanceId,
        status: InstanceStatus,
        message: Option<String>,
    ) -> ControlResult<()> {
        let before = self.store.get(kind, id)?.status;
        self.store.set_status(kind, id, status, message).await?;
        if before != status {
            tracing::info!(%kind, %id, from = %before, to = %status, "instance status changed");
            self.publish(kind, id, InstanceAction::StatusChanged, status);
        }
        Ok(())
    }

    /// Builds args from a structured or direct configuration, then creates and launches.
    pub async fn create(
        &self,
        kind: ServiceKind,
        config: &ServiceConfiguration,
    ) -> ControlResult<CreateOutcome> {
        config.validate(kind)?;
        let args = args::build(kind, config)?;
        self.create_from_args(kind, args).await
    }

    pub async fn create_from_args(
        &self,
        kind: ServiceKind,
        mut args: Vec<String>,
    ) -> ControlResult<CreateOutcome> {
        args::strip_kind_token(&mut args);
        if args.iter().all(|a| a.trim().is_empty()) {
            return Err(ControlError::Validation("argument list is empty".to_string()));
        }

        let instance = self.store.create(kind, args).await;
        let id = instance.id.clone();
        tracing::info!(%kind, %id, args = ?secret::mask(&instance.args), "instance created");
        self.publish(kind, &id, InstanceAction::Created, instance.status);

        let slot = self.slot(kind, &id, &instance.args);
        let launch_error = {
            let mut state = slot.state.lock().await;
            self.relaunch(kind, &id, &slot, &mut state, &instance.args)
                .await
                .err()
        };
        if let Some(err) = &launch_error {
            tracing::warn!(%kind, %id, error = %err, "launch after create failed");
        }

        Ok(CreateOutcome {
            instance: self.store.get(kind, &id)?,
            launch_error,
        })
    }

    /// Same as [`LifecycleController::restart`]: an existing instance is
    /// always relaunched, even when it is already running.
    pub async fn start(&self, kind: ServiceKind, id: &InstanceId) -> ControlResult<()> {
        self.restart(kind, id).await
    }

    pub async fn restart(&self, kind: ServiceKind, id: &InstanceId) -> ControlResult<()> {
        let (slot, seen) = self.prepare(kind, id)?;
        let mut state = slot.state.lock().await;
        let instance = match self.store.get(kind, id) {
            Ok(v) => v,
            Err(e) => {
                self.forget_slot(kind, id, &slot);
                return Err(e);
            }
        };

        if slot.launches.load(Ordering::SeqCst) != seen
            && instance.status == InstanceStatus::Running
            && state.handle.is_some()
        {
            tracing::debug!(%kind, %id, "start coalesced with overlapping launch");
            return Ok(());
        }

        self.relaunch(kind, id, &slot, &mut state, &instance.args).await
    }

    /// No-op when nothing is running. While a timed-out launch is still in
    /// flight the outcome is indeterminate and the call fails with `Timeout`.
    pub async fn stop(&self, kind: ServiceKind, id: &InstanceId) -> ControlResult<()> {
        let (slot, _) = self.prepare(kind, id)?;
        let mut state = slot.state.lock().await;
        let instance = match self.store.get(kind, id) {
            Ok(v) => v,
            Err(e) => {
                self.forget_slot(kind, id, &slot);
                return Err(e);
            }
        };

        if state.handle.is_none()
            && state.pending.is_none()
            && instance.status == InstanceStatus::Stopped
        {
            return Ok(());
        }

        slot.logs.emit("[tnet-control] stop requested").await;
        self.settle_pending(kind, id, &slot, &mut state, self.settings.terminate_timeout)
            .await?;
        self.terminate_locked(kind, id, &slot, &mut state).await?;
        self.set_status(kind, id, InstanceStatus::Stopped, None).await
    }

    /// Force-stops, then removes. A failed stop is logged and does not keep
    /// the instance around.
    pub async fn delete(&self, kind: ServiceKind, id: &InstanceId) -> ControlResult<()> {
        let (slot, _) = self.prepare(kind, id)?;
        let mut state = slot.state.lock().await;
        if let Err(e) = self.store.get(kind, id) {
            self.forget_slot(kind, id, &slot);
            return Err(e);
        }

        let settled = self
            .settle_pending(kind, id, &slot, &mut state, self.settings.terminate_timeout)
            .await;
        match settled {
            Ok(_) => {
                if let Err(err) = self.terminate_locked(kind, id, &slot, &mut state).await {
                    tracing::warn!(%kind, %id, error = %err, "stop before delete failed, deleting anyway");
                }
            }
            Err(err) => {
                tracing::warn!(%kind, %id, error = %err, "launch still in flight, deleting anyway");
                if let Some(pending) = state.pending.take() {
                    self.reap_in_background(kind, id.clone(), pending);
                }
            }
        }

        self.store.remove(kind, id).await?;
        self.forget_slot(kind, id, &slot);
        tracing::info!(%kind, %id, "instance deleted");
        self.publish(kind, id, InstanceAction::Deleted, InstanceStatus::Stopped);
        Ok(())
    }

    /// Unmasked `tnet <kind> ...` command line for the explicit reveal action.
    pub fn reveal(&self, kind: ServiceKind, id: &InstanceId) -> ControlResult<String> {
        let instance = self.store.get(kind, id)?;
        tracing::warn!(%kind, %id, "full command line revealed");
        Ok(args::command_line(kind, &instance.args))
    }

    pub fn list(&self, kind: ServiceKind) -> Vec<InstanceView> {
        self.store
            .list(kind)
            .iter()
            .map(ServiceInstance::view)
            .collect()
    }

    pub async fn tail_logs(
        &self,
        kind: ServiceKind,
        id: &InstanceId,
        cursor: u64,
        limit: usize,
    ) -> ControlResult<(Vec<String>, u64)> {
        self.store.get(kind, id)?;
        match self.existing_slot(kind, id) {
            Some(slot) => Ok(slot.logs.tail(cursor, limit).await),
            None => Ok((Vec::new(), cursor)),
        }
    }

    /// Brings `running`/`unknown` statuses in line with what the supervisor
    /// reports. Instances with a transition in flight are skipped.
    pub async fn reconcile(&self) {
        for kind in ServiceKind::ALL {
            for instance in self.store.list(kind) {
                if instance.status == InstanceStatus::Stopped {
                    continue;
                }
                let Some(slot) = self.existing_slot(kind, &instance.id) else {
                    if instance.status == InstanceStatus::Running {
                        let _ = self
                            .set_status(kind, &instance.id, InstanceStatus::Stopped, None)
                            .await;
                    }
                    continue;
                };
                let Ok(mut state) = slot.state.try_lock() else {
                    continue;
                };
                self.reconcile_locked(kind, &instance, &slot, &mut state).await;
            }
        }
    }

    async fn reconcile_locked(
        &self,
        kind: ServiceKind,
        instance: &ServiceInstance,
        slot: &Slot,
        state: &mut SlotState,
    ) {
        let id = &instance.id;
        if state.pending.as_ref().is_some_and(|p| !p.is_finished()) {
            return;
        }
        let Ok(failed) = self
            .settle_pending(kind, id, slot, state, Duration::ZERO)
            .await
        else {
            return;
        };

        let Some(handle) = state.handle else {
            // No handle and no launch in flight: nothing can be running.
            let _ = self.set_status(kind, id, InstanceStatus::Stopped, failed).await;
            return;
        };

        let alive = match tokio::time::timeout(
            self.settings.terminate_timeout,
            self.supervisor.is_alive(handle),
        )
        .await
        {
            Ok(alive) => alive,
            Err(_) => {
                tracing::warn!(%kind, %id, "liveness check timed out");
                return;
            }
        };

        if alive {
            if instance.status == InstanceStatus::Unknown {
                let _ = self.set_status(kind, id, InstanceStatus::Running, None).await;
            }
            return;
        }

        let message = match self.supervisor.exit_status(handle).await {
            Some(detail) => format!("process exited ({detail})"),
            None => "process exited".to_string(),
        };
        state.handle = None;
        // Releases the supervisor's record of the exited process.
        let _ = tokio::time::timeout(
            self.settings.terminate_timeout,
            self.supervisor.terminate(handle),
        )
        .await;
        slot.logs
            .emit(format!("[tnet-control] {message}"))
            .await;
        let _ = self
            .set_status(kind, id, InstanceStatus::Stopped, Some(message))
            .await;
    }

    /// Stops every instance that has a live handle. Used on shutdown.
    pub async fn shutdown(&self) {
        for kind in ServiceKind::ALL {
            for instance in self.store.list(kind) {
                if instance.status == InstanceStatus::Stopped {
                    continue;
                }
                if let Err(err) = self.stop(kind, &instance.id).await {
                    tracing::warn!(%kind, id = %instance.id, error = %err, "stop on shutdown failed");
                }
            }
        }
    }

    /// Collects a launch that outlived its timeout, waiting at most `wait`.
    ///
    /// On success the late handle becomes the slot's handle. `Ok(Some(msg))`
    /// means the launch failed and no process exists. A launch still in
    /// flight leaves the instance `unknown` and fails with `Timeout`.
    async fn settle_pending(
        &self,
        kind: ServiceKind,
        id: &InstanceId,
        slot: &Slot,
        state: &mut SlotState,
        wait: Duration,
    ) -> ControlResult<Option<String>> {
        let Some(mut pending) = state.pending.take() else {
            return Ok(None);
        };

        match tokio::time::timeout(wait, &mut pending).await {
            Ok(Ok(Ok(handle))) => {
                tracing::info!(%kind, %id, "timed-out launch completed late");
                slot.logs
                    .emit("[tnet-control] launch completed after its timeout")
                    .await;
                state.handle = Some(handle);
                Ok(None)
            }
            Ok(Ok(Err(err))) => {
                let msg = slot.logs.redact(&format_error_chain(&err));
                slot.logs
                    .emit(format!("[tnet-control] launch failed: {msg}"))
                    .await;
                Ok(Some(msg))
            }
            Ok(Err(join_err)) => {
                let msg = format!("launch task failed: {join_err}");
                tracing::warn!(%kind, %id, error = %msg, "launch task did not complete");
                Ok(Some(msg))
            }
            Err(_) => {
                state.pending = Some(pending);
                let msg = "launch is still in progress; process state is indeterminate".to_string();
                let _ = self
                    .set_status(kind, id, InstanceStatus::Unknown, Some(msg.clone()))
                    .await;
                Err(ControlError::Timeout(msg))
            }
        }
    }

    /// Terminates whatever a still-running launch eventually produces. Used
    /// when the instance it belongs to is deleted.
    fn reap_in_background(&self, kind: ServiceKind, id: InstanceId, pending: PendingLaunch) {
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            let Ok(Ok(handle)) = pending.await else {
                return;
            };
            if let Err(err) = supervisor.terminate(handle).await {
                tracing::warn!(%kind, %id, error = %format_error_chain(&err), "failed to stop process of deleted instance");
            }
        });
    }

    async fn terminate_locked(
        &self,
        kind: ServiceKind,
        id: &InstanceId,
        slot: &Slot,
        state: &mut SlotState,
    ) -> ControlResult<()> {
        let Some(handle) = state.handle else {
            return Ok(());
        };

        match tokio::time::timeout(
            self.settings.terminate_timeout,
            self.supervisor.terminate(handle),
        )
        .await
        {
            Ok(Ok(())) => {
                state.handle = None;
                Ok(())
            }
            Ok(Err(err)) => {
                let msg = slot.logs.redact(&format_error_chain(&err));
                if self.supervisor.is_alive(handle).await {
                    tracing::warn!(%kind, %id, error = %msg, "terminate failed, process still alive");
                    let _ = self
                        .set_status(kind, id, InstanceStatus::Running, Some(msg.clone()))
                        .await;
                    Err(ControlError::Process(msg))
                } else {
                    // Termination is confirmed; the error is only informational.
                    tracing::warn!(%kind, %id, error = %msg, "terminate reported an error but the process is gone");
                    state.handle = None;
                    Ok(())
                }
            }
            Err(_) => {
                let msg = format!(
                    "terminate did not finish within {}ms",
                    self.settings.terminate_timeout.as_millis()
                );
                tracing::warn!(%kind, %id, "{msg}");
                let _ = self
                    .set_status(kind, id, InstanceStatus::Unknown, Some(msg.clone()))
                    .await;
                Err(ControlError::Timeout(msg))
            }
        }
    }

    async fn launch_failed(
        &self,
        kind: ServiceKind,
        id: &InstanceId,
        slot: &Slot,
        raw: &str,
    ) -> ControlResult<()> {
        let msg = slot.logs.redact(raw);
        slot.logs
            .emit(format!("[tnet-control] launch failed: {msg}"))
            .await;
        self.set_status(kind, id, InstanceStatus::Stopped, Some(msg.clone()))
            .await?;
        Err(ControlError::Process(msg))
    }

    /// Terminates the current process, then launches a new one. The launch
    /// runs in its own task so a timeout never abandons a spawned process.
    async fn relaunch(
        &self,
        kind: ServiceKind,
        id: &InstanceId,
        slot: &Slot,
        state: &mut SlotState,
        args: &[String],
    ) -> ControlResult<()> {
        self.settle_pending(kind, id, slot, state, self.settings.terminate_timeout)
            .await?;
        self.terminate_locked(kind, id, slot, state).await?;

        slot.logs
            .emit(format!(
                "[tnet-control] launching: {}",
                args::command_line(kind, &secret::mask(args))
            ))
            .await;

        let supervisor = self.supervisor.clone();
        let logs = slot.logs.clone();
        let owned = args.to_vec();
        let mut launch: PendingLaunch = tokio::spawn(async move {
            supervisor
                .launch(LaunchRequest {
                    kind,
                    args: &owned,
                    logs,
                })
                .await
        });

        match tokio::time::timeout(self.settings.launch_timeout, &mut launch).await {
            Ok(Ok(Ok(handle))) => {
                state.handle = Some(handle);
                slot.launches.fetch_add(1, Ordering::SeqCst);
                self.set_status(kind, id, InstanceStatus::Running, None).await
            }
            Ok(Ok(Err(err))) => {
                self.launch_failed(kind, id, slot, &format_error_chain(&err))
                    .await
            }
            Ok(Err(join_err)) => {
                self.launch_failed(kind, id, slot, &format!("launch task failed: {join_err}"))
                    .await
            }
            Err(_) => {
                state.pending = Some(launch);
                let msg = format!(
                    "launch did not finish within {}ms",
                    self.settings.launch_timeout.as_millis()
                );
                slot.logs.emit(format!("[tnet-control] {msg}")).await;
                self.set_status(kind, id, InstanceStatus::Unknown, Some(msg.clone()))
                    .await?;
                Err(ControlError::Timeout(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::testing::FakeSupervisor;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn controller_with(settings: LifecycleSettings) -> (Arc<LifecycleController>, Arc<FakeSupervisor>) {
        let fake = Arc::new(FakeSupervisor::default());
        let controller = LifecycleController::new(
            Arc::new(InstanceStore::in_memory()),
            fake.clone(),
            settings,
        );
        (Arc::new(controller), fake)
    }

    fn controller() -> (Arc<LifecycleController>, Arc<FakeSupervisor>) {
        controller_with(LifecycleSettings::default())
    }

    #[tokio::test]
    async fn create_from_form_masks_and_deletes() {
        let (ctl, fake) = controller();
        let config: ServiceConfiguration = serde_json::from_value(serde_json::json!({
            "inputMode": "form",
            "tunnelMode": "listen",
            "tunnelListen": "0.0.0.0:9000",
            "cryptKey": "secret123",
        }))
        .unwrap();

        let out = ctl.create(ServiceKind::Agent, &config).await.unwrap();
        assert!(out.launch_error.is_none());
        assert_eq!(
            out.instance.args,
            strings(&["--tunnel-listen=0.0.0.0:9000", "--crypt-key=secret123"])
        );
        assert_eq!(out.instance.status, InstanceStatus::Running);
        assert_eq!(fake.live_count(), 1);

        let listed = ctl.list(ServiceKind::Agent);
        assert_eq!(
            listed[0].args,
            strings(&["--tunnel-listen=0.0.0.0:9000", "--crypt-key=**********"])
        );

        ctl.delete(ServiceKind::Agent, &out.instance.id).await.unwrap();
        assert!(ctl.list(ServiceKind::Agent).is_empty());
        assert_eq!(fake.live_count(), 0);
    }

    #[tokio::test]
    async fn create_rejects_empty_args_without_storing() {
        let (ctl, fake) = controller();
        let err = ctl
            .create_from_args(ServiceKind::Proxy, strings(&["  ", ""]))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        // A lone kind token is also empty once stripped.
        let err = ctl
            .create_from_args(ServiceKind::Proxy, strings(&["proxy"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        assert!(ctl.list(ServiceKind::Proxy).is_empty());
        assert_eq!(fake.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn create_strips_leading_kind_token() {
        let (ctl, _) = controller();
        let out = ctl
            .create_from_args(ServiceKind::Agent, strings(&["agent", "--tunnel-listen=:1"]))
            .await
            .unwrap();
        assert_eq!(out.instance.args, strings(&["--tunnel-listen=:1"]));
    }

    #[tokio::test]
    async fn launch_failure_keeps_instance_stopped_and_masks_error() {
        let (ctl, fake) = controller();
        fake.fail_launch.store(true, Ordering::SeqCst);

        let out = ctl
            .create_from_args(
                ServiceKind::Proxy,
                strings(&["--listen=:1080", "--crypt-key=secret123"]),
            )
            .await
            .unwrap();
        let err = out.launch_error.expect("launch should fail");
        assert!(matches!(err, ControlError::Process(_)));
        assert!(!err.to_string().contains("secret123"));

        let stored = ctl.store().get(ServiceKind::Proxy, &out.instance.id).unwrap();
        assert_eq!(stored.status, InstanceStatus::Stopped);
        assert!(stored.message.as_deref().unwrap().contains("--crypt-key=**********"));

        // The configuration is kept and can be started later.
        fake.fail_launch.store(false, Ordering::SeqCst);
        ctl.start(ServiceKind::Proxy, &out.instance.id).await.unwrap();
        let stored = ctl.store().get(ServiceKind::Proxy, &out.instance.id).unwrap();
        assert_eq!(stored.status, InstanceStatus::Running);
        assert!(stored.message.is_none());
    }

    #[tokio::test]
    async fn keys_with_spaces_never_reach_messages() {
        let (ctl, fake) = controller();
        fake.fail_launch.store(true, Ordering::SeqCst);

        let out = ctl
            .create_from_args(
                ServiceKind::Agent,
                strings(&["--tunnel-listen=:1", "--crypt-key=hunter2 topsecret"]),
            )
            .await
            .unwrap();
        let err = out.launch_error.expect("launch should fail");
        assert!(!err.to_string().contains("topsecret"));

        let stored = ctl.store().get(ServiceKind::Agent, &out.instance.id).unwrap();
        let message = stored.message.unwrap();
        assert!(message.contains("--crypt-key=**********"));
        assert!(!message.contains("topsecret"));

        let (lines, _) = ctl
            .tail_logs(ServiceKind::Agent, &out.instance.id, 0, 100)
            .await
            .unwrap();
        assert!(lines.iter().all(|l| !l.contains("topsecret")));
    }

    #[tokio::test]
    async fn stop_twice_is_idempotent() {
        let (ctl, fake) = controller();
        let out = ctl
            .create_from_args(ServiceKind::Agent, strings(&["--tunnel-listen=:1"]))
            .await
            .unwrap();
        let id = out.instance.id;

        ctl.stop(ServiceKind::Agent, &id).await.unwrap();
        assert_eq!(ctl.store().get(ServiceKind::Agent, &id).unwrap().status, InstanceStatus::Stopped);
        assert_eq!(fake.terminates.load(Ordering::SeqCst), 1);

        ctl.stop(ServiceKind::Agent, &id).await.unwrap();
        assert_eq!(ctl.store().get(ServiceKind::Agent, &id).unwrap().status, InstanceStatus::Stopped);
        assert_eq!(fake.terminates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_replaces_the_running_process() {
        let (ctl, fake) = controller();
        let id = ctl
            .create_from_args(ServiceKind::Agent, strings(&["--tunnel-listen=:1"]))
            .await
            .unwrap()
            .instance
            .id;

        ctl.restart(ServiceKind::Agent, &id).await.unwrap();
        assert_eq!(fake.launches.load(Ordering::SeqCst), 2);
        assert_eq!(fake.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(fake.live_count(), 1);

        // Start on a running instance is a forced restart.
        ctl.start(ServiceKind::Agent, &id).await.unwrap();
        assert_eq!(fake.launches.load(Ordering::SeqCst), 3);
        assert_eq!(fake.live_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_launch_once() {
        let (ctl, fake) = controller();
        let id = ctl
            .create_from_args(ServiceKind::Proxy, strings(&["--listen=:1"]))
            .await
            .unwrap()
            .instance
            .id;
        ctl.stop(ServiceKind::Proxy, &id).await.unwrap();
        *fake.launch_delay.lock().unwrap() = Duration::from_millis(50);
        let before = fake.launches.load(Ordering::SeqCst);

        let (a, b) = tokio::join!(
            ctl.start(ServiceKind::Proxy, &id),
            ctl.start(ServiceKind::Proxy, &id)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(fake.launches.load(Ordering::SeqCst), before + 1);
        assert_eq!(fake.live_count(), 1);
        assert_eq!(
            ctl.store().get(ServiceKind::Proxy, &id).unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn different_ids_do_not_block_each_other() {
        let (ctl, fake) = controller();
        let a = ctl
            .create_from_args(ServiceKind::Agent, strings(&["--a"]))
            .await
            .unwrap()
            .instance
            .id;
        let b = ctl
            .create_from_args(ServiceKind::Agent, strings(&["--b"]))
            .await
            .unwrap()
            .instance
            .id;
        *fake.launch_delay.lock().unwrap() = Duration::from_millis(20);

        let (ra, rb) = tokio::join!(
            ctl.restart(ServiceKind::Agent, &a),
            ctl.restart(ServiceKind::Agent, &b)
        );
        ra.unwrap();
        rb.unwrap();
        assert_eq!(fake.launches.load(Ordering::SeqCst), 4);
        assert_eq!(fake.live_count(), 2);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let (ctl, _) = controller();
        let missing = InstanceId::from("ffffffff");
        for res in [
            ctl.start(ServiceKind::Agent, &missing).await,
            ctl.stop(ServiceKind::Agent, &missing).await,
            ctl.delete(ServiceKind::Agent, &missing).await,
        ] {
            assert!(matches!(res, Err(ControlError::NotFound { .. })));
        }
        assert!(ctl.reveal(ServiceKind::Agent, &missing).is_err());
        assert!(ctl.tail_logs(ServiceKind::Agent, &missing, 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn ids_are_scoped_by_kind() {
        let (ctl, _) = controller();
        let id = ctl
            .create_from_args(ServiceKind::Agent, strings(&["--a"]))
            .await
            .unwrap()
            .instance
            .id;
        assert!(matches!(
            ctl.stop(ServiceKind::Proxy, &id).await,
            Err(ControlError::NotFound { kind: ServiceKind::Proxy, .. })
        ));
    }

    #[tokio::test]
    async fn launch_timeout_marks_status_unknown() {
        let (ctl, fake) = controller_with(LifecycleSettings {
            launch_timeout: Duration::from_millis(30),
            ..LifecycleSettings::default()
        });
        *fake.launch_delay.lock().unwrap() = Duration::from_millis(300);

        let out = ctl
            .create_from_args(ServiceKind::Agent, strings(&["--a"]))
            .await
            .unwrap();
        assert!(matches!(out.launch_error, Some(ControlError::Timeout(_))));
        assert_eq!(out.instance.status, InstanceStatus::Unknown);

        // Stop waits for the late launch and terminates what it produced.
        ctl.stop(ServiceKind::Agent, &out.instance.id).await.unwrap();
        assert_eq!(
            ctl.store().get(ServiceKind::Agent, &out.instance.id).unwrap().status,
            InstanceStatus::Stopped
        );
        assert_eq!(fake.launches.load(Ordering::SeqCst), 1);
        assert_eq!(fake.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(fake.live_count(), 0);
    }

    #[tokio::test]
    async fn stop_during_slow_launch_stays_unknown() {
        let (ctl, fake) = controller_with(LifecycleSettings {
            launch_timeout: Duration::from_millis(30),
            terminate_timeout: Duration::from_millis(30),
            ..LifecycleSettings::default()
        });
        *fake.launch_delay.lock().unwrap() = Duration::from_millis(300);

        let id = ctl
            .create_from_args(ServiceKind::Proxy, strings(&["--a"]))
            .await
            .unwrap()
            .instance
            .id;

        let err = ctl.stop(ServiceKind::Proxy, &id).await.unwrap_err();
        assert!(matches!(err, ControlError::Timeout(_)));
        assert_eq!(
            ctl.store().get(ServiceKind::Proxy, &id).unwrap().status,
            InstanceStatus::Unknown
        );

        // Once the launch lands, reconcile adopts the process.
        tokio::time::sleep(Duration::from_millis(400)).await;
        ctl.reconcile().await;
        assert_eq!(
            ctl.store().get(ServiceKind::Proxy, &id).unwrap().status,
            InstanceStatus::Running
        );
        assert_eq!(fake.live_count(), 1);

        ctl.stop(ServiceKind::Proxy, &id).await.unwrap();
        assert_eq!(
            ctl.store().get(ServiceKind::Proxy, &id).unwrap().status,
            InstanceStatus::Stopped
        );
        assert_eq!(fake.live_count(), 0);
    }

    #[tokio::test]
    async fn late_launch_of_deleted_instance_is_terminated() {
        let (ctl, fake) = controller_with(LifecycleSettings {
            launch_timeout: Duration::from_millis(30),
            terminate_timeout: Duration::from_millis(30),
            ..LifecycleSettings::default()
        });
        *fake.launch_delay.lock().unwrap() = Duration::from_millis(200);

        let id = ctl
            .create_from_args(ServiceKind::Agent, strings(&["--a"]))
            .await
            .unwrap()
            .instance
            .id;
        ctl.delete(ServiceKind::Agent, &id).await.unwrap();
        assert!(ctl.list(ServiceKind::Agent).is_empty());

        let mut live = usize::MAX;
        for _ in 0..50 {
            live = fake.live_count();
            if fake.terminates.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(live, 0);
        assert_eq!(fake.terminates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminate_timeout_marks_status_unknown() {
        let (ctl, fake) = controller_with(LifecycleSettings {
            terminate_timeout: Duration::from_millis(30),
            ..LifecycleSettings::default()
        });
        let id = ctl
            .create_from_args(ServiceKind::Proxy, strings(&["--a"]))
            .await
            .unwrap()
            .instance
            .id;
        *fake.terminate_delay.lock().unwrap() = Duration::from_millis(300);

        let err = ctl.stop(ServiceKind::Proxy, &id).await.unwrap_err();
        assert!(matches!(err, ControlError::Timeout(_)));
        assert_eq!(
            ctl.store().get(ServiceKind::Proxy, &id).unwrap().status,
            InstanceStatus::Unknown
        );

        // The process is in fact still alive: reconcile restores `running`.
        ctl.reconcile().await;
        assert_eq!(
            ctl.store().get(ServiceKind::Proxy, &id).unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn failed_terminate_of_live_process_is_reported() {
        let (ctl, fake) = controller();
        let id = ctl
            .create_from_args(ServiceKind::Agent, strings(&["--a"]))
            .await
            .unwrap()
            .instance
            .id;
        fake.fail_terminate.store(true, Ordering::SeqCst);

        let err = ctl.stop(ServiceKind::Agent, &id).await.unwrap_err();
        assert!(matches!(err, ControlError::Process(_)));
        assert_eq!(
            ctl.store().get(ServiceKind::Agent, &id).unwrap().status,
            InstanceStatus::Running
        );

        // Delete still removes the instance.
        ctl.delete(ServiceKind::Agent, &id).await.unwrap();
        assert!(ctl.list(ServiceKind::Agent).is_empty());
    }

    #[tokio::test]
    async fn reconcile_marks_dead_processes_stopped() {
        let (ctl, fake) = controller();
        let id = ctl
            .create_from_args(ServiceKind::Proxy, strings(&["--a"]))
            .await
            .unwrap()
            .instance
            .id;
        let mut events = ctl.subscribe();

        fake.kill_all();
        ctl.reconcile().await;

        let inst = ctl.store().get(ServiceKind::Proxy, &id).unwrap();
        assert_eq!(inst.status, InstanceStatus::Stopped);
        assert_eq!(inst.message.as_deref(), Some("process exited (exit status: 1)"));

        let ev = events.try_recv().unwrap();
        assert_eq!(ev.id, id);
        assert_eq!(ev.action, InstanceAction::StatusChanged);
        assert_eq!(ev.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn events_follow_the_lifecycle() {
        let (ctl, _) = controller();
        let mut events = ctl.subscribe();
        let id = ctl
            .create_from_args(ServiceKind::Agent, strings(&["--a"]))
            .await
            .unwrap()
            .instance
            .id;
        ctl.delete(ServiceKind::Agent, &id).await.unwrap();

        let actions: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| (e.action, e.status))
            .collect();
        assert_eq!(
            actions,
            vec![
                (InstanceAction::Created, InstanceStatus::Stopped),
                (InstanceAction::StatusChanged, InstanceStatus::Running),
                (InstanceAction::Deleted, InstanceStatus::Stopped),
            ]
        );
    }

    #[tokio::test]
    async fn reveal_returns_unmasked_command_and_logs_are_masked() {
        let (ctl, _) = controller();
        let id = ctl
            .create_from_args(
                ServiceKind::Agent,
                strings(&["--tunnel-listen=0.0.0.0:9000", "--crypt-key=secret123"]),
            )
            .await
            .unwrap()
            .instance
            .id;

        assert_eq!(
            ctl.reveal(ServiceKind::Agent, &id).unwrap(),
            "tnet agent --tunnel-listen=0.0.0.0:9000 --crypt-key=secret123"
        );

        let (lines, _) = ctl.tail_logs(ServiceKind::Agent, &id, 0, 100).await.unwrap();
        assert!(lines.iter().any(|l| l.contains("--crypt-key=**********")));
        assert!(lines.iter().all(|l| !l.contains("secret123")));
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let (ctl, fake) = controller();
        for arg in ["--a", "--b"] {
            ctl.create_from_args(ServiceKind::Agent, strings(&[arg]))
                .await
                .unwrap();
        }
        ctl.create_from_args(ServiceKind::Proxy, strings(&["--c"]))
            .await
            .unwrap();
        assert_eq!(fake.live_count(), 3);

        ctl.shutdown().await;
        assert_eq!(fake.live_count(), 0);
        assert!(ctl
            .list(ServiceKind::Agent)
            .iter()
            .all(|v| v.status == InstanceStatus::Stopped));
    }
    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_launch_is_not_orphaned() {
        use crate::supervisor::CommandSupervisor;

        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        // $1 is the kind, $2 the pid file.
        let binary = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            r#"echo $$ > "$2"; exec sleep 30"#.to_string(),
            "tnet".to_string(),
        ];
        let supervisor = Arc::new(CommandSupervisor::new(
            binary,
            Duration::from_millis(600),
            Duration::from_secs(2),
        ));
        let ctl = LifecycleController::new(
            Arc::new(InstanceStore::in_memory()),
            supervisor,
            LifecycleSettings {
                launch_timeout: Duration::from_millis(150),
                terminate_timeout: Duration::from_secs(5),
                ..LifecycleSettings::default()
            },
        );

        let out = ctl
            .create_from_args(ServiceKind::Agent, vec![pidfile.display().to_string()])
            .await
            .unwrap();
        assert!(matches!(out.launch_error, Some(ControlError::Timeout(_))));
        assert_eq!(out.instance.status, InstanceStatus::Unknown);

        ctl.stop(ServiceKind::Agent, &out.instance.id).await.unwrap();
        assert_eq!(
            ctl.store().get(ServiceKind::Agent, &out.instance.id).unwrap().status,
            InstanceStatus::Stopped
        );

        let pid: libc::pid_t = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut gone = false;
        for _ in 0..50 {
            if unsafe { libc::kill(pid, 0) } == -1 {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "process {pid} outlived stop");
    }
}
