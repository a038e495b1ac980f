use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tnet_process::{InstanceId, InstanceStatus, InstanceView, ServiceKind};
use tokio::io::AsyncWriteExt;

use crate::error::{ControlError, ControlResult};
use crate::secret;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub kind: ServiceKind,
    /// Exact argument list passed to the process, after the kind token.
    pub args: Vec<String>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    /// Last launch/terminate problem, already masked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceInstance {
    pub fn view(&self) -> InstanceView {
        InstanceView {
            id: self.id.clone(),
            status: self.status,
            args: secret::mask(&self.args),
            created_at: self.created_at,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Namespace {
    order: Vec<InstanceId>,
    entries: HashMap<InstanceId, ServiceInstance>,
}

impl Namespace {
    fn list(&self) -> Vec<ServiceInstance> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }
}

#[derive(Debug, Default)]
struct Namespaces {
    agents: Namespace,
    proxies: Namespace,
}

impl Namespaces {
    fn get(&self, kind: ServiceKind) -> &Namespace {
        match kind {
            ServiceKind::Agent => &self.agents,
            ServiceKind::Proxy => &self.proxies,
        }
    }

    fn get_mut(&mut self, kind: ServiceKind) -> &mut Namespace {
        match kind {
            ServiceKind::Agent => &mut self.agents,
            ServiceKind::Proxy => &mut self.proxies,
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PersistedStore {
    version: u32,
    instances: Vec<ServiceInstance>,
}

/// Instance table, partitioned by kind. Ids are never cross-checked between
/// the two namespaces.
///
/// The table lock is synchronous and never held across an await; persistence
/// is serialized separately so the last writer always writes the latest state.
#[derive(Debug)]
pub struct InstanceStore {
    inner: Mutex<Namespaces>,
    persist_path: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl InstanceStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Namespaces::default()),
            persist_path: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Opens a persisted store. Loaded instances come back `stopped`: their
    /// processes did not survive the previous control plane.
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let mut namespaces = Namespaces::default();

        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let persisted: PersistedStore = serde_json::from_slice(&raw)
                    .with_context(|| format!("parse {}", path.display()))?;
                if persisted.version != STORE_VERSION {
                    anyhow::bail!(
                        "unsupported instance store version {} in {}",
                        persisted.version,
                        path.display()
                    );
                }
                for mut inst in persisted.instances {
                    inst.status = InstanceStatus::Stopped;
                    let ns = namespaces.get_mut(inst.kind);
                    if ns.entries.contains_key(&inst.id) {
                        tracing::warn!(kind = %inst.kind, id = %inst.id, "duplicate persisted instance skipped");
                        continue;
                    }
                    ns.order.push(inst.id.clone());
                    ns.entries.insert(inst.id.clone(), inst);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", path.display()));
            }
        }

        Ok(Self {
            inner: Mutex::new(namespaces),
            persist_path: Some(path),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Namespaces> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn create(&self, kind: ServiceKind, args: Vec<String>) -> ServiceInstance {
        let inst = {
            let mut guard = self.lock();
            let ns = guard.get_mut(kind);
            let mut id = InstanceId::new();
            while ns.entries.contains_key(&id) {
                id = InstanceId::new();
            }
            let inst = ServiceInstance {
                id: id.clone(),
                kind,
                args,
                status: InstanceStatus::Stopped,
                created_at: Utc::now(),
                message: None,
            };
            ns.order.push(id.clone());
            ns.entries.insert(id, inst.clone());
            inst
        };
        self.persist().await;
        inst
    }

    pub fn get(&self, kind: ServiceKind, id: &InstanceId) -> ControlResult<ServiceInstance> {
        self.lock()
            .get(kind)
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::not_found(kind, id))
    }

    /// Instances of one kind in insertion order.
    pub fn list(&self, kind: ServiceKind) -> Vec<ServiceInstance> {
        self.lock().get(kind).list()
    }

    pub fn count(&self, kind: ServiceKind) -> usize {
        self.lock().get(kind).entries.len()
    }

    pub async fn set_status(
        &self,
        kind: ServiceKind,
        id: &InstanceId,
        status: InstanceStatus,
        message: Option<String>,
    ) -> ControlResult<()> {
        {
            let mut guard = self.lock();
            let inst = guard
                .get_mut(kind)
                .entries
                .get_mut(id)
                .ok_or_else(|| ControlError::not_found(kind, id))?;
            if inst.status == status && inst.message == message {
                return Ok(());
            }
            inst.status = status;
            inst.message = message;
        }
        self.persist().await;
        Ok(())
    }

    pub async fn remove(&self, kind: ServiceKind, id: &InstanceId) -> ControlResult<ServiceInstance> {
        let removed = {
            let mut guard = self.lock();
            let ns = guard.get_mut(kind);
            let removed = ns
                .entries
                .remove(id)
                .ok_or_else(|| ControlError::not_found(kind, id))?;
            ns.order.retain(|x| x != id);
            removed
        };
        self.persist().await;
        Ok(removed)
    }

    fn snapshot(&self) -> PersistedStore {
        let guard = self.lock();
        let mut instances = guard.agents.list();
        instances.extend(guard.proxies.list());
        PersistedStore {
            version: STORE_VERSION,
            instances,
        }
    }

    async fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let _writer = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        if let Err(err) = write_atomic(path, &snapshot).await {
            tracing::warn!(path = %path.display(), error = %crate::error::format_error_chain(&err), "failed to persist instances");
        }
    }
}

async fn write_atomic(path: &Path, store: &PersistedStore) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("create data root")?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(store).context("serialize instances")?;
    // A stale tmp file would keep its old permissions.
    let _ = tokio::fs::remove_file(&tmp).await;
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    // Crypt keys are stored in clear; owner only.
    #[cfg(unix)]
    opts.mode(0o600);
    let mut f = opts
        .open(&tmp)
        .await
        .context("create instances.json.tmp")?;
    f.write_all(&data)
        .await
        .context("write instances.json.tmp")?;
    f.flush().await.context("flush instances.json.tmp")?;
    drop(f);
    tokio::fs::rename(&tmp, path)
        .await
        .context("persist instances.json")?;
    Ok(())
}
