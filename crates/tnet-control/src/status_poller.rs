use std::{sync::Arc, time::Duration};

use crate::lifecycle::LifecycleController;

/// Periodically reconciles recorded statuses with the supervisor, so crashed
/// processes show up as `stopped` without anyone touching them.
#[derive(Clone)]
pub struct StatusPoller {
    controller: Arc<LifecycleController>,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(controller: Arc<LifecycleController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.tick().await;
            }
        })
    }

    async fn tick(&self) {
        self.controller.reconcile().await;
    }
}
