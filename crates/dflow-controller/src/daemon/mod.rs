//! Single-worker daemon around the [`Controller`].
//!
//! Everything that touches controller state (intents, rebinds, session
//! changes, settle timers) arrives as a [`WorkerEvent`] on one bounded
//! channel and is handled in order by one task. Intents are queued and
//! applied in a batch once the channel has nothing else ready.

mod controller;

pub use controller::{Controller, ControllerStatus, IntentEvent};

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::model::{PortBinding, PortId};
use log::{debug, info};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("controller worker has stopped")]
    WorkerGone,
}

#[derive(Debug)]
pub enum WorkerEvent {
    Intent(IntentEvent),
    Rebind {
        port: PortId,
        binding: Option<PortBinding>,
    },
    SessionEstablished,
    SessionLost,
    SettleElapsed {
        epoch: u64,
    },
    /// Answered once every earlier event has been handled
    Barrier(oneshot::Sender<()>),
    Status(oneshot::Sender<ControllerStatus>),
    Shutdown,
}

/// Cloneable sender side of the worker channel.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<WorkerEvent>,
}

impl DaemonHandle {
    async fn send(&self, event: WorkerEvent) -> Result<(), DaemonError> {
        self.tx.send(event).await.map_err(|_| DaemonError::WorkerGone)
    }

    pub async fn submit(&self, intent: IntentEvent) -> Result<(), DaemonError> {
        self.send(WorkerEvent::Intent(intent)).await
    }

    pub async fn rebind(&self, port: PortId, binding: Option<PortBinding>) -> Result<(), DaemonError> {
        self.send(WorkerEvent::Rebind { port, binding }).await
    }

    pub async fn session_established(&self) -> Result<(), DaemonError> {
        self.send(WorkerEvent::SessionEstablished).await
    }

    pub async fn session_lost(&self) -> Result<(), DaemonError> {
        self.send(WorkerEvent::SessionLost).await
    }

    /// Waits until the worker has handled everything sent before.
    pub async fn barrier(&self) -> Result<(), DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerEvent::Barrier(tx)).await?;
        rx.await.map_err(|_| DaemonError::WorkerGone)
    }

    pub async fn status(&self) -> Result<ControllerStatus, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerEvent::Status(tx)).await?;
        rx.await.map_err(|_| DaemonError::WorkerGone)
    }

    pub async fn shutdown(&self) -> Result<(), DaemonError> {
        self.send(WorkerEvent::Shutdown).await
    }
}

pub struct ControllerDaemon {
    controller: Controller,
    rx: mpsc::Receiver<WorkerEvent>,
    /// Lets settle timers post back without keeping the channel open
    weak_tx: mpsc::WeakSender<WorkerEvent>,
    settle_delay: Duration,
    settle_timer: Option<JoinHandle<()>>,
}

impl ControllerDaemon {
    pub fn new(controller: Controller) -> (Self, DaemonHandle) {
        let (tx, rx) = mpsc::channel(controller.config().daemon.queue_depth);
        let daemon = Self {
            settle_delay: controller.config().settle_delay(),
            controller,
            rx,
            weak_tx: tx.downgrade(),
            settle_timer: None,
        };
        (daemon, DaemonHandle { tx })
    }

    /// Runs until [`DaemonHandle::shutdown`] or until every handle is
    /// dropped, then hands the controller back.
    pub async fn run(mut self) -> Controller {
        info!(
            "ControllerDaemon: running, settle delay {:?}",
            self.settle_delay
        );
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "ControllerDaemon", "run")
            .with_details(serde_json::json!({
                "settle_delay_ms": self.controller.config().aging.settle_delay_ms,
                "queue_depth": self.controller.config().daemon.queue_depth,
            }))
            .with_outcome(AuditOutcome::Success));

        while let Some(event) = self.rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }

        self.cancel_settle();
        self.controller.process_pending();
        info!("ControllerDaemon: stopped");
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "ControllerDaemon", "stop")
            .with_outcome(AuditOutcome::Success));
        self.controller
    }

    /// False to stop the loop.
    fn handle(&mut self, event: WorkerEvent) -> bool {
        if let WorkerEvent::Intent(intent) = event {
            self.controller.submit(intent);
            if self.rx.is_empty() {
                self.controller.process_pending();
            }
            return true;
        }

        self.controller.process_pending();
        match event {
            WorkerEvent::Intent(_) => {}
            WorkerEvent::Rebind { port, binding } => {
                self.controller.rebind_port(&port, binding);
            }
            WorkerEvent::SessionEstablished => {
                self.cancel_settle();
                let epoch = self.controller.session_established();
                self.schedule_settle(epoch);
            }
            WorkerEvent::SessionLost => {
                self.cancel_settle();
                self.controller.session_lost();
            }
            WorkerEvent::SettleElapsed { epoch } => {
                self.settle_timer = None;
                self.controller.session_settled(epoch);
            }
            WorkerEvent::Barrier(reply) => {
                let _ = reply.send(());
            }
            WorkerEvent::Status(reply) => {
                let _ = reply.send(self.controller.status());
            }
            WorkerEvent::Shutdown => return false,
        }
        true
    }

    fn schedule_settle(&mut self, epoch: u64) {
        let delay = self.settle_delay;
        let weak_tx = self.weak_tx.clone();
        self.settle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = weak_tx.upgrade() {
                let _ = tx.send(WorkerEvent::SettleElapsed { epoch }).await;
            }
        }));
        debug!("ControllerDaemon: epoch {} settles in {:?}", epoch, delay);
    }

    fn cancel_settle(&mut self) {
        if let Some(timer) = self.settle_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::model::{Entity, LogicalSwitch};
    use crate::pipeline::SessionState;
    use crate::secgroup::NullConntrack;
    use dflow_app_common::Operation;
    use dflow_ofproto::MemorySwitch;
    use pretty_assertions::assert_eq;

    fn spawn(switch: &MemorySwitch, settle_delay_ms: u64) -> (DaemonHandle, JoinHandle<Controller>) {
        let mut config = ControllerConfig {
            chassis: "host-a".to_string(),
            ..ControllerConfig::default()
        };
        config.aging.settle_delay_ms = settle_delay_ms;
        let controller = Controller::new(config, Box::new(switch.clone()), Box::new(NullConntrack)).unwrap();
        let (daemon, handle) = ControllerDaemon::new(controller);
        (handle, tokio::spawn(daemon.run()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_settles_after_delay() {
        let switch = MemorySwitch::new();
        let (handle, worker) = spawn(&switch, 1000);

        handle.session_established().await.unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.session, SessionState::Established { epoch: 1 });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.session, SessionState::Settled { epoch: 1 });
        assert_eq!(status.aging.unwrap().first_contacts, 1);

        handle.shutdown().await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_cancels_settle() {
        let switch = MemorySwitch::new();
        let (handle, worker) = spawn(&switch, 1000);

        handle.session_established().await.unwrap();
        handle.session_lost().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.session, SessionState::Down);
        assert_eq!(status.aging.unwrap().skipped, 0);

        drop(handle);
        let controller = worker.await.unwrap();
        assert_eq!(controller.session_state(), SessionState::Down);
    }

    #[tokio::test]
    async fn test_intents_applied_before_barrier_returns() {
        let switch = MemorySwitch::new();
        let (handle, worker) = spawn(&switch, 1000);

        handle
            .submit(IntentEvent::new(
                Operation::Created,
                Entity::LogicalSwitch(LogicalSwitch::new("ls1", 5)),
            ))
            .await
            .unwrap();
        handle.barrier().await.unwrap();

        let status = handle.status().await.unwrap();
        assert_eq!(status.pending_intents, 0);
        assert_eq!(status.dispatch.events, 1);

        handle.shutdown().await.unwrap();
        let controller = worker.await.unwrap();
        assert!(controller.store().lswitch(&"ls1".into()).is_some());
    }
}
