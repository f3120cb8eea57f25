//! The synchronous core driven by the daemon's worker.

use super::DaemonError;
use crate::aging::{AgingApp, AgingStats};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::config::ControllerConfig;
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::model::{Entity, LogicalPort, LogicalSwitch, ObjectStore, PortBinding, PortId, SecurityGroup, StoreChange};
use crate::pipeline::{CookieRegistry, FlowPipeline, PipelineStats, SessionState, SwitchSession};
use crate::secgroup::{ConntrackHelper, SecGroupApp, SecGroupStats};
use dflow_app_common::{ConsumerConfig, IntentConsumer, IntentEntry, Operation};
use dflow_ofproto::SwitchChannel;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// One northbound change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentEvent {
    pub op: Operation,
    pub entity: Entity,
}

impl IntentEvent {
    pub fn new(op: Operation, entity: Entity) -> Self {
        Self { op, entity }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub session: SessionState,
    pub pending_intents: usize,
    pub ports: usize,
    pub store_errors: u64,
    pub dispatch: DispatchStats,
    pub pipeline: PipelineStats,
    pub aging: Option<AgingStats>,
    pub secgroup: Option<SecGroupStats>,
}

pub struct Controller {
    config: ControllerConfig,
    store: ObjectStore,
    pipeline: FlowPipeline,
    dispatcher: Dispatcher,
    lswitches: IntentConsumer<LogicalSwitch>,
    groups: IntentConsumer<SecurityGroup>,
    ports: IntentConsumer<LogicalPort>,
    store_errors: u64,
}

impl Controller {
    /// Registers the apps (aging first, so its generation flip precedes
    /// every replay) and runs their start hooks.
    pub fn new(
        config: ControllerConfig,
        channel: Box<dyn SwitchChannel>,
        conntrack: Box<dyn ConntrackHelper>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;

        let mut registry = CookieRegistry::new();
        let mut dispatcher = Dispatcher::new(config.chassis.clone());
        let aging = AgingApp::new(config.aging.enabled);
        let generation = aging.generation_handle();
        dispatcher.register(aging, &mut registry)?;
        dispatcher.register(SecGroupApp::new(conntrack), &mut registry)?;

        let batch_size = config.daemon.batch_size;
        let mut controller = Self {
            store: ObjectStore::new(),
            pipeline: FlowPipeline::new(SwitchSession::new(channel), generation),
            dispatcher,
            lswitches: IntentConsumer::new(
                ConsumerConfig::new("logical_switch").with_priority(0).with_batch_size(batch_size),
            ),
            groups: IntentConsumer::new(
                ConsumerConfig::new("security_group").with_priority(1).with_batch_size(batch_size),
            ),
            ports: IntentConsumer::new(ConsumerConfig::new("port").with_priority(2).with_batch_size(batch_size)),
            store_errors: 0,
            config,
        };
        controller.dispatcher.start(&mut controller.pipeline, &controller.store);

        info!(
            "Controller: chassis {} with apps {:?}, {} cookie bits left",
            controller.config.chassis,
            controller.dispatcher.app_names(),
            registry.available()
        );
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "Controller", "start")
            .with_object_id(controller.config.chassis.clone())
            .with_details(serde_json::json!({
                "apps": controller.dispatcher.app_names(),
                "aging": controller.config.aging.enabled,
                "cookie_bits_left": registry.available(),
            }))
            .with_outcome(AuditOutcome::Success));
        Ok(controller)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn pipeline(&self) -> &FlowPipeline {
        &self.pipeline
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn aging(&self) -> Option<&AgingApp> {
        self.dispatcher.app::<AgingApp>()
    }

    pub fn secgroup(&self) -> Option<&SecGroupApp> {
        self.dispatcher.app::<SecGroupApp>()
    }

    pub fn session_state(&self) -> SessionState {
        self.pipeline.session().state()
    }

    pub fn pending_intents(&self) -> usize {
        self.lswitches.pending_count() + self.groups.pending_count() + self.ports.pending_count()
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            session: self.session_state(),
            pending_intents: self.pending_intents(),
            ports: self.store.port_count(),
            store_errors: self.store_errors,
            dispatch: self.dispatcher.stats().clone(),
            pipeline: self.pipeline.stats().clone(),
            aging: self.aging().map(|aging| aging.stats().clone()),
            secgroup: self.secgroup().map(|secgroup| secgroup.stats().clone()),
        }
    }

    /// Queues an intent; nothing happens until [`Controller::process_pending`].
    pub fn submit(&mut self, intent: IntentEvent) {
        let IntentEvent { op, entity } = intent;
        let key = entity.id().to_string();
        match entity {
            Entity::LogicalSwitch(lswitch) => self.lswitches.push(IntentEntry::new(key, op, lswitch)),
            Entity::SecurityGroup(group) => self.groups.push(IntentEntry::new(key, op, group)),
            Entity::Port(port) => self.ports.push(IntentEntry::new(key, op, port)),
        }
    }

    /// Applies queued intents, logical switches first, then security
    /// groups, then ports. Returns how many were applied.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        loop {
            if self.lswitches.has_pending() {
                for entry in self.lswitches.pop_batch() {
                    let change = self.store.apply_lswitch(entry.op, entry.object);
                    self.dispatcher.handle_lswitch(&mut self.pipeline, &self.store, &change);
                    applied += 1;
                }
            } else if self.groups.has_pending() {
                for entry in self.groups.pop_batch() {
                    let change = self.store.apply_security_group(entry.op, entry.object);
                    self.dispatcher
                        .handle_security_group(&mut self.pipeline, &self.store, &change);
                    applied += 1;
                }
            } else if self.ports.has_pending() {
                for entry in self.ports.pop_batch() {
                    self.apply_port(entry);
                    applied += 1;
                }
            } else {
                break;
            }
        }
        if applied > 0 {
            debug!("Controller: applied {} intents", applied);
        }
        applied
    }

    fn apply_port(&mut self, entry: IntentEntry<LogicalPort>) {
        match self.store.apply_port(entry.op, entry.object) {
            Ok(change) => self.dispatcher.handle_port(&mut self.pipeline, &self.store, &change),
            Err(e) => {
                self.store_errors += 1;
                warn!("Controller: rejected {} of port {}: {}", entry.op, entry.key, e);
            }
        }
    }

    /// Local rebind of a known port, e.g. after a live migration landed.
    pub fn rebind_port(&mut self, port: &PortId, binding: Option<PortBinding>) -> StoreChange<LogicalPort> {
        self.dispatcher
            .rebind_port(&mut self.pipeline, &mut self.store, port, binding)
    }

    /// Starts a new session epoch and has every app replay into it.
    pub fn session_established(&mut self) -> u64 {
        let epoch = self.pipeline.session_mut().establish();
        audit_log!(AuditRecord::new(AuditCategory::SessionLifecycle, "Controller", "establish")
            .with_details(serde_json::json!({ "epoch": epoch }))
            .with_outcome(AuditOutcome::Success));
        self.dispatcher
            .session_established(&mut self.pipeline, &self.store);
        epoch
    }

    pub fn session_lost(&mut self) {
        let epoch = self.pipeline.session().epoch();
        self.pipeline.session_mut().lose();
        audit_log!(AuditRecord::new(AuditCategory::SessionLifecycle, "Controller", "lose")
            .with_details(serde_json::json!({ "epoch": epoch }))
            .with_outcome(AuditOutcome::Success));
    }

    /// Runs the settle hooks if `epoch` is still the live session.
    pub fn session_settled(&mut self, epoch: u64) -> bool {
        if !self.pipeline.session_mut().settle(epoch) {
            audit_log!(AuditRecord::new(AuditCategory::SessionLifecycle, "Controller", "settle")
                .with_details(serde_json::json!({ "epoch": epoch }))
                .with_outcome(AuditOutcome::Skipped));
            return false;
        }
        self.dispatcher.session_settled(&mut self.pipeline, &self.store);
        audit_log!(AuditRecord::new(AuditCategory::SessionLifecycle, "Controller", "settle")
            .with_details(serde_json::json!({ "epoch": epoch }))
            .with_outcome(AuditOutcome::Success));
        true
    }
}
