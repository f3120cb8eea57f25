//! Delivers store changes to registered apps.

use super::binding::{derive_events, BindingState, BindingTracker};
use super::event::EventKind;
use super::registry::{App, AppContext, Delivery, ErasedApp, Payload, Registered};
use super::DispatchError;
use crate::model::{LogicalPort, LogicalSwitch, ObjectStore, PortBinding, PortId, SecurityGroup, StoreChange};
use crate::pipeline::{CookieRegistry, FlowPipeline};
use log::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub events: u64,
    pub handler_calls: u64,
    pub handler_errors: u64,
    pub handler_panics: u64,
    /// Stale, unchanged or unknown changes that produced no event
    pub ignored_changes: u64,
}

pub struct Dispatcher {
    apps: Vec<Box<dyn ErasedApp>>,
    bindings: BindingTracker,
    local_chassis: String,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(local_chassis: impl Into<String>) -> Self {
        Self {
            apps: Vec::new(),
            bindings: BindingTracker::new(),
            local_chassis: local_chassis.into(),
            stats: DispatchStats::default(),
        }
    }

    pub fn local_chassis(&self) -> &str {
        &self.local_chassis
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn binding_state(&self, port: &PortId) -> BindingState {
        self.bindings.state(port)
    }

    pub fn app_names(&self) -> Vec<&'static str> {
        self.apps.iter().map(|app| app.name()).collect()
    }

    /// Typed access to a registered app.
    pub fn app<A: App>(&self) -> Option<&A> {
        self.apps.iter().find_map(|app| app.as_any().downcast_ref::<A>())
    }

    /// Validates the app's handler table, lets it reserve cookie bits and
    /// appends it to the delivery order.
    pub fn register<A: App>(&mut self, mut app: A, registry: &mut CookieRegistry) -> Result<(), DispatchError> {
        let name = app.name();
        if self.apps.iter().any(|existing| existing.name() == name) {
            return Err(DispatchError::DuplicateApp(name));
        }
        for entry in A::handlers() {
            if !entry.event.applies_to(entry.entity()) {
                return Err(DispatchError::InvalidHandler {
                    app: name,
                    entity: entry.entity(),
                    event: entry.event,
                });
            }
        }
        app.reserve_cookies(registry)
            .map_err(|source| DispatchError::Cookie { app: name, source })?;

        info!(
            "Dispatcher: registered {} with {} handlers",
            name,
            A::handlers().len()
        );
        self.apps.push(Box::new(Registered::new(app)));
        Ok(())
    }

    pub fn start(&mut self, pipeline: &mut FlowPipeline, store: &ObjectStore) {
        let mut ctx = AppContext {
            pipeline,
            store,
            local_chassis: &self.local_chassis,
        };
        for app in &mut self.apps {
            if let Some(panic) = app.start(&mut ctx) {
                self.stats.handler_panics += 1;
                error!("Dispatcher: {} panicked on start: {}", app.name(), panic);
            }
        }
    }

    pub fn session_established(&mut self, pipeline: &mut FlowPipeline, store: &ObjectStore) {
        let mut ctx = AppContext {
            pipeline,
            store,
            local_chassis: &self.local_chassis,
        };
        for app in &mut self.apps {
            if let Some(panic) = app.session_established(&mut ctx) {
                self.stats.handler_panics += 1;
                error!("Dispatcher: {} panicked on session establish: {}", app.name(), panic);
            }
        }
    }

    pub fn session_settled(&mut self, pipeline: &mut FlowPipeline, store: &ObjectStore) {
        let mut ctx = AppContext {
            pipeline,
            store,
            local_chassis: &self.local_chassis,
        };
        for app in &mut self.apps {
            if let Some(panic) = app.session_settled(&mut ctx) {
                self.stats.handler_panics += 1;
                error!("Dispatcher: {} panicked on session settle: {}", app.name(), panic);
            }
        }
    }

    pub fn handle_port(&mut self, pipeline: &mut FlowPipeline, store: &ObjectStore, change: &StoreChange<LogicalPort>) {
        if !change.is_effective() {
            self.stats.ignored_changes += 1;
            return;
        }
        self.bindings.record(change, &self.local_chassis);
        for event in derive_events(change, &self.local_chassis) {
            let payload = Payload::Port(&event.port, event.old.as_ref());
            self.deliver(pipeline, store, event.kind, &payload);
        }
    }

    pub fn handle_security_group(
        &mut self,
        pipeline: &mut FlowPipeline,
        store: &ObjectStore,
        change: &StoreChange<SecurityGroup>,
    ) {
        match change {
            StoreChange::Created(new) => {
                self.deliver(pipeline, store, EventKind::Created, &Payload::SecurityGroup(new, None));
            }
            StoreChange::Updated { old, new } => {
                self.deliver(pipeline, store, EventKind::Updated, &Payload::SecurityGroup(new, Some(old)));
            }
            StoreChange::Deleted(old) => {
                self.deliver(pipeline, store, EventKind::Deleted, &Payload::SecurityGroup(old, None));
            }
            StoreChange::Stale | StoreChange::Unchanged | StoreChange::Unknown => {
                self.stats.ignored_changes += 1;
            }
        }
    }

    pub fn handle_lswitch(
        &mut self,
        pipeline: &mut FlowPipeline,
        store: &ObjectStore,
        change: &StoreChange<LogicalSwitch>,
    ) {
        match change {
            StoreChange::Created(new) => {
                self.deliver(pipeline, store, EventKind::Created, &Payload::LogicalSwitch(new, None));
            }
            StoreChange::Updated { old, new } => {
                self.deliver(pipeline, store, EventKind::Updated, &Payload::LogicalSwitch(new, Some(old)));
            }
            StoreChange::Deleted(old) => {
                self.deliver(pipeline, store, EventKind::Deleted, &Payload::LogicalSwitch(old, None));
            }
            StoreChange::Stale | StoreChange::Unchanged | StoreChange::Unknown => {
                self.stats.ignored_changes += 1;
            }
        }
    }

    /// Local rebind of a port by a collaborator module. Produces the same
    /// events an intent update with the new binding would.
    pub fn rebind_port(
        &mut self,
        pipeline: &mut FlowPipeline,
        store: &mut ObjectStore,
        port: &PortId,
        binding: Option<PortBinding>,
    ) -> StoreChange<LogicalPort> {
        let change = store.set_port_binding(port, binding);
        if let StoreChange::Unknown = change {
            warn!("Dispatcher: rebind of unknown port {}", port);
        }
        self.handle_port(pipeline, store, &change);
        change
    }

    fn deliver(&mut self, pipeline: &mut FlowPipeline, store: &ObjectStore, event: EventKind, payload: &Payload<'_>) {
        self.stats.events += 1;
        debug!(
            "Dispatcher: {} {} {}",
            payload.entity(),
            payload.object_id(),
            event
        );

        let mut ctx = AppContext {
            pipeline,
            store,
            local_chassis: &self.local_chassis,
        };
        for app in &mut self.apps {
            if !app.wants(payload.entity(), event) {
                continue;
            }
            for delivery in app.deliver(&mut ctx, event, payload) {
                self.stats.handler_calls += 1;
                match delivery {
                    Delivery::Ok => {}
                    Delivery::Failed(e) => {
                        self.stats.handler_errors += 1;
                        error!(
                            "Dispatcher: {} failed {} for {} {}: {}",
                            app.name(),
                            event,
                            payload.entity(),
                            payload.object_id(),
                            e
                        );
                    }
                    Delivery::Panicked(message) => {
                        self.stats.handler_panics += 1;
                        error!(
                            "Dispatcher: {} panicked in {} for {} {}: {}",
                            app.name(),
                            event,
                            payload.entity(),
                            payload.object_id(),
                            message
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aging::GenerationHandle;
    use crate::dispatch::{Handler, HandlerEntry};
    use crate::pipeline::SwitchSession;
    use dflow_app_common::{HandlerError, HandlerResult, Operation};
    use dflow_ofproto::MemorySwitch;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
    }

    impl Recorder {
        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, entry));
        }

        fn bind_local(&mut self, _ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
            self.push(format!("bind_local {}", port.id));
            Ok(())
        }

        fn unbind_local(&mut self, _ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
            self.push(format!("unbind_local {}", port.id));
            Ok(())
        }

        fn bind_remote(&mut self, _ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
            self.push(format!("bind_remote {}", port.id));
            Ok(())
        }

        fn sg_updated(&mut self, _ctx: &mut AppContext<'_>, sg: &SecurityGroup, old: Option<&SecurityGroup>) -> HandlerResult<()> {
            self.push(format!("sg_updated {} from v{}", sg.id, old.map_or(0, |o| o.version)));
            Ok(())
        }
    }

    const RECORDER_HANDLERS: &[HandlerEntry<Recorder>] = &[
        HandlerEntry::new(EventKind::BindLocal, Handler::Port(Recorder::bind_local)),
        HandlerEntry::new(EventKind::UnbindLocal, Handler::Port(Recorder::unbind_local)),
        HandlerEntry::new(EventKind::BindRemote, Handler::Port(Recorder::bind_remote)),
        HandlerEntry::new(EventKind::Updated, Handler::SecurityGroup(Recorder::sg_updated)),
    ];

    impl App for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn handlers() -> &'static [HandlerEntry<Self>] {
            RECORDER_HANDLERS
        }
    }

    struct Faulty;

    impl Faulty {
        fn fail(&mut self, _ctx: &mut AppContext<'_>, _port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
            Err(HandlerError::internal("boom"))
        }

        fn explode(&mut self, _ctx: &mut AppContext<'_>, _port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
            panic!("handler exploded");
        }
    }

    const FAULTY_HANDLERS: &[HandlerEntry<Faulty>] = &[
        HandlerEntry::new(EventKind::BindLocal, Handler::Port(Faulty::fail)),
        HandlerEntry::new(EventKind::BindLocal, Handler::Port(Faulty::explode)),
    ];

    impl App for Faulty {
        fn name(&self) -> &'static str {
            "faulty"
        }

        fn handlers() -> &'static [HandlerEntry<Self>] {
            FAULTY_HANDLERS
        }
    }

    struct Misdeclared;

    impl Misdeclared {
        fn nop(&mut self, _ctx: &mut AppContext<'_>, _port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
            Ok(())
        }
    }

    const MISDECLARED_HANDLERS: &[HandlerEntry<Misdeclared>] =
        &[HandlerEntry::new(EventKind::Created, Handler::Port(Misdeclared::nop))];

    impl App for Misdeclared {
        fn name(&self) -> &'static str {
            "misdeclared"
        }

        fn handlers() -> &'static [HandlerEntry<Self>] {
            MISDECLARED_HANDLERS
        }
    }

    fn pipeline() -> FlowPipeline {
        let mut session = SwitchSession::new(Box::new(MemorySwitch::new()));
        session.establish();
        FlowPipeline::new(session, GenerationHandle::default())
    }

    fn local_port(id: &str, key: u32, chassis: &str) -> LogicalPort {
        LogicalPort::new(id, "net1", key).with_binding(PortBinding::chassis(chassis))
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let log = Log::default();
        let mut registry = CookieRegistry::new();
        let mut dispatcher = Dispatcher::new("host-a");
        dispatcher
            .register(Recorder { name: "first", log: log.clone() }, &mut registry)
            .unwrap();
        dispatcher
            .register(Recorder { name: "second", log: log.clone() }, &mut registry)
            .unwrap();

        let mut pipeline = pipeline();
        let mut store = ObjectStore::new();
        let change = store
            .apply_port(Operation::Created, local_port("p1", 1, "host-a"))
            .unwrap();
        dispatcher.handle_port(&mut pipeline, &store, &change);

        let change = store
            .apply_port(Operation::Updated, local_port("p1", 1, "host-b").with_version(1))
            .unwrap();
        dispatcher.handle_port(&mut pipeline, &store, &change);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first:bind_local p1",
                "second:bind_local p1",
                "first:unbind_local p1",
                "second:unbind_local p1",
                "first:bind_remote p1",
                "second:bind_remote p1",
            ]
        );
        assert_eq!(dispatcher.binding_state(&PortId::new("p1")), BindingState::BoundRemote);
    }

    #[test]
    fn test_failures_do_not_stop_delivery() {
        let log = Log::default();
        let mut registry = CookieRegistry::new();
        let mut dispatcher = Dispatcher::new("host-a");
        dispatcher.register(Faulty, &mut registry).unwrap();
        dispatcher
            .register(Recorder { name: "after", log: log.clone() }, &mut registry)
            .unwrap();

        let mut pipeline = pipeline();
        let change = StoreChange::Created(local_port("p1", 1, "host-a"));
        dispatcher.handle_port(&mut pipeline, &ObjectStore::new(), &change);

        assert_eq!(*log.lock().unwrap(), vec!["after:bind_local p1"]);
        assert_eq!(dispatcher.stats().handler_errors, 1);
        assert_eq!(dispatcher.stats().handler_panics, 1);
        assert_eq!(dispatcher.stats().handler_calls, 3);
    }

    #[test]
    fn test_registration_validation() {
        let mut registry = CookieRegistry::new();
        let mut dispatcher = Dispatcher::new("host-a");

        assert!(matches!(
            dispatcher.register(Misdeclared, &mut registry),
            Err(DispatchError::InvalidHandler { .. })
        ));

        dispatcher.register(Faulty, &mut registry).unwrap();
        assert!(matches!(
            dispatcher.register(Faulty, &mut registry),
            Err(DispatchError::DuplicateApp("faulty"))
        ));
        assert_eq!(dispatcher.app_names(), vec!["faulty"]);
        assert!(dispatcher.app::<Faulty>().is_some());
    }

    #[test]
    fn test_non_port_events_and_ignored_changes() {
        let log = Log::default();
        let mut registry = CookieRegistry::new();
        let mut dispatcher = Dispatcher::new("host-a");
        dispatcher
            .register(Recorder { name: "r", log: log.clone() }, &mut registry)
            .unwrap();
        let mut pipeline = pipeline();
        let store = ObjectStore::new();

        let old = SecurityGroup::new("sg1", 5).with_version(1);
        let new = SecurityGroup::new("sg1", 5).with_version(2);
        dispatcher.handle_security_group(&mut pipeline, &store, &StoreChange::Updated { old, new });
        dispatcher.handle_security_group(&mut pipeline, &store, &StoreChange::Stale);
        dispatcher.handle_port(&mut pipeline, &store, &StoreChange::Unknown);

        assert_eq!(*log.lock().unwrap(), vec!["r:sg_updated sg1 from v1"]);
        assert_eq!(dispatcher.stats().ignored_changes, 2);
    }

    #[test]
    fn test_rebind_port() {
        let log = Log::default();
        let mut registry = CookieRegistry::new();
        let mut dispatcher = Dispatcher::new("host-a");
        dispatcher
            .register(Recorder { name: "r", log: log.clone() }, &mut registry)
            .unwrap();
        let mut pipeline = pipeline();
        let mut store = ObjectStore::new();
        store
            .apply_port(Operation::Created, LogicalPort::new("p1", "net1", 1))
            .unwrap();

        let change = dispatcher.rebind_port(
            &mut pipeline,
            &mut store,
            &PortId::new("p1"),
            Some(PortBinding::chassis("host-a")),
        );
        assert!(change.is_effective());
        assert_eq!(*log.lock().unwrap(), vec!["r:bind_local p1"]);
    }
}
