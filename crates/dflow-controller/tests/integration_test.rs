//! End-to-end tests of the controller against the in-memory switch.
//!
//! These drive the public API the way the daemon does (intents in, session
//! events, settle) and check what ends up on the switch.

use dflow_app_common::{HandlerResult, Operation};
use dflow_controller::aging::Generation;
use dflow_controller::config::ControllerConfig;
use dflow_controller::dispatch::{App, AppContext, Dispatcher, EventKind, Handler, HandlerEntry};
use dflow_controller::model::{
    Direction, Entity, EtherType, LogicalPort, LogicalSwitch, ObjectStore, PortBinding, SecurityGroup,
    SecurityGroupRule,
};
use dflow_controller::pipeline::{CookieRegistry, FlowPipeline, PriorityBand, SwitchSession, Table};
use dflow_controller::secgroup::{direction_tables, NullConntrack};
use dflow_controller::{Controller, ControllerDaemon, IntentEvent};
use dflow_ofproto::{
    Action, Cookie, FieldKind, FlowEntry, FlowKey, FlowMod, Instruction, Match, MatchField, MemorySwitch,
    SwitchChannel,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CHASSIS: &str = "host-a";
const PROTO_TCP: u8 = 6;

fn config(aging: bool) -> ControllerConfig {
    let mut config = ControllerConfig {
        chassis: CHASSIS.to_string(),
        ..ControllerConfig::default()
    };
    config.aging.enabled = aging;
    config.aging.settle_delay_ms = 1000;
    config
}

fn controller(switch: &MemorySwitch, aging: bool) -> Controller {
    Controller::new(config(aging), Box::new(switch.clone()), Box::new(NullConntrack)).unwrap()
}

fn apply(controller: &mut Controller, op: Operation, entity: Entity) {
    controller.submit(IntentEvent::new(op, entity));
    controller.process_pending();
}

fn lswitch(controller: &mut Controller) {
    apply(
        controller,
        Operation::Created,
        Entity::LogicalSwitch(LogicalSwitch::new("ls1", 5)),
    );
}

fn group(controller: &mut Controller, sg: SecurityGroup) {
    apply(controller, Operation::Updated, Entity::SecurityGroup(sg));
}

fn port(controller: &mut Controller, port: LogicalPort) {
    apply(controller, Operation::Updated, Entity::Port(port));
}

fn delete_port(controller: &mut Controller, id: &str) {
    let port = controller.store().port(&id.into()).cloned().unwrap();
    apply(controller, Operation::Deleted, Entity::Port(port));
}

fn vm(id: &str, key: u32, ip: &str, chassis: &str) -> LogicalPort {
    LogicalPort::new(id, "ls1", key)
        .with_address("fa:16:3e:00:00:01".parse().unwrap(), ip.parse().unwrap())
        .with_binding(PortBinding::chassis(chassis))
}

fn tcp_in(id: &str, dst_port: u16) -> SecurityGroupRule {
    SecurityGroupRule::new(id, Direction::Ingress, EtherType::IPv4)
        .with_protocol(PROTO_TCP)
        .with_ports(dst_port, dst_port)
}

fn rule_clauses(switch: &MemorySwitch, direction: Direction) -> Vec<FlowEntry> {
    switch
        .flows_in(direction_tables(direction).security_group.id())
        .into_iter()
        .filter(|flow| {
            flow.actions()
                .any(|action| matches!(action, Action::Conjunction { clause: 1, .. }))
        })
        .collect()
}

fn port_clause(switch: &MemorySwitch, direction: Direction, key: u32) -> Option<FlowEntry> {
    let tables = direction_tables(direction);
    switch.get(&FlowKey {
        table: tables.security_group.id(),
        priority: PriorityBand::Medium.priority(),
        flow_match: Match::new().reg(tables.port_reg, key),
    })
}

fn carries_conjunction(switch: &MemorySwitch, conj: u32) -> bool {
    switch.flows().iter().any(|flow| {
        flow.conjunction_ids().contains(&conj)
            || flow.flow_match.get(FieldKind::ConjId) == Some(&MatchField::ConjId(conj))
    })
}

fn flow_keys(switch: &MemorySwitch) -> BTreeSet<FlowKey> {
    switch.flows().iter().map(FlowEntry::key).collect()
}

#[test]
fn test_end_to_end_remote_group_scenario() {
    let switch = MemorySwitch::new();
    let mut c = controller(&switch, true);
    c.session_established();
    lswitch(&mut c);
    group(&mut c, SecurityGroup::new("g2", 12));
    group(&mut c, SecurityGroup::new("g1", 11).with_rule(tcp_in("r1", 80).with_remote_group("g2")));

    port(&mut c, vm("a", 1, "10.0.0.1", CHASSIS).with_security_group("g1"));
    {
        let secgroup = c.secgroup().unwrap();
        assert!(secgroup.is_active(&"g1".into()));
        assert_eq!(secgroup.association_count(&"g1".into()), 1);
    }
    assert_eq!(port_clause(&switch, Direction::Ingress, 1).unwrap().conjunction_ids(), vec![11]);
    assert!(rule_clauses(&switch, Direction::Ingress).is_empty());

    port(&mut c, vm("b", 2, "10.0.0.2", "host-b").with_security_group("g2"));
    let clauses = rule_clauses(&switch, Direction::Ingress);
    assert_eq!(clauses.len(), 1);
    let expected = Match::new()
        .eth_type(0x0800)
        .ip_proto(PROTO_TCP)
        .tp_dst(80, u16::MAX)
        .ip_src("10.0.0.2/32".parse().unwrap());
    assert_eq!(clauses[0].flow_match, expected);
    assert_eq!(clauses[0].conjunction_ids(), vec![11]);

    delete_port(&mut c, "a");
    assert!(!carries_conjunction(&switch, 11));
    assert!(!c.secgroup().unwrap().is_active(&"g1".into()));
}

#[test]
fn test_flow_count_is_ports_plus_rules() {
    let switch = MemorySwitch::new();
    let mut c = controller(&switch, false);
    c.session_established();
    lswitch(&mut c);

    let mut sg = SecurityGroup::new("g1", 11);
    for (i, dst_port) in [22, 80, 443, 8080].into_iter().enumerate() {
        sg = sg.with_rule(tcp_in(&format!("r{}", i), dst_port));
    }
    group(&mut c, sg);
    let table = direction_tables(Direction::Ingress).security_group.id();
    let baseline = switch.flows_in(table).len();

    for key in 1..=5u32 {
        port(
            &mut c,
            vm(&format!("p{}", key), key, &format!("10.0.0.{}", key), CHASSIS).with_security_group("g1"),
        );
    }

    // 5 clause-0 flows, 4 clause-1 flows and one permit flow.
    assert_eq!(switch.flows_in(table).len(), baseline + 5 + 4 + 1);
    assert_eq!(rule_clauses(&switch, Direction::Ingress).len(), 4);
}

#[test]
fn test_remote_group_created_late() {
    let switch = MemorySwitch::new();
    let mut c = controller(&switch, false);
    c.session_established();
    lswitch(&mut c);
    group(&mut c, SecurityGroup::new("g1", 11).with_rule(tcp_in("r1", 22).with_remote_group("g2")));
    port(&mut c, vm("a", 1, "10.0.0.1", CHASSIS).with_security_group("g1"));
    port(&mut c, vm("b", 2, "10.0.0.2", "host-b").with_security_group("g2"));
    assert!(rule_clauses(&switch, Direction::Ingress).is_empty());

    group(&mut c, SecurityGroup::new("g2", 12));
    let clauses = rule_clauses(&switch, Direction::Ingress);
    assert_eq!(clauses.len(), 1);
    assert_eq!(
        clauses[0].flow_match.get(FieldKind::IpSrc),
        Some(&MatchField::IpSrc("10.0.0.2/32".parse().unwrap()))
    );

    let g2 = c.store().security_group(&"g2".into()).cloned().unwrap();
    apply(&mut c, Operation::Deleted, Entity::SecurityGroup(g2));
    assert!(rule_clauses(&switch, Direction::Ingress).is_empty());
    assert!(c.secgroup().unwrap().is_active(&"g1".into()));
}

#[test]
fn test_replay_reinstalls_same_flows() {
    let switch = MemorySwitch::new();
    let mut c = controller(&switch, false);
    c.session_established();
    lswitch(&mut c);
    group(&mut c, SecurityGroup::new("g2", 12));
    group(&mut c, SecurityGroup::new("g1", 11).with_rule(tcp_in("r1", 80).with_remote_group("g2")));
    port(&mut c, vm("a", 1, "10.0.0.1", CHASSIS).with_security_group("g1"));
    port(&mut c, vm("b", 2, "10.0.0.2", "host-b").with_security_group("g2"));

    let before = switch.flows();
    c.session_lost();
    c.session_established();

    assert_eq!(switch.flow_count(), before.len());
    for flow in before {
        assert_eq!(switch.get(&flow.key()), Some(flow));
    }
}

#[test]
fn test_edits_while_down_are_replayed() {
    let switch = MemorySwitch::new();
    let mut c = controller(&switch, false);
    c.session_established();
    lswitch(&mut c);
    group(&mut c, SecurityGroup::new("g1", 11).with_rule(tcp_in("r1", 80)));
    port(&mut c, vm("a", 1, "10.0.0.1", CHASSIS).with_security_group("g1"));
    let expected = flow_keys(&switch);

    // Edits made while the session is down are dropped, not queued.
    c.session_lost();
    port(&mut c, vm("c", 3, "10.0.0.3", CHASSIS).with_security_group("g1"));
    assert!(port_clause(&switch, Direction::Ingress, 3).is_none());
    assert!(c.pipeline().stats().deferred > 0);

    c.session_established();
    assert!(flow_keys(&switch).is_superset(&expected));
    assert!(port_clause(&switch, Direction::Ingress, 3).is_some());
}

#[test]
fn test_aging_sweeps_only_stale_generation() {
    let switch = MemorySwitch::new();

    let mut first = controller(&switch, true);
    let epoch = first.session_established();
    lswitch(&mut first);
    group(&mut first, SecurityGroup::new("g1", 11).with_rule(tcp_in("r1", 80)));
    port(&mut first, vm("a", 1, "10.0.0.1", CHASSIS).with_security_group("g1"));
    port(&mut first, vm("b", 2, "10.0.0.2", CHASSIS).with_security_group("g1"));
    assert!(first.session_settled(epoch));
    assert_eq!(first.aging().unwrap().stats().first_contacts, 1);
    assert!(port_clause(&switch, Direction::Egress, 2).is_some());

    // Restart: the new instance never hears about port b.
    let mut second = controller(&switch, true);
    let epoch = second.session_established();
    assert_eq!(second.aging().unwrap().current(), Generation::ONE);
    lswitch(&mut second);
    group(&mut second, SecurityGroup::new("g1", 11).with_rule(tcp_in("r1", 80)));
    port(&mut second, vm("a", 1, "10.0.0.1", CHASSIS).with_security_group("g1"));
    assert!(port_clause(&switch, Direction::Egress, 2).is_some());

    assert!(second.session_settled(epoch));
    assert_eq!(second.aging().unwrap().stats().sweeps, 1);
    assert!(port_clause(&switch, Direction::Egress, 2).is_none());
    assert!(port_clause(&switch, Direction::Egress, 1).is_some());
    assert_eq!(rule_clauses(&switch, Direction::Ingress).len(), 1);
    assert_eq!(switch.flows_in(Table::Canary.id()).len(), 1);

    // Generation bit is the lowest cookie bit.
    assert!(switch.flows().iter().all(|flow| flow.cookie.0 & 1 == 1));
}

#[test]
fn test_no_sweep_without_canary() {
    let switch = MemorySwitch::new();
    let mut foreign = switch.clone();
    foreign
        .send_flow_mod(&FlowMod::add(
            Table::L2Lookup.id(),
            PriorityBand::Low.priority(),
            Match::new().reg(6, 99),
            Cookie::ZERO,
            vec![Instruction::GotoTable(Table::Egress.id())],
        ))
        .unwrap();

    let mut c = controller(&switch, true);
    let epoch = c.session_established();
    assert!(c.session_settled(epoch));

    let aging = c.aging().unwrap().stats().clone();
    assert_eq!(aging.first_contacts, 1);
    assert_eq!(aging.sweeps, 0);
    assert!(switch
        .get(&FlowKey {
            table: Table::L2Lookup.id(),
            priority: PriorityBand::Low.priority(),
            flow_match: Match::new().reg(6, 99),
        })
        .is_some());
}

#[test]
fn test_moving_port_unbinds_before_binding() {
    #[derive(Default)]
    struct Journal {
        seen: Arc<Mutex<Vec<(EventKind, String)>>>,
    }

    impl Journal {
        fn record(&mut self, _ctx: &mut AppContext<'_>, port: &LogicalPort, kind: EventKind) -> HandlerResult<()> {
            self.seen.lock().unwrap().push((kind, port.id.to_string()));
            Ok(())
        }

        fn bind_local(&mut self, ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
            self.record(ctx, port, EventKind::BindLocal)
        }

        fn bind_remote(&mut self, ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
            self.record(ctx, port, EventKind::BindRemote)
        }

        fn unbind_local(&mut self, ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
            self.record(ctx, port, EventKind::UnbindLocal)
        }

        fn unbind_remote(&mut self, ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
            self.record(ctx, port, EventKind::UnbindRemote)
        }
    }

    const JOURNAL_HANDLERS: &[HandlerEntry<Journal>] = &[
        HandlerEntry::new(EventKind::BindLocal, Handler::Port(Journal::bind_local)),
        HandlerEntry::new(EventKind::BindRemote, Handler::Port(Journal::bind_remote)),
        HandlerEntry::new(EventKind::UnbindLocal, Handler::Port(Journal::unbind_local)),
        HandlerEntry::new(EventKind::UnbindRemote, Handler::Port(Journal::unbind_remote)),
    ];

    impl App for Journal {
        fn name(&self) -> &'static str {
            "journal"
        }

        fn handlers() -> &'static [HandlerEntry<Self>] {
            JOURNAL_HANDLERS
        }
    }

    let journal = Journal::default();
    let seen = Arc::clone(&journal.seen);
    let switch = MemorySwitch::new();
    let mut pipeline = FlowPipeline::new(SwitchSession::new(Box::new(switch)), Default::default());
    let mut store = ObjectStore::new();
    let mut dispatcher = Dispatcher::new(CHASSIS);
    dispatcher.register(journal, &mut CookieRegistry::new()).unwrap();

    let change = store
        .apply_port(Operation::Created, vm("p", 1, "10.0.0.1", "host-b"))
        .unwrap();
    dispatcher.handle_port(&mut pipeline, &store, &change);
    dispatcher.rebind_port(&mut pipeline, &mut store, &"p".into(), Some(PortBinding::chassis(CHASSIS)));
    dispatcher.rebind_port(&mut pipeline, &mut store, &"p".into(), None);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (EventKind::BindRemote, "p".to_string()),
            (EventKind::UnbindRemote, "p".to_string()),
            (EventKind::BindLocal, "p".to_string()),
            (EventKind::UnbindLocal, "p".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_daemon_restart_sweeps_after_settle() {
    let switch = MemorySwitch::new();

    let (daemon, handle) = ControllerDaemon::new(controller(&switch, true));
    let worker = tokio::spawn(daemon.run());
    handle.session_established().await.unwrap();
    for intent in [
        IntentEvent::new(Operation::Created, Entity::LogicalSwitch(LogicalSwitch::new("ls1", 5))),
        IntentEvent::new(Operation::Created, Entity::SecurityGroup(SecurityGroup::new("g1", 11))),
        IntentEvent::new(
            Operation::Created,
            Entity::Port(vm("a", 1, "10.0.0.1", CHASSIS).with_security_group("g1")),
        ),
        IntentEvent::new(
            Operation::Created,
            Entity::Port(vm("b", 2, "10.0.0.2", CHASSIS).with_security_group("g1")),
        ),
    ] {
        handle.submit(intent).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;
    handle.barrier().await.unwrap();
    assert!(port_clause(&switch, Direction::Ingress, 2).is_some());
    handle.shutdown().await.unwrap();
    worker.await.unwrap();

    let (daemon, handle) = ControllerDaemon::new(controller(&switch, true));
    let worker = tokio::spawn(daemon.run());
    handle.session_established().await.unwrap();
    for intent in [
        IntentEvent::new(Operation::Created, Entity::LogicalSwitch(LogicalSwitch::new("ls1", 5))),
        IntentEvent::new(Operation::Created, Entity::SecurityGroup(SecurityGroup::new("g1", 11))),
        IntentEvent::new(
            Operation::Created,
            Entity::Port(vm("a", 1, "10.0.0.1", CHASSIS).with_security_group("g1")),
        ),
    ] {
        handle.submit(intent).await.unwrap();
    }
    handle.barrier().await.unwrap();
    assert!(port_clause(&switch, Direction::Ingress, 2).is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.aging.unwrap().sweeps, 1);
    assert!(port_clause(&switch, Direction::Ingress, 2).is_none());
    assert_eq!(port_clause(&switch, Direction::Ingress, 1).unwrap().conjunction_ids(), vec![11]);

    drop(handle);
    let controller = worker.await.unwrap();
    assert_eq!(controller.store().port_count(), 1);
}

#[test]
fn test_intents_round_trip_through_json() {
    let json = r#"[
        {"op": "created", "entity": {"kind": "logical_switch", "id": "ls1", "unique_key": 5}},
        {"op": "created", "entity": {"kind": "security_group", "id": "g1", "unique_key": 11, "rules": [
            {"id": "r1", "direction": "ingress", "ethertype": "IPv4", "protocol": 6,
             "port_range_min": 22, "port_range_max": 22}
        ]}},
        {"op": "created", "entity": {"kind": "port", "id": "a", "lswitch": "ls1", "unique_key": 1,
            "security_groups": ["g1"], "binding": {"type": "chassis", "chassis": "host-a"}}}
    ]"#;
    let intents: Vec<IntentEvent> = serde_json::from_str(json).unwrap();
    assert_eq!(intents.len(), 3);

    let switch = MemorySwitch::new();
    let mut c = controller(&switch, false);
    c.session_established();
    for intent in intents {
        c.submit(intent);
    }
    assert_eq!(c.process_pending(), 3);
    assert_eq!(rule_clauses(&switch, Direction::Ingress).len(), 1);
    assert!(port_clause(&switch, Direction::Ingress, 1).is_some());
}
