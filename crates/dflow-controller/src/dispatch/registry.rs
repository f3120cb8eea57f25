//! App registration: static handler tables and type-erased delivery.

use super::event::EventKind;
use crate::model::{EntityKind, LogicalPort, LogicalSwitch, ObjectStore, SecurityGroup};
use crate::pipeline::{CookieRegistry, FlowPipeline, PipelineError};
use dflow_app_common::{HandlerError, HandlerResult};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// What a handler gets besides its own state.
pub struct AppContext<'a> {
    pub pipeline: &'a mut FlowPipeline,
    pub store: &'a ObjectStore,
    pub local_chassis: &'a str,
}

/// `(new, old)` for creates, binds and updates; `(gone, None)` for
/// deletes and unbinds.
pub type PortHandler<A> =
    fn(&mut A, &mut AppContext<'_>, &LogicalPort, Option<&LogicalPort>) -> HandlerResult<()>;
pub type SecurityGroupHandler<A> =
    fn(&mut A, &mut AppContext<'_>, &SecurityGroup, Option<&SecurityGroup>) -> HandlerResult<()>;
pub type LogicalSwitchHandler<A> =
    fn(&mut A, &mut AppContext<'_>, &LogicalSwitch, Option<&LogicalSwitch>) -> HandlerResult<()>;

pub enum Handler<A> {
    Port(PortHandler<A>),
    SecurityGroup(SecurityGroupHandler<A>),
    LogicalSwitch(LogicalSwitchHandler<A>),
}

impl<A> Handler<A> {
    pub const fn entity(&self) -> EntityKind {
        match self {
            Handler::Port(_) => EntityKind::Port,
            Handler::SecurityGroup(_) => EntityKind::SecurityGroup,
            Handler::LogicalSwitch(_) => EntityKind::LogicalSwitch,
        }
    }
}

/// One row of an app's handler table.
pub struct HandlerEntry<A> {
    pub event: EventKind,
    pub handler: Handler<A>,
}

impl<A> HandlerEntry<A> {
    pub const fn new(event: EventKind, handler: Handler<A>) -> Self {
        Self { event, handler }
    }

    pub const fn entity(&self) -> EntityKind {
        self.handler.entity()
    }
}

/// A policy module driven by the dispatcher.
///
/// Handlers and lifecycle hooks run on the controller's single worker, in
/// registration order. They must not block.
pub trait App: Send + 'static {
    fn name(&self) -> &'static str;

    /// The app's static handler table.
    fn handlers() -> &'static [HandlerEntry<Self>]
    where
        Self: Sized;

    /// Called once at registration. Errors abort start-up.
    fn reserve_cookies(&mut self, _registry: &mut CookieRegistry) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Called once after every app is registered.
    fn on_start(&mut self, _ctx: &mut AppContext<'_>) {}

    /// The session came (back) up: reinstall everything.
    fn on_session_established(&mut self, _ctx: &mut AppContext<'_>) {}

    /// Every app has replayed and the settle delay elapsed.
    fn on_session_settled(&mut self, _ctx: &mut AppContext<'_>) {}
}

/// Snapshot pair handed to the erased delivery path.
pub enum Payload<'p> {
    Port(&'p LogicalPort, Option<&'p LogicalPort>),
    SecurityGroup(&'p SecurityGroup, Option<&'p SecurityGroup>),
    LogicalSwitch(&'p LogicalSwitch, Option<&'p LogicalSwitch>),
}

impl Payload<'_> {
    pub fn entity(&self) -> EntityKind {
        match self {
            Payload::Port(..) => EntityKind::Port,
            Payload::SecurityGroup(..) => EntityKind::SecurityGroup,
            Payload::LogicalSwitch(..) => EntityKind::LogicalSwitch,
        }
    }

    pub fn object_id(&self) -> &str {
        match self {
            Payload::Port(port, _) => port.id.as_str(),
            Payload::SecurityGroup(group, _) => group.id.as_str(),
            Payload::LogicalSwitch(lswitch, _) => lswitch.id.as_str(),
        }
    }
}

/// Result of one handler invocation.
#[derive(Debug)]
pub enum Delivery {
    Ok,
    Failed(HandlerError),
    Panicked(String),
}

pub(crate) trait ErasedApp: Send {
    fn name(&self) -> &'static str;
    fn wants(&self, entity: EntityKind, event: EventKind) -> bool;
    fn deliver(&mut self, ctx: &mut AppContext<'_>, event: EventKind, payload: &Payload<'_>) -> Vec<Delivery>;
    fn start(&mut self, ctx: &mut AppContext<'_>) -> Option<String>;
    fn session_established(&mut self, ctx: &mut AppContext<'_>) -> Option<String>;
    fn session_settled(&mut self, ctx: &mut AppContext<'_>) -> Option<String>;
    fn as_any(&self) -> &dyn Any;
}

pub(crate) struct Registered<A: App> {
    app: A,
}

impl<A: App> Registered<A> {
    pub(crate) fn new(app: A) -> Self {
        Self { app }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `f`, turning a panic into its message.
fn guarded<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

impl<A: App> ErasedApp for Registered<A> {
    fn name(&self) -> &'static str {
        self.app.name()
    }

    fn wants(&self, entity: EntityKind, event: EventKind) -> bool {
        A::handlers()
            .iter()
            .any(|entry| entry.event == event && entry.entity() == entity)
    }

    fn deliver(&mut self, ctx: &mut AppContext<'_>, event: EventKind, payload: &Payload<'_>) -> Vec<Delivery> {
        let app = &mut self.app;
        A::handlers()
            .iter()
            .filter(|entry| entry.event == event)
            .filter_map(|entry| {
                let outcome = match (&entry.handler, payload) {
                    (Handler::Port(f), Payload::Port(new, old)) => guarded(|| f(app, ctx, new, *old)),
                    (Handler::SecurityGroup(f), Payload::SecurityGroup(new, old)) => {
                        guarded(|| f(app, ctx, new, *old))
                    }
                    (Handler::LogicalSwitch(f), Payload::LogicalSwitch(new, old)) => {
                        guarded(|| f(app, ctx, new, *old))
                    }
                    _ => return None,
                };
                Some(match outcome {
                    Ok(Ok(())) => Delivery::Ok,
                    Ok(Err(e)) => Delivery::Failed(e),
                    Err(message) => Delivery::Panicked(message),
                })
            })
            .collect()
    }

    fn start(&mut self, ctx: &mut AppContext<'_>) -> Option<String> {
        guarded(|| self.app.on_start(ctx)).err()
    }

    fn session_established(&mut self, ctx: &mut AppContext<'_>) -> Option<String> {
        guarded(|| self.app.on_session_established(ctx)).err()
    }

    fn session_settled(&mut self, ctx: &mut AppContext<'_>) -> Option<String> {
        guarded(|| self.app.on_session_settled(ctx)).err()
    }

    fn as_any(&self) -> &dyn Any {
        &self.app
    }
}
