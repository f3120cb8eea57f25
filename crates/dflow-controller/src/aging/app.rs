use super::generation::{Generation, GenerationHandle, GenerationOwner};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::dispatch::{App, AppContext, HandlerEntry};
use crate::pipeline::{CookieRegistry, CookieSlot, FlowPipeline, PipelineError, PriorityBand, Table};
use dflow_ofproto::{Cookie, FlowEntry, Match};
use log::{info, warn};

pub const AGING_COOKIE: &str = "aging";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgingStats {
    pub sessions: u64,
    /// Sessions that found no canary
    pub first_contacts: u64,
    pub flips: u64,
    pub sweeps: u64,
    pub sweep_failures: u64,
    /// Sessions that settled without a sweep
    pub skipped: u64,
}

pub struct AgingApp {
    enabled: bool,
    owner: GenerationOwner,
    slot: Option<CookieSlot>,
    /// Generation to sweep once the current session settles
    sweep: Option<Generation>,
    stats: AgingStats,
}

fn is_canary(entry: &FlowEntry) -> bool {
    entry.priority == PriorityBand::Default.priority() && entry.flow_match.is_empty() && entry.is_drop()
}

impl AgingApp {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            owner: GenerationOwner::new(),
            slot: None,
            sweep: None,
            stats: AgingStats::default(),
        }
    }

    /// Handle the pipeline tags flows with.
    pub fn generation_handle(&self) -> GenerationHandle {
        self.owner.handle()
    }

    pub fn current(&self) -> Generation {
        self.owner.current()
    }

    pub fn stats(&self) -> &AgingStats {
        &self.stats
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True when the settle of the current session will sweep.
    pub fn sweep_pending(&self) -> bool {
        self.sweep.is_some()
    }

    fn write_canary(pipeline: &mut FlowPipeline) -> bool {
        match pipeline.try_install_flow(Table::Canary, PriorityBand::Default, Match::new(), Vec::new(), Cookie::ZERO) {
            Ok(()) => true,
            Err(e) => {
                warn!("AgingApp: failed to write canary: {}", e);
                false
            }
        }
    }

    fn begin_session(&mut self, pipeline: &mut FlowPipeline) {
        self.stats.sessions += 1;
        self.sweep = None;

        let canary = match pipeline.dump_table(Table::Canary) {
            Ok(flows) => flows.into_iter().find(is_canary),
            Err(e) => {
                warn!("AgingApp: canary dump failed, skipping aging this session: {}", e);
                audit_log!(AuditRecord::new(AuditCategory::FlowAging, "AgingApp", "read_canary")
                    .with_error(e.to_string()));
                Self::write_canary(pipeline);
                return;
            }
        };

        let Some(canary) = canary else {
            self.stats.first_contacts += 1;
            info!(
                "AgingApp: no canary, first contact; keeping {} and skipping aging",
                self.owner.current()
            );
            Self::write_canary(pipeline);
            audit_log!(AuditRecord::new(AuditCategory::FlowAging, "AgingApp", "first_contact")
                .with_object_id(self.owner.current().to_string())
                .with_object_type("generation")
                .with_outcome(AuditOutcome::Skipped));
            return;
        };

        let previous = pipeline.generation().generation_of(canary.cookie);
        let next = previous.complement();
        self.owner.set(next);
        if !Self::write_canary(pipeline) {
            self.owner.set(previous);
            audit_log!(AuditRecord::new(AuditCategory::FlowAging, "AgingApp", "flip_generation")
                .with_object_id(previous.to_string())
                .with_error("canary write failed"));
            return;
        }

        self.stats.flips += 1;
        self.sweep = Some(previous);
        info!("AgingApp: generation {} -> {}", previous, next);
        audit_log!(AuditRecord::new(AuditCategory::FlowAging, "AgingApp", "flip_generation")
            .with_object_id(next.to_string())
            .with_object_type("generation")
            .with_details(serde_json::json!({ "previous": previous.bit(), "current": next.bit() }))
            .with_outcome(AuditOutcome::Success));
    }

    fn finish_session(&mut self, pipeline: &mut FlowPipeline) {
        let Some(stale) = self.sweep.take() else {
            self.stats.skipped += 1;
            info!("AgingApp: session settled, no sweep this session");
            return;
        };

        let handle = pipeline.generation().clone();
        let tag = handle.tag_for(stale);
        match pipeline.try_remove_flows_by_cookie(None, tag, handle.mask()) {
            Ok(()) => {
                self.stats.sweeps += 1;
                info!("AgingApp: swept flows of {}", stale);
                audit_log!(AuditRecord::new(AuditCategory::FlowAging, "AgingApp", "sweep")
                    .with_object_id(stale.to_string())
                    .with_object_type("generation")
                    .with_outcome(AuditOutcome::Success));
            }
            Err(e) => {
                self.stats.sweep_failures += 1;
                warn!("AgingApp: sweep of {} failed, not retrying: {}", stale, e);
                audit_log!(AuditRecord::new(AuditCategory::FlowAging, "AgingApp", "sweep")
                    .with_object_id(stale.to_string())
                    .with_error(e.to_string()));
            }
        }
    }
}

const HANDLERS: &[HandlerEntry<AgingApp>] = &[];

impl App for AgingApp {
    fn name(&self) -> &'static str {
        "aging"
    }

    fn handlers() -> &'static [HandlerEntry<Self>] {
        HANDLERS
    }

    fn reserve_cookies(&mut self, registry: &mut CookieRegistry) -> Result<(), PipelineError> {
        if !self.enabled {
            return Ok(());
        }
        let slot = registry.reserve(AGING_COOKIE, 1)?;
        self.owner.bind(slot);
        self.slot = Some(slot);
        Ok(())
    }

    fn on_session_established(&mut self, ctx: &mut AppContext<'_>) {
        if self.slot.is_some() {
            self.begin_session(ctx.pipeline);
        }
    }

    fn on_session_settled(&mut self, ctx: &mut AppContext<'_>) {
        if self.slot.is_some() {
            self.finish_session(ctx.pipeline);
        }
    }
}
