//! Southbound session to one switch.

use dflow_ofproto::{FlowEntry, FlowMod, OfError, OfResult, SwitchChannel, TableSelector};
use log::{debug, info, warn};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Down,
    /// Connected; modules are replaying
    Established { epoch: u64 },
    /// Replay finished and the settle delay elapsed
    Settled { epoch: u64 },
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Down => write!(f, "down"),
            SessionState::Established { epoch } => write!(f, "established(epoch={})", epoch),
            SessionState::Settled { epoch } => write!(f, "settled(epoch={})", epoch),
        }
    }
}

/// Owns the channel and numbers each connection with an epoch so that late
/// settle notifications from an earlier connection can be told apart.
pub struct SwitchSession {
    channel: Box<dyn SwitchChannel>,
    state: SessionState,
    epoch: u64,
}

impl SwitchSession {
    pub fn new(channel: Box<dyn SwitchChannel>) -> Self {
        Self {
            channel,
            state: SessionState::Down,
            epoch: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_established(&self) -> bool {
        !matches!(self.state, SessionState::Down)
    }

    /// Starts a new epoch. Re-establishing an up session also starts one.
    pub fn establish(&mut self) -> u64 {
        self.epoch += 1;
        self.state = SessionState::Established { epoch: self.epoch };
        info!("SwitchSession: established, epoch {}", self.epoch);
        self.epoch
    }

    pub fn lose(&mut self) {
        if self.is_established() {
            warn!("SwitchSession: lost in epoch {}", self.epoch);
        }
        self.state = SessionState::Down;
    }

    /// Marks `epoch` settled. False if that epoch is no longer current.
    pub fn settle(&mut self, epoch: u64) -> bool {
        match self.state {
            SessionState::Established { epoch: current } if current == epoch => {
                self.state = SessionState::Settled { epoch };
                true
            }
            state => {
                debug!("SwitchSession: ignoring settle for epoch {} in state {}", epoch, state);
                false
            }
        }
    }

    pub fn send(&mut self, flow_mod: &FlowMod) -> OfResult<()> {
        if !self.is_established() {
            return Err(OfError::Disconnected);
        }
        self.channel.send_flow_mod(flow_mod)
    }

    pub fn dump(&mut self, selector: TableSelector) -> OfResult<Vec<FlowEntry>> {
        if !self.is_established() {
            return Err(OfError::Disconnected);
        }
        self.channel.dump_flows(selector)
    }
}

impl fmt::Debug for SwitchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchSession")
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .finish()
    }
}
