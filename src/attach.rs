//! Network attach state machine
//!
//! Pure transition logic: the machine consumes link-layer events and
//! episode outcomes and answers with the single action the orchestrator
//! should take. It never touches the radio itself.

use std::net::IpAddr;

use log::{debug, info, warn};

pub const DEFAULT_MAX_RETRY: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachState {
    Unconfigured,
    /// Station attach in progress; the payload counts failed attempts so far
    Attaching(u8),
    LocalConfigMode,
    Connected,
    /// The provisioning episode closed without credentials
    Failed,
}

/// Events delivered by the link-layer collaborator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    AttachSucceeded(IpAddr),
    AttachFailed,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachAction {
    Idle,
    /// Try the station attach again with the stored credentials
    Reattempt,
    /// Start a provisioning episode; station attempts continue alongside it
    EnterLocalConfig,
    /// One diagnostic reachability check after attach
    Probe(IpAddr),
}

pub struct AttachMachine {
    state: AttachState,
    max_retry: u8,
    background_failures: u8,
}

impl AttachMachine {
    pub fn new(max_retry: u8) -> Self {
        Self {
            state: AttachState::Unconfigured,
            max_retry,
            background_failures: 0,
        }
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    pub fn max_retry(&self) -> u8 {
        self.max_retry
    }

    fn transition(&mut self, next: AttachState) {
        if self.state != next {
            debug!("attach: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    /// Entry point after power-on or restart.
    pub fn boot(&mut self, has_credentials: bool) -> AttachAction {
        if self.state != AttachState::Unconfigured {
            warn!("attach: boot ignored in state {:?}", self.state);
            return AttachAction::Idle;
        }

        self.background_failures = 0;
        if has_credentials {
            info!("attach: credentials found, attaching");
            self.transition(AttachState::Attaching(0));
            AttachAction::Reattempt
        } else {
            info!("attach: no credentials found, entering local configuration mode");
            self.transition(AttachState::LocalConfigMode);
            AttachAction::EnterLocalConfig
        }
    }

    pub fn on_link_event(&mut self, event: LinkEvent) -> AttachAction {
        match (self.state, event) {
            (AttachState::Unconfigured, _) => {
                debug!("attach: {:?} ignored while unconfigured", event);
                AttachAction::Idle
            }

            (_, LinkEvent::AttachSucceeded(address)) => {
                info!("attach: connected, address {}", address);
                self.background_failures = 0;
                self.transition(AttachState::Connected);
                AttachAction::Probe(address)
            }

            (AttachState::Attaching(failures), _) => {
                let failures = failures.saturating_add(1);
                if failures < self.max_retry {
                    info!(
                        "attach: router not found, retrying ({}/{})",
                        failures, self.max_retry
                    );
                    self.transition(AttachState::Attaching(failures));
                    AttachAction::Reattempt
                } else {
                    warn!(
                        "attach: retry budget exhausted after {} failures, starting local configuration",
                        failures
                    );
                    self.background_failures = 0;
                    self.transition(AttachState::LocalConfigMode);
                    AttachAction::EnterLocalConfig
                }
            }

            (AttachState::Connected, _) => {
                warn!("attach: link lost, reattaching");
                self.transition(AttachState::Attaching(0));
                AttachAction::Reattempt
            }

            (AttachState::LocalConfigMode | AttachState::Failed, _) => {
                self.background_failures = self.background_failures.saturating_add(1);
                if self.background_failures <= self.max_retry {
                    debug!(
                        "attach: background attach failed ({}/{})",
                        self.background_failures, self.max_retry
                    );
                    AttachAction::Reattempt
                } else {
                    debug!("attach: background attach gave up");
                    AttachAction::Idle
                }
            }
        }
    }

    /// A winning pair was persisted; the device restarts into attach.
    pub fn on_credentials_committed(&mut self) {
        info!("attach: credentials committed, awaiting restart");
        self.transition(AttachState::Unconfigured);
    }

    /// The episode ended without a committed pair.
    pub fn on_episode_failed(&mut self) {
        match self.state {
            AttachState::LocalConfigMode => self.transition(AttachState::Failed),
            other => debug!("attach: episode ended while {:?}", other),
        }
    }
}

impl Default for AttachMachine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRY)
    }
}
