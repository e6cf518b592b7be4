//! Orchestrator event loop
//!
//! Link outcomes, winner declarations and timer expiry all arrive as
//! [`ProvisionEvent`]s on one queue and are handled in arrival order.

use std::sync::{atomic::AtomicBool, Arc};

use common::Credentials;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    attach::{AttachAction, AttachMachine, AttachState, LinkEvent},
    config::Config,
    episode::{EpisodePhase, EpisodeSettings, IntakeChannel, ProvisioningEpisode, Restarter},
    intake::WinningPair,
    link::LinkLayer,
    probe,
    storage::{self, CredentialStore},
};

#[derive(Debug)]
pub enum ProvisionEvent {
    Link(LinkEvent),
    CredentialsReceived { episode: u64, pair: WinningPair },
    EpisodeExpired { episode: u64 },
}

/// Everything the orchestrator talks to outside its own state
pub struct Collaborators {
    pub store: Arc<dyn CredentialStore>,
    pub link: Arc<dyn LinkLayer>,
    pub channels: Vec<Arc<dyn IntakeChannel>>,
    pub restarter: Arc<dyn Restarter>,
}

pub struct Provisioner {
    machine: AttachMachine,
    settings: EpisodeSettings,
    probe_host: String,
    shares_radio: bool,
    deps: Collaborators,
    events: UnboundedSender<ProvisionEvent>,
    live: Arc<AtomicBool>,
    episode: Option<ProvisioningEpisode>,
    next_episode: u64,
    last_phase: Option<EpisodePhase>,
    credentials: Option<Credentials>,
}

impl Provisioner {
    /// `events` must feed the receiver later passed to [`Provisioner::run`].
    pub fn new(
        config: &Config,
        deps: Collaborators,
        events: UnboundedSender<ProvisionEvent>,
    ) -> Self {
        Self {
            machine: AttachMachine::new(config.max_retry),
            settings: EpisodeSettings::from_config(config),
            probe_host: config.probe_host.clone(),
            shares_radio: config.link.shares_radio(),
            deps,
            events,
            live: Arc::new(AtomicBool::new(false)),
            episode: None,
            next_episode: 0,
            last_phase: None,
            credentials: None,
        }
    }

    pub fn state(&self) -> AttachState {
        self.machine.state()
    }

    /// Phase of the live episode, or of the last one to end
    pub fn episode_phase(&self) -> Option<EpisodePhase> {
        self.episode
            .as_ref()
            .map(ProvisioningEpisode::phase)
            .or(self.last_phase)
    }

    pub fn episode(&self) -> Option<&ProvisioningEpisode> {
        self.episode.as_ref()
    }

    /// Check storage, then attach or open local configuration.
    pub fn boot(&mut self) {
        self.credentials = storage::load_credentials(self.deps.store.as_ref());
        let action = self.machine.boot(self.credentials.is_some());
        self.apply(action);
    }

    pub fn handle(&mut self, event: ProvisionEvent) {
        match event {
            ProvisionEvent::Link(event) => {
                let action = self.machine.on_link_event(event);
                self.apply(action);
            }
            ProvisionEvent::CredentialsReceived { episode, pair } => {
                self.on_credentials(episode, pair)
            }
            ProvisionEvent::EpisodeExpired { episode } => self.on_expired(episode),
        }
    }

    pub async fn run(mut self, mut events: UnboundedReceiver<ProvisionEvent>) {
        self.boot();
        while let Some(event) = events.recv().await {
            debug!("provisioner: {:?}", event);
            self.handle(event);
        }
        info!("provisioner: event queue closed");
    }

    fn apply(&mut self, action: AttachAction) {
        match action {
            AttachAction::Idle => {}
            AttachAction::Reattempt => self.begin_attach(),
            AttachAction::EnterLocalConfig => {
                self.start_episode();
                if self.credentials.is_some() {
                    self.begin_attach();
                }
            }
            AttachAction::Probe(address) => {
                debug!("provisioner: probing uplink from {}", address);
                let host = self.probe_host.clone();
                tokio::spawn(async move {
                    probe::probe_reachability(&host).await;
                });
            }
        }
    }

    fn begin_attach(&self) {
        let Some(credentials) = &self.credentials else {
            debug!("provisioner: no stored credentials to attach with");
            return;
        };
        // A station connect on the access point's interface would replace it
        if self.shares_radio && self.episode.is_some() {
            debug!("provisioner: access point holds the radio, attach deferred");
            return;
        }
        if let Err(e) = self.deps.link.begin_attach(credentials) {
            warn!("provisioner: attach could not start: {:#}", e);
            let _ = self.events.send(ProvisionEvent::Link(LinkEvent::AttachFailed));
        }
    }

    fn start_episode(&mut self) {
        let id = self.next_episode;
        let episode = ProvisioningEpisode::start(
            id,
            &self.live,
            &self.settings,
            self.deps.link.clone(),
            &self.deps.channels,
            self.events.clone(),
        );
        if let Some(episode) = episode {
            self.next_episode += 1;
            self.last_phase = None;
            self.episode = Some(episode);
        }
    }

    /// Take the episode `id` if it is the live one.
    fn current_episode(&mut self, id: u64) -> Option<ProvisioningEpisode> {
        let live = self
            .episode
            .as_ref()
            .is_some_and(|e| e.id() == id && e.phase() == EpisodePhase::Live);
        if !live {
            debug!("provisioner: stale event for episode {}", id);
            return None;
        }
        self.episode.take()
    }

    fn on_credentials(&mut self, id: u64, pair: WinningPair) {
        let Some(episode) = self.current_episode(id) else {
            return;
        };
        self.commit(episode, pair);
    }

    fn on_expired(&mut self, id: u64) {
        let Some(mut episode) = self.current_episode(id) else {
            return;
        };

        // A pair completed before the intake closed still wins
        if let Some(pair) = episode.intake().winner() {
            info!("provisioner: episode {} expired with a winner declared", id);
            self.commit(episode, pair);
            return;
        }

        episode.expire();
        self.machine.on_episode_failed();
        self.last_phase = Some(episode.phase());
    }

    fn commit(&mut self, mut episode: ProvisioningEpisode, pair: WinningPair) {
        match episode.commit(pair, self.deps.store.as_ref(), self.deps.restarter.clone()) {
            Ok(()) => self.machine.on_credentials_committed(),
            Err(e) => {
                error!("provisioner: {}, device will not restart", e);
                self.machine.on_episode_failed();
            }
        }
        self.last_phase = Some(episode.phase());
    }
}
