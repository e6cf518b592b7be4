//! Provisioning episode
//!
//! One bounded stretch of local configuration mode. The episode value owns
//! the intake, the shutdown registry and the countdown; dropping it tears
//! everything down.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};

use crate::{
    config::Config,
    error::ProvisionError,
    intake::{CredentialIntake, WinningPair},
    link::LinkLayer,
    provisioner::ProvisionEvent,
    registry::{ShutdownAction, ShutdownRegistry},
    storage::{self, CredentialStore},
    timer::ProvisioningTimer,
};

/// An input channel that can be opened for the duration of an episode
pub trait IntakeChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Start accepting submissions into `intake`. The returned action must
    /// stop the channel and be safe to run more than once.
    fn open(self: Arc<Self>, intake: Arc<CredentialIntake>) -> anyhow::Result<ShutdownAction>;
}

pub trait Restarter: Send + Sync {
    fn restart(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpisodePhase {
    Live,
    /// Credentials persisted, restart scheduled
    Committed,
    /// Torn down without persisting, e.g. storage failed
    Aborted,
    /// Window elapsed without a complete pair
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpisodeSettings {
    pub window: Duration,
    pub restart_grace: Duration,
    pub registry_capacity: usize,
}

impl EpisodeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window: config.provisioning_window(),
            restart_grace: config.restart_grace(),
            registry_capacity: config.registry_capacity,
        }
    }
}

impl Default for EpisodeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Holds the process-wide "episode live" flag for as long as it exists
struct EpisodeGuard(Arc<AtomicBool>);

impl EpisodeGuard {
    fn acquire(live: &Arc<AtomicBool>) -> Option<Self> {
        live.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| EpisodeGuard(live.clone()))
    }
}

impl Drop for EpisodeGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ProvisioningEpisode {
    id: u64,
    phase: EpisodePhase,
    restart_grace: Duration,
    intake: Arc<CredentialIntake>,
    registry: Arc<ShutdownRegistry>,
    timer: ProvisioningTimer,
    forward: JoinHandle<()>,
    // Released last
    _guard: EpisodeGuard,
}

impl ProvisioningEpisode {
    /// Enter local configuration mode. Returns `None` when another episode is
    /// still live. Must be called from within a tokio runtime.
    pub fn start(
        id: u64,
        live: &Arc<AtomicBool>,
        settings: &EpisodeSettings,
        link: Arc<dyn LinkLayer>,
        channels: &[Arc<dyn IntakeChannel>],
        events: UnboundedSender<ProvisionEvent>,
    ) -> Option<Self> {
        let Some(guard) = EpisodeGuard::acquire(live) else {
            warn!("episode: already live, start ignored");
            return None;
        };
        info!("episode {}: starting local configuration mode", id);

        if let Err(e) = link.enable_local_mode() {
            error!("episode {}: failed to enable access point: {:#}", id, e);
        }

        let intake = Arc::new(CredentialIntake::new());
        let registry = Arc::new(ShutdownRegistry::new(settings.registry_capacity));

        for channel in channels {
            match channel.clone().open(intake.clone()) {
                Ok(action) => {
                    if let Err(e) = registry.register(action) {
                        warn!("episode {}: {}", id, e);
                    }
                }
                Err(e) => error!("episode {}: failed to open {}: {:#}", id, channel.name(), e),
            }
        }

        let radio = ShutdownAction::new("radio", move || link.disable_local_mode());
        if let Err(e) = registry.register(radio) {
            warn!("episode {}: {}", id, e);
        }

        let timer = ProvisioningTimer::new(registry.clone());
        let expired_intake = intake.clone();
        let expired_events = events.clone();
        // Nothing may win once channels start stopping
        let close_intake = move || expired_intake.close();
        let notify = move || {
            if expired_events
                .send(ProvisionEvent::EpisodeExpired { episode: id })
                .is_err()
            {
                debug!("episode {}: event queue closed before expiry", id);
            }
        };
        let armed = timer.arm(settings.window, close_intake, notify);
        if let Err(e) = armed {
            error!("episode {}: {}", id, e);
        }

        let winner = intake.subscribe();
        let forward = tokio::spawn(async move {
            if let Ok(pair) = winner.await {
                let _ = events.send(ProvisionEvent::CredentialsReceived { episode: id, pair });
            }
        });

        Some(Self {
            id,
            phase: EpisodePhase::Live,
            restart_grace: settings.restart_grace,
            intake,
            registry,
            timer,
            forward,
            _guard: guard,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> EpisodePhase {
        self.phase
    }

    pub fn intake(&self) -> &Arc<CredentialIntake> {
        &self.intake
    }

    pub fn registry(&self) -> &Arc<ShutdownRegistry> {
        &self.registry
    }

    /// Silence every channel, persist the pair and schedule the restart.
    ///
    /// A storage failure leaves the episode `Aborted` and no restart is
    /// scheduled.
    pub fn commit(
        &mut self,
        pair: WinningPair,
        store: &dyn CredentialStore,
        restarter: Arc<dyn Restarter>,
    ) -> Result<(), ProvisionError> {
        if self.phase != EpisodePhase::Live {
            warn!("episode {}: commit ignored in phase {:?}", self.id, self.phase);
            return Ok(());
        }

        self.timer.cancel();
        self.registry.trigger_all();
        self.intake.close();

        if let Err(e) = storage::save_credentials(store, &pair) {
            error!("episode {}: {}", self.id, e);
            self.phase = EpisodePhase::Aborted;
            return Err(e);
        }
        self.phase = EpisodePhase::Committed;

        let grace = self.restart_grace;
        info!(
            "episode {}: credentials for `{}` saved, restarting in {}ms",
            self.id,
            pair.ssid,
            grace.as_millis()
        );
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            restarter.restart();
        });
        Ok(())
    }

    /// The window elapsed with no complete pair. Callers commit
    /// [`CredentialIntake::winner`] instead when one was declared.
    pub fn expire(&mut self) {
        if self.phase != EpisodePhase::Live {
            debug!("episode {}: expiry ignored in phase {:?}", self.id, self.phase);
            return;
        }
        // The timer has already swept the registry; both calls are no-ops then
        self.registry.trigger_all();
        self.intake.close();
        self.phase = EpisodePhase::Failed;
        warn!("episode {}: timeout reached, local configuration mode closed", self.id);
    }
}

impl Drop for ProvisioningEpisode {
    fn drop(&mut self) {
        self.forward.abort();
        self.timer.cancel();
        self.registry.trigger_all();
        self.intake.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use common::{ChannelId, CredentialField, Credentials};
    use std::sync::{atomic::AtomicUsize, Mutex};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    #[derive(Default)]
    struct FakeLink {
        calls: Mutex<Vec<&'static str>>,
    }

    impl LinkLayer for FakeLink {
        fn begin_attach(&self, _: &Credentials) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("attach");
            Ok(())
        }

        fn enable_local_mode(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("enable");
            Ok(())
        }

        fn disable_local_mode(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("disable");
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeChannel {
        opens: AtomicUsize,
        stops: Arc<AtomicUsize>,
    }

    impl IntakeChannel for FakeChannel {
        fn name(&self) -> &str {
            "fake"
        }

        fn open(self: Arc<Self>, _: Arc<CredentialIntake>) -> anyhow::Result<ShutdownAction> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let stops = self.stops.clone();
            Ok(ShutdownAction::new("fake", move || {
                stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
        }
    }

    #[derive(Default)]
    struct CountingRestarter(AtomicUsize);

    impl Restarter for CountingRestarter {
        fn restart(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        live: Arc<AtomicBool>,
        link: Arc<FakeLink>,
        channel: Arc<FakeChannel>,
        events: UnboundedReceiver<ProvisionEvent>,
        episode: ProvisioningEpisode,
    }

    fn start() -> Harness {
        start_with(&EpisodeSettings::default())
    }

    fn start_with(settings: &EpisodeSettings) -> Harness {
        let live = Arc::new(AtomicBool::new(false));
        let link = Arc::new(FakeLink::default());
        let channel = Arc::new(FakeChannel::default());
        let (tx, events) = mpsc::unbounded_channel();
        let channels: Vec<Arc<dyn IntakeChannel>> = vec![channel.clone()];
        let episode = ProvisioningEpisode::start(
            7,
            &live,
            settings,
            link.clone(),
            &channels,
            tx,
        )
        .unwrap();
        Harness {
            live,
            link,
            channel,
            events,
            episode,
        }
    }

    fn complete_pair(intake: &CredentialIntake) {
        intake
            .submit(ChannelId::Wireless, CredentialField::Ssid, b"HomeNet")
            .unwrap();
        intake
            .submit(ChannelId::Wireless, CredentialField::Passphrase, b"secret123")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_opens_everything() {
        let h = start();
        assert_eq!(h.episode.phase(), EpisodePhase::Live);
        assert_eq!(h.channel.opens.load(Ordering::SeqCst), 1);
        assert_eq!(*h.link.calls.lock().unwrap(), vec!["enable"]);
        // One channel plus the radio
        assert_eq!(h.episode.registry().len(), 2);
        assert!(h.live.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_registry_still_starts() {
        let settings = EpisodeSettings {
            registry_capacity: 1,
            ..EpisodeSettings::default()
        };
        let mut h = start_with(&settings);

        assert_eq!(h.episode.phase(), EpisodePhase::Live);
        assert_eq!(h.channel.opens.load(Ordering::SeqCst), 1);
        // The radio did not fit
        assert_eq!(h.episode.registry().len(), 1);

        complete_pair(h.episode.intake());
        assert!(matches!(
            h.events.recv().await,
            Some(ProvisionEvent::CredentialsReceived { episode: 7, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_noop() {
        let h = start();
        let (tx, _rx) = mpsc::unbounded_channel();
        let second = ProvisioningEpisode::start(
            8,
            &h.live,
            &EpisodeSettings::default(),
            h.link.clone(),
            &[],
            tx,
        );
        assert!(second.is_none());
        assert_eq!(*h.link.calls.lock().unwrap(), vec!["enable"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_winner_is_forwarded_and_committed() {
        let mut h = start();
        complete_pair(h.episode.intake());

        let pair = match h.events.recv().await {
            Some(ProvisionEvent::CredentialsReceived { episode: 7, pair }) => pair,
            other => panic!("unexpected event {:?}", other),
        };

        let store = MemoryStore::new();
        let restarter = Arc::new(CountingRestarter::default());
        h.episode.commit(pair, &store, restarter.clone()).unwrap();

        assert_eq!(h.episode.phase(), EpisodePhase::Committed);
        assert_eq!(h.channel.stops.load(Ordering::SeqCst), 1);
        assert_eq!(*h.link.calls.lock().unwrap(), vec!["enable", "disable"]);
        assert_eq!(store.committed("wifi_ssid").as_deref(), Some("HomeNet"));

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(restarter.0.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(restarter.0.load(Ordering::SeqCst), 1);

        // The countdown was cancelled, nothing expires later
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_survives_episode_drop() {
        let h = start();
        let Harness { mut episode, .. } = h;
        let store = MemoryStore::new();
        let restarter = Arc::new(CountingRestarter::default());
        episode
            .commit(Credentials::new("HomeNet", "secret123"), &store, restarter.clone())
            .unwrap();
        drop(episode);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(restarter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_aborts_without_restart() {
        let mut h = start();
        let store = MemoryStore::new();
        store.fail_commit(true);
        let restarter = Arc::new(CountingRestarter::default());

        let result = h
            .episode
            .commit(Credentials::new("HomeNet", "secret123"), &store, restarter.clone());
        assert!(matches!(result, Err(ProvisionError::PersistenceFailure(_))));
        assert_eq!(h.episode.phase(), EpisodePhase::Aborted);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(restarter.0.load(Ordering::SeqCst), 0);
        // Channels were still silenced
        assert_eq!(h.channel.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_elapses() {
        let mut h = start();
        h.episode
            .intake()
            .submit(ChannelId::Http, CredentialField::Ssid, b"HomeNet")
            .unwrap();

        tokio::time::sleep(Duration::from_secs(301)).await;
        match h.events.recv().await {
            Some(ProvisionEvent::EpisodeExpired { episode: 7 }) => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert!(h.episode.intake().is_closed());
        assert_eq!(h.channel.stops.load(Ordering::SeqCst), 1);

        h.episode.expire();
        assert_eq!(h.episode.phase(), EpisodePhase::Failed);
        assert_eq!(h.channel.stops.load(Ordering::SeqCst), 1);
        assert_eq!(*h.link.calls.lock().unwrap(), vec!["enable", "disable"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_guard_and_silences_channels() {
        let h = start();
        let live = h.live.clone();
        let stops = h.channel.stops.clone();
        drop(h);
        assert!(!live.load(Ordering::SeqCst));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
