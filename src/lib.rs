use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod attach;
pub mod ble;
pub mod config;
pub mod episode;
pub mod error;
pub mod intake;
pub mod link;
pub mod logging;
pub mod portal;
pub mod probe;
pub mod provisioner;
pub mod registry;
pub mod storage;
pub mod timer;

pub mod prelude {
    pub use crate::{
        attach::{AttachAction, AttachMachine, AttachState, LinkEvent},
        config::Config,
        episode::{EpisodePhase, EpisodeSettings, IntakeChannel, ProvisioningEpisode, Restarter},
        error::{InvalidValue, ProvisionError},
        intake::{CredentialIntake, SubmitOutcome, WinningPair},
        provisioner::{Collaborators, ProvisionEvent, Provisioner},
        registry::{ShutdownAction, ShutdownRegistry},
        timer::{ProvisioningTimer, TimerState},
    };
    pub use common::{ChannelId, CredentialField, Credentials};
}

/// Shared state here is only ever plain data, so a panic while holding the
/// lock cannot leave it half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
