use common::{ChannelId, CredentialField};
use thiserror::Error;

/// Why a candidate credential value was refused
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidValue {
    #[error("value is empty")]
    Empty,
    #[error("value is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("value is not valid UTF-8")]
    NotUtf8,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Malformed, empty or oversized field. Channel-local, nothing was mutated.
    #[error("invalid {field} from {channel} channel: {reason}")]
    InvalidCredentialValue {
        channel: ChannelId,
        field: CredentialField,
        reason: InvalidValue,
    },

    /// Too many shutdown registrations. The action is not torn down.
    #[error("shutdown registry is full ({capacity} actions), `{name}` was not registered")]
    CapacityExceeded { capacity: usize, name: String },

    /// Registration arrived after the registry was already swept.
    #[error("shutdown registry already triggered, `{name}` was not registered")]
    RegistryClosed { name: String },

    #[error("provisioning timer is already armed")]
    AlreadyArmed,

    /// Storage set or commit failed; the device retries on next boot.
    #[error("failed to persist credentials: {0:#}")]
    PersistenceFailure(anyhow::Error),
}

impl ProvisionError {
    pub fn invalid(channel: ChannelId, field: CredentialField, reason: InvalidValue) -> Self {
        ProvisionError::InvalidCredentialValue {
            channel,
            field,
            reason,
        }
    }
}
