//! Credential intake
//!
//! Both input channels write candidate fields here independently. Each channel
//! owns its own slot so halves from different channels never combine; the
//! first slot to hold both halves wins, and the winner flag lives under the
//! same lock as the slots so only one caller can ever see it flip.

use std::sync::Mutex;

use common::{ChannelId, CredentialField, Credentials};
use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::{
    error::{InvalidValue, ProvisionError},
    lock,
};

/// The first complete pair, handed to exactly one caller
pub type WinningPair = Credentials;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Field stored, the pair is not complete yet
    Pending,
    /// This submission completed the first pair
    Winner(WinningPair),
    /// Another submission already won, nothing was stored
    AlreadyDeclared,
    /// The episode was torn down, nothing was stored
    Closed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CredentialSlot {
    ssid: Option<String>,
    passphrase: Option<String>,
}

impl CredentialSlot {
    fn set(&mut self, field: CredentialField, value: String) {
        match field {
            CredentialField::Ssid => self.ssid = Some(value),
            CredentialField::Passphrase => self.passphrase = Some(value),
        }
    }

    fn pair(&self) -> Option<WinningPair> {
        match (&self.ssid, &self.passphrase) {
            (Some(ssid), Some(passphrase)) => Some(Credentials::new(ssid, passphrase)),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.ssid.is_none() && self.passphrase.is_none()
    }
}

#[derive(Default)]
struct IntakeState {
    slots: [CredentialSlot; 2],
    winner: Option<WinningPair>,
    closed: bool,
    subscriber: Option<oneshot::Sender<WinningPair>>,
}

#[derive(Default)]
pub struct CredentialIntake {
    state: Mutex<IntakeState>,
}

/// Check a decoded candidate value against its field's limits.
pub fn validate(
    channel: ChannelId,
    field: CredentialField,
    value: &[u8],
) -> Result<String, ProvisionError> {
    if value.is_empty() {
        return Err(ProvisionError::invalid(channel, field, InvalidValue::Empty));
    }
    if value.len() > field.max_len() {
        return Err(ProvisionError::invalid(
            channel,
            field,
            InvalidValue::TooLong {
                len: value.len(),
                max: field.max_len(),
            },
        ));
    }
    String::from_utf8(value.to_vec())
        .map_err(|_| ProvisionError::invalid(channel, field, InvalidValue::NotUtf8))
}

impl CredentialIntake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive the winning pair once it is declared. A later subscription
    /// replaces an earlier one.
    pub fn subscribe(&self) -> oneshot::Receiver<WinningPair> {
        let (tx, rx) = oneshot::channel();
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if let Some(winner) = &state.winner {
            let _ = tx.send(winner.clone());
        } else if !state.closed {
            state.subscriber = Some(tx);
        }
        rx
    }

    pub fn submit(
        &self,
        channel: ChannelId,
        field: CredentialField,
        value: &[u8],
    ) -> Result<SubmitOutcome, ProvisionError> {
        // Decoding and validation stay outside the critical section
        let value = match validate(channel, field, value) {
            Ok(value) => value,
            Err(e) => {
                warn!("intake: rejected {}", e);
                return Err(e);
            }
        };

        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.closed {
            debug!("intake: {} {} arrived after close", channel, field);
            return Ok(SubmitOutcome::Closed);
        }
        if state.winner.is_some() {
            info!("intake: {} {} ignored, winner already declared", channel, field);
            return Ok(SubmitOutcome::AlreadyDeclared);
        }

        match field {
            CredentialField::Ssid => info!("intake: received ssid `{}` via {}", value, channel),
            CredentialField::Passphrase => info!(
                "intake: received passphrase ({} bytes) via {}",
                value.len(),
                channel
            ),
        }

        let slot = &mut state.slots[channel.index()];
        slot.set(field, value);

        let Some(pair) = slot.pair() else {
            return Ok(SubmitOutcome::Pending);
        };

        info!("intake: {} channel completed the first pair", channel);
        state.winner = Some(pair.clone());
        if let Some(subscriber) = state.subscriber.take() {
            let _ = subscriber.send(pair.clone());
        }
        Ok(SubmitOutcome::Winner(pair))
    }

    pub fn is_winner_declared(&self) -> bool {
        lock(&self.state).winner.is_some()
    }

    /// The declared pair. Still readable after `close`.
    pub fn winner(&self) -> Option<WinningPair> {
        lock(&self.state).winner.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Discard partial pairs and refuse any further submissions.
    pub fn close(&self) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.closed {
            return;
        }
        state.closed = true;
        for channel in ChannelId::ALL {
            let slot = &mut state.slots[channel.index()];
            if !slot.is_empty() && state.winner.is_none() {
                info!("intake: discarding partial pair from {}", channel);
            }
            *slot = CredentialSlot::default();
        }
        state.subscriber = None;
    }
}
