//! Short-range wireless intake channel
//!
//! A GATT service with two write-only characteristics, one per credential
//! field. The platform GATT server forwards raw writes to
//! [`WirelessChannel::on_write`] and answers the peer with the returned
//! ATT status.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use common::{ChannelId, CredentialField};
use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    episode::IntakeChannel,
    error::{InvalidValue, ProvisionError},
    intake::{CredentialIntake, SubmitOutcome},
    lock,
    registry::ShutdownAction,
};

pub mod advert;

pub const DEFAULT_DEVICE_NAME: &str = "ESP_BLE_VISION";

/// Radio side of the channel, implemented by the platform BLE stack
pub trait Advertiser: Send + Sync {
    fn start_advertising(&self, advert: &[u8], scan_response: &[u8]) -> anyhow::Result<()>;
    fn stop_advertising(&self) -> anyhow::Result<()>;
}

/// ATT error returned to the writing peer
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AttError {
    #[error("write not permitted")]
    WriteNotPermitted,
    #[error("invalid attribute value length")]
    InvalidAttributeValueLength,
    #[error("unlikely error")]
    Unlikely,
}

impl AttError {
    pub const fn code(self) -> u8 {
        match self {
            AttError::WriteNotPermitted => 0x03,
            AttError::InvalidAttributeValueLength => 0x0D,
            AttError::Unlikely => 0x0E,
        }
    }
}

pub struct WirelessChannel {
    device_name: String,
    advertiser: Arc<dyn Advertiser>,
    intake: Mutex<Option<Arc<CredentialIntake>>>,
    advertising: AtomicBool,
}

impl WirelessChannel {
    pub fn new(device_name: impl Into<String>, advertiser: Arc<dyn Advertiser>) -> Self {
        Self {
            device_name: device_name.into(),
            advertiser,
            intake: Mutex::new(None),
            advertising: AtomicBool::new(false),
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    /// Handle one characteristic write from a connected peer.
    pub fn on_write(&self, characteristic: u16, data: &[u8]) -> Result<SubmitOutcome, AttError> {
        let Some(field) = CredentialField::from_characteristic_uuid(characteristic) else {
            warn!("ble: write to unknown characteristic {:#06x}", characteristic);
            return Err(AttError::WriteNotPermitted);
        };

        // Clone out so a concurrent stop never waits on a submission
        let Some(intake) = lock(&self.intake).clone() else {
            debug!("ble: {} write after channel stopped", field);
            return Ok(SubmitOutcome::Closed);
        };

        match intake.submit(ChannelId::Wireless, field, data) {
            Ok(outcome) => Ok(outcome),
            Err(ProvisionError::InvalidCredentialValue { reason, .. }) => Err(match reason {
                InvalidValue::Empty | InvalidValue::TooLong { .. } => {
                    AttError::InvalidAttributeValueLength
                }
                InvalidValue::NotUtf8 => AttError::Unlikely,
            }),
            Err(e) => {
                warn!("ble: unexpected intake error: {}", e);
                Err(AttError::Unlikely)
            }
        }
    }

    /// Stop advertising and detach from the intake. Safe to call repeatedly.
    pub fn stop(&self) -> anyhow::Result<()> {
        lock(&self.intake).take();
        if !self.advertising.swap(false, Ordering::SeqCst) {
            debug!("ble: already stopped");
            return Ok(());
        }
        self.advertiser.stop_advertising()?;
        info!("ble: advertising stopped");
        Ok(())
    }
}

impl IntakeChannel for WirelessChannel {
    fn name(&self) -> &str {
        "ble"
    }

    fn open(self: Arc<Self>, intake: Arc<CredentialIntake>) -> anyhow::Result<ShutdownAction> {
        let advert = advert::advertising_payload(&self.device_name)
            .map_err(|e| anyhow::anyhow!("packing advertising flags: {:?}", e))?;
        let scan_response = advert::scan_response_payload();

        *lock(&self.intake) = Some(intake);
        if let Err(e) = self.advertiser.start_advertising(&advert, &scan_response) {
            lock(&self.intake).take();
            return Err(e);
        }
        self.advertising.store(true, Ordering::SeqCst);
        info!("ble: advertising as `{}`", self.device_name);

        let channel = self.clone();
        Ok(ShutdownAction::new("ble", move || channel.stop()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{PASSPHRASE_CHARACTERISTIC_UUID, SSID_CHARACTERISTIC_UUID};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeAdvertiser {
        starts: AtomicUsize,
        stops: AtomicUsize,
        last_advert: Mutex<Vec<u8>>,
    }

    impl Advertiser for FakeAdvertiser {
        fn start_advertising(&self, advert: &[u8], _scan_response: &[u8]) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.last_advert.lock().unwrap() = advert.to_vec();
            Ok(())
        }

        fn stop_advertising(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    type Opened = (
        Arc<WirelessChannel>,
        Arc<FakeAdvertiser>,
        Arc<CredentialIntake>,
        ShutdownAction,
    );

    fn open_channel() -> Opened {
        let advertiser = Arc::new(FakeAdvertiser::default());
        let channel = Arc::new(WirelessChannel::new(DEFAULT_DEVICE_NAME, advertiser.clone()));
        let intake = Arc::new(CredentialIntake::new());
        let action = channel.clone().open(intake.clone()).unwrap();
        (channel, advertiser, intake, action)
    }

    #[test]
    fn test_att_codes() {
        assert_eq!(AttError::WriteNotPermitted.code(), 0x03);
        assert_eq!(AttError::InvalidAttributeValueLength.code(), 0x0D);
        assert_eq!(AttError::Unlikely.code(), 0x0E);
    }

    #[test]
    fn test_open_advertises() {
        let (channel, advertiser, _, action) = open_channel();
        assert!(channel.is_advertising());
        assert_eq!(advertiser.starts.load(Ordering::SeqCst), 1);
        assert_eq!(action.name(), "ble");
        assert!(advertiser.last_advert.lock().unwrap().ends_with(b"ESP_BLE_VISION"));
    }

    #[test]
    fn test_writes_complete_a_pair() {
        let (channel, _, intake, _) = open_channel();

        assert_eq!(
            channel.on_write(SSID_CHARACTERISTIC_UUID, b"HomeNet"),
            Ok(SubmitOutcome::Pending)
        );
        assert_eq!(
            channel.on_write(PASSPHRASE_CHARACTERISTIC_UUID, b""),
            Err(AttError::InvalidAttributeValueLength)
        );
        match channel.on_write(PASSPHRASE_CHARACTERISTIC_UUID, b"secret123") {
            Ok(SubmitOutcome::Winner(pair)) => {
                assert_eq!(pair.ssid, "HomeNet");
                assert_eq!(pair.passphrase, "secret123");
            }
            other => panic!("expected winner, got {:?}", other),
        }
        assert!(intake.is_winner_declared());
    }

    #[test]
    fn test_write_errors() {
        let (channel, _, _, _) = open_channel();
        assert_eq!(
            channel.on_write(0xFF03, b"HomeNet"),
            Err(AttError::WriteNotPermitted)
        );
        assert_eq!(
            channel.on_write(SSID_CHARACTERISTIC_UUID, &[b'a'; 32]),
            Err(AttError::InvalidAttributeValueLength)
        );
        assert_eq!(
            channel.on_write(SSID_CHARACTERISTIC_UUID, &[0xff, 0xfe]),
            Err(AttError::Unlikely)
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (channel, advertiser, _, action) = open_channel();
        channel.stop().unwrap();
        channel.stop().unwrap();
        assert_eq!(advertiser.stops.load(Ordering::SeqCst), 1);
        assert!(!channel.is_advertising());

        drop(action);
        assert_eq!(
            channel.on_write(SSID_CHARACTERISTIC_UUID, b"HomeNet"),
            Ok(SubmitOutcome::Closed)
        );
    }
}
