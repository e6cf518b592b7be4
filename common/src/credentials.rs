use alloc::string::String;
use core::fmt;
use serde::{Deserialize, Serialize};

// Field limits match the 32/64 byte radio config buffers, one byte of which
// is reserved for the terminator.
pub const SSID_MAX_LEN: usize = 31;
pub const PASSPHRASE_MAX_LEN: usize = 63;

// Storage keys for the committed pair
pub const SSID_KEY: &str = "wifi_ssid";
pub const PASSPHRASE_KEY: &str = "wifi_pass";

/// Primary GATT service carrying the two credential characteristics:
/// 19f65d8d-1dbc-c4ad-7349-755320a1712d
pub const PROVISIONING_SERVICE_UUID: u128 = 0x19f6_5d8d_1dbc_c4ad_7349_7553_20a1_712d;
pub const SSID_CHARACTERISTIC_UUID: u16 = 0xFF01;
pub const PASSPHRASE_CHARACTERISTIC_UUID: u16 = 0xFF02;

/// One of the two halves of a credential pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialField {
    Ssid,
    Passphrase,
}

impl CredentialField {
    pub const fn max_len(self) -> usize {
        match self {
            Self::Ssid => SSID_MAX_LEN,
            Self::Passphrase => PASSPHRASE_MAX_LEN,
        }
    }

    pub const fn storage_key(self) -> &'static str {
        match self {
            Self::Ssid => SSID_KEY,
            Self::Passphrase => PASSPHRASE_KEY,
        }
    }

    pub const fn characteristic_uuid(self) -> u16 {
        match self {
            Self::Ssid => SSID_CHARACTERISTIC_UUID,
            Self::Passphrase => PASSPHRASE_CHARACTERISTIC_UUID,
        }
    }

    pub const fn from_characteristic_uuid(uuid: u16) -> Option<Self> {
        match uuid {
            SSID_CHARACTERISTIC_UUID => Some(Self::Ssid),
            PASSPHRASE_CHARACTERISTIC_UUID => Some(Self::Passphrase),
            _ => None,
        }
    }
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssid => write!(f, "ssid"),
            Self::Passphrase => write!(f, "passphrase"),
        }
    }
}

/// Input channels that can race to deliver credentials
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelId {
    /// Short-range wireless characteristic writes
    Wireless,
    /// Local HTTP configuration form
    Http,
}

impl ChannelId {
    pub const ALL: [ChannelId; 2] = [ChannelId::Wireless, ChannelId::Http];

    pub const fn index(self) -> usize {
        match self {
            Self::Wireless => 0,
            Self::Http => 1,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wireless => write!(f, "wireless"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// A complete network credential pair
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn new(ssid: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            passphrase: passphrase.into(),
        }
    }

    pub fn get(&self, field: CredentialField) -> &str {
        match field {
            CredentialField::Ssid => &self.ssid,
            CredentialField::Passphrase => &self.passphrase,
        }
    }
}

// Passphrases stay out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("passphrase", &format_args!("<{} bytes>", self.passphrase.len()))
            .finish()
    }
}
