//! Radio link layer collaborator
//!
//! Outcomes of `begin_attach` are reported asynchronously as
//! [`LinkEvent`](crate::attach::LinkEvent)s on the orchestrator's event queue.

use common::Credentials;

mod nmcli;

pub use nmcli::NmcliLink;

pub trait LinkLayer: Send + Sync {
    /// Start a station attach. Must not block; the outcome arrives as an event.
    fn begin_attach(&self, credentials: &Credentials) -> anyhow::Result<()>;

    /// Bring up the local access point. Must not block.
    fn enable_local_mode(&self) -> anyhow::Result<()>;

    /// Tear down the local access point. Must not block, and is safe to call
    /// when it is already down.
    fn disable_local_mode(&self) -> anyhow::Result<()>;
}
