use std::{
    net::{IpAddr, Ipv4Addr},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{bail, Context};
use common::Credentials;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::LinkLayer;
use crate::{
    attach::LinkEvent,
    config::{AccessPointConfig, LinkConfig},
    provisioner::ProvisionEvent,
};

const HOTSPOT_CONNECTION: &str = "provisioner-ap";
const CONNECT_WAIT_SECS: &str = "30";
const AP_ADDRESS: &str = "10.42.0.1/24";
const DHCP_POOL_START: u8 = 10;

#[derive(Clone, Copy, Debug)]
enum RadioCommand {
    Up,
    Down,
}

/// NetworkManager backed link layer, driven through the `nmcli` CLI.
///
/// Access point changes are queued to one worker task so they apply in order
/// and never block the caller.
pub struct NmcliLink {
    interface: String,
    events: UnboundedSender<ProvisionEvent>,
    radio: UnboundedSender<RadioCommand>,
    local_mode: AtomicBool,
}

impl NmcliLink {
    /// Must be called from within a tokio runtime.
    pub fn new(
        link: &LinkConfig,
        access_point: &AccessPointConfig,
        events: UnboundedSender<ProvisionEvent>,
    ) -> Self {
        let (radio, commands) = mpsc::unbounded_channel();
        tokio::spawn(radio_worker(
            commands,
            link.ap_interface.clone(),
            access_point.clone(),
        ));

        Self {
            interface: link.interface.clone(),
            events,
            radio,
            local_mode: AtomicBool::new(false),
        }
    }

    fn queue(&self, command: RadioCommand) -> anyhow::Result<()> {
        self.radio
            .send(command)
            .map_err(|_| anyhow::anyhow!("access point worker has stopped"))
    }
}

pub(crate) fn connect_args(interface: &str, credentials: &Credentials) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--wait".into(),
        CONNECT_WAIT_SECS.into(),
        "device".into(),
        "wifi".into(),
        "connect".into(),
        credentials.ssid.clone(),
    ];
    if !credentials.passphrase.is_empty() {
        args.push("password".into());
        args.push(credentials.passphrase.clone());
    }
    args.push("ifname".into());
    args.push(interface.into());
    args
}

/// DHCP pool for the shared network, one lease per allowed client.
/// NetworkManager has no station limit for AP mode, so the pool is the cap.
pub(crate) fn dhcp_range(max_connections: u8) -> String {
    let last = (u16::from(DHCP_POOL_START) + u16::from(max_connections.max(1)) - 1).min(254);
    format!("10.42.0.{},10.42.0.{}", DHCP_POOL_START, last)
}

/// Commands that bring the access point up on `interface`
pub(crate) fn hotspot_commands(interface: &str, ap: &AccessPointConfig) -> Vec<Vec<String>> {
    let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();

    let range = dhcp_range(ap.max_connections);
    let mut add = owned(&[
        "connection",
        "add",
        "type",
        "wifi",
        "ifname",
        interface,
        "con-name",
        HOTSPOT_CONNECTION,
        "autoconnect",
        "no",
        "ssid",
        ap.ssid.as_str(),
        "802-11-wireless.mode",
        "ap",
        "ipv4.method",
        "shared",
        "ipv4.addresses",
        AP_ADDRESS,
        "ipv4.shared-dhcp-range",
        range.as_str(),
    ]);
    if !ap.passphrase.is_empty() {
        add.extend(owned(&[
            "802-11-wireless-security.key-mgmt",
            "wpa-psk",
            "802-11-wireless-security.psk",
            ap.passphrase.as_str(),
        ]));
    }

    vec![add, owned(&["connection", "up", HOTSPOT_CONNECTION])]
}

/// Take the access point down and forget its profile
pub(crate) fn teardown_commands() -> Vec<Vec<String>> {
    [
        ["connection", "down", HOTSPOT_CONNECTION],
        ["connection", "delete", HOTSPOT_CONNECTION],
    ]
    .iter()
    .map(|args| args.iter().map(|a| a.to_string()).collect())
    .collect()
}

/// Parse the first line of `nmcli -g IP4.ADDRESS device show`, e.g. `192.168.1.42/24`.
pub(crate) fn parse_ipv4_address(output: &str) -> Option<IpAddr> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    // Multiple addresses are separated by " | "
    let first = line.split('|').next()?.trim();
    let address = first.split('/').next()?;
    address.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
}

async fn run_nmcli(args: &[String]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new("nmcli")
        .args(args)
        .output()
        .await
        .context("failed to run nmcli")?;
    if !output.status.success() {
        bail!(
            "nmcli {} exited with {}: {}",
            args.iter().take(2).cloned().collect::<Vec<_>>().join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn attach(interface: String, credentials: Credentials) -> anyhow::Result<IpAddr> {
    run_nmcli(&connect_args(&interface, &credentials))
        .await
        .with_context(|| format!("connect to `{}` failed", credentials.ssid))?;

    let query: Vec<String> = ["-g", "IP4.ADDRESS", "device", "show", interface.as_str()]
        .iter()
        .map(|a| a.to_string())
        .collect();
    let output = run_nmcli(&query)
        .await
        .context("failed to query interface address")?;
    parse_ipv4_address(&output).with_context(|| format!("{} has no IPv4 address", interface))
}

async fn radio_worker(
    mut commands: UnboundedReceiver<RadioCommand>,
    interface: String,
    ap: AccessPointConfig,
) {
    while let Some(command) = commands.recv().await {
        let steps = match command {
            RadioCommand::Up => hotspot_commands(&interface, &ap),
            RadioCommand::Down => teardown_commands(),
        };

        let mut result = Ok(());
        for args in &steps {
            if let Err(e) = run_nmcli(args).await {
                result = Err(e);
                break;
            }
        }

        match (command, result) {
            (RadioCommand::Up, Ok(())) => info!(
                "link: access point `{}` up on {} ({}, max {} clients)",
                ap.ssid,
                interface,
                if ap.passphrase.is_empty() { "open" } else { "WPA2" },
                ap.max_connections
            ),
            (RadioCommand::Down, Ok(())) => info!("link: access point down, station only"),
            (command, Err(e)) => error!("link: access point {:?} failed: {:#}", command, e),
        }
    }
    debug!("link: access point worker stopped");
}

impl LinkLayer for NmcliLink {
    fn begin_attach(&self, credentials: &Credentials) -> anyhow::Result<()> {
        info!("link: connecting to `{}` on {}", credentials.ssid, self.interface);

        let interface = self.interface.clone();
        let credentials = credentials.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match attach(interface, credentials).await {
                Ok(address) => LinkEvent::AttachSucceeded(address),
                Err(e) => {
                    warn!("link: {:#}", e);
                    LinkEvent::AttachFailed
                }
            };
            if events.send(ProvisionEvent::Link(event)).is_err() {
                debug!("link: event queue closed, dropping {:?}", event);
            }
        });
        Ok(())
    }

    fn enable_local_mode(&self) -> anyhow::Result<()> {
        if self.local_mode.swap(true, Ordering::SeqCst) {
            debug!("link: access point already up");
            return Ok(());
        }
        self.queue(RadioCommand::Up)
    }

    fn disable_local_mode(&self) -> anyhow::Result<()> {
        if !self.local_mode.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.queue(RadioCommand::Down)
    }
}
