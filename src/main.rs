use std::{path::PathBuf, sync::Arc};

use anyhow::Error;
use clap::Parser;
use log::{info, warn};
use tokio::sync::mpsc;
use wifi_provisioner::{
    config::Config,
    episode::{IntakeChannel, Restarter},
    link::NmcliLink,
    logging,
    portal::HttpPortal,
    provisioner::{Collaborators, Provisioner},
    storage::FileStore,
};

/// Headless Wi-Fi credential provisioning
#[derive(Parser, Debug)]
#[command(name = "wifi-provisioner")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the RON configuration file
    #[arg(long, default_value = "config.ron")]
    config: PathBuf,

    /// Log level for this crate, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

/// Exits cleanly and leaves the restart to the service manager
struct ProcessRestarter;

impl Restarter for ProcessRestarter {
    fn restart(&self) {
        info!("restarting");
        std::process::exit(0);
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    logging::init(args.log_level.as_deref())?;

    let config = Config::load(&args.config)?;
    info!("loaded config from {}", args.config.display());

    let store = Arc::new(FileStore::open(&config.storage.path)?);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let link = Arc::new(NmcliLink::new(
        &config.link,
        &config.access_point,
        events_tx.clone(),
    ));

    let portal = Arc::new(HttpPortal::new(config.portal.bind));
    let channels: Vec<Arc<dyn IntakeChannel>> = vec![portal];
    if config.ble.enabled {
        warn!(
            "no BLE transport on this host, `{}` will not advertise",
            config.ble.device_name
        );
    }

    let provisioner = Provisioner::new(
        &config,
        Collaborators {
            store,
            link,
            channels,
            restarter: Arc::new(ProcessRestarter),
        },
        events_tx,
    );
    provisioner.run(events_rx).await;
    Ok(())
}
