//! Local HTTP configuration portal
//!
//! Serves the configuration form on `/` and accepts a submission on
//! `/save?ssid=..&pass=..`.

use std::{
    net::{SocketAddr, TcpListener},
    sync::{Arc, Mutex},
};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use common::{ChannelId, CredentialField};
use log::{debug, error, info, warn};
use rust_embed::RustEmbed;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::{
    episode::IntakeChannel,
    intake::{self, CredentialIntake, SubmitOutcome},
    lock,
    registry::ShutdownAction,
};

pub const DEFAULT_BIND: &str = "0.0.0.0:80";

const RECEIVED: &str =
    "<h1>Credentials received!</h1><p>The device will save them and restart shortly.</p>";
const PENDING: &str = "<h1>Credentials incomplete, waiting for the rest</h1>";
const ALREADY_DECLARED: &str = "<h1>Credentials were already received</h1>";
const CLOSED: &str = "<h1>Configuration mode has closed</h1>";
const PARSE_FAILED: &str = "Failed to parse data";

#[derive(RustEmbed)]
#[folder = "src/portal/assets"]
struct PortalAsset;

#[derive(Debug, Deserialize)]
struct SaveQuery {
    ssid: Option<String>,
    pass: Option<String>,
}

pub fn router(intake: Arc<CredentialIntake>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/save", get(save))
        .with_state(intake)
}

async fn index() -> Response {
    match PortalAsset::get("index.html") {
        Some(page) => Response::builder()
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(page.data.into_owned()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        None => {
            error!("portal: index.html missing from embedded assets");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn respond(outcome: SubmitOutcome) -> Response {
    match outcome {
        SubmitOutcome::Winner(_) => (StatusCode::OK, Html(RECEIVED)).into_response(),
        SubmitOutcome::Pending => (StatusCode::ACCEPTED, Html(PENDING)).into_response(),
        SubmitOutcome::AlreadyDeclared => {
            (StatusCode::CONFLICT, Html(ALREADY_DECLARED)).into_response()
        }
        SubmitOutcome::Closed => (StatusCode::GONE, Html(CLOSED)).into_response(),
    }
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, PARSE_FAILED).into_response()
}

async fn save(
    State(intake): State<Arc<CredentialIntake>>,
    query: Result<Query<SaveQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(SaveQuery {
        ssid: Some(ssid),
        pass: Some(pass),
    })) = query
    else {
        warn!("portal: save request without ssid and pass");
        return bad_request();
    };

    // Both halves are checked before either reaches the intake
    for (field, value) in [
        (CredentialField::Ssid, &ssid),
        (CredentialField::Passphrase, &pass),
    ] {
        if let Err(e) = intake::validate(ChannelId::Http, field, value.as_bytes()) {
            warn!("portal: {}", e);
            return bad_request();
        }
    }

    let mut outcome = SubmitOutcome::Pending;
    for (field, value) in [
        (CredentialField::Ssid, ssid),
        (CredentialField::Passphrase, pass),
    ] {
        outcome = match intake.submit(ChannelId::Http, field, value.as_bytes()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("portal: {}", e);
                return bad_request();
            }
        };
        if matches!(
            outcome,
            SubmitOutcome::AlreadyDeclared | SubmitOutcome::Closed
        ) {
            break;
        }
    }

    debug!("portal: save answered with {:?}", outcome);
    respond(outcome)
}

pub struct HttpPortal {
    bind: SocketAddr,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpPortal {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            shutdown: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Address actually bound while serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn is_serving(&self) -> bool {
        lock(&self.shutdown).is_some()
    }

    /// Stop serving. Safe to call repeatedly.
    pub fn stop(&self) -> anyhow::Result<()> {
        match lock(&self.shutdown).take() {
            Some(shutdown) => {
                // The server task may already be gone
                let _ = shutdown.send(());
                lock(&self.local_addr).take();
                info!("portal: stopped");
            }
            None => debug!("portal: already stopped"),
        }
        Ok(())
    }
}

impl IntakeChannel for HttpPortal {
    fn name(&self) -> &str {
        "portal"
    }

    /// Must be called from within a tokio runtime.
    fn open(self: Arc<Self>, intake: Arc<CredentialIntake>) -> anyhow::Result<ShutdownAction> {
        let listener = TcpListener::bind(self.bind)
            .with_context(|| format!("binding portal to {}", self.bind))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let listener = tokio::net::TcpListener::from_std(listener)?;

        let (tx, rx) = oneshot::channel::<()>();
        *lock(&self.shutdown) = Some(tx);
        *lock(&self.local_addr) = Some(local_addr);

        let app = router(intake);
        tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("portal: server error: {}", e);
            }
        });
        info!("portal: listening on http://{}", local_addr);

        let portal = self.clone();
        Ok(ShutdownAction::new("portal", move || portal.stop()))
    }
}
