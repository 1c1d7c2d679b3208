pub mod http;
pub mod ssdp;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use crate::app::{App, YouTubeApp};
use crate::config::Store;
use crate::error::AppError;
use crate::settings::SETTINGS;

pub const NAME: &str = "Loungecast";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CONFIG_ID: u32 = 1;

pub const UUID_KEY: &str = "apps.youtube.uuid";

/// Shared state of the HTTP and SSDP servers.
pub struct ServerState {
    pub apps: HashMap<&'static str, Arc<dyn App>>,
    pub friendly_name: String,
    pub uuid: String,
    pub http_port: u16,
    pub local_ip: IpAddr,
}

/// Bring the receiver up: persisted identity, app registry, DIAL HTTP,
/// SSDP. Returns after ctrl-c, once every app has been quit.
pub async fn serve() -> Result<(), AppError> {
    let store = Arc::new(Store::open_default()?);

    // The device UUID is generated once and kept forever; remotes identify
    // the screen by it.
    let uuid = store.get_or_insert(UUID_KEY, Uuid::new_v4().to_string())?;
    info!("device UUID: {}", uuid);

    let listener = TcpListener::bind(("0.0.0.0", SETTINGS.http_port)).await?;
    let http_port = listener.local_addr()?.port();
    info!("serving HTTP on port {}", http_port);

    let mut apps: HashMap<&'static str, Arc<dyn App>> = HashMap::new();
    apps.insert(
        "YouTube",
        Arc::new(YouTubeApp::new(store.clone(), uuid.clone())),
    );

    let state = Arc::new(ServerState {
        apps,
        friendly_name: SETTINGS.friendly_name.clone(),
        uuid,
        http_port,
        local_ip: default_local_ip()?,
    });

    let http_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = http::serve(http_state, listener).await {
            error!("HTTP server failed: {}", e);
        }
    });

    if !SETTINGS.disable_ssdp {
        let ssdp_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = ssdp::serve(ssdp_state).await {
                error!("SSDP server failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for app in state.apps.values() {
        app.quit().await;
    }
    Ok(())
}

// The address we advertise in Application-URL. A connected UDP socket to a
// public address reveals the interface a LAN peer would reach us on.
fn default_local_ip() -> Result<IpAddr, AppError> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")?;
    probe.connect("8.8.8.8:80")?;
    Ok(probe.local_addr()?.ip())
}
