// SSDP responder. DIAL is deprecated, but it is still how the YouTube app
// on phones finds TV devices on the local network.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::server::{ServerState, CONFIG_ID, NAME, VERSION};

const SSDP_PORT: u16 = 1900;
const SSDP_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const MSEARCH_HEADER: &str = "M-SEARCH * HTTP/1.1\r\n";
// The DIAL specification implies this is the only ST that must be answered.
const SEARCH_TARGET: &str = "urn:dial-multiscreen-org:service:dial:";

// SSDP packets fit in one UDP datagram.
const PACKET_SIZE: usize = 1500;

pub async fn serve(state: Arc<ServerState>) -> Result<(), AppError> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], SSDP_PORT))).await?;
    socket.join_multicast_v4(SSDP_MULTICAST, Ipv4Addr::UNSPECIFIED)?;
    let socket = Arc::new(socket);

    info!("listening for SSDP searches");

    let mut buf = [0u8; PACKET_SIZE];
    loop {
        let (n, raddr) = socket.recv_from(&mut buf).await?;
        let packet = match std::str::from_utf8(&buf[..n]) {
            Ok(packet) => packet,
            Err(_) => continue,
        };

        if !packet.starts_with(MSEARCH_HEADER) {
            continue;
        }

        let headers = parse_headers(&packet[MSEARCH_HEADER.len()..]);
        match headers.iter().find(|(k, _)| k == "ST") {
            Some((_, st)) if st.starts_with(SEARCH_TARGET) => {}
            _ => continue,
        }

        let mx: u64 = match headers
            .iter()
            .find(|(k, _)| k == "MX")
            .and_then(|(_, v)| v.parse().ok())
        {
            Some(mx) => mx,
            None => {
                warn!("M-SEARCH without a usable MX header from {}", raddr);
                continue;
            }
        };

        debug!("M-SEARCH from {}", raddr);

        let socket = socket.clone();
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = respond(&socket, &state, raddr, mx).await {
                warn!("could not answer M-SEARCH: {}", e);
            }
        });
    }
}

// Responses are delayed by a random fraction of MX seconds, per UPnP, so a
// burst of searchers does not get a burst of simultaneous answers.
async fn respond(
    socket: &UdpSocket,
    state: &ServerState,
    raddr: SocketAddr,
    mx: u64,
) -> Result<(), AppError> {
    let jitter = rand::thread_rng().gen_range(0..1_000_000u64);
    tokio::time::sleep(Duration::from_micros(jitter * mx)).await;

    let local_ip = local_ip_towards(raddr)?;
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age=1800\r\n\
         DATE: {}\r\n\
         EXT: \r\n\
         LOCATION: http://{}:{}/upnp/description.xml\r\n\
         SERVER: Linux/3.x UPnP/1.1 {}/{}\r\n\
         ST: urn:dial-multiscreen-org:service:dial:1\r\n\
         USN: uuid:{}::urn:dial-multiscreen-org:service:dial:1\r\n\
         CONFIGID.UPNP.ORG: {}\r\n\
         \r\n",
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"),
        local_ip,
        state.http_port,
        NAME,
        VERSION,
        state.uuid,
        CONFIG_ID,
    );

    socket.send_to(response.as_bytes(), raddr).await?;
    debug!("sent SSDP response to {}", raddr);
    Ok(())
}

fn parse_headers(packet: &str) -> Vec<(String, String)> {
    packet
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_uppercase(), value.trim().to_string()))
        })
        .collect()
}

/// The local address a reply to `raddr` would leave from, found by opening
/// an ephemeral connected UDP socket towards it.
pub fn local_ip_towards(raddr: SocketAddr) -> Result<IpAddr, AppError> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")?;
    probe.connect(raddr)?;
    Ok(probe.local_addr()?.ip())
}
