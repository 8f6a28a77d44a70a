// ============================================================================
// NET_UTILS.RS - HOST NETWORK HELPERS
// MAC normalization, LAN address detection, port probing
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::DecodeError;

/// Return MAC in canonical uppercase colon form (`XX:XX:XX:XX:XX:XX`).
///
/// Accepts colon, hyphen or bare hex input. Anything that is not exactly
/// 12 hex digits after removing separators is rejected.
pub fn normalize_mac(mac: &str) -> Result<String, DecodeError> {
    let hex_only: String = mac
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if hex_only.len() != 12 || !hex_only.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DecodeError::Mac(mac.to_string()));
    }

    let pairs: Vec<&str> = (0..12).step_by(2).map(|i| &hex_only[i..i + 2]).collect();
    Ok(pairs.join(":"))
}

/// Best guess at this machine's LAN address, loopback if nothing better exists
pub fn get_local_ip() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Could not determine local IP address: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// True if something accepts TCP connections on `host:port`
pub async fn probe_port(host: IpAddr, port: u16, wait: Duration) -> bool {
    let addr = SocketAddr::new(host, port);
    match timeout(wait, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => {
            debug!("Port {} is already listening", addr);
            true
        }
        _ => false,
    }
}

/// Look up the hardware address of `ip` in the kernel neighbour table.
///
/// Only Linux exposes the table as a file; elsewhere this returns `None`.
pub fn lookup_neighbor_mac(ip: IpAddr) -> Option<String> {
    let table = std::fs::read_to_string("/proc/net/arp").ok()?;
    parse_arp_table(&table, ip)
}

fn parse_arp_table(table: &str, ip: IpAddr) -> Option<String> {
    let wanted = ip.to_string();
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 && fields[0] == wanted && fields[3] != "00:00:00:00:00:00" {
            normalize_mac(fields[3]).ok()
        } else {
            None
        }
    })
}

/// Milliseconds since the Unix epoch
pub fn current_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
