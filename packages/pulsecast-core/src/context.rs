//! Local network address enumeration.
//!
//! The receiver application on a Chromecast connects back to the daemon over
//! websocket, so START_STREAM must carry every address the device might be
//! able to reach us at: all local interface addresses except loopback.

use std::net::IpAddr;

use local_ip_address::list_afinet_netifas;

use crate::error::PulsecastError;

/// Lists the non-loopback addresses of all local interfaces, deduplicated.
pub fn local_addresses() -> Result<Vec<IpAddr>, PulsecastError> {
    let netifas = list_afinet_netifas()
        .map_err(|e| PulsecastError::Network(format!("failed to list interfaces: {e}")))?;

    let mut addresses: Vec<IpAddr> = netifas
        .into_iter()
        .map(|(_, ip)| ip)
        .filter(|ip| !ip.is_loopback())
        .collect();
    addresses.sort();
    addresses.dedup();
    Ok(addresses)
}

/// Builds the `ws://` endpoint list for START_STREAM from the local
/// addresses and the broadcaster's listening port.
pub fn websocket_endpoints(port: u16) -> Result<Vec<String>, PulsecastError> {
    Ok(local_addresses()?
        .into_iter()
        .map(|ip| websocket_url(ip, port))
        .collect())
}

fn websocket_url(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("ws://{v4}:{port}"),
        IpAddr::V6(v6) => format!("ws://[{v6}]:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn v4_urls_are_plain() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));
        assert_eq!(websocket_url(ip, 8009), "ws://192.0.2.10:8009");
    }

    #[test]
    fn v6_urls_are_bracketed() {
        let ip = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        assert_eq!(websocket_url(ip, 443), "ws://[2001:db8::1]:443");
    }

    #[test]
    fn local_addresses_skip_loopback() {
        // Whatever the machine looks like, loopback must never appear.
        if let Ok(addresses) = local_addresses() {
            assert!(addresses.iter().all(|ip| !ip.is_loopback()));
        }
    }
}
