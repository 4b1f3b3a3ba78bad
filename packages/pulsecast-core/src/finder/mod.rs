//! Chromecast discovery over DNS-SD/mDNS.
//!
//! Browses for `_googlecast._tcp.local.` and folds browse/resolve events
//! through the [`registry::ServiceRegistry`] bookkeeping into NEW / UPDATE /
//! REMOVE instance events. A lost mDNS daemon is treated as transient: all
//! state is torn down (emitting REMOVE for every instance) and discovery
//! reconnects from scratch.

pub mod registry;

use std::collections::BTreeMap;
use std::net::SocketAddr;

use mdns_sd::{ResolvedService, ScopedIp, ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{FinderError, PulsecastError};

pub use registry::{ChromecastInfo, Protocol, ResolverKey, UpdateKind};

/// Chromecast mDNS service type (trailing dot required by mdns-sd).
const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// One discovery update: what changed, and the instance's current state.
pub type FinderUpdate = (UpdateKind, ChromecastInfo);

/// Browses the LAN for Chromecasts until stopped.
pub struct ChromecastFinder {
    cancel: CancellationToken,
}

impl ChromecastFinder {
    /// Starts discovery. Updates flow into `updates`; a fatal failure is
    /// reported once through `errors`, after which the finder is stopped.
    pub fn start(
        updates: mpsc::UnboundedSender<FinderUpdate>,
        errors: mpsc::UnboundedSender<PulsecastError>,
    ) -> Self {
        let cancel = CancellationToken::new();
        tokio::spawn(run_finder(updates, errors, cancel.clone()));
        Self { cancel }
    }

    /// Stops discovery. Idempotent; teardown emits REMOVE for every
    /// instance still known.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ChromecastFinder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_finder(
    updates: mpsc::UnboundedSender<FinderUpdate>,
    errors: mpsc::UnboundedSender<PulsecastError>,
    cancel: CancellationToken,
) {
    loop {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                let _ = errors.send(FinderError::Daemon(e.to_string()).into());
                return;
            }
        };
        if let Err(e) = daemon.use_service_data(true) {
            let _ = daemon.shutdown();
            let _ = errors.send(FinderError::Daemon(e.to_string()).into());
            return;
        }
        let receiver = match daemon.browse(CAST_SERVICE_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = daemon.shutdown();
                let _ = errors.send(FinderError::Browse(e.to_string()).into());
                return;
            }
        };
        log::debug!("[Finder] Browsing for {}", CAST_SERVICE_TYPE);

        let mut registry = registry::ServiceRegistry::default();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    teardown(&mut registry, &updates);
                    let _ = daemon.stop_browse(CAST_SERVICE_TYPE);
                    let _ = daemon.shutdown();
                    return;
                }
                event = receiver.recv_async() => event,
            };
            match event {
                Ok(event) => handle_service_event(event, &mut registry, &updates),
                Err(e) => {
                    // The daemon went away underneath us; reconnect.
                    log::warn!("[Finder] mDNS daemon lost ({}), reconnecting", e);
                    break;
                }
            }
        }

        teardown(&mut registry, &updates);
        let _ = daemon.shutdown();
    }
}

fn handle_service_event(
    event: ServiceEvent,
    registry: &mut registry::ServiceRegistry,
    updates: &mpsc::UnboundedSender<FinderUpdate>,
) {
    match event {
        ServiceEvent::ServiceFound(_, fullname) => {
            let key = resolver_key(&fullname);
            log::trace!("[Finder] Resolver added for '{}'", key.name);
            if !registry.resolver_added(&key) {
                log::debug!("[Finder] Duplicate resolver for '{}'", key.name);
            }
        }
        ServiceEvent::ServiceData(info) => {
            let key = resolver_key(&info.fullname);
            match parse_resolved(&info) {
                Some((endpoint, txt)) => {
                    log::trace!("[Finder] '{}' resolved to {}", key.name, endpoint);
                    emit(registry.resolver_resolved(&key, endpoint, txt), updates);
                }
                None => {
                    // Resolved without a usable address; same path as a
                    // resolve failure.
                    log::warn!("[Finder] '{}' resolved without addresses", key.name);
                    emit(registry.resolver_removed(&key), updates);
                }
            }
        }
        ServiceEvent::ServiceRemoved(_, fullname) => {
            let key = resolver_key(&fullname);
            log::trace!("[Finder] Resolver removed for '{}'", key.name);
            emit(registry.resolver_removed(&key), updates);
        }
        other => log::trace!("[Finder] Ignoring event: {:?}", other),
    }
}

fn emit(
    event: Option<FinderUpdate>,
    updates: &mpsc::UnboundedSender<FinderUpdate>,
) {
    if let Some((kind, info)) = event {
        match kind {
            UpdateKind::New => log::info!("[Finder] New Chromecast '{}'", info.name),
            UpdateKind::Update => log::debug!("[Finder] Chromecast '{}' updated", info.name),
            UpdateKind::Remove => log::info!("[Finder] Chromecast '{}' removed", info.name),
        }
        let _ = updates.send((kind, info));
    }
}

fn teardown(
    registry: &mut registry::ServiceRegistry,
    updates: &mpsc::UnboundedSender<FinderUpdate>,
) {
    for event in registry.clear() {
        emit(Some(event), updates);
    }
}

/// mdns-sd does not expose per-interface resolvers, so the production key
/// space is (0, Unspec, name); the registry still keeps full keys for the
/// multi-resolver bookkeeping.
fn resolver_key(fullname: &str) -> ResolverKey {
    ResolverKey::new(0, Protocol::Unspec, instance_name(fullname))
}

/// Strips the service-type suffix off a DNS-SD fullname.
fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(&format!(".{CAST_SERVICE_TYPE}"))
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}

/// Extracts the endpoint and TXT map from a resolved service. IPv4 is
/// preferred; the port comes from the SRV record.
fn parse_resolved(info: &ResolvedService) -> Option<(SocketAddr, BTreeMap<String, String>)> {
    let ip = info
        .addresses
        .iter()
        .find_map(|addr| match addr {
            ScopedIp::V4(_) => Some(addr.to_ip_addr()),
            _ => None,
        })
        .or_else(|| info.addresses.iter().next().map(ScopedIp::to_ip_addr))?;

    let txt: BTreeMap<String, String> = info
        .txt_properties
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    Some((SocketAddr::new(ip, info.port), txt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_strips_service_suffix() {
        assert_eq!(
            instance_name("CC-Kitchen._googlecast._tcp.local."),
            "CC-Kitchen"
        );
    }

    #[test]
    fn instance_name_keeps_unknown_suffixes() {
        assert_eq!(
            instance_name("Speaker._airplay._tcp.local."),
            "Speaker._airplay._tcp.local"
        );
    }
}
