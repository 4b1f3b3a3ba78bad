//! Resolver and endpoint bookkeeping for discovered Chromecasts.
//!
//! One Chromecast (keyed by its service instance name) is typically visible
//! through several DNS-SD resolvers at once - one per interface/protocol
//! pair. The registry reference-counts every reported endpoint so that an
//! endpoint stays exposed exactly as long as at least one live resolver
//! still reports it, and coalesces resolver churn into NEW / UPDATE /
//! REMOVE instance events.
//!
//! This is a pure state machine fed by adapter events, so the whole
//! multi-resolver lifecycle is unit-testable without an mDNS daemon.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;

/// Protocol family a resolver browses on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    V4,
    V6,
    Unspec,
}

/// Identity of one resolve subscription: interface, protocol family and
/// service instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolverKey {
    pub interface: u32,
    pub protocol: Protocol,
    pub name: String,
}

impl ResolverKey {
    pub fn new(interface: u32, protocol: Protocol, name: impl Into<String>) -> Self {
        Self {
            interface,
            protocol,
            name: name.into(),
        }
    }
}

/// Everything known about one Chromecast on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChromecastInfo {
    /// Service instance name; unique per device.
    pub name: String,
    /// All endpoints currently reported by at least one resolver.
    pub endpoints: BTreeSet<SocketAddr>,
    /// DNS-SD TXT attributes, passed through opaquely.
    pub txt: BTreeMap<String, String>,
}

impl ChromecastInfo {
    /// Human-facing name: the `fn` TXT attribute when present, otherwise the
    /// service instance name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.txt.get("fn").map_or(&self.name, String::as_str)
    }
}

/// Kind of instance change reported alongside a [`ChromecastInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    New,
    Update,
    Remove,
}

#[derive(Debug, Default)]
struct Instance {
    txt: BTreeMap<String, String>,
    /// Endpoint currently reported by each resolver.
    endpoints: HashMap<ResolverKey, SocketAddr>,
    /// How many resolvers report each endpoint.
    endpoint_count: HashMap<SocketAddr, usize>,
}

impl Instance {
    fn info(&self, name: &str) -> ChromecastInfo {
        ChromecastInfo {
            name: name.to_string(),
            endpoints: self.endpoint_count.keys().copied().collect(),
            txt: self.txt.clone(),
        }
    }
}

/// The discovery adapter's bookkeeping tables.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    /// Live resolve subscriptions.
    resolvers: std::collections::HashSet<ResolverKey>,
    instances: HashMap<String, Instance>,
}

impl ServiceRegistry {
    /// Registers a resolver announced by the browser. Returns false on a
    /// duplicate announcement.
    pub fn resolver_added(&mut self, key: &ResolverKey) -> bool {
        self.resolvers.insert(key.clone())
    }

    /// Records a resolve result and reports the instance change, if any.
    ///
    /// A resolver that previously reported a different endpoint transfers
    /// its reference to the new one; the old endpoint disappears from the
    /// instance once its count reaches zero.
    pub fn resolver_resolved(
        &mut self,
        key: &ResolverKey,
        endpoint: SocketAddr,
        txt: BTreeMap<String, String>,
    ) -> Option<(UpdateKind, ChromecastInfo)> {
        if !self.resolvers.contains(key) {
            // Resolve raced with teardown of its resolver.
            return None;
        }

        let added = !self.instances.contains_key(&key.name);
        let instance = self.instances.entry(key.name.clone()).or_default();
        let mut updated = false;

        if instance.txt != txt {
            instance.txt = txt;
            updated = true;
        }

        let mut set_endpoint = false;
        match instance.endpoints.get(key) {
            None => set_endpoint = true,
            Some(current) if *current != endpoint => {
                let current = *current;
                if decrement(&mut instance.endpoint_count, current) {
                    updated = true;
                }
                set_endpoint = true;
            }
            Some(_) => {}
        }

        if set_endpoint {
            instance.endpoints.insert(key.clone(), endpoint);
            let count = instance.endpoint_count.entry(endpoint).or_insert(0);
            *count += 1;
            if *count == 1 {
                updated = true;
            }
        }

        if added {
            Some((UpdateKind::New, instance.info(&key.name)))
        } else if updated {
            Some((UpdateKind::Update, instance.info(&key.name)))
        } else {
            None
        }
    }

    /// Drops a resolver (browser REMOVE, resolve failure, or teardown) and
    /// reports the instance change, if any. The instance disappears with its
    /// last resolver.
    pub fn resolver_removed(&mut self, key: &ResolverKey) -> Option<(UpdateKind, ChromecastInfo)> {
        if !self.resolvers.remove(key) {
            return None;
        }
        let instance = self.instances.get_mut(&key.name)?;
        // A resolver may be removed before it ever resolved.
        let endpoint = instance.endpoints.remove(key)?;
        let updated = decrement(&mut instance.endpoint_count, endpoint);

        if instance.endpoints.is_empty() {
            let info = instance.info(&key.name);
            self.instances.remove(&key.name);
            Some((UpdateKind::Remove, info))
        } else if updated {
            Some((UpdateKind::Update, instance.info(&key.name)))
        } else {
            None
        }
    }

    /// Removes every resolver in turn, yielding the resulting events.
    /// Used by `stop()` and by the daemon-reconnect path.
    pub fn clear(&mut self) -> Vec<(UpdateKind, ChromecastInfo)> {
        let keys: Vec<ResolverKey> = self.resolvers.iter().cloned().collect();
        keys.iter()
            .filter_map(|key| self.resolver_removed(key))
            .collect()
    }

    #[cfg(test)]
    fn endpoint_count(&self, name: &str, endpoint: SocketAddr) -> usize {
        self.instances
            .get(name)
            .and_then(|i| i.endpoint_count.get(&endpoint))
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for instance in self.instances.values() {
            // A live instance has at least one reporting resolver.
            assert!(!instance.endpoints.is_empty());
            // endpoint_count[e] equals the number of resolvers reporting e.
            let mut expected: HashMap<SocketAddr, usize> = HashMap::new();
            for endpoint in instance.endpoints.values() {
                *expected.entry(*endpoint).or_insert(0) += 1;
            }
            assert_eq!(instance.endpoint_count, expected);
            // The exposed endpoint set is exactly {e | count[e] > 0}.
            assert!(instance.endpoint_count.values().all(|c| *c > 0));
        }
    }
}

/// Decrements a refcount, dropping the entry at zero. Returns true when the
/// endpoint disappeared.
fn decrement(counts: &mut HashMap<SocketAddr, usize>, endpoint: SocketAddr) -> bool {
    if let Some(count) = counts.get_mut(&endpoint) {
        *count -= 1;
        if *count == 0 {
            counts.remove(&endpoint);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, last], port))
    }

    fn kitchen_txt() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("fn".to_string(), "Kitchen".to_string()),
            ("id".to_string(), "abcdef".to_string()),
        ])
    }

    #[test]
    fn discovery_lifecycle_with_two_resolvers() {
        let mut registry = ServiceRegistry::default();
        let first = ResolverKey::new(2, Protocol::V4, "CC-Kitchen");
        let second = ResolverKey::new(3, Protocol::V4, "CC-Kitchen");

        assert!(registry.resolver_added(&first));
        let event = registry
            .resolver_resolved(&first, endpoint(10, 8009), kitchen_txt())
            .expect("first resolve must produce NEW");
        registry.check_invariants();
        assert_eq!(event.0, UpdateKind::New);
        assert_eq!(
            event.1.endpoints,
            BTreeSet::from([endpoint(10, 8009)])
        );
        assert_eq!(event.1.display_name(), "Kitchen");

        // Second resolver, same endpoint: the count rises to 2 but the
        // visible endpoint set and TXT are unchanged, so the update is
        // coalesced away.
        assert!(registry.resolver_added(&second));
        assert_eq!(
            registry.resolver_resolved(&second, endpoint(10, 8009), kitchen_txt()),
            None
        );
        registry.check_invariants();
        assert_eq!(registry.endpoint_count("CC-Kitchen", endpoint(10, 8009)), 2);

        // Removing one resolver leaves the instance live and silent.
        assert_eq!(registry.resolver_removed(&first), None);
        registry.check_invariants();
        assert_eq!(registry.endpoint_count("CC-Kitchen", endpoint(10, 8009)), 1);

        // Removing the last resolver emits REMOVE.
        let event = registry
            .resolver_removed(&second)
            .expect("last resolver must produce REMOVE");
        assert_eq!(event.0, UpdateKind::Remove);
        registry.check_invariants();
    }

    #[test]
    fn txt_change_produces_update() {
        let mut registry = ServiceRegistry::default();
        let key = ResolverKey::new(2, Protocol::V4, "CC");
        registry.resolver_added(&key);
        registry.resolver_resolved(&key, endpoint(10, 8009), kitchen_txt());

        let mut changed = kitchen_txt();
        changed.insert("fn".to_string(), "Kitchen Display".to_string());
        let event = registry
            .resolver_resolved(&key, endpoint(10, 8009), changed)
            .expect("TXT change must produce UPDATE");
        assert_eq!(event.0, UpdateKind::Update);
        assert_eq!(event.1.display_name(), "Kitchen Display");
        registry.check_invariants();
    }

    #[test]
    fn endpoint_move_transfers_the_refcount() {
        let mut registry = ServiceRegistry::default();
        let mobile = ResolverKey::new(2, Protocol::V4, "CC");
        let anchored = ResolverKey::new(3, Protocol::V4, "CC");
        registry.resolver_added(&mobile);
        registry.resolver_added(&anchored);
        registry.resolver_resolved(&mobile, endpoint(10, 8009), kitchen_txt());
        registry.resolver_resolved(&anchored, endpoint(10, 8009), kitchen_txt());

        // The mobile resolver re-resolves to a new address: old endpoint
        // stays (anchored still reports it), new endpoint appears.
        let event = registry
            .resolver_resolved(&mobile, endpoint(20, 8009), kitchen_txt())
            .expect("new endpoint must produce UPDATE");
        assert_eq!(event.0, UpdateKind::Update);
        assert_eq!(
            event.1.endpoints,
            BTreeSet::from([endpoint(10, 8009), endpoint(20, 8009)])
        );
        registry.check_invariants();

        // The anchored resolver follows: the old endpoint's count reaches
        // zero and it disappears.
        let event = registry
            .resolver_resolved(&anchored, endpoint(20, 8009), kitchen_txt())
            .expect("endpoint drop must produce UPDATE");
        assert_eq!(event.1.endpoints, BTreeSet::from([endpoint(20, 8009)]));
        assert_eq!(registry.endpoint_count("CC", endpoint(20, 8009)), 2);
        registry.check_invariants();
    }

    #[test]
    fn unresolved_resolver_removal_is_silent() {
        let mut registry = ServiceRegistry::default();
        let key = ResolverKey::new(2, Protocol::V4, "CC");
        registry.resolver_added(&key);
        assert_eq!(registry.resolver_removed(&key), None);
        registry.check_invariants();
    }

    #[test]
    fn stale_resolve_after_removal_is_ignored() {
        let mut registry = ServiceRegistry::default();
        let key = ResolverKey::new(2, Protocol::V4, "CC");
        registry.resolver_added(&key);
        registry.resolver_removed(&key);
        assert_eq!(
            registry.resolver_resolved(&key, endpoint(10, 8009), kitchen_txt()),
            None
        );
    }

    #[test]
    fn clear_emits_remove_for_every_instance() {
        let mut registry = ServiceRegistry::default();
        for (iface, name) in [(2, "CC-A"), (3, "CC-A"), (2, "CC-B")] {
            let key = ResolverKey::new(iface, Protocol::V4, name);
            registry.resolver_added(&key);
            registry.resolver_resolved(&key, endpoint(iface as u8, 8009), BTreeMap::new());
        }
        let events = registry.clear();
        let removes: Vec<_> = events
            .iter()
            .filter(|(kind, _)| *kind == UpdateKind::Remove)
            .map(|(_, info)| info.name.clone())
            .collect();
        assert_eq!(removes.len(), 2);
        assert!(removes.contains(&"CC-A".to_string()));
        assert!(removes.contains(&"CC-B".to_string()));
        registry.check_invariants();
    }
}
