//! Address allow-list (supplements spec.md's "specified only at its
//! interface" collaborator, per `original_source/Utils/addressFilter.py`):
//! literal IPs plus hostnames resolved on a periodic refresh.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Refresh cadence for hostname entries, matching the original's 300s loop.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Interface the inbound-INVITE admission check (C5) consults. Kept as
/// a trait so tests can supply a fixed set without spinning up a
/// resolver.
pub trait AllowList: Send + Sync {
    fn addresses(&self) -> HashSet<IpAddr>;
}

/// Default implementation: literal IPs are fixed at construction;
/// hostnames are re-resolved via the standard resolver on
/// `REFRESH_INTERVAL`, same as the original's background thread pool.
pub struct ResolvingAllowList {
    literals: HashSet<IpAddr>,
    hostnames: Vec<String>,
    resolved: RwLock<HashSet<IpAddr>>,
}

impl ResolvingAllowList {
    pub fn new(entries: impl IntoIterator<Item = String>) -> Arc<Self> {
        let mut literals = HashSet::new();
        let mut hostnames = Vec::new();
        for entry in entries {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                literals.insert(ip);
            } else {
                hostnames.push(entry);
            }
        }
        Arc::new(ResolvingAllowList {
            literals,
            hostnames,
            resolved: RwLock::new(HashSet::new()),
        })
    }

    async fn resolve_once(&self) {
        let mut resolved = HashSet::new();
        for hostname in &self.hostnames {
            let lookup_target = format!("{hostname}:0");
            match tokio::net::lookup_host(&lookup_target).await {
                Ok(addrs) => {
                    for addr in addrs {
                        resolved.insert(addr.ip());
                    }
                }
                Err(e) => warn!(%hostname, error = %e, "allow-list DNS resolution failed"),
            }
        }
        debug!(count = resolved.len(), "allow-list DNS refresh complete");
        *self.resolved.write().unwrap() = resolved;
    }

    /// Spawn the periodic resolution loop. Resolves once immediately so
    /// callers don't have to wait a full interval before hostnames
    /// start counting.
    pub fn spawn_refresh(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.resolve_once().await;
                if self.hostnames.is_empty() {
                    break;
                }
                tokio::time::sleep(REFRESH_INTERVAL).await;
            }
        })
    }
}

impl AllowList for ResolvingAllowList {
    fn addresses(&self) -> HashSet<IpAddr> {
        let mut all = self.literals.clone();
        all.extend(self.resolved.read().unwrap().iter().copied());
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_ips_available_without_resolution() {
        let list = ResolvingAllowList::new(vec!["192.0.2.10".to_string()]);
        assert!(list.addresses().contains(&"192.0.2.10".parse::<IpAddr>().unwrap()));
    }

    #[tokio::test]
    async fn hostname_entries_start_absent_until_resolved() {
        let list = ResolvingAllowList::new(vec!["example.invalid".to_string()]);
        assert!(list.addresses().is_empty());
    }
}
