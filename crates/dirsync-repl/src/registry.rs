//! Registry of the replication domains served by this process.

use crate::dn::Dn;
use crate::domain::ReplicationDomain;
use crate::error::{ReplError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Domains keyed by suffix.
#[derive(Default)]
pub struct DomainRegistry {
    domains: DashMap<Dn, Arc<ReplicationDomain>>,
}

impl DomainRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a domain. Two domains may not share a suffix.
    pub fn register(&self, domain: Arc<ReplicationDomain>) -> Result<()> {
        let base = domain.base_dn().clone();
        match self.domains.entry(base.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ReplError::DomainExists {
                base_dn: base.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(domain);
                info!(base_dn = %base, "replication domain registered");
                Ok(())
            }
        }
    }

    /// Remove the domain for `base`.
    pub fn unregister(&self, base: &Dn) -> Result<Arc<ReplicationDomain>> {
        self.domains
            .remove(base)
            .map(|(_, domain)| domain)
            .ok_or_else(|| ReplError::UnknownDomain {
                base_dn: base.to_string(),
            })
    }

    /// Domain replicating exactly `base`.
    pub fn get(&self, base: &Dn) -> Option<Arc<ReplicationDomain>> {
        self.domains.get(base).map(|d| Arc::clone(d.value()))
    }

    /// Domain whose suffix is the closest ancestor of `dn`.
    pub fn find_for_dn(&self, dn: &Dn) -> Option<Arc<ReplicationDomain>> {
        self.domains
            .iter()
            .filter(|d| dn.is_descendant_of(d.key()))
            .max_by_key(|d| d.key().depth())
            .map(|d| Arc::clone(d.value()))
    }

    /// Every registered domain.
    pub fn domains(&self) -> Vec<Arc<ReplicationDomain>> {
        self.domains.iter().map(|d| Arc::clone(d.value())).collect()
    }

    /// Number of domains.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// True if no domain is registered.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Shut down every domain, logging failures.
    pub async fn shutdown_all(&self) {
        for domain in self.domains() {
            if let Err(e) = domain.shutdown().await {
                warn!(base_dn = %domain.base_dn(), error = %e, "domain shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, InMemoryBackend};
    use crate::config::DomainConfig;
    use crate::domain::DomainState;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn domain(base: &str, replica_id: u16) -> Arc<ReplicationDomain> {
        let config = DomainConfig {
            replica_id,
            base_dn: base.to_string(),
            ..DomainConfig::default()
        };
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new(dn(base)));
        let (domain, _channels) = ReplicationDomain::new(config, backend).unwrap();
        domain
    }

    #[test]
    fn test_register_rejects_duplicate_suffix() {
        let registry = DomainRegistry::new();
        registry.register(domain("dc=example,dc=com", 1)).unwrap();
        let err = registry.register(domain("DC=Example,DC=Com", 2)).unwrap_err();
        assert!(matches!(err, ReplError::DomainExists { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_find_for_dn_picks_longest_suffix() {
        let registry = DomainRegistry::new();
        registry.register(domain("dc=example,dc=com", 1)).unwrap();
        registry.register(domain("ou=people,dc=example,dc=com", 1)).unwrap();

        let found = registry
            .find_for_dn(&dn("cn=alice,ou=people,dc=example,dc=com"))
            .unwrap();
        assert_eq!(found.base_dn(), &dn("ou=people,dc=example,dc=com"));

        let found = registry.find_for_dn(&dn("ou=groups,dc=example,dc=com")).unwrap();
        assert_eq!(found.base_dn(), &dn("dc=example,dc=com"));

        assert!(registry.find_for_dn(&dn("dc=other")).is_none());
    }

    #[test]
    fn test_unregister() {
        let registry = DomainRegistry::new();
        registry.register(domain("o=test", 1)).unwrap();
        assert!(registry.get(&dn("o=test")).is_some());
        registry.unregister(&dn("o=test")).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.unregister(&dn("o=test")),
            Err(ReplError::UnknownDomain { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let registry = DomainRegistry::new();
        let a = domain("o=a", 1);
        let b = domain("o=b", 1);
        a.start().await.unwrap();
        registry.register(Arc::clone(&a)).unwrap();
        registry.register(Arc::clone(&b)).unwrap();

        registry.shutdown_all().await;
        assert_eq!(a.lifecycle().await, DomainState::Stopped);
        assert_eq!(b.lifecycle().await, DomainState::Stopped);
    }
}
