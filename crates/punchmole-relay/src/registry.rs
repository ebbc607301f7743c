//! Domain registry
//!
//! Maps each public domain to the control session currently serving it.
//! A newer registration for the same domain replaces the older one; the
//! older session keeps running but stops receiving traffic for that domain.

use crate::session::SessionHandle;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Whether the control connection behind a registration is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// A write to the control connection failed; it is about to be torn down
    Stale,
}

/// A domain bound to a control session
#[derive(Debug, Clone)]
pub struct Registration {
    pub domain: String,
    pub session: SessionHandle,
    pub liveness: Liveness,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    domains: Arc<RwLock<HashMap<String, Registration>>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `domain` to `session`, replacing any previous registration.
    ///
    /// Returns the replaced registration, if any.
    pub fn register(&self, domain: &str, session: SessionHandle) -> Option<Registration> {
        let connection_id = session.connection_id().to_string();
        let registration = Registration {
            domain: domain.to_string(),
            session,
            liveness: Liveness::Alive,
            registered_at: chrono::Utc::now(),
        };

        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = domains.insert(domain.to_string(), registration);

        match &replaced {
            Some(old) => tracing::info!(
                domain = %domain,
                connection_id = %connection_id,
                old_connection_id = %old.session.connection_id(),
                old_registered_at = %old.registered_at,
                "Re-registered domain (replaced previous control connection)"
            ),
            None => tracing::info!(
                domain = %domain,
                connection_id = %connection_id,
                "Registered domain"
            ),
        }

        replaced
    }

    /// Remove the registration for `domain` if it still belongs to
    /// `connection_id`. A registration that was taken over by a newer
    /// connection is left alone.
    pub fn unregister(&self, domain: &str, connection_id: &str) -> bool {
        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        let owned = domains
            .get(domain)
            .is_some_and(|r| r.session.connection_id() == connection_id);

        if owned {
            domains.remove(domain);
            tracing::info!(domain = %domain, connection_id = %connection_id, "Unregistered domain");
        } else {
            tracing::debug!(
                domain = %domain,
                connection_id = %connection_id,
                "Skipping unregister, domain is owned by another connection"
            );
        }
        owned
    }

    /// Flag the registration as unusable if it belongs to `connection_id`
    pub fn mark_stale(&self, domain: &str, connection_id: &str) {
        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(registration) = domains.get_mut(domain) {
            if registration.session.connection_id() == connection_id {
                registration.liveness = Liveness::Stale;
                tracing::warn!(domain = %domain, connection_id = %connection_id, "Marked registration stale");
            }
        }
    }

    /// The session serving `domain`, if its control connection is alive
    pub fn lookup_live(&self, domain: &str) -> Option<SessionHandle> {
        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        domains
            .get(domain)
            .filter(|r| r.liveness == Liveness::Alive && !r.session.is_closed())
            .map(|r| r.session.clone())
    }

    pub fn get(&self, domain: &str) -> Option<Registration> {
        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        domains.get(domain).cloned()
    }

    pub fn domains(&self) -> Vec<String> {
        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        domains.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        domains.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(connection_id: &str) -> (SessionHandle, mpsc::Receiver<crate::session::SessionCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (SessionHandle::new(connection_id.to_string(), tx), rx)
    }

    #[test]
    fn test_last_writer_wins() {
        let registry = DomainRegistry::new();
        let (first, _rx1) = handle("c1");
        let (second, _rx2) = handle("c2");

        assert!(registry.register("a.test", first).is_none());
        let replaced = registry.register("a.test", second).unwrap();
        assert_eq!(replaced.session.connection_id(), "c1");

        let live = registry.lookup_live("a.test").unwrap();
        assert_eq!(live.connection_id(), "c2");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_unregister_only_removes_own_registration() {
        let registry = DomainRegistry::new();
        let (first, _rx1) = handle("c1");
        let (second, _rx2) = handle("c2");

        registry.register("a.test", first);
        registry.register("a.test", second);

        // The replaced connection closing must not drop the newer binding
        assert!(!registry.unregister("a.test", "c1"));
        assert!(registry.lookup_live("a.test").is_some());

        assert!(registry.unregister("a.test", "c2"));
        assert!(registry.lookup_live("a.test").is_none());
    }

    #[test]
    fn test_stale_registration_is_not_live() {
        let registry = DomainRegistry::new();
        let (session, _rx) = handle("c1");
        registry.register("a.test", session);

        registry.mark_stale("a.test", "other");
        assert!(registry.lookup_live("a.test").is_some());

        registry.mark_stale("a.test", "c1");
        assert!(registry.lookup_live("a.test").is_none());
        assert_eq!(registry.get("a.test").unwrap().liveness, Liveness::Stale);
    }

    #[test]
    fn test_closed_session_is_not_live() {
        let registry = DomainRegistry::new();
        let (session, rx) = handle("c1");
        registry.register("a.test", session);
        drop(rx);

        assert!(registry.lookup_live("a.test").is_none());
        assert_eq!(registry.domains(), vec!["a.test".to_string()]);
    }
}
