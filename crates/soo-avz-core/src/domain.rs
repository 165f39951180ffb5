//! Domains and the registry that owns their tables
//!
//! A [`Domain`] bundles everything the substrate keeps per execution
//! domain: its event channel table, its grant table, the handlers bound to
//! its channels and, once started, its dispatcher thread.
//!
//! The [`DomainRegistry`] is the entry point of every operation. It hands
//! out `Arc<Domain>` clones, so a lookup never holds the registry lock while
//! a table lock is taken.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use soo_hal::MemoryLayer;
use tracing::info;

use crate::config::AvzConfig;
use crate::dispatch::{EventDispatcher, EventHandler, EventHandlers};
use crate::error::AvzError;
use crate::evtchn::EventChannelTable;
use crate::gnttab::GrantTable;
use crate::types::{ChannelId, DomainId};

/// One execution domain
pub struct Domain {
    id: DomainId,
    evtchn: Arc<EventChannelTable>,
    gnttab: GrantTable,
    handlers: EventHandlers,
    dispatcher: Mutex<Option<EventDispatcher>>,
    dying: AtomicBool,
}

impl Domain {
    fn new(id: DomainId, config: &AvzConfig) -> Self {
        Self {
            id,
            evtchn: Arc::new(EventChannelTable::new(id, config.nr_evtchn, config.nr_virqs)),
            gnttab: GrantTable::new(id, config.nr_grant_entries, config.nr_reserved_grants),
            handlers: EventHandlers::default(),
            dispatcher: Mutex::new(None),
            dying: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn evtchn(&self) -> &EventChannelTable {
        &self.evtchn
    }

    pub fn gnttab(&self) -> &GrantTable {
        &self.gnttab
    }

    pub fn handlers(&self) -> &EventHandlers {
        &self.handlers
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    pub fn has_dispatcher(&self) -> bool {
        self.dispatcher.lock().is_some()
    }
}

/// Owner of every domain of one platform
pub struct DomainRegistry {
    config: AvzConfig,
    memory: Arc<dyn MemoryLayer>,
    domains: RwLock<BTreeMap<DomainId, Arc<Domain>>>,
}

impl DomainRegistry {
    pub fn new(config: AvzConfig, memory: Arc<dyn MemoryLayer>) -> Result<Self, AvzError> {
        config.validate()?;
        Ok(Self {
            config,
            memory,
            domains: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &AvzConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<dyn MemoryLayer> {
        &self.memory
    }

    /// Register a new domain with empty tables
    pub fn create_domain(&self, id: DomainId) -> Result<Arc<Domain>, AvzError> {
        if id.0 >= self.config.max_domains {
            return Err(AvzError::InvalidDomain(id));
        }
        let mut domains = self.domains.write();
        if domains.contains_key(&id) {
            return Err(AvzError::DomainExists(id));
        }
        let domain = Arc::new(Domain::new(id, &self.config));
        domains.insert(id, domain.clone());
        info!(domain = %id, "domain created");
        Ok(domain)
    }

    /// Look up a domain, dying or not
    pub fn domain(&self, id: DomainId) -> Result<Arc<Domain>, AvzError> {
        self.domains
            .read()
            .get(&id)
            .cloned()
            .ok_or(AvzError::DomainNotFound(id))
    }

    /// Look up a domain that accepts new bindings
    pub(crate) fn live_domain(&self, id: DomainId) -> Result<Arc<Domain>, AvzError> {
        let domain = self.domain(id)?;
        if domain.is_dying() {
            return Err(AvzError::DomainDying(id));
        }
        Ok(domain)
    }

    pub fn domain_ids(&self) -> Vec<DomainId> {
        self.domains.read().keys().copied().collect()
    }

    /// Start the dispatcher thread of `id`; a no-op if it already runs
    pub fn start_dispatcher(&self, id: DomainId) -> Result<(), AvzError> {
        let domain = self.live_domain(id)?;
        let mut slot = domain.dispatcher.lock();
        if slot.is_none() {
            *slot = Some(EventDispatcher::spawn(
                domain.evtchn.clone(),
                domain.handlers.clone(),
                self.config.dispatch_passes,
            )?);
        }
        Ok(())
    }

    /// Run `handler` on the dispatcher of `id` whenever `channel` fires
    pub fn bind_handler(
        &self,
        id: DomainId,
        channel: ChannelId,
        handler: EventHandler,
    ) -> Result<(), AvzError> {
        let domain = self.domain(id)?;
        domain.evtchn.state(channel)?;
        domain.handlers.bind(channel, handler);
        Ok(())
    }

    pub fn unbind_handler(&self, id: DomainId, channel: ChannelId) -> Result<bool, AvzError> {
        Ok(self.domain(id)?.handlers.unbind(channel))
    }

    /// Tear a domain down
    ///
    /// Stops its dispatcher, closes every channel (interdomain peers fall back
    /// to Unbound), drops the foreign mappings it holds and unregisters it.
    /// Entries it granted stay accounted in its table until their mappers
    /// unmap them.
    pub fn destroy_domain(&self, id: DomainId) -> Result<(), AvzError> {
        let domain = self.domain(id)?;
        if domain.dying.swap(true, Ordering::AcqRel) {
            return Err(AvzError::DomainDying(id));
        }
        info!(domain = %id, "destroying domain");

        let dispatcher = domain.dispatcher.lock().take();
        if let Some(mut dispatcher) = dispatcher {
            dispatcher.stop();
        }
        domain.handlers.clear();
        self.evtchn_destroy(&domain);
        self.gnttab_release_mappings(id);

        self.domains.write().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soo_hal::SimMemory;

    fn registry() -> DomainRegistry {
        DomainRegistry::new(AvzConfig::default(), Arc::new(SimMemory::new())).unwrap()
    }

    #[test]
    fn test_create_and_lookup() {
        let reg = registry();
        reg.create_domain(DomainId(0)).unwrap();
        reg.create_domain(DomainId(3)).unwrap();
        assert_eq!(reg.domain_ids(), vec![DomainId(0), DomainId(3)]);
        assert_eq!(reg.domain(DomainId(3)).unwrap().id(), DomainId(3));
        assert!(matches!(
            reg.domain(DomainId(4)),
            Err(AvzError::DomainNotFound(_))
        ));
    }

    #[test]
    fn test_create_rejects_duplicates_and_range() {
        let reg = registry();
        reg.create_domain(DomainId(1)).unwrap();
        assert!(matches!(
            reg.create_domain(DomainId(1)),
            Err(AvzError::DomainExists(_))
        ));
        assert!(matches!(
            reg.create_domain(DomainId(7)),
            Err(AvzError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = AvzConfig {
            dispatch_passes: 0,
            ..AvzConfig::default()
        };
        assert!(DomainRegistry::new(config, Arc::new(SimMemory::new())).is_err());
    }

    #[test]
    fn test_destroy_twice() {
        let reg = registry();
        reg.create_domain(DomainId(2)).unwrap();
        reg.destroy_domain(DomainId(2)).unwrap();
        assert!(matches!(
            reg.destroy_domain(DomainId(2)),
            Err(AvzError::DomainNotFound(_))
        ));
    }

    #[test]
    fn test_start_dispatcher_idempotent() {
        let reg = registry();
        reg.create_domain(DomainId(1)).unwrap();
        reg.start_dispatcher(DomainId(1)).unwrap();
        reg.start_dispatcher(DomainId(1)).unwrap();
        assert!(reg.domain(DomainId(1)).unwrap().has_dispatcher());
        reg.destroy_domain(DomainId(1)).unwrap();
    }

    #[test]
    fn test_bind_handler_requires_valid_channel() {
        let reg = registry();
        reg.create_domain(DomainId(1)).unwrap();
        let handler: EventHandler = Arc::new(|_: ChannelId| {});
        assert!(reg
            .bind_handler(DomainId(1), ChannelId(5000), handler.clone())
            .is_err());
        assert!(reg.bind_handler(DomainId(1), ChannelId(5), handler).is_ok());
        assert!(reg.unbind_handler(DomainId(1), ChannelId(5)).unwrap());
    }
}
