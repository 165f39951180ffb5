//! Bus configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use soo_avz_core::{DomainId, DOMID_AGENCY};
use soo_vbstore::{Store, StoreLayout, TxId};
use tracing::info;

use crate::error::VbusError;
use crate::paths;

/// Device types served on this node and the Mobile Entity slots
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VbusConfig {
    /// Device types with a backend driver on this node
    pub backends: Vec<String>,
    /// Domains that may host Mobile Entities
    pub me_domains: Vec<DomainId>,
    /// Upper bound for bus-level waits (suspend, resume, close); none waits forever
    pub sync_timeout_ms: Option<u64>,
}

impl Default for VbusConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            // 0 is the Agency, 1 its realtime half
            me_domains: (2..7).map(DomainId).collect(),
            sync_timeout_ms: None,
        }
    }
}

impl VbusConfig {
    pub fn from_json(json: &str) -> Result<Self, VbusError> {
        let config: VbusConfig =
            serde_json::from_str(json).map_err(|e| VbusError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), VbusError> {
        self.store_layout().validate()?;
        for (i, domain) in self.me_domains.iter().enumerate() {
            if domain.0 <= 1 {
                return Err(VbusError::InvalidConfig(format!(
                    "domain {domain} is reserved for the Agency"
                )));
            }
            if self.me_domains[..i].contains(domain) {
                return Err(VbusError::InvalidConfig(format!(
                    "domain {domain} listed twice"
                )));
            }
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_ms.map(Duration::from_millis)
    }

    /// Store layout covering every configured domain and backend
    pub fn store_layout(&self) -> StoreLayout {
        let highest = self.me_domains.iter().map(|d| d.0 + 1).max().unwrap_or(0);
        let defaults = StoreLayout::default();
        StoreLayout {
            max_domains: defaults.max_domains.max(highest),
            backends: self.backends.clone(),
        }
    }

    /// Create the store layout plus one `/device/<domid>` per ME slot
    pub fn populate_store(&self, store: &Store) -> Result<(), VbusError> {
        self.validate()?;
        store.populate_layout(&self.store_layout())?;
        for domain in &self.me_domains {
            store.mkdir(TxId::NIL, &paths::frontend_domain_dir(*domain))?;
        }
        info!(
            agency = %DOMID_AGENCY,
            me_domains = ?self.me_domains,
            "vbus store populated"
        );
        Ok(())
    }
}
