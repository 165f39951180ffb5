//! Well-known store paths and the initial tree layout.
//!
//! ```text
//!   /
//!   ├── backend/<devtype>/<domid>/<instance>/...
//!   ├── device/<domid>/<devtype>/<instance>/...
//!   ├── domain/gnttab/<domid>
//!   └── soo/
//!       ├── directcomm/<domid>
//!       └── me
//! ```

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::VbsError;
use crate::store::Store;
use crate::types::TxId;

pub const BACKEND_ROOT: &str = "/backend";
pub const DEVICE_ROOT: &str = "/device";
pub const DOMAIN_ROOT: &str = "/domain";
pub const GNTTAB_ROOT: &str = "/domain/gnttab";
pub const SOO_ROOT: &str = "/soo";
pub const DIRECTCOMM_ROOT: &str = "/soo/directcomm";
pub const ME_ROOT: &str = "/soo/me";

/// Which directories exist when the store comes up
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLayout {
    /// Per-domain directories are created for ids `0..max_domains`
    pub max_domains: u16,
    /// Device types with a backend on this node, each gets `/backend/<devtype>`
    pub backends: Vec<String>,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            max_domains: 7,
            backends: Vec::new(),
        }
    }
}

impl StoreLayout {
    pub fn from_json(json: &str) -> Result<Self, VbsError> {
        let layout: StoreLayout = serde_json::from_str(json)
            .map_err(|e| VbsError::InvalidConfig(e.to_string()))?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<(), VbsError> {
        for devtype in &self.backends {
            if devtype.is_empty() || devtype.contains('/') || devtype.contains('\0') {
                return Err(VbsError::InvalidConfig(format!(
                    "backend name {devtype:?} is not a single path segment"
                )));
            }
        }
        Ok(())
    }
}

impl Store {
    /// Create the fixed directories and one `/backend/<devtype>` per configured backend
    pub fn populate_layout(&self, layout: &StoreLayout) -> Result<(), VbsError> {
        layout.validate()?;
        let tx = TxId::NIL;
        for dir in [BACKEND_ROOT, DEVICE_ROOT, DOMAIN_ROOT, GNTTAB_ROOT, SOO_ROOT, DIRECTCOMM_ROOT, ME_ROOT] {
            self.mkdir(tx, dir)?;
        }
        for domid in 0..layout.max_domains {
            self.mkdir(tx, &format!("{GNTTAB_ROOT}/{domid}"))?;
            self.mkdir(tx, &format!("{DIRECTCOMM_ROOT}/{domid}"))?;
        }
        for devtype in &layout.backends {
            self.mkdir(tx, &format!("{BACKEND_ROOT}/{devtype}"))?;
        }
        info!(
            max_domains = layout.max_domains,
            backends = ?layout.backends,
            "store layout populated"
        );
        Ok(())
    }
}
