//! Store paths and keys of split devices
//!
//! ```text
//!   /device/<domid>/<devtype>/<instance>/{state,ring-ref,ring-evtchn,backend,backend-id}
//!   /backend/<devtype>/<domid>/<instance>/{state,ring-ref,ring-evtchn,frontend,frontend-id}
//! ```
//!
//! `<domid>` is always the frontend's domain.

use soo_avz_core::DomainId;
use soo_vbstore::{join_path, BACKEND_ROOT, DEVICE_ROOT};

pub const STATE: &str = "state";
pub const RING_REF: &str = "ring-ref";
pub const RING_EVTCHN: &str = "ring-evtchn";
pub const BACKEND: &str = "backend";
pub const BACKEND_ID: &str = "backend-id";
pub const FRONTEND: &str = "frontend";
pub const FRONTEND_ID: &str = "frontend-id";

/// `/device/<domid>/<devtype>/<instance>`
pub fn frontend_node(domain: DomainId, devtype: &str, instance: u32) -> String {
    format!("{DEVICE_ROOT}/{domain}/{devtype}/{instance}")
}

/// `/backend/<devtype>/<domid>/<instance>`
pub fn backend_node(devtype: &str, frontend_domain: DomainId, instance: u32) -> String {
    format!("{BACKEND_ROOT}/{devtype}/{frontend_domain}/{instance}")
}

/// `/device/<domid>`, parent of every frontend of one domain
pub fn frontend_domain_dir(domain: DomainId) -> String {
    format!("{DEVICE_ROOT}/{domain}")
}

pub fn key(node: &str, key: &str) -> String {
    join_path(node, key)
}

pub fn state_path(node: &str) -> String {
    join_path(node, STATE)
}
