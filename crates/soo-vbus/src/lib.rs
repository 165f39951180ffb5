//! VBus - split-device connections between domains
//!
//! A split device has a frontend in a Mobile Entity and a backend in the
//! Agency. Both ends publish their connection state in the store and watch
//! each other's; the transition table decides what each end does next. The
//! frontend owns a shared ring page, grants it to the backend and reserves
//! an event channel; the backend maps the page and binds to the channel.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────┐          ┌────────────────────────────┐
//! │  Bus (ME domain)           │          │  Bus (Agency)              │
//! │   frontend VbusDevice      │          │   backend VbusDevice       │
//! │    FrontRing ─ gref ───────┼──grant──►│    mapping ─ BackRing      │
//! │    evtchn ─────────────────┼──bind───►│    evtchn                  │
//! └─────────────┬──────────────┘          └──────────────┬─────────────┘
//!               │ /device/<d>/<t>/<i>/state              │
//!               └──────────────► Store ◄─────────────────┘
//!                        /backend/<t>/<d>/<i>/state
//! ```
//!
//! # Module Organization
//!
//! - `state` - Connection states and endpoint roles
//! - `transition` - The (role, local, peer) reaction table
//! - `processing` - Data-path gate drained by suspend
//! - `ring` - Request/response ring laid out in a granted page
//! - `paths` - Store paths and keys of split devices
//! - `lifecycle` - Driver callbacks
//! - `device` - One endpoint and its resources
//! - `bus` - Per-domain device registry and migration entry points
//! - `config` - Bus configuration

pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod paths;
pub mod processing;
pub mod ring;
pub mod state;
pub mod transition;

pub use bus::Bus;
pub use config::VbusConfig;
pub use device::VbusDevice;
pub use error::VbusError;
pub use lifecycle::DeviceLifecycle;
pub use processing::{ProcessingGate, ProcessingGuard};
pub use ring::{BackRing, FrontRing, MAX_PAYLOAD, RING_SIZE};
pub use state::{Role, VbusState};
pub use transition::{react, target_state, Reaction};
