//! netvision-core - building blocks of the NetVision debugging tooling
//!
//! The relay hub, the UDP discovery beacon, the viewer sync engine, the adb
//! bridge tracker and the shared data model all live here; the binaries in
//! the sibling crates are thin hosts around these pieces.
//!
//! # Example
//!
//! ```no_run
//! use netvision_core::{RelayHub, RelayHubOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut hub = RelayHub::new(RelayHubOptions { port: 8970 });
//!     hub.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     hub.stop().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod launcher;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod store;
pub mod sync;
pub mod types;

pub use bridge::{BridgeTracker, BridgeTrackerOptions};
pub use config::NetvisionConfig;
pub use discovery::{DiscoveryBeacon, DiscoveryBeaconOptions};
pub use launcher::{open_viewer, TabGuard};
pub use protocol::WireMessage;
pub use registry::DeviceRegistry;
pub use relay::{RelayHub, RelayHubOptions};
pub use store::LogStore;
pub use sync::{ClientEvent, SyncEngine, SyncEngineOptions};
pub use types::{DevicePlatform, DeviceRecord, LogEnvelope};
