//! Cablegram - Real-time messaging delivery core
//!
//! Cablegram tracks which users are connected from which devices, fans out
//! persisted messages and notifications to the right live connections, and
//! keeps a per-user presence state machine consistent across multiple
//! concurrent connections.
//!
//! ## Architecture
//!
//! ```text
//! Client (TCP frames) → Session Gateway → Delivery Coordinator → recipients
//!                            │                   │
//!                      Presence Registry   Chat Membership Index
//!                            │                   │
//!                      Activity Monitor     Chat Store (memory/postgres)
//! ```
//!
//! The store backend is selected at compile time; exactly one must be enabled.

// Compile-time feature validation: exactly one store backend required
#[cfg(not(any(feature = "postgres", feature = "memory")))]
compile_error!(
    "Cablegram requires a store backend. Enable: --features postgres OR --features memory"
);

// Enforce mutual exclusivity
#[cfg(all(feature = "postgres", feature = "memory"))]
compile_error!("Only one store backend can be enabled. Choose postgres OR memory, not both.");

pub mod activity;
pub mod auth;
pub mod config;
pub mod delivery;
pub mod framing;
pub mod gateway;
pub mod membership;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod store;

pub use activity::ActivityMonitor;
pub use auth::TokenVerifier;
pub use config::Config;
pub use delivery::DeliveryCoordinator;
pub use gateway::SessionGateway;
pub use membership::ChatMembershipIndex;
pub use model::{MessageKind, UserStatus};
pub use presence::{PresenceRegistry, StatusChange};
pub use protocol::{ClientCommand, ServerEvent};
pub use store::ChatStore;

#[cfg(feature = "postgres")]
pub use store::PostgresStore;

#[cfg(feature = "memory")]
pub use store::MemoryStore;
