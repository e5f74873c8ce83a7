//! Delivery sessions
//!
//! Each captured stream is replicated into unicast, multicast and segmented
//! legs, grouped into named sessions and registered with a session server.

pub mod leg;
pub mod multicast;
pub mod orchestrator;
pub mod ports;
pub mod server;

pub use leg::{DeliveryLeg, DeliveryMode, Session};
pub use multicast::MulticastEndpoint;
pub use orchestrator::{DeliveryPlan, SessionOrchestrator};
pub use ports::{PortAllocator, PortPair};
pub use server::SessionServer;
