//! In-process Tor network for tests
//!
//! [`LoopbackNetwork`] runs simulated relays on a mock layer so circuits,
//! streams, directory downloads and hidden services can be exercised
//! without touching the real network.

pub mod documents;
pub mod relay;

pub use documents::{RelayKeys, RelaySpec};
pub use relay::LoopbackNetwork;
