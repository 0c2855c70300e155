//! gearlink - Real-time audio and control plane for edge gears
//!
//! This library carries bidirectional voice and control traffic between
//! small edge devices ("gears") and a compute server over a topic-based
//! pub/sub bus: stamped compressed frames uplink, a mixed and paced
//! synthesized downlink, plus state transitions, tiered device stats,
//! and asynchronous control commands.

pub mod audio;
pub mod bus;
pub mod config;
pub mod port;
pub mod protocol;

pub use bus::{Listener, ListenerConfig};
pub use port::{ClientPort, ServerPort};
pub use protocol::{Frame, StampedFrame};
