//! Wire protocol definitions
//!
//! Timestamped compressed-frame format, state and stats events, session
//! commands, and the topic layout they travel on.

mod command;
mod error;
mod frame;
mod state;
mod stats;
mod time;
mod topic;

pub use command::{
    OtaComponent, OtaUpgrade, SessionCommand, SessionCommandEvent, WifiCredentials,
};
pub use error::ProtocolError;
pub use frame::{Frame, StampedFrame, STAMP_HEADER_SIZE, STAMP_VERSION};
pub use state::{State, StateCause, StateEvent, STATE_EVENT_VERSION};
pub use stats::{
    Battery, Brightness, CellularNetwork, ComponentVersion, LightMode, NfcTag, PairStatus,
    Shaking, StatsChanges, StatsEvent, SystemVersion, Volume, WifiNetwork, WifiStore,
    WifiStoreEntry,
};
pub use time::EpochMillis;
pub use topic::{TopicKind, TopicScheme};
