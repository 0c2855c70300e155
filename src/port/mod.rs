//! Port layer
//!
//! Two symmetric endpoints around the bus: the client port on the device
//! side, the server port on the compute side. Each is an in-process
//! router between a transport and application code, bound through four
//! small capability traits so the in-process pipe and the bus transport
//! are interchangeable.

mod client;
mod error;
pub mod pipe;
mod server;
mod traits;

pub use client::{
    ClientPort, ClientPortConfig, CommandStream, STATE_REPORT_INTERVAL, STATS_ROUND_INTERVAL,
};
pub use error::PortError;
pub use server::{ServerPort, ServerPortConfig, UplinkData, BUFFERING_DURATION};
pub use traits::{
    DownlinkRx, DownlinkTx, EventSource, MicSource, SpeakerSink, UplinkRx, UplinkTx,
};
