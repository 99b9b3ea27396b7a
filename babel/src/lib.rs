//! A Babel routing-protocol speaker (RFC 8966).
//!
//! A [`Speaker`] discovers neighbours on its attached links over IPv6
//! multicast, measures link cost with the Hello/IHU exchange, exchanges
//! distance-vector route advertisements and maintains a loop-free table of
//! selected routes. The wire codec lives in the [`proto`]
//! (`babel-proto`) crate.
//!
//! ```no_run
//! use babel::{Speaker, SpeakerConfig};
//!
//! # async fn run() -> Result<(), babel::Error> {
//! let speaker = Speaker::new(SpeakerConfig {
//!     multicast: true,
//!     ..Default::default()
//! })
//! .await?;
//! // ...
//! speaker.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Installing selected routes into the kernel forwarding table is the
//! caller's business, driven through the [`Handler`] callbacks and
//! [`Speaker::routes`].

use thiserror::Error as ThisError;

mod config;
mod deadline;
mod history;
mod interface;
mod neighbour;
mod net;
mod queue;
mod route;
mod speaker;

pub use babel_proto as proto;

pub use config::{
    Handler, InterfaceFilter, InterfaceInfo, NeighbourInfo, Parameters, RouteFilter, RouteInfo,
    SpeakerConfig,
};
pub use deadline::Deadline;
pub use history::HelloHistory;
pub use interface::Interface;
pub use neighbour::Neighbour;
pub use queue::PacketSink;
pub use speaker::Speaker;

/// Speaker-level failures.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Proto(#[from] babel_proto::Error),
}
