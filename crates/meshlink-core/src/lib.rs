//! # meshlink core
//!
//! Link-layer reliability and security for low-power wireless mesh nodes.
//!
//! This crate provides:
//! - A single staging buffer for the frame being composed or dissected
//! - Per-neighbor CSMA queues with exponential backoff, retries and ACK priority
//! - ETX and RSSI link quality estimation with freshness tracking
//! - Anti-replay frame counters, optionally suppressed into the MAC seqno
//! - A liveness sweep that deletes unresponsive secured neighbors
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          LinkLayer                               │
//! │   (timer queue on a virtual clock, dispatches every event)      │
//! ├──────────────┬──────────────┬──────────────┬────────────────────┤
//! │     Csma     │ LinkStats    │ AntiReplay   │ Liveness           │
//! │ (queues,     │ (ETX, RSSI,  │ (frame       │ (UPDATE sweep,     │
//! │  backoff)    │  freshness)  │  counters)   │  deletion)         │
//! ├──────────────┴──────────────┴──────────────┴────────────────────┤
//! │                 PacketBuf / Snapshot / Pool                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Rdc (radio duty cycling, external)               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one logical thread. Components never own timers:
//! they return requests that [`LinkLayer`] turns into timer events.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod anti_replay;
pub mod config;
pub mod csma;
pub mod error;
pub mod link_stats;
pub mod liveness;
pub mod neighbor;
pub mod packetbuf;
pub mod pool;
pub mod rdc;
pub mod stack;
pub mod time;

pub use addr::LinkAddr;
pub use anti_replay::{AntiReplay, AntiReplayInfo};
pub use config::{AntiReplayConfig, CsmaConfig, LinkConfig, LinkStatsConfig, LivenessConfig};
pub use csma::{Csma, CsmaStats, QueueState};
pub use error::{ConfigError, Error, NeighborError, PacketBufError, Result, SecurityError, SendError};
pub use link_stats::{LinkStats, LinkStatsTable};
pub use liveness::{Liveness, LivenessAction, LivenessState, LivenessStats};
pub use neighbor::{NeighborTable, SecuredNeighbor, SecuredNeighborTable};
pub use packetbuf::{PACKETBUF_SIZE, PacketAddr, PacketAttr, PacketBuf, Snapshot};
pub use pool::{Handle, Pool};
pub use rdc::{FrameList, QueueId, Rdc, TxStatus};
pub use stack::{Command, InputVerdict, LinkLayer, SendReport, SendTicket};
pub use time::Timestamp;
