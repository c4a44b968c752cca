//! Receiver for frames exported over UDP by a packet capture tool.
//!
//! Datagrams are unwrapped and decoded down to the IPv4 transport payload
//! ([`decoder`]), optionally reduced to a marker match ([`pattern`]), and
//! collected into a bounded log that is flushed to a sink at most once per
//! tick ([`aggregator`]). [`session::CaptureSession`] wires the pieces
//! together for one capture run.

pub mod aggregator;
pub mod config;
pub mod decoder;
pub mod error;
pub mod forward;
pub mod model;
pub mod network;
pub mod pattern;
pub mod session;

pub use aggregator::{AggregatorHandle, Flush, LogAggregator, LogBuffer};
pub use config::{Config, Mode};
pub use decoder::{decode, Dropped, ExportFormat, ExportReader};
pub use error::{Error, Result};
pub use forward::{ForwardNotice, Forwarder};
pub use model::{DecodedPacket, ExporterStats, LinkType, LogEntry, RawFrame, Transport};
pub use network::{ListenerConfig, ListenerStats, PacketListener};
pub use pattern::PatternExtractor;
pub use session::{CaptureSession, SessionReport, TextSink};
