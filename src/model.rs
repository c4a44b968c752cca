// src/model.rs
use std::borrow::Cow;
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Local};

/// Link layer a frame was captured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Bare IP packet, no link header.
    RawIp,
    /// Anything else the exporter announced (pcap LINKTYPE value).
    Other(i32),
}

impl LinkType {
    /// Map a pcap LINKTYPE value.
    pub fn from_pcap(linktype: i32) -> Self {
        match linktype {
            1 => LinkType::Ethernet,
            // LINKTYPE_RAW, LINKTYPE_IPV4
            101 | 228 => LinkType::RawIp,
            other => LinkType::Other(other),
        }
    }
}

/// One frame as received off the transport. Borrows the receive buffer and
/// lives only for a single pass through the decoder.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    pub received_at: DateTime<Local>,
    pub link_type: LinkType,
}

impl<'a> RawFrame<'a> {
    pub fn new(data: &'a [u8], received_at: DateTime<Local>, link_type: LinkType) -> Self {
        Self {
            data,
            received_at,
            link_type,
        }
    }

    /// An Ethernet frame stamped with the current time.
    pub fn ethernet(data: &'a [u8]) -> Self {
        Self::new(data, Local::now(), LinkType::Ethernet)
    }
}

/// Transport-layer summary of a decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
    /// Any other IPv4 protocol number; the payload is the whole IP payload.
    Other(u8),
}

/// Application tag carried in a PCAPdroid trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppTag {
    pub uid: i32,
    pub name: String,
}

/// A frame that parsed as IPv4 and carried a non-blank payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub timestamp: DateTime<Local>,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub transport: Transport,
    pub payload: Vec<u8>,
    pub app: Option<AppTag>,
}

impl DecodedPacket {
    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A formatted, immutable log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry(String);

impl LogEntry {
    /// `[HH:MM:SS] src → dst\npayload\n\n`
    pub fn packet(packet: &DecodedPacket) -> Self {
        Self(format!(
            "[{}] {} → {}\n{}\n\n",
            packet.timestamp.format("%H:%M:%S"),
            packet.source,
            packet.destination,
            packet.payload_text()
        ))
    }

    /// One extracted match per line.
    pub fn matched(value: &str) -> Self {
        Self(format!("{value}\n"))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counters reported by the external capture tool when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packets_dropped: u32,
    pub bytes_dumped: u64,
}

impl ExporterStats {
    pub fn to_entry(&self) -> LogEntry {
        LogEntry(format!(
            "*** CAPTURE STATISTICS ***\n\
             Bytes sent: {}\n\
             Bytes received: {}\n\
             Packets sent: {}\n\
             Packets received: {}\n\
             Packets dropped: {}\n\
             PCAP dump size: {}\n\n",
            self.bytes_sent,
            self.bytes_received,
            self.packets_sent,
            self.packets_received,
            self.packets_dropped,
            self.bytes_dumped
        ))
    }
}
