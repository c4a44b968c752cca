//! Frame decoding.
//!
//! Datagrams from the exporter are first unwrapped by [`ExportReader`] (pcap
//! global header and per-datagram pcap records), then [`decode`] slices the
//! link, IPv4 and transport headers to recover the application payload.
//!
//! Only IPv4 is supported at the network layer. Everything else is
//! [`Dropped`] with a diagnostic; nothing here returns an error.

use std::fmt;

use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use pcap_parser::{parse_pcap_frame, parse_pcap_frame_be, parse_pcap_header};
use serde::{Deserialize, Serialize};

use crate::model::{AppTag, DecodedPacket, LinkType, RawFrame, Transport};

/// Well-known EtherTypes.
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const VLAN: u16 = 0x8100;
    pub const QINQ: u16 = 0x88A8;
    pub const VLAN_DOUBLE: u16 = 0x9100;
}

/// IP protocol numbers.
mod ip_proto {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

const VLAN_TAG_LEN: usize = 4;
const PCAP_HEADER_LEN: usize = 24;

/// PCAPdroid trailer: magic, uid, app name, fcs.
const TRAILER_MAGIC: u32 = 0x0107_2021;
const TRAILER_LEN: usize = 32;
const TRAILER_APPNAME_LEN: usize = 20;

/// Why a frame did not become a [`DecodedPacket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dropped {
    /// Frame shorter than the header being sliced.
    Truncated { layer: &'static str },
    /// Link type other than Ethernet or raw IP.
    UnsupportedLink(LinkType),
    /// Ethernet frame carrying something other than IPv4.
    NonIpv4 { ether_type: u16 },
    /// Raw IP frame with a version nibble other than 4.
    IpVersion(u8),
    /// Header present but inconsistent.
    Malformed { layer: &'static str, reason: String },
    /// Nothing but whitespace or control bytes after the headers.
    EmptyPayload,
}

impl Dropped {
    fn report(&self) {
        match self {
            Dropped::NonIpv4 { .. } | Dropped::IpVersion(_) => {
                log::warn!("Received non-IPv4 packet ({})", self)
            }
            Dropped::EmptyPayload => log::trace!("Skipping frame: {}", self),
            _ => log::debug!("Dropping frame: {}", self),
        }
    }
}

impl fmt::Display for Dropped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dropped::Truncated { layer } => write!(f, "{layer} header truncated"),
            Dropped::UnsupportedLink(link) => write!(f, "unsupported link type {link:?}"),
            Dropped::NonIpv4 { ether_type } => write!(f, "ethertype {ether_type:#06x}"),
            Dropped::IpVersion(v) => write!(f, "IP version {v}"),
            Dropped::Malformed { layer, reason } => write!(f, "malformed {layer}: {reason}"),
            Dropped::EmptyPayload => f.write_str("empty payload"),
        }
    }
}

/// Decode one frame into addresses and payload.
///
/// Deterministic in the frame bytes and link type. Drops are logged here and
/// returned as `Err`; callers are expected to count them and move on.
pub fn decode(frame: &RawFrame<'_>) -> Result<DecodedPacket, Dropped> {
    let result = decode_frame(frame);
    if let Err(dropped) = &result {
        dropped.report();
    }
    result
}

fn decode_frame(frame: &RawFrame<'_>) -> Result<DecodedPacket, Dropped> {
    let (ip, from_ethernet) = match frame.link_type {
        LinkType::Ethernet => (strip_ethernet(frame.data)?, true),
        LinkType::RawIp => {
            let version = frame
                .data
                .first()
                .map(|b| b >> 4)
                .ok_or(Dropped::Truncated { layer: "IPv4" })?;
            if version != 4 {
                return Err(Dropped::IpVersion(version));
            }
            (frame.data, false)
        }
        other => return Err(Dropped::UnsupportedLink(other)),
    };

    let ipv4 = Ipv4HeaderSlice::from_slice(ip).map_err(|e| Dropped::Malformed {
        layer: "IPv4",
        reason: e.to_string(),
    })?;
    let header_len = ipv4.slice().len();
    let total_len = usize::from(ipv4.total_len());
    if total_len < header_len {
        return Err(Dropped::Malformed {
            layer: "IPv4",
            reason: format!("total length {total_len} below header length {header_len}"),
        });
    }
    // Snaplen may have cut the packet short; keep what was captured.
    let ip_end = total_len.min(ip.len());
    let ip_payload = &ip[header_len..ip_end];

    let first_fragment = ipv4.fragments_offset().value() == 0;
    let (transport, payload) = match ipv4.protocol().0 {
        ip_proto::TCP if first_fragment => {
            let tcp = TcpHeaderSlice::from_slice(ip_payload).map_err(|e| Dropped::Malformed {
                layer: "TCP",
                reason: e.to_string(),
            })?;
            let transport = Transport::Tcp {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
            };
            (transport, &ip_payload[tcp.slice().len()..])
        }
        ip_proto::UDP if first_fragment => {
            let udp = UdpHeaderSlice::from_slice(ip_payload).map_err(|_| Dropped::Truncated {
                layer: "UDP",
            })?;
            let transport = Transport::Udp {
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
            };
            (transport, &ip_payload[udp.slice().len()..])
        }
        proto => (Transport::Other(proto), ip_payload),
    };

    if is_blank(payload) {
        return Err(Dropped::EmptyPayload);
    }

    let app = if from_ethernet {
        parse_trailer(&ip[ip_end..])
    } else {
        None
    };

    Ok(DecodedPacket {
        timestamp: frame.received_at,
        source: ipv4.source_addr(),
        destination: ipv4.destination_addr(),
        transport,
        payload: payload.to_vec(),
        app,
    })
}

/// Nothing but spaces and control characters, e.g. a keepalive's lone NUL.
fn is_blank(payload: &[u8]) -> bool {
    String::from_utf8_lossy(payload)
        .trim_matches(|c: char| c <= ' ')
        .is_empty()
}

/// Skip the Ethernet header and any VLAN tags, returning the IPv4 packet.
fn strip_ethernet(data: &[u8]) -> Result<&[u8], Dropped> {
    let eth = Ethernet2HeaderSlice::from_slice(data).map_err(|_| Dropped::Truncated {
        layer: "Ethernet",
    })?;
    let mut ether_type = eth.ether_type().0;
    let mut offset = eth.slice().len();

    while matches!(
        ether_type,
        ethertype::VLAN | ethertype::QINQ | ethertype::VLAN_DOUBLE
    ) {
        let tag = data
            .get(offset..offset + VLAN_TAG_LEN)
            .ok_or(Dropped::Truncated { layer: "VLAN" })?;
        ether_type = u16::from_be_bytes([tag[2], tag[3]]);
        offset += VLAN_TAG_LEN;
    }

    if ether_type != ethertype::IPV4 {
        return Err(Dropped::NonIpv4 { ether_type });
    }
    Ok(&data[offset..])
}

/// Parse a PCAPdroid trailer from the bytes following the IP packet.
fn parse_trailer(rest: &[u8]) -> Option<AppTag> {
    if rest.len() < TRAILER_LEN {
        return None;
    }
    let trailer = &rest[rest.len() - TRAILER_LEN..];
    let magic = u32::from_be_bytes(trailer[0..4].try_into().ok()?);
    if magic != TRAILER_MAGIC {
        return None;
    }
    let uid = i32::from_be_bytes(trailer[4..8].try_into().ok()?);
    let name_bytes = &trailer[8..8 + TRAILER_APPNAME_LEN];
    let name_len = name_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(TRAILER_APPNAME_LEN);
    let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
    Some(AppTag { uid, name })
}

/// How the exporter frames each datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// pcap global header once, then one pcap record per datagram.
    #[default]
    Pcap,
    /// Each datagram is a bare Ethernet frame.
    Raw,
}

/// What one datagram turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record<'a> {
    /// A pcap global header; no frame to decode.
    Header { link_type: LinkType },
    /// A captured frame and the link type it was captured on.
    Frame { data: &'a [u8], link_type: LinkType },
    /// Neither a header nor a well-formed record.
    Invalid,
}

/// Per-stream datagram unwrapper. Remembers the byte order and link type
/// announced by the last pcap global header.
#[derive(Debug, Clone)]
pub struct ExportReader {
    format: ExportFormat,
    big_endian: bool,
    link_type: LinkType,
}

impl ExportReader {
    pub fn new(format: ExportFormat) -> Self {
        Self {
            format,
            big_endian: false,
            link_type: LinkType::Ethernet,
        }
    }

    pub fn read<'a>(&mut self, datagram: &'a [u8]) -> Record<'a> {
        if self.format == ExportFormat::Raw {
            return Record::Frame {
                data: datagram,
                link_type: LinkType::Ethernet,
            };
        }

        if datagram.len() == PCAP_HEADER_LEN {
            if let Ok((_, header)) = parse_pcap_header(datagram) {
                self.big_endian = header.is_bigendian();
                self.link_type = LinkType::from_pcap(header.network.0);
                log::info!(
                    "Exporter stream header: pcap v{}.{}, link type {:?}, snaplen {}",
                    header.version_major,
                    header.version_minor,
                    self.link_type,
                    header.snaplen
                );
                return Record::Header {
                    link_type: self.link_type,
                };
            }
        }

        let parsed = if self.big_endian {
            parse_pcap_frame_be(datagram)
        } else {
            parse_pcap_frame(datagram)
        };
        match parsed {
            Ok((_, block)) => Record::Frame {
                data: block.data,
                link_type: self.link_type,
            },
            Err(e) => {
                log::debug!("Datagram of {} bytes is not a pcap record: {:?}", datagram.len(), e);
                Record::Invalid
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;
    use std::net::Ipv4Addr;

    const SRC_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 1];
    const DST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 2];

    fn tcp_frame(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4([10, 0, 0, 5], [93, 184, 216, 34], 64)
            .tcp(40000, 80, 1, 65535);
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        out
    }

    fn pcap_record(frame: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
        out
    }

    fn pcap_header(linktype: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&linktype.to_le_bytes());
        out
    }

    #[test]
    fn test_decode_tcp_payload() {
        let bytes = tcp_frame(b"GET / HTTP/1.1\r\n");
        let packet = decode(&RawFrame::ethernet(&bytes)).unwrap();
        assert_eq!(packet.source, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(packet.destination, Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(
            packet.transport,
            Transport::Tcp {
                src_port: 40000,
                dst_port: 80
            }
        );
        assert_eq!(packet.payload_text(), "GET / HTTP/1.1\r\n");
        assert_eq!(packet.app, None);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let bytes = tcp_frame(b"same bytes");
        let frame = RawFrame::ethernet(&bytes);
        assert_eq!(decode(&frame), decode(&frame));
    }

    #[test]
    fn test_decode_udp_payload() {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4([192, 168, 1, 1], [192, 168, 1, 2], 20)
            .udp(5353, 53);
        let mut bytes = Vec::new();
        builder.write(&mut bytes, b"query").unwrap();

        let packet = decode(&RawFrame::ethernet(&bytes)).unwrap();
        assert_eq!(
            packet.transport,
            Transport::Udp {
                src_port: 5353,
                dst_port: 53
            }
        );
        assert_eq!(packet.payload, b"query");
    }

    #[test]
    fn test_ipv6_frame_is_dropped() {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv6([1; 16], [2; 16], 64)
            .udp(1000, 2000);
        let mut bytes = Vec::new();
        builder.write(&mut bytes, b"hello v6").unwrap();

        assert_eq!(
            decode(&RawFrame::ethernet(&bytes)),
            Err(Dropped::NonIpv4 { ether_type: 0x86DD })
        );
    }

    #[test]
    fn test_arp_frame_is_dropped() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&DST_MAC);
        bytes.extend_from_slice(&SRC_MAC);
        bytes.extend_from_slice(&0x0806u16.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 28]);
        assert_eq!(
            decode(&RawFrame::ethernet(&bytes)),
            Err(Dropped::NonIpv4 { ether_type: 0x0806 })
        );
    }

    #[test]
    fn test_whitespace_payload_is_suppressed() {
        for payload in [&b""[..], b"   ", b"\r\n\t \n", b"\0", &[0x01, 0x1f, b' ']] {
            let bytes = tcp_frame(payload);
            assert_eq!(
                decode(&RawFrame::ethernet(&bytes)),
                Err(Dropped::EmptyPayload)
            );
        }
    }

    #[test]
    fn test_control_bytes_around_text_are_kept() {
        let bytes = tcp_frame(b"\0ping\x01");
        let packet = decode(&RawFrame::ethernet(&bytes)).unwrap();
        assert_eq!(packet.payload, b"\0ping\x01");
    }

    #[test]
    fn test_truncated_frames_are_dropped() {
        let bytes = tcp_frame(b"payload");
        assert_eq!(
            decode(&RawFrame::ethernet(&bytes[..10])),
            Err(Dropped::Truncated { layer: "Ethernet" })
        );
        assert!(matches!(
            decode(&RawFrame::ethernet(&bytes[..20])),
            Err(Dropped::Malformed { layer: "IPv4", .. })
        ));
    }

    #[test]
    fn test_vlan_tag_is_skipped() {
        let plain = tcp_frame(b"tagged");
        let mut bytes = plain[..12].to_vec();
        bytes.extend_from_slice(&ethertype::VLAN.to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x0a]);
        bytes.extend_from_slice(&plain[12..]);

        let packet = decode(&RawFrame::ethernet(&bytes)).unwrap();
        assert_eq!(packet.payload, b"tagged");
    }

    #[test]
    fn test_raw_ip_link() {
        let builder = PacketBuilder::ipv4([10, 1, 1, 1], [10, 1, 1, 2], 64).udp(1, 2);
        let mut bytes = Vec::new();
        builder.write(&mut bytes, b"raw").unwrap();

        let frame = RawFrame::new(&bytes, chrono::Local::now(), LinkType::RawIp);
        assert_eq!(decode(&frame).unwrap().payload, b"raw");

        let frame = RawFrame::new(&bytes, chrono::Local::now(), LinkType::Other(113));
        assert_eq!(
            decode(&frame),
            Err(Dropped::UnsupportedLink(LinkType::Other(113)))
        );
    }

    #[test]
    fn test_trailer_is_parsed_and_excluded_from_payload() {
        let mut bytes = tcp_frame(b"hello");
        bytes.extend_from_slice(&TRAILER_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&10123i32.to_be_bytes());
        let mut name = [0u8; TRAILER_APPNAME_LEN];
        name[..11].copy_from_slice(b"com.example");
        bytes.extend_from_slice(&name);
        bytes.extend_from_slice(&0u32.to_be_bytes());

        let packet = decode(&RawFrame::ethernet(&bytes)).unwrap();
        assert_eq!(packet.payload, b"hello");
        assert_eq!(
            packet.app,
            Some(AppTag {
                uid: 10123,
                name: "com.example".to_string()
            })
        );
    }

    #[test]
    fn test_padding_without_trailer_magic() {
        let mut bytes = tcp_frame(b"hi");
        bytes.extend_from_slice(&[0u8; 40]);
        let packet = decode(&RawFrame::ethernet(&bytes)).unwrap();
        assert_eq!(packet.payload, b"hi");
        assert_eq!(packet.app, None);
    }

    #[test]
    fn test_export_reader_pcap_stream() {
        let mut reader = ExportReader::new(ExportFormat::Pcap);
        assert_eq!(
            reader.read(&pcap_header(1)),
            Record::Header {
                link_type: LinkType::Ethernet
            }
        );

        let frame = tcp_frame(b"inside a record");
        let datagram = pcap_record(&frame);
        match reader.read(&datagram) {
            Record::Frame { data, link_type } => {
                assert_eq!(data, &frame[..]);
                assert_eq!(link_type, LinkType::Ethernet);
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_export_reader_remembers_link_type() {
        let mut reader = ExportReader::new(ExportFormat::Pcap);
        reader.read(&pcap_header(101));
        let datagram = pcap_record(&[0x45, 0, 0, 20]);
        assert!(matches!(
            reader.read(&datagram),
            Record::Frame {
                link_type: LinkType::RawIp,
                ..
            }
        ));
    }

    #[test]
    fn test_export_reader_rejects_short_datagram() {
        let mut reader = ExportReader::new(ExportFormat::Pcap);
        assert_eq!(reader.read(&[1, 2, 3]), Record::Invalid);
    }

    #[test]
    fn test_export_reader_raw_passthrough() {
        let mut reader = ExportReader::new(ExportFormat::Raw);
        let frame = tcp_frame(b"x");
        assert_eq!(
            reader.read(&frame),
            Record::Frame {
                data: &frame[..],
                link_type: LinkType::Ethernet
            }
        );
    }
}
