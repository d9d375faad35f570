//! DNS gate: per-packet deny decisions against the block-set.
//!
//! The packet pump hands every packet leaving the device through
//! [`DnsGate::examine`]. Plain IPv4/UDP DNS queries for a blocked host never
//! reach the tunnel; instead the gate synthesizes an NXDOMAIN answer that the
//! pump loops straight back into the device. Anything the gate does not
//! understand is forwarded untouched.

use crate::blockset::BlockSetHandle;
use std::sync::Arc;
use tracing::{debug, trace};

const DNS_PORT: u16 = 53;
const IPV4_PROTO_UDP: u8 = 17;
/// DNS flags for the synthesized answer: response, recursion available,
/// RCODE 3 (NXDOMAIN). The query's RD bit is copied in.
const NXDOMAIN_FLAGS: u16 = 0x8083;

/// Outcome of examining one outbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not a blocked DNS query; send through the tunnel.
    Forward,
    /// Blocked: write this synthesized response back into the device.
    Deny(Vec<u8>),
}

/// Inspects outbound packets for DNS queries naming blocked hosts.
pub struct DnsGate {
    blocked: Arc<BlockSetHandle>,
}

impl DnsGate {
    pub fn new(blocked: Arc<BlockSetHandle>) -> Self {
        Self { blocked }
    }

    /// Decide what to do with one packet read from the device.
    pub fn examine(&self, packet: &[u8]) -> Verdict {
        let Some(query) = DnsQuery::parse(packet) else {
            return Verdict::Forward;
        };

        if !self.blocked.snapshot().contains(&query.qname) {
            trace!(host = %query.qname, "dns query allowed");
            return Verdict::Forward;
        }

        debug!(host = %query.qname, "dns query denied");
        Verdict::Deny(query.nxdomain_response(packet))
    }
}

/// The pieces of a parsed IPv4/UDP DNS query we need for a response.
struct DnsQuery {
    ip_header_len: usize,
    /// DNS flags from the query (for the RD bit).
    flags: u16,
    /// Question section bytes (labels + qtype + qclass).
    question_end: usize,
    qname: String,
}

impl DnsQuery {
    /// Parse a packet as an IPv4/UDP DNS query with one question.
    /// Returns `None` for anything else (IPv6, TCP, non-53, malformed).
    fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < 20 || packet[0] >> 4 != 4 {
            return None;
        }
        let ihl = ((packet[0] & 0x0f) as usize) * 4;
        if ihl < 20 || packet.len() < ihl + 8 || packet[9] != IPV4_PROTO_UDP {
            return None;
        }

        let udp = ihl;
        let dst_port = u16::from_be_bytes([packet[udp + 2], packet[udp + 3]]);
        if dst_port != DNS_PORT {
            return None;
        }

        let dns = udp + 8;
        if packet.len() < dns + 12 {
            return None;
        }
        let flags = u16::from_be_bytes([packet[dns + 2], packet[dns + 3]]);
        let qdcount = u16::from_be_bytes([packet[dns + 4], packet[dns + 5]]);
        if flags & 0x8000 != 0 || qdcount != 1 {
            return None;
        }

        // Walk the question labels.
        let mut pos = dns + 12;
        let mut labels: Vec<&[u8]> = Vec::new();
        loop {
            let len = *packet.get(pos)? as usize;
            if len == 0 {
                pos += 1;
                break;
            }
            // Compressed names never appear in a query's own question.
            if len & 0xc0 != 0 {
                return None;
            }
            labels.push(packet.get(pos + 1..pos + 1 + len)?);
            pos += 1 + len;
        }
        // qtype + qclass
        let question_end = pos + 4;
        if packet.len() < question_end {
            return None;
        }

        let qname = labels
            .iter()
            .map(|l| String::from_utf8_lossy(l).to_lowercase())
            .collect::<Vec<_>>()
            .join(".");
        if qname.is_empty() {
            return None;
        }

        Some(Self {
            ip_header_len: ihl,
            flags,
            question_end,
            qname,
        })
    }

    /// Build a full IPv4/UDP/DNS NXDOMAIN response to this query.
    fn nxdomain_response(&self, query_packet: &[u8]) -> Vec<u8> {
        let udp = self.ip_header_len;
        let dns = udp + 8;
        let question = &query_packet[dns + 12..self.question_end];
        let dns_len = 12 + question.len();
        let udp_len = 8 + dns_len;
        let total_len = 20 + udp_len;

        let mut out = Vec::with_capacity(total_len);

        // IPv4 header (no options), source and destination swapped.
        out.push(0x45);
        out.push(0);
        out.extend_from_slice(&(total_len as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0]); // identification
        out.extend_from_slice(&[0x40, 0]); // don't fragment
        out.push(64); // ttl
        out.push(IPV4_PROTO_UDP);
        out.extend_from_slice(&[0, 0]); // checksum, patched below
        out.extend_from_slice(&query_packet[16..20]); // src <- query dst
        out.extend_from_slice(&query_packet[12..16]); // dst <- query src
        let checksum = ipv4_checksum(&out[..20]);
        out[10..12].copy_from_slice(&checksum.to_be_bytes());

        // UDP header, ports swapped; checksum 0 (legal over IPv4).
        out.extend_from_slice(&query_packet[udp + 2..udp + 4]);
        out.extend_from_slice(&query_packet[udp..udp + 2]);
        out.extend_from_slice(&(udp_len as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0]);

        // DNS header: same id, NXDOMAIN flags with the query's RD bit, the
        // original question echoed back, no answer records.
        out.extend_from_slice(&query_packet[dns..dns + 2]);
        out.extend_from_slice(&(NXDOMAIN_FLAGS | (self.flags & 0x0100)).to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        out.extend_from_slice(&[0; 6]); // ancount, nscount, arcount
        out.extend_from_slice(question);

        out
    }
}

/// RFC 791 header checksum.
fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = u16::from_be_bytes([chunk[0], *chunk.get(1).unwrap_or(&0)]);
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
