//! DNS destination NAT
//!
//! Diverts every tunneled DNS query to a forced nameserver and rewrites
//! matching answers back to the address the application originally asked,
//! keyed by the DNS transaction id. Pending entries expire after 60
//! seconds.

use crate::rewrite::Rewriter;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;

const DNS_PORT: u16 = 53;
const DNS_TIMEOUT: Duration = Duration::from_secs(60);

const IPV4_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;
const DNS_HEADER: usize = 12;
const PROTO_UDP: u8 = 17;

struct PendingQuery {
    original_dst: Ipv4Addr,
    time: Instant,
}

pub struct DnsRewriter {
    force_nameserver: Ipv4Addr,
    records: HashMap<u16, PendingQuery>,
}

impl DnsRewriter {
    pub fn new(force_nameserver: Ipv4Addr) -> Self {
        DnsRewriter {
            force_nameserver,
            records: HashMap::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.records.len()
    }
}

impl Rewriter for DnsRewriter {
    fn name(&self) -> &str {
        "dns"
    }

    fn rewrite(&mut self, packet: &[u8]) -> crate::Result<Option<Vec<u8>>> {
        let view = match DnsView::parse(packet) {
            Some(view) => view,
            None => return Ok(None),
        };

        if !view.is_response && view.dst_port == DNS_PORT {
            self.records.insert(
                view.dns_id,
                PendingQuery {
                    original_dst: view.dst,
                    time: Instant::now(),
                },
            );
            tracing::debug!(
                "rewriting DNS query {:#06x}: {} to {}",
                view.dns_id,
                view.dst,
                self.force_nameserver
            );
            Ok(Some(view.with_dst(packet, self.force_nameserver)))
        } else if view.is_response && view.src_port == DNS_PORT {
            match self.records.remove(&view.dns_id) {
                Some(record) => {
                    tracing::debug!(
                        "rewriting DNS answer {:#06x}: {} to {}",
                        view.dns_id,
                        view.src,
                        record.original_dst
                    );
                    Ok(Some(view.with_src(packet, record.original_dst)))
                }
                None => Ok(None),
            }
        } else {
            Ok(None)
        }
    }

    fn sweep(&mut self) {
        self.records
            .retain(|_, record| record.time.elapsed() <= DNS_TIMEOUT);
    }
}

/// The handful of fields this rewriter needs from an IPv4/UDP/DNS packet
struct DnsView {
    ihl: usize,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    dns_id: u16,
    is_response: bool,
}

impl DnsView {
    fn parse(packet: &[u8]) -> Option<DnsView> {
        if packet.len() < IPV4_MIN_HEADER {
            return None;
        }
        if packet[0] >> 4 != 4 {
            return None;
        }
        let ihl = ((packet[0] & 0x0f) as usize) * 4;
        if ihl < IPV4_MIN_HEADER || packet.len() < ihl + UDP_HEADER + DNS_HEADER {
            return None;
        }
        if packet[9] != PROTO_UDP {
            return None;
        }

        let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
        let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
        let src_port = u16::from_be_bytes([packet[ihl], packet[ihl + 1]]);
        let dst_port = u16::from_be_bytes([packet[ihl + 2], packet[ihl + 3]]);
        if src_port != DNS_PORT && dst_port != DNS_PORT {
            return None;
        }

        let dns = ihl + UDP_HEADER;
        let dns_id = u16::from_be_bytes([packet[dns], packet[dns + 1]]);
        let is_response = packet[dns + 2] & 0x80 != 0;

        Some(DnsView {
            ihl,
            src,
            dst,
            src_port,
            dst_port,
            dns_id,
            is_response,
        })
    }

    fn with_dst(&self, packet: &[u8], dst: Ipv4Addr) -> Vec<u8> {
        let mut data = packet.to_vec();
        data[16..20].copy_from_slice(&dst.octets());
        self.fix_checksums(&mut data);
        data
    }

    fn with_src(&self, packet: &[u8], src: Ipv4Addr) -> Vec<u8> {
        let mut data = packet.to_vec();
        data[12..16].copy_from_slice(&src.octets());
        self.fix_checksums(&mut data);
        data
    }

    fn fix_checksums(&self, data: &mut [u8]) {
        data[10] = 0;
        data[11] = 0;
        let checksum = ipv4_checksum(&data[..self.ihl]);
        data[10..12].copy_from_slice(&checksum.to_be_bytes());
        // a zero UDP checksum means "not computed" on IPv4
        data[self.ihl + 6] = 0;
        data[self.ihl + 7] = 0;
    }
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            (chunk[0] as u16) << 8
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
