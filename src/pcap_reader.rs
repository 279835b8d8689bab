use anyhow::{Context, Result};
use pcap::{Capture, Error as PcapError};
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::packet::PacketRecord;

/// Decapsulate one captured frame down to its UDP payload.
///
/// Returns `None` for anything that is not Ethernet/IPv4/UDP with a non-empty
/// payload; such frames are skipped by the caller.
fn decode_frame(data: &[u8]) -> Option<(Ipv4Addr, u16, Vec<u8>)> {
    let ethernet = EthernetPacket::new(data)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }

    let ipv4 = Ipv4Packet::new(ethernet.payload())?;
    if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }

    let udp = UdpPacket::new(ipv4.payload())?;
    let payload = udp.payload();
    if payload.is_empty() {
        return None;
    }

    Some((ipv4.get_destination(), udp.get_destination(), payload.to_vec()))
}

/// Load every usable UDP datagram from a pcap/pcapng file, in capture order.
pub fn load_capture(file_path: &Path) -> Result<Vec<PacketRecord>> {
    debug!("Opening capture file with libpcap: {}", file_path.display());

    let mut capture = Capture::from_file(file_path)
        .with_context(|| format!("Failed to open capture file: {}", file_path.display()))?;

    let mut records = Vec::new();
    let mut frame_count = 0u64;

    loop {
        let frame = match capture.next_packet() {
            Ok(frame) => frame,
            Err(PcapError::NoMorePackets) => break,
            Err(e) => {
                warn!("Error reading frame #{}: {}", frame_count + 1, e);
                continue;
            }
        };

        frame_count += 1;
        let timestamp =
            frame.header.ts.tv_sec as f64 + frame.header.ts.tv_usec as f64 / 1_000_000.0;

        let Some((dest_addr, dest_port, payload)) = decode_frame(frame.data) else {
            debug!("Skipping frame #{} (not IPv4/UDP with payload)", frame_count);
            continue;
        };

        records.push(PacketRecord::new(timestamp, payload, dest_addr, dest_port));
    }

    info!(
        "Loaded {} UDP packets from {} frames in {}",
        records.len(),
        frame_count,
        file_path.display()
    );
    log_summary(&records);

    Ok(records)
}

/// Per-destination breakdown of the loaded capture.
fn log_summary(records: &[PacketRecord]) {
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        warn!("No UDP packets with payload found in capture file");
        return;
    };

    let duration = (last.timestamp - first.timestamp).max(0.0);
    info!("Capture duration: {:.2}s", duration);

    let mut counts: BTreeMap<(Ipv4Addr, u16), u64> = BTreeMap::new();
    for record in records {
        *counts.entry((record.dest_addr, record.dest_port)).or_default() += 1;
    }
    for ((addr, port), count) in &counts {
        info!("  -> {}:{} ({} packets)", addr, port, count);
    }
}
