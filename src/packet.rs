use std::net::Ipv4Addr;

/// One decoded datagram from the capture file. Immutable after load.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub timestamp: f64,      // Capture timestamp (seconds since epoch)
    pub payload: Vec<u8>,    // UDP payload, never empty
    pub dest_addr: Ipv4Addr, // Captured destination (multicast group)
    pub dest_port: u16,
}

impl PacketRecord {
    pub fn new(timestamp: f64, payload: Vec<u8>, dest_addr: Ipv4Addr, dest_port: u16) -> Self {
        Self {
            timestamp,
            payload,
            dest_addr,
            dest_port,
        }
    }
}
