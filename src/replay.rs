use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::faults::FaultInjector;
use crate::igmp::Membership;
use crate::net::Transmit;
use crate::packet::PacketRecord;
use crate::rtp;

/// How many records between refreshes of the fan-out target set.
const TARGET_REFRESH_RECORDS: usize = 500;
/// Waits shorter than this are skipped; scheduler jitter exceeds them.
const MIN_WAIT: Duration = Duration::from_millis(1);
/// Membership poll cadence while idle.
const IDLE_POLL: Duration = Duration::from_millis(100);
/// Pause between passes in standard (non-continuous) mode.
const INTER_PASS_PAUSE: Duration = Duration::from_secs(3);

/// Cumulative counters for the process lifetime, shared with the stats
/// reporter task.
#[derive(Default)]
pub struct ReplayStats {
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_reordered: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub passes: AtomicU64,
}

pub struct ReplayConfig {
    /// Timing divisor: 2.0 replays twice as fast as captured.
    pub speed: f64,
    /// No inter-pass pause, RTP sequence numbers patched for continuity.
    pub continuous: bool,
}

/// A delayed packet awaiting release.
///
/// Carries the fan-out targets snapshotted when it was delayed; targets that
/// leave before the release time still receive it. Deliberate simplification.
struct ReorderEntry {
    release_at: Instant,
    payload: Vec<u8>,
    dest_port: u16,
    targets: Arc<Vec<Ipv4Addr>>,
}

pub struct ReplayEngine<T: Transmit> {
    records: Vec<PacketRecord>,
    /// Speed-scaled playout offset of each record relative to the first.
    offsets: Vec<Duration>,
    membership: Arc<Membership>,
    faults: FaultInjector,
    transmit: T,
    stats: Arc<ReplayStats>,
    running: Arc<AtomicBool>,
    config: ReplayConfig,
    /// Continuous mode: accumulated sequence offset per destination port.
    seq_offsets: HashMap<u16, u16>,
    reorder_buffer: Vec<ReorderEntry>,
}

impl<T: Transmit> ReplayEngine<T> {
    pub fn new(
        records: Vec<PacketRecord>,
        config: ReplayConfig,
        membership: Arc<Membership>,
        faults: FaultInjector,
        transmit: T,
        stats: Arc<ReplayStats>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let base = records.first().map(|r| r.timestamp).unwrap_or(0.0);
        let offsets = records
            .iter()
            .map(|r| Duration::from_secs_f64(((r.timestamp - base) / config.speed).max(0.0)))
            .collect();

        Self {
            records,
            offsets,
            membership,
            faults,
            transmit,
            stats,
            running,
            config,
            seq_offsets: HashMap::new(),
            reorder_buffer: Vec::new(),
        }
    }

    /// Idle/replaying loop. Returns when the running flag clears.
    pub fn run(mut self) {
        info!("Waiting for IGMP join on {}...", self.destination_list());

        let mut was_replaying = false;
        while self.running.load(Ordering::Relaxed) {
            if !self.membership.any_joined() {
                if was_replaying {
                    info!("All groups left, waiting for join...");
                    was_replaying = false;
                }
                thread::sleep(IDLE_POLL);
                continue;
            }
            was_replaying = true;

            let pass = self.stats.passes.fetch_add(1, Ordering::Relaxed) + 1;
            let pass_start = Instant::now();
            let sent = self.run_pass();
            info!(
                "Pass {}: {} packets in {:.2}s",
                pass,
                sent,
                pass_start.elapsed().as_secs_f64()
            );

            if !self.config.continuous {
                self.pause_between_passes();
            }
        }
    }

    /// One traversal of the record sequence. Returns packets sent, counting
    /// each fan-out send.
    fn run_pass(&mut self) -> u64 {
        let pass_start = Instant::now();
        let mut targets = Arc::new(self.membership.joined_targets());
        let mut pass_sent = 0u64;
        // Continuous mode: RTP records sent this pass, keyed by port.
        let mut rtp_sent_by_port: HashMap<u16, u64> = HashMap::new();

        for index in 0..self.records.len() {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            // Bounded-staleness refresh of the fan-out targets. An empty
            // joined set ends the pass and drops the engine back to idle.
            if index > 0 && index % TARGET_REFRESH_RECORDS == 0 {
                let current = self.membership.joined_targets();
                if current.is_empty() {
                    debug!("All destinations left, ending pass at record {}", index);
                    break;
                }
                targets = Arc::new(current);
            }

            let dest_addr = self.records[index].dest_addr;
            let dest_port = self.records[index].dest_port;

            // Watched destination currently down: skip, no wait.
            if self.membership.is_gated(dest_addr) {
                continue;
            }

            // Hold until this record's playout offset (monotonic clock).
            let due = pass_start + self.offsets[index];
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait >= MIN_WAIT {
                    thread::sleep(wait);
                }
            }

            pass_sent += self.release_due_entries();

            if self.faults.should_drop() {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let seq_offset = if self.config.continuous {
                self.seq_offsets.get(&dest_port).copied().unwrap_or(0)
            } else {
                0
            };
            let is_rtp = rtp::is_rtp(&self.records[index].payload);

            if let Some(delay) = self.faults.reorder_delay() {
                let mut payload = self.records[index].payload.clone();
                rtp::apply_sequence_offset(&mut payload, seq_offset);
                self.reorder_buffer.push(ReorderEntry {
                    release_at: Instant::now() + delay,
                    payload,
                    dest_port,
                    targets: targets.clone(),
                });
                self.stats.packets_reordered.fetch_add(1, Ordering::Relaxed);
                // Delayed entries are always sent before the pass ends.
                if self.config.continuous && is_rtp {
                    *rtp_sent_by_port.entry(dest_port).or_default() += 1;
                }
                continue;
            }

            if seq_offset != 0 && is_rtp {
                let mut patched = self.records[index].payload.clone();
                rtp::apply_sequence_offset(&mut patched, seq_offset);
                pass_sent +=
                    send_fanout(&self.transmit, &self.stats, &patched, dest_port, &targets);
            } else {
                pass_sent += send_fanout(
                    &self.transmit,
                    &self.stats,
                    &self.records[index].payload,
                    dest_port,
                    &targets,
                );
            }
            if self.config.continuous && is_rtp {
                *rtp_sent_by_port.entry(dest_port).or_default() += 1;
            }
        }

        pass_sent += self.flush_reorder_buffer();

        if self.config.continuous {
            for (port, count) in rtp_sent_by_port {
                let offset = self.seq_offsets.entry(port).or_insert(0);
                *offset = offset.wrapping_add(count as u16);
            }
        }

        pass_sent
    }

    /// Send every buffered packet whose release time has passed.
    fn release_due_entries(&mut self) -> u64 {
        if self.reorder_buffer.is_empty() {
            return 0;
        }
        let now = Instant::now();
        let mut sent = 0;
        let mut index = 0;
        while index < self.reorder_buffer.len() {
            if now >= self.reorder_buffer[index].release_at {
                let entry = self.reorder_buffer.swap_remove(index);
                sent += send_fanout(
                    &self.transmit,
                    &self.stats,
                    &entry.payload,
                    entry.dest_port,
                    &entry.targets,
                );
            } else {
                index += 1;
            }
        }
        sent
    }

    /// Pass end: send everything still buffered, ignoring release times.
    fn flush_reorder_buffer(&mut self) -> u64 {
        let mut sent = 0;
        for entry in std::mem::take(&mut self.reorder_buffer) {
            sent += send_fanout(
                &self.transmit,
                &self.stats,
                &entry.payload,
                entry.dest_port,
                &entry.targets,
            );
        }
        sent
    }

    fn pause_between_passes(&self) {
        debug!("Waiting {}s before next pass...", INTER_PASS_PAUSE.as_secs());
        let deadline = Instant::now() + INTER_PASS_PAUSE;
        while Instant::now() < deadline && self.running.load(Ordering::Relaxed) {
            thread::sleep(IDLE_POLL);
        }
    }

    fn destination_list(&self) -> String {
        let dests: BTreeSet<(Ipv4Addr, u16)> = self
            .records
            .iter()
            .map(|r| (r.dest_addr, r.dest_port))
            .collect();
        dests
            .iter()
            .map(|(addr, port)| format!("{addr}:{port}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn send_fanout<T: Transmit>(
    transmit: &T,
    stats: &ReplayStats,
    payload: &[u8],
    port: u16,
    targets: &[Ipv4Addr],
) -> u64 {
    let mut sent = 0;
    for addr in targets {
        let dest = SocketAddrV4::new(*addr, port);
        match transmit.send_to(payload, dest) {
            Ok(bytes) => {
                stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
                sent += 1;
            }
            Err(e) => {
                // One bad send must not halt replay to other destinations.
                stats.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to send to {}: {}", dest, e);
            }
        }
    }
    sent
}
