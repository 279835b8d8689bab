use anyhow::{Context, Result, bail};
use clap::Parser;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

mod faults;
mod igmp;
mod net;
mod packet;
mod pcap_reader;
mod replay;
mod rtp;

use faults::FaultInjector;
use igmp::{Membership, MembershipMonitor, Subnet};
use net::MulticastSender;
use replay::{ReplayConfig, ReplayEngine, ReplayStats};

#[derive(Parser, Debug)]
#[command(name = "mcast-replay")]
#[command(about = "Replay captured multicast UDP (RTP/FEC) traffic while receivers are joined")]
#[command(version)]
struct Args {
    /// Path to the pcap/pcapng capture file
    capture: PathBuf,

    /// Network interface for outbound multicast (e.g. eth0)
    #[arg(short, long)]
    interface: Option<String>,

    /// Packet loss rate in percent (0-100)
    #[arg(long, default_value = "0.0", value_name = "PERCENT")]
    loss: f64,

    /// Packet reorder rate in percent (0-100)
    #[arg(long, default_value = "0.0", value_name = "PERCENT")]
    reorder: f64,

    /// Replay speed multiplier (2.0 replays twice as fast as captured)
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// No pause between passes; RTP sequence numbers are patched so streams
    /// appear unbroken across passes
    #[arg(long)]
    continuous: bool,

    /// Subnet to scan for joined groups, repeatable
    /// (default: the /24 of each captured destination)
    #[arg(long, value_name = "CIDR")]
    subnet: Vec<Subnet>,

    /// Track only the exact captured destination addresses instead of
    /// scanning subnets; packets for a destination nobody joined are skipped
    #[arg(long)]
    fixed: bool,

    /// Outbound multicast TTL
    #[arg(long, default_value = "1")]
    ttl: u32,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn validate(args: &Args) -> Result<()> {
    if !(0.0..=100.0).contains(&args.loss) {
        bail!("--loss must be between 0 and 100");
    }
    if !(0.0..=100.0).contains(&args.reorder) {
        bail!("--reorder must be between 0 and 100");
    }
    if !(args.speed > 0.0) {
        bail!("--speed must be greater than 0");
    }
    Ok(())
}

/// Default membership scan scope: the /24 around each captured destination.
fn derive_subnets(groups: &BTreeSet<Ipv4Addr>) -> Result<Vec<Subnet>> {
    let networks: BTreeSet<u32> = groups
        .iter()
        .map(|addr| u32::from(*addr) & 0xffff_ff00)
        .collect();
    networks
        .into_iter()
        .map(|network| Subnet::new(Ipv4Addr::from(network), 24))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    validate(&args)?;

    let records = pcap_reader::load_capture(&args.capture)?;
    if records.is_empty() {
        bail!(
            "No usable UDP packets found in {}",
            args.capture.display()
        );
    }

    let groups: BTreeSet<Ipv4Addr> = records.iter().map(|r| r.dest_addr).collect();
    let subnets = if !args.subnet.is_empty() {
        args.subnet.clone()
    } else if args.fixed {
        Vec::new()
    } else {
        derive_subnets(&groups)?
    };
    let watched: Vec<Ipv4Addr> = if args.fixed {
        groups.iter().copied().collect()
    } else {
        Vec::new()
    };

    if !subnets.is_empty() {
        info!(
            "Monitoring IGMP for subnets: {}",
            subnets
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    if !watched.is_empty() {
        info!(
            "Monitoring IGMP for groups: {}",
            watched
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let running = Arc::new(AtomicBool::new(true));
    let membership = Arc::new(Membership::new(subnets, watched));
    let monitor = MembershipMonitor::new(membership.clone(), running.clone()).spawn();

    let sender = MulticastSender::new(args.interface.as_deref(), args.ttl)?;

    let faults = FaultInjector::new(args.loss, args.reorder);
    if faults.enabled() {
        info!(
            "Simulation: loss={:.1}%, reorder={:.1}%",
            args.loss, args.reorder
        );
    }

    let stats = Arc::new(ReplayStats::default());
    let engine = ReplayEngine::new(
        records,
        ReplayConfig {
            speed: args.speed,
            continuous: args.continuous,
        },
        membership,
        faults,
        sender,
        stats.clone(),
        running.clone(),
    );

    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
                running.store(false, Ordering::Relaxed);
            }
        });
    }

    // Periodic throughput statistics, independent of pass boundaries.
    let stats_task = {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.tick().await; // the first tick completes immediately
            let mut last_packets = 0u64;
            let mut last_bytes = 0u64;
            let mut last_time = Instant::now();

            loop {
                interval.tick().await;
                let packets = stats.packets_sent.load(Ordering::Relaxed);
                let bytes = stats.bytes_sent.load(Ordering::Relaxed);
                let now = Instant::now();
                let elapsed = now.duration_since(last_time).as_secs_f64();
                if packets > last_packets {
                    info!(
                        "Rate: {:.0} pkt/s, {:.1} KB/s",
                        (packets - last_packets) as f64 / elapsed,
                        (bytes - last_bytes) as f64 / 1024.0 / elapsed
                    );
                }
                last_packets = packets;
                last_bytes = bytes;
                last_time = now;
            }
        })
    };

    info!("(Ctrl+C to stop)");
    let start = Instant::now();
    tokio::task::spawn_blocking(move || engine.run())
        .await
        .context("Replay loop panicked")?;

    stats_task.abort();
    running.store(false, Ordering::Relaxed);
    if monitor.join().is_err() {
        warn!("IGMP monitor thread panicked");
    }

    print_summary(&stats, start.elapsed());
    Ok(())
}

fn print_summary(stats: &ReplayStats, elapsed: Duration) {
    let sent = stats.packets_sent.load(Ordering::Relaxed);
    let bytes = stats.bytes_sent.load(Ordering::Relaxed);
    let dropped = stats.packets_dropped.load(Ordering::Relaxed);
    let reordered = stats.packets_reordered.load(Ordering::Relaxed);
    let errors = stats.send_errors.load(Ordering::Relaxed);
    let passes = stats.passes.load(Ordering::Relaxed);

    info!("Stopped after {} pass(es)", passes);
    info!("Total: {} packets sent, {:.1} KB", sent, bytes as f64 / 1024.0);
    if dropped > 0 {
        info!("Dropped: {} packets", dropped);
    }
    if reordered > 0 {
        info!("Reordered: {} packets", reordered);
    }
    if errors > 0 {
        warn!("Send errors: {}", errors);
    }
    if elapsed > Duration::ZERO {
        info!(
            "Duration: {:.1}s, Rate: {:.1} pkt/s",
            elapsed.as_secs_f64(),
            sent as f64 / elapsed.as_secs_f64()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(loss: f64, reorder: f64, speed: f64) -> Args {
        Args {
            capture: PathBuf::from("capture.pcapng"),
            interface: None,
            loss,
            reorder,
            speed,
            continuous: false,
            subnet: Vec::new(),
            fixed: false,
            ttl: 1,
            verbose: false,
        }
    }

    #[test]
    fn accepts_valid_arguments() {
        assert!(validate(&args(0.0, 0.0, 1.0)).is_ok());
        assert!(validate(&args(100.0, 100.0, 0.5)).is_ok());
    }

    #[test]
    fn rejects_out_of_range_percentages() {
        assert!(validate(&args(-1.0, 0.0, 1.0)).is_err());
        assert!(validate(&args(101.0, 0.0, 1.0)).is_err());
        assert!(validate(&args(0.0, 100.5, 1.0)).is_err());
    }

    #[test]
    fn rejects_non_positive_speed() {
        assert!(validate(&args(0.0, 0.0, 0.0)).is_err());
        assert!(validate(&args(0.0, 0.0, -2.0)).is_err());
        assert!(validate(&args(0.0, 0.0, f64::NAN)).is_err());
    }

    #[test]
    fn derives_deduplicated_slash24_subnets() {
        let groups: BTreeSet<Ipv4Addr> = ["239.81.0.1", "239.81.0.9", "239.82.0.1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let subnets = derive_subnets(&groups).unwrap();
        assert_eq!(subnets.len(), 2);
        assert!(subnets[0].contains("239.81.0.200".parse().unwrap()));
        assert!(subnets[1].contains("239.82.0.200".parse().unwrap()));
        assert!(!subnets[0].contains("239.82.0.200".parse().unwrap()));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
