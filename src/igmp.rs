//! Multicast group membership tracking via the kernel IGMP table.
//!
//! A background thread polls `/proc/net/igmp` and publishes the joined set
//! through a mutex-guarded snapshot that the replay loop reads. Two tracking
//! inputs coexist on one monitor: a list of subnets whose member addresses
//! are scanned out of the table, and a fixed set of watched addresses each
//! carrying a joined flag. Either, both, or neither may be configured.

use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

pub const IGMP_TABLE_PATH: &str = "/proc/net/igmp";

/// 50ms keeps join/leave reaction well under the engine's pacing delays.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: u32,
    prefix: u8,
}

impl Subnet {
    pub fn new(network: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            bail!("Invalid prefix length /{prefix} (must be 0-32)");
        }
        Ok(Self {
            network: u32::from(network),
            prefix,
        })
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == self.network & self.mask()
    }
}

impl FromStr for Subnet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((addr, prefix)) = s.split_once('/') else {
            bail!("Invalid subnet '{s}' (expected a.b.c.d/len)");
        };
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid subnet address '{addr}'"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid prefix length '{prefix}'"))?;
        Self::new(network, prefix)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix)
    }
}

/// Extract every group address from `/proc/net/igmp` content.
///
/// Group rows carry the address as 8 hex digits in reversed byte order
/// (`010000E0` is 224.0.0.1); every other row is skipped.
pub fn parse_igmp_table(content: &str) -> HashSet<Ipv4Addr> {
    let mut groups = HashSet::new();
    for line in content.lines() {
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        if token.len() != 8 {
            continue;
        }
        if let Ok(raw) = u32::from_str_radix(token, 16) {
            groups.insert(Ipv4Addr::from(raw.swap_bytes()));
        }
    }
    groups
}

/// Join/leave transitions produced by one poll.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MembershipUpdate {
    pub joins: Vec<Ipv4Addr>,
    pub leaves: Vec<Ipv4Addr>,
}

#[derive(Default)]
struct Inner {
    /// Addresses inside the configured subnets currently present in the
    /// kernel table. Never contains an address outside the subnets.
    scanned: HashSet<Ipv4Addr>,
    /// Fixed watched addresses and their joined flags.
    watched: HashMap<Ipv4Addr, bool>,
}

impl Inner {
    fn effective(&self) -> BTreeSet<Ipv4Addr> {
        self.scanned
            .iter()
            .copied()
            .chain(
                self.watched
                    .iter()
                    .filter(|(_, joined)| **joined)
                    .map(|(addr, _)| *addr),
            )
            .collect()
    }
}

/// Shared membership state: written by the monitor, read by the replay loop.
///
/// The mutex is held only for snapshot copy/compare, never across sends or
/// timed waits.
pub struct Membership {
    subnets: Vec<Subnet>,
    inner: Mutex<Inner>,
}

impl Membership {
    pub fn new(subnets: Vec<Subnet>, watched: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            subnets,
            inner: Mutex::new(Inner {
                scanned: HashSet::new(),
                watched: watched.into_iter().map(|addr| (addr, false)).collect(),
            }),
        }
    }

    /// Fold one kernel table snapshot into the tracked state, returning the
    /// transitions relative to the previous poll.
    pub fn apply_snapshot(&self, kernel: &HashSet<Ipv4Addr>) -> MembershipUpdate {
        let mut inner = self.inner.lock();
        let before = inner.effective();

        inner.scanned = kernel
            .iter()
            .copied()
            .filter(|addr| self.subnets.iter().any(|subnet| subnet.contains(*addr)))
            .collect();
        for (addr, joined) in inner.watched.iter_mut() {
            *joined = kernel.contains(addr);
        }

        let after = inner.effective();
        MembershipUpdate {
            joins: after.difference(&before).copied().collect(),
            leaves: before.difference(&after).copied().collect(),
        }
    }

    /// Sorted snapshot of every currently joined destination address.
    pub fn joined_targets(&self) -> Vec<Ipv4Addr> {
        self.inner.lock().effective().into_iter().collect()
    }

    pub fn any_joined(&self) -> bool {
        let inner = self.inner.lock();
        !inner.scanned.is_empty() || inner.watched.values().any(|joined| *joined)
    }

    /// True when `addr` is a watched destination whose flag is down.
    pub fn is_gated(&self, addr: Ipv4Addr) -> bool {
        self.inner
            .lock()
            .watched
            .get(&addr)
            .is_some_and(|joined| !joined)
    }
}

/// Background thread polling the kernel IGMP table.
pub struct MembershipMonitor {
    membership: Arc<Membership>,
    running: Arc<AtomicBool>,
    table_path: PathBuf,
    poll_interval: Duration,
}

impl MembershipMonitor {
    pub fn new(membership: Arc<Membership>, running: Arc<AtomicBool>) -> Self {
        Self {
            membership,
            running,
            table_path: PathBuf::from(IGMP_TABLE_PATH),
            poll_interval: POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_table_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.table_path = path.into();
        self
    }

    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            debug!("IGMP monitor started (polling {})", self.table_path.display());
            while self.running.load(Ordering::Relaxed) {
                self.poll_once();
                thread::sleep(self.poll_interval);
            }
            debug!("IGMP monitor stopped");
        })
    }

    fn poll_once(&self) {
        // An unreadable table means no members joined, never an error.
        let kernel = std::fs::read_to_string(&self.table_path)
            .map(|content| parse_igmp_table(&content))
            .unwrap_or_default();

        let update = self.membership.apply_snapshot(&kernel);
        for addr in &update.joins {
            info!("IGMP join detected: {}", addr);
        }
        for addr in &update.leaves {
            info!("IGMP leave detected: {}", addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn set(addrs: &[&str]) -> HashSet<Ipv4Addr> {
        addrs.iter().map(|s| addr(s)).collect()
    }

    #[test]
    fn subnet_containment() {
        let subnet: Subnet = "239.81.0.0/24".parse().unwrap();
        assert!(subnet.contains(addr("239.81.0.200")));
        assert!(!subnet.contains(addr("239.82.0.200")));

        let other: Subnet = "239.82.0.0/24".parse().unwrap();
        assert!(!other.contains(addr("239.81.0.200")));
    }

    #[test]
    fn subnet_prefix_extremes() {
        let all: Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(addr("239.81.0.5")));

        let host: Subnet = "239.81.0.5/32".parse().unwrap();
        assert!(host.contains(addr("239.81.0.5")));
        assert!(!host.contains(addr("239.81.0.6")));
    }

    #[test]
    fn subnet_parse_rejects_garbage() {
        assert!("239.81.0.0".parse::<Subnet>().is_err());
        assert!("239.81.0.0/33".parse::<Subnet>().is_err());
        assert!("not-an-ip/24".parse::<Subnet>().is_err());
    }

    #[test]
    fn parses_kernel_table() {
        let content = "\
Idx\tDevice    : Count Querier\tGroup    Users Timeout\t\tReporter
1\tlo        :     1      V3
\t\t\t\t010000E0     1 0:00000000\t\t0
2\teth0      :     2      V3
\t\t\t\t050051EF     1 0:00000000\t\t0
\t\t\t\tnot-hex!     1 0:00000000\t\t0
";
        let groups = parse_igmp_table(content);
        assert_eq!(groups, set(&["224.0.0.1", "239.81.0.5"]));
    }

    #[test]
    fn snapshot_diff_emits_join_then_leave() {
        let membership = Membership::new(vec!["239.81.0.0/24".parse().unwrap()], []);

        let update = membership.apply_snapshot(&set(&["239.81.0.5"]));
        assert_eq!(update.joins, vec![addr("239.81.0.5")]);
        assert!(update.leaves.is_empty());
        assert_eq!(membership.joined_targets(), vec![addr("239.81.0.5")]);

        let update = membership.apply_snapshot(&HashSet::new());
        assert!(update.joins.is_empty());
        assert_eq!(update.leaves, vec![addr("239.81.0.5")]);
        assert!(membership.joined_targets().is_empty());
        assert!(!membership.any_joined());
    }

    #[test]
    fn scanned_set_stays_inside_subnets() {
        let membership = Membership::new(vec!["239.81.0.0/24".parse().unwrap()], []);
        membership.apply_snapshot(&set(&["239.81.0.5", "239.82.0.5", "224.0.0.1"]));
        assert_eq!(membership.joined_targets(), vec![addr("239.81.0.5")]);
    }

    #[test]
    fn watched_flags_follow_kernel_state() {
        let membership = Membership::new(Vec::new(), [addr("239.81.0.1")]);
        assert!(membership.is_gated(addr("239.81.0.1")));
        assert!(!membership.is_gated(addr("239.99.0.1"))); // not watched

        let update = membership.apply_snapshot(&set(&["239.81.0.1"]));
        assert_eq!(update.joins, vec![addr("239.81.0.1")]);
        assert!(!membership.is_gated(addr("239.81.0.1")));
        assert!(membership.any_joined());

        membership.apply_snapshot(&HashSet::new());
        assert!(membership.is_gated(addr("239.81.0.1")));
    }

    #[test]
    fn both_modes_union_in_targets() {
        let membership = Membership::new(
            vec!["239.81.0.0/24".parse().unwrap()],
            [addr("239.99.0.1")],
        );
        membership.apply_snapshot(&set(&["239.81.0.5", "239.99.0.1"]));
        assert_eq!(
            membership.joined_targets(),
            vec![addr("239.81.0.5"), addr("239.99.0.1")]
        );
    }

    #[test]
    fn poll_reads_table_file_and_survives_missing_file() {
        let membership = Arc::new(Membership::new(
            vec!["239.81.0.0/24".parse().unwrap()],
            [],
        ));
        let running = Arc::new(AtomicBool::new(true));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "\t\t\t\t050051EF     1 0:00000000\t\t0").unwrap();

        let monitor = MembershipMonitor::new(membership.clone(), running.clone())
            .with_table_path(file.path());
        monitor.poll_once();
        assert_eq!(membership.joined_targets(), vec![addr("239.81.0.5")]);

        // Unreadable table degrades to the empty set.
        let gone = MembershipMonitor::new(membership.clone(), running)
            .with_table_path("/nonexistent/igmp");
        gone.poll_once();
        assert!(membership.joined_targets().is_empty());
    }
}
