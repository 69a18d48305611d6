pub mod bpf;
pub mod fake;

use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::Result;
use crate::types::{BackendId, BackendState, LbAddr, ServiceFlags, ServiceId, fmt_host_port};

/// The six kernel tables the reconciler programs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Table {
    Service,
    Backend,
    RevNat,
    Affinity,
    SourceRange,
    Maglev,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Table::Service => "service",
            Table::Backend => "backend",
            Table::RevNat => "rev_nat",
            Table::Affinity => "affinity",
            Table::SourceRange => "source_range",
            Table::Maglev => "maglev",
        };
        f.write_str(s)
    }
}

/// Key of one row in the service table. Slot 0 is the master row; slots
/// `1..=count+qcount` point at backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ServiceSlot {
    pub addr: LbAddr,
    pub slot: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServiceEntry {
    pub backend_id: u16,
    pub count: u16,
    pub qcount: u16,
    pub flags: ServiceFlags,
    pub rev_nat_id: ServiceId,
    /// Session affinity timeout in seconds; zero when affinity is off.
    pub affinity_timeout: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackendEntry {
    pub addr: LbAddr,
    pub state: BackendState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RevNatEntry {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AffinityKey {
    pub rev_nat_id: ServiceId,
    pub backend_id: BackendId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SourceRangeKey {
    pub rev_nat_id: ServiceId,
    pub cidr: IpNetwork,
}

/// Logical operations on the kernel tables. Deletes are idempotent:
/// removing an absent key succeeds. `scan` returns entries in no particular
/// order.
pub trait LbMaps {
    fn update_service(&mut self, key: &ServiceSlot, value: &ServiceEntry) -> Result<()>;
    fn delete_service(&mut self, key: &ServiceSlot) -> Result<()>;
    fn scan_services(&self) -> Result<Vec<(ServiceSlot, ServiceEntry)>>;

    fn update_backend(&mut self, id: BackendId, value: &BackendEntry) -> Result<()>;
    fn delete_backend(&mut self, id: BackendId) -> Result<()>;
    fn scan_backends(&self) -> Result<Vec<(BackendId, BackendEntry)>>;

    fn update_rev_nat(&mut self, id: ServiceId, value: &RevNatEntry) -> Result<()>;
    fn delete_rev_nat(&mut self, id: ServiceId) -> Result<()>;
    fn scan_rev_nat(&self) -> Result<Vec<(ServiceId, RevNatEntry)>>;

    fn update_affinity_match(&mut self, key: &AffinityKey) -> Result<()>;
    fn delete_affinity_match(&mut self, key: &AffinityKey) -> Result<()>;
    fn scan_affinity_matches(&self) -> Result<Vec<AffinityKey>>;

    fn update_source_range(&mut self, key: &SourceRangeKey) -> Result<()>;
    fn delete_source_range(&mut self, key: &SourceRangeKey) -> Result<()>;
    fn scan_source_ranges(&self) -> Result<Vec<SourceRangeKey>>;

    fn update_maglev(&mut self, id: ServiceId, table: &[BackendId]) -> Result<()>;
    fn delete_maglev(&mut self, id: ServiceId) -> Result<()>;
    fn scan_maglev(&self) -> Result<Vec<(ServiceId, Vec<BackendId>)>>;
}

struct AddrPort(IpAddr, u16);

impl fmt::Display for AddrPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_host_port(f, &self.0, self.1)
    }
}

/// Renders every table as sorted text lines, one row per line. Used by the
/// tests and by the agent's debug dump.
pub fn dump_lb_maps<M: LbMaps + ?Sized>(maps: &M) -> Result<Vec<String>> {
    let mut lines = Vec::new();

    for (key, value) in maps.scan_services()? {
        lines.push(format!(
            "SVC: ID={} ADDR={} SLOT={} BEID={} COUNT={} QCOUNT={} FLAGS={}",
            value.rev_nat_id,
            key.addr,
            key.slot,
            value.backend_id,
            value.count,
            value.qcount,
            value.flags,
        ));
    }
    for (id, value) in maps.scan_backends()? {
        lines.push(format!(
            "BE: ID={} ADDR={} STATE={}",
            id, value.addr, value.state
        ));
    }
    for (id, value) in maps.scan_rev_nat()? {
        lines.push(format!(
            "REV: ID={} ADDR={}",
            id,
            AddrPort(value.ip, value.port)
        ));
    }
    for key in maps.scan_affinity_matches()? {
        lines.push(format!(
            "AFF: ID={} BEID={}",
            key.rev_nat_id, key.backend_id
        ));
    }
    for key in maps.scan_source_ranges()? {
        lines.push(format!("SRCRANGE: ID={} CIDR={}", key.rev_nat_id, key.cidr));
    }
    for (id, table) in maps.scan_maglev()? {
        lines.push(format!("MAGLEV: ID={} INNER=[{}]", id, inner_summary(&table)));
    }

    lines.sort();
    Ok(lines)
}

/// Summarizes a lookup table as `bid(buckets)` pairs sorted by backend id.
fn inner_summary(table: &[BackendId]) -> String {
    let mut counts: Vec<(BackendId, usize)> = Vec::new();
    for bid in table {
        match counts.iter_mut().find(|(id, _)| id == bid) {
            Some((_, n)) => *n += 1,
            None => counts.push((*bid, 1)),
        }
    }
    counts.sort();
    counts
        .iter()
        .map(|(id, n)| format!("{id}({n})"))
        .collect::<Vec<_>>()
        .join(", ")
}
