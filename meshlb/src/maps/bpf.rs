use std::net::IpAddr;
use std::path::Path;

use aya::Pod;
use aya::maps::{HashMap, Map, MapData, MapError};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use meshlb_ebpf_common::affinity::{AffinityMatchKey, SourceRangeKeyV4, SourceRangeKeyV6};
use meshlb_ebpf_common::maglev::{MAGLEV_LUT_SIZE, MaglevLut};
use meshlb_ebpf_common::service::{
    BackendValueV4, BackendValueV6, RevNatValueV4, RevNatValueV6, ServiceKeyV4, ServiceKeyV6,
    ServiceValue,
};

use super::{
    AffinityKey, BackendEntry, LbMaps, RevNatEntry, ServiceEntry, ServiceSlot, SourceRangeKey,
    Table,
};
use crate::types::{BackendId, LbAddr, ServiceId};
use crate::{Error, Result};

pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/meshlb";

const PIN_SERVICES_V4: &str = "meshlb_services_v4";
const PIN_SERVICES_V6: &str = "meshlb_services_v6";
const PIN_BACKENDS_V4: &str = "meshlb_backends_v4";
const PIN_BACKENDS_V6: &str = "meshlb_backends_v6";
const PIN_REV_NAT_V4: &str = "meshlb_rev_nat_v4";
const PIN_REV_NAT_V6: &str = "meshlb_rev_nat_v6";
const PIN_AFFINITY: &str = "meshlb_affinity_match";
const PIN_SOURCE_RANGES_V4: &str = "meshlb_source_ranges_v4";
const PIN_SOURCE_RANGES_V6: &str = "meshlb_source_ranges_v6";
const PIN_MAGLEV: &str = "meshlb_maglev";

type PinnedMap<K, V> = HashMap<MapData, K, V>;

/// Kernel-backed implementation over the maps pinned by the datapath
/// loader. Address families live in separate maps; tables keyed purely by
/// id (affinity, maglev) are shared.
pub struct BpfLbMaps {
    services_v4: PinnedMap<ServiceKeyV4, ServiceValue>,
    services_v6: PinnedMap<ServiceKeyV6, ServiceValue>,
    backends_v4: PinnedMap<u16, BackendValueV4>,
    backends_v6: PinnedMap<u16, BackendValueV6>,
    rev_nat_v4: PinnedMap<u16, RevNatValueV4>,
    rev_nat_v6: PinnedMap<u16, RevNatValueV6>,
    affinity: PinnedMap<AffinityMatchKey, u8>,
    source_ranges_v4: PinnedMap<SourceRangeKeyV4, u8>,
    source_ranges_v6: PinnedMap<SourceRangeKeyV6, u8>,
    maglev: PinnedMap<u16, MaglevLut>,
}

impl BpfLbMaps {
    pub fn from_pinned(base: &Path) -> Result<Self> {
        Ok(Self {
            services_v4: load_map(base, PIN_SERVICES_V4)?,
            services_v6: load_map(base, PIN_SERVICES_V6)?,
            backends_v4: load_map(base, PIN_BACKENDS_V4)?,
            backends_v6: load_map(base, PIN_BACKENDS_V6)?,
            rev_nat_v4: load_map(base, PIN_REV_NAT_V4)?,
            rev_nat_v6: load_map(base, PIN_REV_NAT_V6)?,
            affinity: load_map(base, PIN_AFFINITY)?,
            source_ranges_v4: load_map(base, PIN_SOURCE_RANGES_V4)?,
            source_ranges_v6: load_map(base, PIN_SOURCE_RANGES_V6)?,
            maglev: load_map(base, PIN_MAGLEV)?,
        })
    }
}

fn load_map<K: Pod, V: Pod>(base: &Path, name: &'static str) -> Result<PinnedMap<K, V>> {
    let data = MapData::from_pin(base.join(name)).map_err(|e| Error::MapLoad {
        name,
        reason: e.to_string(),
    })?;
    Map::HashMap(data).try_into().map_err(|e: MapError| Error::MapLoad {
        name,
        reason: e.to_string(),
    })
}

fn write_err(table: Table, e: MapError) -> Error {
    Error::MapWrite {
        table,
        reason: e.to_string(),
    }
}

fn read_err(table: Table, e: MapError) -> Error {
    Error::MapRead {
        table,
        reason: e.to_string(),
    }
}

/// The reconciler deletes blindly; a key the kernel no longer has is fine.
fn ignore_missing(res: std::result::Result<(), MapError>, table: Table) -> Result<()> {
    match res {
        Ok(()) => Ok(()),
        Err(MapError::KeyNotFound) => Ok(()),
        Err(MapError::SyscallError(e))
            if e.io_error.kind() == std::io::ErrorKind::NotFound =>
        {
            Ok(())
        }
        Err(e) => Err(write_err(table, e)),
    }
}

fn service_value(value: &ServiceEntry) -> ServiceValue {
    ServiceValue {
        backend_id: value.backend_id,
        count: value.count,
        qcount: value.qcount,
        flags: value.flags,
        rev_nat_id: value.rev_nat_id,
        _pad: 0,
        affinity_timeout: value.affinity_timeout,
    }
}

fn service_entry(value: &ServiceValue) -> ServiceEntry {
    ServiceEntry {
        backend_id: value.backend_id,
        count: value.count,
        qcount: value.qcount,
        flags: value.flags,
        rev_nat_id: value.rev_nat_id,
        affinity_timeout: value.affinity_timeout,
    }
}

impl LbMaps for BpfLbMaps {
    fn update_service(&mut self, key: &ServiceSlot, value: &ServiceEntry) -> Result<()> {
        let value = service_value(value);
        let res = match key.addr.ip {
            IpAddr::V4(ip) => self.services_v4.insert(
                ServiceKeyV4::new(
                    ip.to_bits(),
                    key.addr.port,
                    key.slot,
                    key.addr.protocol,
                    key.addr.scope,
                ),
                value,
                0,
            ),
            IpAddr::V6(ip) => self.services_v6.insert(
                ServiceKeyV6::new(
                    ip.to_bits(),
                    key.addr.port,
                    key.slot,
                    key.addr.protocol,
                    key.addr.scope,
                ),
                value,
                0,
            ),
        };
        res.map_err(|e| write_err(Table::Service, e))
    }

    fn delete_service(&mut self, key: &ServiceSlot) -> Result<()> {
        let res = match key.addr.ip {
            IpAddr::V4(ip) => self.services_v4.remove(&ServiceKeyV4::new(
                ip.to_bits(),
                key.addr.port,
                key.slot,
                key.addr.protocol,
                key.addr.scope,
            )),
            IpAddr::V6(ip) => self.services_v6.remove(&ServiceKeyV6::new(
                ip.to_bits(),
                key.addr.port,
                key.slot,
                key.addr.protocol,
                key.addr.scope,
            )),
        };
        ignore_missing(res, Table::Service)
    }

    fn scan_services(&self) -> Result<Vec<(ServiceSlot, ServiceEntry)>> {
        let mut out = Vec::new();
        for entry in self.services_v4.iter() {
            let (k, v) = entry.map_err(|e| read_err(Table::Service, e))?;
            let addr = LbAddr {
                ip: IpAddr::V4(k.ip.into()),
                port: k.port,
                protocol: k.protocol,
                scope: k.scope,
            };
            out.push((ServiceSlot { addr, slot: k.slot }, service_entry(&v)));
        }
        for entry in self.services_v6.iter() {
            let (k, v) = entry.map_err(|e| read_err(Table::Service, e))?;
            let addr = LbAddr {
                ip: IpAddr::V6(k.ip.into()),
                port: k.port,
                protocol: k.protocol,
                scope: k.scope,
            };
            out.push((ServiceSlot { addr, slot: k.slot }, service_entry(&v)));
        }
        Ok(out)
    }

    fn update_backend(&mut self, id: BackendId, value: &BackendEntry) -> Result<()> {
        let res = match value.addr.ip {
            IpAddr::V4(ip) => self.backends_v4.insert(
                id,
                BackendValueV4 {
                    ip: ip.to_bits(),
                    port: value.addr.port,
                    protocol: value.addr.protocol,
                    state: value.state,
                    flags: 0,
                    _pad: [0; 3],
                },
                0,
            ),
            IpAddr::V6(ip) => self.backends_v6.insert(
                id,
                BackendValueV6 {
                    ip: ip.to_bits(),
                    port: value.addr.port,
                    protocol: value.addr.protocol,
                    state: value.state,
                    flags: 0,
                    _pad: [0; 11],
                },
                0,
            ),
        };
        res.map_err(|e| write_err(Table::Backend, e))
    }

    fn delete_backend(&mut self, id: BackendId) -> Result<()> {
        // The id alone does not tell the family; clear both.
        ignore_missing(self.backends_v4.remove(&id), Table::Backend)?;
        ignore_missing(self.backends_v6.remove(&id), Table::Backend)
    }

    fn scan_backends(&self) -> Result<Vec<(BackendId, BackendEntry)>> {
        let mut out = Vec::new();
        for entry in self.backends_v4.iter() {
            let (id, v) = entry.map_err(|e| read_err(Table::Backend, e))?;
            out.push((
                id,
                BackendEntry {
                    addr: LbAddr::new(IpAddr::V4(v.ip.into()), v.port, v.protocol),
                    state: v.state,
                },
            ));
        }
        for entry in self.backends_v6.iter() {
            let (id, v) = entry.map_err(|e| read_err(Table::Backend, e))?;
            out.push((
                id,
                BackendEntry {
                    addr: LbAddr::new(IpAddr::V6(v.ip.into()), v.port, v.protocol),
                    state: v.state,
                },
            ));
        }
        Ok(out)
    }

    fn update_rev_nat(&mut self, id: ServiceId, value: &RevNatEntry) -> Result<()> {
        let res = match value.ip {
            IpAddr::V4(ip) => self.rev_nat_v4.insert(
                id,
                RevNatValueV4 {
                    ip: ip.to_bits(),
                    port: value.port,
                    _pad: 0,
                },
                0,
            ),
            IpAddr::V6(ip) => self.rev_nat_v6.insert(
                id,
                RevNatValueV6 {
                    ip: ip.to_bits(),
                    port: value.port,
                    _pad: [0; 14],
                },
                0,
            ),
        };
        res.map_err(|e| write_err(Table::RevNat, e))
    }

    fn delete_rev_nat(&mut self, id: ServiceId) -> Result<()> {
        ignore_missing(self.rev_nat_v4.remove(&id), Table::RevNat)?;
        ignore_missing(self.rev_nat_v6.remove(&id), Table::RevNat)
    }

    fn scan_rev_nat(&self) -> Result<Vec<(ServiceId, RevNatEntry)>> {
        let mut out = Vec::new();
        for entry in self.rev_nat_v4.iter() {
            let (id, v) = entry.map_err(|e| read_err(Table::RevNat, e))?;
            out.push((
                id,
                RevNatEntry {
                    ip: IpAddr::V4(v.ip.into()),
                    port: v.port,
                },
            ));
        }
        for entry in self.rev_nat_v6.iter() {
            let (id, v) = entry.map_err(|e| read_err(Table::RevNat, e))?;
            out.push((
                id,
                RevNatEntry {
                    ip: IpAddr::V6(v.ip.into()),
                    port: v.port,
                },
            ));
        }
        Ok(out)
    }

    fn update_affinity_match(&mut self, key: &AffinityKey) -> Result<()> {
        self.affinity
            .insert(AffinityMatchKey::new(key.rev_nat_id, key.backend_id), 0, 0)
            .map_err(|e| write_err(Table::Affinity, e))
    }

    fn delete_affinity_match(&mut self, key: &AffinityKey) -> Result<()> {
        ignore_missing(
            self.affinity
                .remove(&AffinityMatchKey::new(key.rev_nat_id, key.backend_id)),
            Table::Affinity,
        )
    }

    fn scan_affinity_matches(&self) -> Result<Vec<AffinityKey>> {
        let mut out = Vec::new();
        for entry in self.affinity.iter() {
            let (k, _) = entry.map_err(|e| read_err(Table::Affinity, e))?;
            out.push(AffinityKey {
                rev_nat_id: k.rev_nat_id,
                backend_id: k.backend_id,
            });
        }
        Ok(out)
    }

    fn update_source_range(&mut self, key: &SourceRangeKey) -> Result<()> {
        let res = match key.cidr {
            IpNetwork::V4(net) => self.source_ranges_v4.insert(
                SourceRangeKeyV4 {
                    rev_nat_id: key.rev_nat_id,
                    prefix_len: net.prefix(),
                    _pad: 0,
                    ip: net.network().to_bits(),
                },
                0,
                0,
            ),
            IpNetwork::V6(net) => self.source_ranges_v6.insert(
                SourceRangeKeyV6 {
                    rev_nat_id: key.rev_nat_id,
                    prefix_len: net.prefix(),
                    _pad: [0; 13],
                    ip: net.network().to_bits(),
                },
                0,
                0,
            ),
        };
        res.map_err(|e| write_err(Table::SourceRange, e))
    }

    fn delete_source_range(&mut self, key: &SourceRangeKey) -> Result<()> {
        let res = match key.cidr {
            IpNetwork::V4(net) => self.source_ranges_v4.remove(&SourceRangeKeyV4 {
                rev_nat_id: key.rev_nat_id,
                prefix_len: net.prefix(),
                _pad: 0,
                ip: net.network().to_bits(),
            }),
            IpNetwork::V6(net) => self.source_ranges_v6.remove(&SourceRangeKeyV6 {
                rev_nat_id: key.rev_nat_id,
                prefix_len: net.prefix(),
                _pad: [0; 13],
                ip: net.network().to_bits(),
            }),
        };
        ignore_missing(res, Table::SourceRange)
    }

    fn scan_source_ranges(&self) -> Result<Vec<SourceRangeKey>> {
        let mut out = Vec::new();
        for entry in self.source_ranges_v4.iter() {
            let (k, _) = entry.map_err(|e| read_err(Table::SourceRange, e))?;
            let net = Ipv4Network::new(k.ip.into(), k.prefix_len)
                .map_err(|e| Error::MapRead {
                    table: Table::SourceRange,
                    reason: e.to_string(),
                })?;
            out.push(SourceRangeKey {
                rev_nat_id: k.rev_nat_id,
                cidr: IpNetwork::V4(net),
            });
        }
        for entry in self.source_ranges_v6.iter() {
            let (k, _) = entry.map_err(|e| read_err(Table::SourceRange, e))?;
            let net = Ipv6Network::new(k.ip.into(), k.prefix_len)
                .map_err(|e| Error::MapRead {
                    table: Table::SourceRange,
                    reason: e.to_string(),
                })?;
            out.push(SourceRangeKey {
                rev_nat_id: k.rev_nat_id,
                cidr: IpNetwork::V6(net),
            });
        }
        Ok(out)
    }

    fn update_maglev(&mut self, id: ServiceId, table: &[BackendId]) -> Result<()> {
        if table.len() != MAGLEV_LUT_SIZE {
            return Err(Error::MapWrite {
                table: Table::Maglev,
                reason: format!(
                    "lookup table has {} buckets, kernel map holds {}",
                    table.len(),
                    MAGLEV_LUT_SIZE
                ),
            });
        }
        let mut lut: MaglevLut = [0; MAGLEV_LUT_SIZE];
        lut.copy_from_slice(table);
        self.maglev
            .insert(id, lut, 0)
            .map_err(|e| write_err(Table::Maglev, e))
    }

    fn delete_maglev(&mut self, id: ServiceId) -> Result<()> {
        ignore_missing(self.maglev.remove(&id), Table::Maglev)
    }

    fn scan_maglev(&self) -> Result<Vec<(ServiceId, Vec<BackendId>)>> {
        let mut out = Vec::new();
        for entry in self.maglev.iter() {
            let (id, lut) = entry.map_err(|e| read_err(Table::Maglev, e))?;
            out.push((id, lut.to_vec()));
        }
        Ok(out)
    }
}
