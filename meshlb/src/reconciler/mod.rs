mod prune;

use std::net::IpAddr;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use ipnetwork::IpNetwork;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Algorithm, Config};
use crate::id::IdAllocator;
use crate::maglev::{Maglev, MaglevBackend};
use crate::maps::{
    AffinityKey, BackendEntry, LbMaps, RevNatEntry, ServiceEntry, ServiceSlot, SourceRangeKey,
};
use crate::node::NodeAddressProvider;
use crate::types::{
    Backend, BackendId, BackendState, Frontend, LbAddr, Protocol, Scope, ServiceId,
};
use crate::{Error, Result};

#[derive(Debug)]
struct BackendMeta {
    id: BackendId,
    state: BackendState,
    /// Frontends referencing this backend. The row lives as long as the set
    /// is non-empty.
    owners: HashSet<LbAddr>,
}

/// Identity of a zero-address frontend, used to remember which node
/// addresses it is currently expanded over.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
struct SurrogateKey {
    port: u16,
    protocol: Protocol,
    scope: Scope,
    ipv6: bool,
}

impl SurrogateKey {
    fn of(fe: &Frontend) -> Self {
        Self {
            port: fe.address.port,
            protocol: fe.address.protocol,
            scope: fe.address.scope,
            ipv6: fe.address.is_ipv6(),
        }
    }
}

/// Programs the kernel load-balancing tables from desired frontends and
/// backends.
///
/// All bookkeeping is unsynchronized; the driver runs `update`, `delete`
/// and `prune` serially and never reconciles the same frontend
/// concurrently. Bookkeeping advances only after the corresponding map
/// write succeeded, so a failed operation can simply be retried with the
/// same input.
pub struct LbReconciler<M, N> {
    cfg: Config,
    maps: M,
    node_addrs: N,
    maglev: Maglev,

    service_ids: IdAllocator<LbAddr>,
    backend_ids: IdAllocator<LbAddr>,
    backend_states: HashMap<LbAddr, BackendMeta>,
    /// Backends each frontend referenced in its last reconcile.
    frontend_backends: HashMap<LbAddr, HashSet<LbAddr>>,
    /// Rows (master included) each frontend occupies in the service table.
    prev_slot_count: HashMap<LbAddr, u16>,
    prev_source_ranges: HashMap<LbAddr, HashSet<IpNetwork>>,
    /// Node addresses each surrogate is currently expanded over.
    node_port_addrs: HashMap<SurrogateKey, Vec<IpAddr>>,
}

impl<M: LbMaps, N: NodeAddressProvider> LbReconciler<M, N> {
    pub fn new(cfg: Config, maps: M, node_addrs: N) -> Result<Self> {
        cfg.validate()?;
        let maglev = Maglev::new(cfg.maglev_table_size, cfg.maglev_seed.clone());
        info!(
            algorithm = ?cfg.algorithm,
            maglev_table_size = cfg.maglev_table_size,
            "load-balancer reconciler initialized"
        );
        Ok(Self {
            service_ids: IdAllocator::new("service", 1, cfg.max_service_ids),
            backend_ids: IdAllocator::new("backend", 1, cfg.max_backend_ids),
            cfg,
            maps,
            node_addrs,
            maglev,
            backend_states: HashMap::new(),
            frontend_backends: HashMap::new(),
            prev_slot_count: HashMap::new(),
            prev_source_ranges: HashMap::new(),
            node_port_addrs: HashMap::new(),
        })
    }

    pub fn maps(&self) -> &M {
        &self.maps
    }

    pub fn maps_mut(&mut self) -> &mut M {
        &mut self.maps
    }

    /// True when no frontend or backend is tracked anymore. After every
    /// frontend was deleted this must hold, or ids have leaked.
    pub fn is_quiescent(&self) -> bool {
        self.service_ids.is_empty()
            && self.backend_ids.is_empty()
            && self.backend_states.is_empty()
            && self.frontend_backends.is_empty()
            && self.prev_slot_count.is_empty()
            && self.prev_source_ranges.is_empty()
            && self.node_port_addrs.is_empty()
    }

    /// Applies the desired state of `frontend` to the maps. Idempotent; on
    /// a map error the rows already written stay in place and a retry with
    /// the same input converges.
    pub fn update<I>(
        &mut self,
        frontend: &Frontend,
        backends: I,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Backend>,
    {
        frontend.validate()?;
        // The backend sequence is produced lazily; the master row needs the
        // counts, so drain it up front.
        let backends: Vec<Backend> = backends.into_iter().collect();
        debug!(
            frontend = %frontend.address,
            service = %frontend.service.name,
            backends = backends.len(),
            "reconciling frontend"
        );
        self.update_frontend(frontend, &backends, cancel)?;
        if frontend.is_surrogate() {
            self.expand_surrogate(frontend, &backends, cancel)?;
        }
        Ok(())
    }

    /// Removes every row associated with `frontend`, releasing its ids and
    /// dropping backend rows that lose their last reference. Deleting an
    /// unknown frontend is a no-op.
    pub fn delete(&mut self, frontend: &Frontend, cancel: &CancellationToken) -> Result<()> {
        debug!(
            frontend = %frontend.address,
            service = %frontend.service.name,
            "deleting frontend"
        );
        if frontend.is_surrogate() {
            let key = SurrogateKey::of(frontend);
            if let Some(derived) = self.node_port_addrs.get(&key).cloned() {
                for ip in derived {
                    self.delete_frontend(&frontend.derived(ip), cancel)?;
                }
                self.node_port_addrs.remove(&key);
            }
        }
        self.delete_frontend(frontend, cancel)
    }

    /// One frontend, one row set. Derived frontends go through here as
    /// well, each with its own service id.
    fn update_frontend(
        &mut self,
        fe: &Frontend,
        backends: &[Backend],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_live(cancel)?;
        let sid = self.service_ids.acquire(&fe.address)?;

        // Slot layout: active backends keep their input order, quarantined
        // ones follow, maintenance never reaches the datapath.
        let mut ordered: Vec<&Backend> = Vec::with_capacity(backends.len());
        let mut quarantined: Vec<&Backend> = Vec::new();
        let mut seen: HashSet<LbAddr> = HashSet::new();
        for be in backends {
            if !seen.insert(be.addr) {
                continue;
            }
            match be.state {
                BackendState::Active | BackendState::Terminating => ordered.push(be),
                BackendState::Quarantined => quarantined.push(be),
                BackendState::Maintenance => {}
            }
        }
        let active_count = ordered.len() as u16;
        let quarantined_count = quarantined.len() as u16;
        ordered.append(&mut quarantined);

        // Backend rows first so no slot ever points at a missing row.
        let mut slot_backends: Vec<(BackendId, &Backend)> = Vec::with_capacity(ordered.len());
        for be in &ordered {
            let bid = self.backend_ids.acquire(&be.addr)?;
            let unchanged = self
                .backend_states
                .get(&be.addr)
                .is_some_and(|meta| meta.state == be.state);
            if !unchanged {
                self.maps.update_backend(
                    bid,
                    &BackendEntry {
                        addr: be.addr,
                        state: be.state,
                    },
                )?;
            }
            let meta = self
                .backend_states
                .entry(be.addr)
                .or_insert_with(|| BackendMeta {
                    id: bid,
                    state: be.state,
                    owners: HashSet::new(),
                });
            meta.state = be.state;
            meta.owners.insert(fe.address);
            slot_backends.push((bid, be));
        }

        let flags = fe.flags(self.cfg.external_cluster_ip);
        let affinity_timeout = fe
            .service
            .session_affinity
            .map(|t| t.as_secs() as u32)
            .unwrap_or(0);

        // The master's backend id doubles as the L7 proxy port (network
        // byte order) and, under session affinity, as the datapath's
        // affinity seed.
        let master_backend_id = if let Some(redirect) = &fe.service.proxy_redirect {
            redirect.proxy_port.to_be()
        } else if fe.service.session_affinity.is_some() && active_count > 0 {
            slot_backends[0].0
        } else {
            0
        };

        self.maps.update_service(
            &ServiceSlot {
                addr: fe.address,
                slot: 0,
            },
            &ServiceEntry {
                backend_id: master_backend_id,
                count: active_count,
                qcount: quarantined_count,
                flags,
                rev_nat_id: sid,
                affinity_timeout,
            },
        )?;
        for (i, (bid, _)) in slot_backends.iter().enumerate() {
            self.maps.update_service(
                &ServiceSlot {
                    addr: fe.address,
                    slot: i as u16 + 1,
                },
                &ServiceEntry {
                    backend_id: *bid,
                    count: 0,
                    qcount: 0,
                    flags,
                    rev_nat_id: sid,
                    affinity_timeout: 0,
                },
            )?;
        }

        // Slots the previous round used beyond the new layout.
        let total_slots = 1 + active_count + quarantined_count;
        let prev_slots = self.prev_slot_count.get(&fe.address).copied().unwrap_or(0);
        for slot in total_slots..prev_slots {
            self.maps.delete_service(&ServiceSlot {
                addr: fe.address,
                slot,
            })?;
        }
        self.prev_slot_count.insert(fe.address, total_slots);

        self.maps.update_rev_nat(
            sid,
            &RevNatEntry {
                ip: fe.address.ip,
                port: fe.address.port,
            },
        )?;

        self.sync_source_ranges(fe, sid)?;
        self.sync_affinity(fe, sid, &slot_backends)?;
        self.sync_maglev(sid, &slot_backends[..active_count as usize])?;

        // References this frontend no longer holds, dropped only now that
        // the new slots are in place.
        let new_refs: HashSet<LbAddr> = ordered.iter().map(|be| be.addr).collect();
        let prev_refs = self
            .frontend_backends
            .insert(fe.address, new_refs.clone())
            .unwrap_or_default();
        for gone in prev_refs.difference(&new_refs) {
            self.release_backend_ref(&fe.address, gone)?;
        }
        Ok(())
    }

    /// Keeps one concrete frontend per node address for a zero-address
    /// NodePort/HostPort, converging when the address set changes.
    fn expand_surrogate(
        &mut self,
        fe: &Frontend,
        backends: &[Backend],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = SurrogateKey::of(fe);
        let mut addrs: Vec<IpAddr> = self
            .node_addrs
            .addresses()
            .into_iter()
            .filter(|ip| ip.is_ipv4() == fe.address.ip.is_ipv4())
            .collect();
        addrs.sort();
        addrs.dedup();

        let prev = self.node_port_addrs.get(&key).cloned().unwrap_or_default();
        for stale in prev.iter().filter(|ip| !addrs.contains(ip)) {
            self.delete_frontend(&fe.derived(*stale), cancel)?;
        }
        for ip in &addrs {
            self.update_frontend(&fe.derived(*ip), backends, cancel)?;
        }
        self.node_port_addrs.insert(key, addrs);
        Ok(())
    }

    fn delete_frontend(&mut self, fe: &Frontend, cancel: &CancellationToken) -> Result<()> {
        self.ensure_live(cancel)?;
        let Some(sid) = self.service_ids.get(&fe.address) else {
            return Ok(());
        };

        let slots = self.prev_slot_count.get(&fe.address).copied().unwrap_or(1);
        for slot in 0..slots {
            self.maps.delete_service(&ServiceSlot {
                addr: fe.address,
                slot,
            })?;
        }
        self.maps.delete_rev_nat(sid)?;
        // Affinity matches are cleared whether or not affinity is enabled
        // on the frontend being deleted.
        for key in self.maps.scan_affinity_matches()? {
            if key.rev_nat_id == sid {
                self.maps.delete_affinity_match(&key)?;
            }
        }
        if let Some(ranges) = self.prev_source_ranges.get(&fe.address).cloned() {
            for cidr in ranges {
                self.maps.delete_source_range(&SourceRangeKey {
                    rev_nat_id: sid,
                    cidr,
                })?;
            }
        }
        self.maps.delete_maglev(sid)?;

        if let Some(refs) = self.frontend_backends.get(&fe.address).cloned() {
            for backend in &refs {
                self.release_backend_ref(&fe.address, backend)?;
                if let Some(set) = self.frontend_backends.get_mut(&fe.address) {
                    set.remove(backend);
                }
            }
            self.frontend_backends.remove(&fe.address);
        }

        self.prev_source_ranges.remove(&fe.address);
        self.prev_slot_count.remove(&fe.address);
        self.service_ids.release(&fe.address);
        Ok(())
    }

    /// Drops `frontend`'s reference on `backend`; the last reference takes
    /// the row and the id with it.
    fn release_backend_ref(&mut self, frontend: &LbAddr, backend: &LbAddr) -> Result<()> {
        let Some(meta) = self.backend_states.get_mut(backend) else {
            return Ok(());
        };
        meta.owners.remove(frontend);
        if !meta.owners.is_empty() {
            return Ok(());
        }
        let id = meta.id;
        self.backend_states.remove(backend);
        self.backend_ids.release(backend);
        // Row deletion last; if it fails the orphan sweep picks the row up.
        self.maps.delete_backend(id)
    }

    fn sync_source_ranges(&mut self, fe: &Frontend, sid: ServiceId) -> Result<()> {
        let desired: HashSet<IpNetwork> = fe.service.source_ranges.iter().copied().collect();
        let prev = self
            .prev_source_ranges
            .get(&fe.address)
            .cloned()
            .unwrap_or_default();

        for cidr in desired.difference(&prev) {
            self.maps.update_source_range(&SourceRangeKey {
                rev_nat_id: sid,
                cidr: *cidr,
            })?;
        }
        for cidr in prev.difference(&desired) {
            self.maps.delete_source_range(&SourceRangeKey {
                rev_nat_id: sid,
                cidr: *cidr,
            })?;
        }

        if desired.is_empty() {
            self.prev_source_ranges.remove(&fe.address);
        } else {
            self.prev_source_ranges.insert(fe.address, desired);
        }
        Ok(())
    }

    /// With affinity on, the match table holds exactly the slot backends of
    /// the service. With affinity off, every match of the service goes,
    /// including ones written before a restart.
    fn sync_affinity(
        &mut self,
        fe: &Frontend,
        sid: ServiceId,
        slot_backends: &[(BackendId, &Backend)],
    ) -> Result<()> {
        let current: HashSet<AffinityKey> = self
            .maps
            .scan_affinity_matches()?
            .into_iter()
            .filter(|key| key.rev_nat_id == sid)
            .collect();

        if fe.service.session_affinity.is_some() {
            let desired: HashSet<AffinityKey> = slot_backends
                .iter()
                .map(|(bid, _)| AffinityKey {
                    rev_nat_id: sid,
                    backend_id: *bid,
                })
                .collect();
            for key in desired.difference(&current) {
                self.maps.update_affinity_match(key)?;
            }
            for key in current.difference(&desired) {
                self.maps.delete_affinity_match(key)?;
            }
        } else {
            for key in &current {
                self.maps.delete_affinity_match(key)?;
            }
        }
        Ok(())
    }

    fn sync_maglev(&mut self, sid: ServiceId, active: &[(BackendId, &Backend)]) -> Result<()> {
        if self.cfg.algorithm == Algorithm::Maglev && !active.is_empty() {
            let backends: Vec<MaglevBackend> = active
                .iter()
                .map(|(bid, be)| MaglevBackend {
                    id: *bid,
                    addr: be.addr,
                    weight: be.weight,
                })
                .collect();
            let table = self.maglev.lookup_table(&backends);
            self.maps.update_maglev(sid, &table)
        } else {
            self.maps.delete_maglev(sid)
        }
    }

    fn ensure_live(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}
