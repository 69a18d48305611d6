use ahash::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::LbReconciler;
use crate::config::Algorithm;
use crate::maps::LbMaps;
use crate::node::NodeAddressProvider;
use crate::types::{BackendId, LbAddr, ServiceId};
use crate::Result;

impl<M: LbMaps, N: NodeAddressProvider> LbReconciler<M, N> {
    /// Sweeps all six tables and removes rows not backed by live
    /// bookkeeping, e.g. leftovers of a predecessor that crashed mid-write.
    /// Runs between operations, never concurrently with them, so a row
    /// belonging to an in-flight update cannot be swept.
    pub fn prune(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_live(cancel)?;

        let live_sids: HashMap<ServiceId, LbAddr> = self
            .service_ids
            .iter()
            .map(|(addr, id)| (id, *addr))
            .collect();
        let live_bids: HashSet<BackendId> =
            self.backend_states.values().map(|meta| meta.id).collect();

        for (key, _) in self.maps.scan_services()? {
            let expected = self.service_ids.contains(&key.addr)
                && key.slot < self.prev_slot_count.get(&key.addr).copied().unwrap_or(1);
            if !expected {
                warn!(addr = %key.addr, slot = key.slot, "removing orphaned service slot");
                self.maps.delete_service(&key)?;
            }
        }

        for (id, entry) in self.maps.scan_backends()? {
            if !live_bids.contains(&id) {
                warn!(id, addr = %entry.addr, "removing orphaned backend");
                self.maps.delete_backend(id)?;
            }
        }

        for (id, _) in self.maps.scan_rev_nat()? {
            if !live_sids.contains_key(&id) {
                warn!(id, "removing orphaned reverse-nat entry");
                self.maps.delete_rev_nat(id)?;
            }
        }

        for key in self.maps.scan_affinity_matches()? {
            if !live_sids.contains_key(&key.rev_nat_id) || !live_bids.contains(&key.backend_id) {
                warn!(
                    id = key.rev_nat_id,
                    backend = key.backend_id,
                    "removing orphaned affinity match"
                );
                self.maps.delete_affinity_match(&key)?;
            }
        }

        for key in self.maps.scan_source_ranges()? {
            let expected = live_sids.get(&key.rev_nat_id).is_some_and(|addr| {
                self.prev_source_ranges
                    .get(addr)
                    .is_some_and(|ranges| ranges.contains(&key.cidr))
            });
            if !expected {
                warn!(id = key.rev_nat_id, cidr = %key.cidr, "removing orphaned source range");
                self.maps.delete_source_range(&key)?;
            }
        }

        for (id, _) in self.maps.scan_maglev()? {
            let expected = self.cfg.algorithm == Algorithm::Maglev && live_sids.contains_key(&id);
            if !expected {
                warn!(id, "removing orphaned maglev table");
                self.maps.delete_maglev(id)?;
            }
        }

        Ok(())
    }
}
