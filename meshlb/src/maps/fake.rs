use ahash::{HashMap, HashSet};

use super::{
    AffinityKey, BackendEntry, LbMaps, RevNatEntry, ServiceEntry, ServiceSlot, SourceRangeKey,
    Table,
};
use crate::types::{BackendId, ServiceId};
use crate::{Error, Result};

/// In-memory stand-in for the kernel tables. Counts mutations (writes that
/// change a value and deletes that remove one) so tests can assert that a
/// reconcile round was a no-op, and can inject write failures per table.
#[derive(Default)]
pub struct FakeLbMaps {
    services: HashMap<ServiceSlot, ServiceEntry>,
    backends: HashMap<BackendId, BackendEntry>,
    rev_nat: HashMap<ServiceId, RevNatEntry>,
    affinity: HashSet<AffinityKey>,
    source_ranges: HashSet<SourceRangeKey>,
    maglev: HashMap<ServiceId, Vec<BackendId>>,
    mutations: u64,
    fail_table: Option<Table>,
}

impl FakeLbMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutations applied so far; unchanged-value writes do not count.
    pub fn mutations(&self) -> u64 {
        self.mutations
    }

    /// Makes every write and delete against `table` fail until cleared.
    pub fn fail_table(&mut self, table: Option<Table>) {
        self.fail_table = table;
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.backends.is_empty()
            && self.rev_nat.is_empty()
            && self.affinity.is_empty()
            && self.source_ranges.is_empty()
            && self.maglev.is_empty()
    }

    fn check(&self, table: Table) -> Result<()> {
        if self.fail_table == Some(table) {
            return Err(Error::MapWrite {
                table,
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn put<K: std::hash::Hash + Eq, V: PartialEq>(
        map: &mut HashMap<K, V>,
        mutations: &mut u64,
        key: K,
        value: V,
    ) {
        if map.get(&key) != Some(&value) {
            *mutations += 1;
        }
        map.insert(key, value);
    }

    fn remove<K: std::hash::Hash + Eq, V>(map: &mut HashMap<K, V>, mutations: &mut u64, key: &K) {
        if map.remove(key).is_some() {
            *mutations += 1;
        }
    }
}

impl LbMaps for FakeLbMaps {
    fn update_service(&mut self, key: &ServiceSlot, value: &ServiceEntry) -> Result<()> {
        self.check(Table::Service)?;
        Self::put(&mut self.services, &mut self.mutations, *key, *value);
        Ok(())
    }

    fn delete_service(&mut self, key: &ServiceSlot) -> Result<()> {
        self.check(Table::Service)?;
        Self::remove(&mut self.services, &mut self.mutations, key);
        Ok(())
    }

    fn scan_services(&self) -> Result<Vec<(ServiceSlot, ServiceEntry)>> {
        Ok(self.services.iter().map(|(k, v)| (*k, *v)).collect())
    }

    fn update_backend(&mut self, id: BackendId, value: &BackendEntry) -> Result<()> {
        self.check(Table::Backend)?;
        Self::put(&mut self.backends, &mut self.mutations, id, *value);
        Ok(())
    }

    fn delete_backend(&mut self, id: BackendId) -> Result<()> {
        self.check(Table::Backend)?;
        Self::remove(&mut self.backends, &mut self.mutations, &id);
        Ok(())
    }

    fn scan_backends(&self) -> Result<Vec<(BackendId, BackendEntry)>> {
        Ok(self.backends.iter().map(|(k, v)| (*k, *v)).collect())
    }

    fn update_rev_nat(&mut self, id: ServiceId, value: &RevNatEntry) -> Result<()> {
        self.check(Table::RevNat)?;
        Self::put(&mut self.rev_nat, &mut self.mutations, id, *value);
        Ok(())
    }

    fn delete_rev_nat(&mut self, id: ServiceId) -> Result<()> {
        self.check(Table::RevNat)?;
        Self::remove(&mut self.rev_nat, &mut self.mutations, &id);
        Ok(())
    }

    fn scan_rev_nat(&self) -> Result<Vec<(ServiceId, RevNatEntry)>> {
        Ok(self.rev_nat.iter().map(|(k, v)| (*k, *v)).collect())
    }

    fn update_affinity_match(&mut self, key: &AffinityKey) -> Result<()> {
        self.check(Table::Affinity)?;
        if self.affinity.insert(*key) {
            self.mutations += 1;
        }
        Ok(())
    }

    fn delete_affinity_match(&mut self, key: &AffinityKey) -> Result<()> {
        self.check(Table::Affinity)?;
        if self.affinity.remove(key) {
            self.mutations += 1;
        }
        Ok(())
    }

    fn scan_affinity_matches(&self) -> Result<Vec<AffinityKey>> {
        Ok(self.affinity.iter().copied().collect())
    }

    fn update_source_range(&mut self, key: &SourceRangeKey) -> Result<()> {
        self.check(Table::SourceRange)?;
        if self.source_ranges.insert(*key) {
            self.mutations += 1;
        }
        Ok(())
    }

    fn delete_source_range(&mut self, key: &SourceRangeKey) -> Result<()> {
        self.check(Table::SourceRange)?;
        if self.source_ranges.remove(key) {
            self.mutations += 1;
        }
        Ok(())
    }

    fn scan_source_ranges(&self) -> Result<Vec<SourceRangeKey>> {
        Ok(self.source_ranges.iter().copied().collect())
    }

    fn update_maglev(&mut self, id: ServiceId, table: &[BackendId]) -> Result<()> {
        self.check(Table::Maglev)?;
        if self.maglev.get(&id).map(Vec::as_slice) != Some(table) {
            self.mutations += 1;
        }
        self.maglev.insert(id, table.to_vec());
        Ok(())
    }

    fn delete_maglev(&mut self, id: ServiceId) -> Result<()> {
        self.check(Table::Maglev)?;
        if self.maglev.remove(&id).is_some() {
            self.mutations += 1;
        }
        Ok(())
    }

    fn scan_maglev(&self) -> Result<Vec<(ServiceId, Vec<BackendId>)>> {
        Ok(self.maglev.iter().map(|(k, v)| (*k, v.clone())).collect())
    }
}
