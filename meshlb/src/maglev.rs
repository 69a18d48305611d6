use sha2::{Digest, Sha256};

use crate::types::{BackendId, LbAddr};

/// A backend participating in the lookup table build.
#[derive(Clone, Copy, Debug)]
pub struct MaglevBackend {
    pub id: BackendId,
    pub addr: LbAddr,
    pub weight: u32,
}

/// Builds fixed-size consistent-hash lookup tables.
///
/// Each backend walks its own permutation of the buckets, derived from a
/// digest of the backend address and the shared seed, and backends claim
/// free buckets in turn. The walk order makes the table a pure function of
/// its inputs: nodes sharing a seed compute identical tables, and a backend
/// joining or leaving moves only its proportional share of buckets.
#[derive(Clone, Debug)]
pub struct Maglev {
    table_size: usize,
    seed: String,
}

impl Maglev {
    pub fn new(table_size: usize, seed: String) -> Self {
        Self { table_size, seed }
    }

    pub fn table_size(&self) -> usize {
        self.table_size
    }

    /// Returns the lookup table, `table_size` buckets mapping to backend
    /// ids. Empty input yields an empty table (no entry should be written).
    pub fn lookup_table(&self, backends: &[MaglevBackend]) -> Vec<BackendId> {
        if backends.is_empty() {
            return Vec::new();
        }
        let m = self.table_size;
        let targets = slot_targets(backends, m);
        let perms: Vec<(u64, u64)> = backends.iter().map(|be| self.offset_skip(be)).collect();

        // Backend ids start at 1, so 0 marks a free bucket.
        let mut table: Vec<BackendId> = vec![0; m];
        let mut next: Vec<u64> = vec![0; backends.len()];
        let mut counts: Vec<usize> = vec![0; backends.len()];
        let mut filled = 0;

        while filled < m {
            for (i, be) in backends.iter().enumerate() {
                if counts[i] >= targets[i] {
                    continue;
                }
                let (offset, skip) = perms[i];
                let bucket = loop {
                    let c = ((offset + next[i] * skip) % m as u64) as usize;
                    next[i] += 1;
                    if table[c] == 0 {
                        break c;
                    }
                };
                table[bucket] = be.id;
                counts[i] += 1;
                filled += 1;
                if filled == m {
                    break;
                }
            }
        }
        table
    }

    fn offset_skip(&self, be: &MaglevBackend) -> (u64, u64) {
        let m = self.table_size as u64;
        let mut hasher = Sha256::new();
        hasher.update(self.seed.as_bytes());
        match be.addr.ip {
            std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
            std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
        }
        hasher.update(be.addr.port.to_be_bytes());
        hasher.update([be.addr.protocol as u8]);
        let digest: [u8; 32] = hasher.finalize().into();
        let h1 = u64::from_be_bytes(digest[0..8].try_into().unwrap());
        let h2 = u64::from_be_bytes(digest[8..16].try_into().unwrap());
        (h1 % m, h2 % (m - 1) + 1)
    }
}

/// Bucket quota per backend: `⌊m·w/Σw⌋` with the remainder spread one each
/// over the weighted backends in input order. All-zero weights degrade to
/// equal weighting.
fn slot_targets(backends: &[MaglevBackend], m: usize) -> Vec<usize> {
    let unweighted = backends.iter().all(|be| be.weight == 0);
    let weights: Vec<u64> = backends
        .iter()
        .map(|be| if unweighted { 1 } else { u64::from(be.weight) })
        .collect();
    let total: u64 = weights.iter().sum();

    let mut targets: Vec<usize> = weights
        .iter()
        .map(|w| ((m as u64 * w) / total) as usize)
        .collect();
    let mut deficit = m - targets.iter().sum::<usize>();
    let mut i = 0;
    while deficit > 0 {
        if weights[i % backends.len()] > 0 {
            targets[i % backends.len()] += 1;
            deficit -= 1;
        }
        i += 1;
    }
    targets
}
