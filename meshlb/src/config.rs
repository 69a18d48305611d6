use serde::Deserialize;

use crate::{Error, Result};

/// Seed mixed into the Maglev permutation digests. All nodes of a cluster
/// must agree on it for their lookup tables to match.
pub const DEFAULT_MAGLEV_SEED: &str = "bWVzaGxiLW1hZ2xldg==";

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// The datapath picks a backend slot at random; no lookup tables are
    /// maintained.
    #[default]
    Random,
    /// Consistent hashing over a per-service lookup table.
    Maglev,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub algorithm: Algorithm,

    /// Buckets in each Maglev lookup table. The kernel map value is sized
    /// at compile time, so this must match
    /// [`meshlb_ebpf_common::maglev::MAGLEV_LUT_SIZE`].
    pub maglev_table_size: usize,
    pub maglev_seed: String,

    /// Program ClusterIP frontends as reachable from outside the cluster.
    pub external_cluster_ip: bool,

    /// Ceilings for the two id spaces.
    pub max_service_ids: u16,
    pub max_backend_ids: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            maglev_table_size: meshlb_ebpf_common::maglev::MAGLEV_LUT_SIZE,
            maglev_seed: DEFAULT_MAGLEV_SEED.to_string(),
            external_cluster_ip: false,
            max_service_ids: u16::MAX,
            max_backend_ids: u16::MAX,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.maglev_table_size != meshlb_ebpf_common::maglev::MAGLEV_LUT_SIZE {
            return Err(Error::Config(format!(
                "maglev_table_size must match the kernel lookup table capacity {}, got {}",
                meshlb_ebpf_common::maglev::MAGLEV_LUT_SIZE,
                self.maglev_table_size
            )));
        }
        if self.max_service_ids == 0 || self.max_backend_ids == 0 {
            return Err(Error::Config("id space ceilings must be non-zero".into()));
        }
        Ok(())
    }
}
