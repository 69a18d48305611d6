/// Number of buckets in the kernel-side Maglev lookup table. Must be prime
/// for the permutation walk to visit every bucket.
pub const MAGLEV_LUT_SIZE: usize = 1021;

/// One lookup table per service, bucket index to backend id.
pub type MaglevLut = [u16; MAGLEV_LUT_SIZE];
