/// Marks `(service, backend)` pairs eligible for session-affinity reuse.
/// The map has no payload; presence of the key is the match.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AffinityMatchKey {
    pub backend_id: u16,
    pub rev_nat_id: u16,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityMatchKey {}

impl AffinityMatchKey {
    pub const fn new(rev_nat_id: u16, backend_id: u16) -> Self {
        Self {
            backend_id,
            rev_nat_id,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SourceRangeKeyV4 {
    pub rev_nat_id: u16,
    pub prefix_len: u8,
    pub _pad: u8,
    pub ip: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for SourceRangeKeyV4 {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SourceRangeKeyV6 {
    pub rev_nat_id: u16,
    pub prefix_len: u8,
    pub _pad: [u8; 13],
    pub ip: u128,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for SourceRangeKeyV6 {}
