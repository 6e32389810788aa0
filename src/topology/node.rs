//! Metadata that identifies a root on some rank.

/// A remote reference: root `index` on process `rank`.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct SfNode {
    pub rank: usize,
    pub index: usize,
}

impl SfNode {
    pub const fn new(rank: usize, index: usize) -> Self {
        Self { rank, index }
    }
}

impl From<(usize, usize)> for SfNode {
    fn from((rank, index): (usize, usize)) -> Self {
        Self { rank, index }
    }
}
