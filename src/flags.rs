// This module encapsulates the bitflags API
// so that we don't leak details that may
// affect semver later on.

use bitflags::bitflags;

bitflags! {
    #[repr(transparent)]
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    struct NodeBitFlags: u32 {
        const EMPTY = 0;
        const IS_SAMPLE = 1 << 1;
    }
}

#[repr(transparent)]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct NodeFlags(NodeBitFlags);

impl NodeFlags {
    pub fn sample() -> Self {
        Self(NodeBitFlags::IS_SAMPLE)
    }

    pub fn is_sample(&self) -> bool {
        self.0.contains(NodeBitFlags::IS_SAMPLE)
    }
}
