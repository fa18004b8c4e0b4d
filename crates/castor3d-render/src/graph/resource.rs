//! Resources and passes as the frame graph sees them.

use std::fmt;

/// Handle of a resource declared on a [`super::FrameGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u32);

/// Handle of a pass declared on a [`super::FrameGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub(crate) u32);

impl PassId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Image,
    Buffer,
}

/// A resource passes read or write.
///
/// The graph never touches the resource itself; it only uses the
/// declarations to order passes.
#[derive(Debug, Clone)]
pub struct ResourceDesc {
    pub name: String,
    pub kind: ResourceKind,
}

/// Which dependency produced an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hazard {
    /// The consumer reads what the producer wrote.
    ReadAfterWrite,
    /// Both write; the later writer must come second.
    WriteAfterWrite,
    /// The later pass overwrites what an earlier one reads.
    WriteAfterRead,
    /// Declared with [`super::PassDesc::after`].
    Explicit,
}
