use crate::memory::MemType;
use crate::Node;

/// Recoverable failures of the memory layer and the graph.
///
/// Accelerator driver faults are not represented here, they abort through
/// [crate::memory::device::fault].
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum Error {
    #[error("allocation of {bytes} bytes failed on {mem}")]
    Alloc { bytes: usize, mem: MemType },

    #[error("invalid device id {id} ({available} devices available)")]
    InvalidDevice { id: usize, available: usize },

    #[error("copy range {begin}..{begin}+{len} invalid for src size {src} / dst size {dst}")]
    Range {
        begin: usize,
        len: usize,
        src: usize,
        dst: usize,
    },

    #[error("index {index} out of bounds for size {size}")]
    IndexOutOfBounds { index: usize, size: usize },

    #[error("axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("operands live on different residencies: {0}/{1} vs {2}/{3}")]
    ResidencyMismatch(MemType, usize, MemType, usize),

    #[error("no backend for {op} on {mem}")]
    UnsupportedResidency { op: &'static str, mem: MemType },

    #[error("{var:?} is not an operand of {node:?}")]
    UnknownVariable { node: Node, var: Node },

    #[error("node {0:?} is not part of this graph")]
    UnknownNode(Node),

    #[error("node {0:?} is not a leaf")]
    NotALeaf(Node),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("node {0:?} still has consumers")]
    InUse(Node),

    #[error("graph already contains a node named {0:?}")]
    DuplicateName(String),
}

impl Error {
    /// Integer status code, `0` is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Error::Alloc { .. } => 1,
            Error::InvalidDevice { .. } => 2,
            Error::Range { .. } => 3,
            Error::IndexOutOfBounds { .. } => 4,
            Error::AxisOutOfRange { .. } => 5,
            Error::ShapeMismatch(_) => 6,
            Error::ResidencyMismatch(..) => 7,
            Error::UnsupportedResidency { .. } => 8,
            Error::UnknownVariable { .. } => 9,
            Error::UnknownNode(_) => 10,
            Error::NotALeaf(_) => 11,
            Error::InvalidConfig(_) => 12,
            Error::InUse(_) => 13,
            Error::DuplicateName(_) => 14,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub fn status<T>(r: &Result<T>) -> i32 {
    match r {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}
