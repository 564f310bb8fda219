use std::{error, fmt};

use crate::bytes;

/// Fatal and recoverable analysis errors.
///
/// Every kind except [`Error::NameTooLong`] aborts the pipeline at the
/// failing stage; `NameTooLong` only skips the offending rename.
#[derive(Debug, Clone)]
pub enum Error {
    /// The opcode stream or a section ended mid-operand.
    TruncatedStream,
    /// Structural damage: bad magic, unknown opcode, enter/leave mismatch,
    /// negative stack size.
    MalformedModule(&'static str),
    /// The lifter finished a function with a non-empty work stack, or an
    /// opblock tried to pop from an empty one.
    UnbalancedStack { address: u32 },
    /// A branch references an address no jump point could be placed at.
    UnresolvedJump { address: u32 },
    /// A rename request exceeded the bounded name buffer; the rename is
    /// skipped.
    NameTooLong { len: usize },
    /// A cut address falls inside no known variable.
    VariableCutFailed { address: u32 },
    /// Reserved: arena allocation aborts on out-of-memory instead of
    /// reporting, so the pipeline never constructs this kind.
    AllocationFailure,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedStream => write!(f, "opcode stream ends mid-operand"),
            Self::MalformedModule(what) => write!(f, "malformed module: {what}"),
            Self::UnbalancedStack { address } => {
                write!(f, "unbalanced work stack in function 0x{address:x}")
            }
            Self::UnresolvedJump { address } => {
                write!(f, "no jump point for target address 0x{address:x}")
            }
            Self::NameTooLong { len } => {
                write!(f, "name of {len} bytes exceeds the name buffer")
            }
            Self::VariableCutFailed { address } => {
                write!(f, "address 0x{address:x} is inside no known variable")
            }
            Self::AllocationFailure => write!(f, "couldn't allocate an entity"),
        }
    }
}

impl error::Error for Error {}

impl From<bytes::Error> for Error {
    fn from(_: bytes::Error) -> Self {
        Self::TruncatedStream
    }
}
