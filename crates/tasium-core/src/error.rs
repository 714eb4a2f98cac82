use std::fmt;

/// Errors raised by the controller-frame data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    /// Port number is outside the port type set.
    BadPortIndex { port: u32, ports: u32 },
    /// A port type is not legal for the slot it was assigned, or the type
    /// sequence cannot form a valid layout.
    IllegalTypes,
    /// Logical controller id out of range.
    BadLogicalController { lcid: u32 },
    /// Legacy physical controller id out of range.
    BadLegacyPcid { pcid: u32 },
    /// Operation across two frames with different port type sets.
    TypeMismatch,
    /// Flat control index out of range.
    BadIndex { index: u32, indices: u32 },
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPortIndex { port, ports } => {
                write!(f, "invalid port index {port} (set has {ports} ports)")
            }
            Self::IllegalTypes => write!(f, "illegal port types"),
            Self::BadLogicalController { lcid } => {
                write!(f, "bad logical controller {lcid}")
            }
            Self::BadLegacyPcid { pcid } => write!(f, "bad legacy PCID {pcid}"),
            Self::TypeMismatch => write!(f, "port types do not match"),
            Self::BadIndex { index, indices } => {
                write!(f, "invalid control index {index} (set has {indices} indices)")
            }
        }
    }
}

impl std::error::Error for InputError {}

/// Errors raised by the movie state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovieError {
    /// The first subframe of a loaded vector does not have the sync flag set.
    BadFirstFrame,
    /// Saved pollcounter array length does not match the control index count.
    WrongCounterCount { expected: usize, actual: usize },
    /// A savestate does not belong to the currently loaded movie.
    IncompatibleSave,
}

impl fmt::Display for MovieError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadFirstFrame => {
                write!(f, "first subframe must have the frame sync flag set")
            }
            Self::WrongCounterCount { expected, actual } => {
                write!(f, "wrong number of poll counters (expected {expected}, got {actual})")
            }
            Self::IncompatibleSave => write!(f, "save is not from this movie"),
        }
    }
}

impl std::error::Error for MovieError {}
