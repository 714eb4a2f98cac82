//! Compressed per-subframe controller input.
//!
//! A *controller frame* is one subframe of input across every attached port,
//! stored in a byte-packed record whose layout is described by a
//! [`PortTypeSet`]. Bit 0 of byte 0 is the frame sync flag: set on the first
//! subframe of each emulated frame. Frames are collected into a paged
//! [`ControllerFrameVector`] and read/written by the movie state machine
//! through per-control poll counters.

mod frame;
mod pollcounter;
mod port;
mod typeset;
mod vector;

pub use frame::{ControllerFrame, FrameMut, FrameRef};
pub use pollcounter::PollcounterVector;
pub use port::{
    ButtonDesc, ControlKind, ControllerDesc, GenericPort, PortType, SystemPort, read_axis_value,
    read_button_value,
};
pub use typeset::{IndexTriple, PortIndexMap, PortTypeSet};
pub use vector::ControllerFrameVector;

/// Bytes reserved for one subframe record. Port type sets larger than this
/// are rejected.
pub const CONTROLLER_FRAME_SIZE: usize = 128;

/// Size of one storage page of a frame vector. Chosen to stay under 64 KiB
/// once per-page bookkeeping is added.
pub const CONTROLLER_PAGE_SIZE: usize = 65500;

/// Sentinel for "this (port, controller, control) triple maps to no flat
/// control index". Kept as a stable value for legacy movie compatibility.
pub const INVALID_INDEX: u32 = 0xFFFF_FFFF;
