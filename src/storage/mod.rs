//! Storage module
//!
//! Piece buffers, hash validation, the save pipeline and resume data.

pub mod range_set;
pub mod piece;
pub mod file;
pub mod save;
pub mod resume;

pub use range_set::RangeSet;
pub use piece::{validate, BlockOutcome, PieceArray, PieceState, SaveRange};
pub use file::{DiskFileStore, FileId, FileStore, MemoryFileStore};
pub use save::{BlockEvent, PieceManager, SaveConfig};
pub use resume::ResumeData;
