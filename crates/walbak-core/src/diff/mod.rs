pub mod format;
pub mod mem;
pub mod merge;
pub mod virt;

pub use format::{DiffFileHeader, DiffReader, DiffRecKind, DiffRecord, DiffWriter};
pub use mem::{DiffMemory, RecIo};
pub use merge::DiffMerger;
pub use virt::{BaseImage, VirtualFullScanner};
