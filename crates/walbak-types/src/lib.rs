pub mod checksum;
pub mod error;
pub mod gid;
pub mod size;
pub mod uuid;

/// Logical block size in bytes. Fixed by the wlog-device format.
pub const LOGICAL_BLOCK_SIZE: usize = 512;

/// Largest number of logical blocks a single data frame may carry.
pub const MAX_BULK_LB: u64 = u16::MAX as u64;
