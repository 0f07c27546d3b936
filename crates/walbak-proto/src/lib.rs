//! Wire-format primitives shared by the walbak client and server sides.
//!
//! Intentionally minimal: value packets, stream-control bytes, the first
//! negotiate handshake, and message/protocol name constants. No volume
//! state, no disk I/O.

pub mod msg;
pub mod negotiate;
pub mod net;
pub mod packet;
pub mod stream;

/// Current protocol version. Exchanged during the first negotiate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default listen ports.
pub const DEFAULT_STORAGE_PORT: u16 = 10000;
pub const DEFAULT_PROXY_PORT: u16 = 10100;
pub const DEFAULT_ARCHIVE_PORT: u16 = 10200;
