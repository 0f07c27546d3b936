//! Message strings, host types, protocol and command names.

/// Synchronous success reply.
pub const OK: &str = "ok";
/// Asynchronous acceptance reply (work continues after the reply).
pub const ACCEPT: &str = "accept";

/// Relation replies of the wdiff-transfer server. Informational, not fatal.
pub const TOO_NEW_DIFF: &str = "too-new-diff";
pub const TOO_OLD_DIFF: &str = "too-old-diff";
pub const DIFFERENT_UUID: &str = "different-uuid";
pub const STOPPED: &str = "stopped";
pub const ARCHIVE_NOT_FOUND: &str = "archive-not-found";

/// Host types sent during sync negotiation.
pub const HOST_STORAGE: &str = "storage";
pub const HOST_PROXY: &str = "proxy";
pub const HOST_ARCHIVE: &str = "archive";

/// Internal data-plane protocol names.
pub const PROTO_FULL_SYNC: &str = "dirty-full-sync";
pub const PROTO_HASH_SYNC: &str = "dirty-hash-sync";
pub const PROTO_WLOG_TRANSFER: &str = "wlog-transfer";
pub const PROTO_WDIFF_TRANSFER: &str = "wdiff-transfer";
pub const PROTO_REPL_SYNC: &str = "repl-sync";

/// Controller-facing command names.
pub const CMD_STATUS: &str = "status";
pub const CMD_INIT_VOL: &str = "init-vol";
pub const CMD_CLEAR_VOL: &str = "clear-vol";
pub const CMD_RESET_VOL: &str = "reset-vol";
pub const CMD_START: &str = "start";
pub const CMD_STOP: &str = "stop";
pub const CMD_FULL_BKP: &str = "full-bkp";
pub const CMD_HASH_BKP: &str = "hash-bkp";
pub const CMD_SNAPSHOT: &str = "snapshot";
pub const CMD_ARCHIVE_INFO: &str = "archive-info";
pub const CMD_RESTORE: &str = "restore";
pub const CMD_DEL_RESTORED: &str = "del-restored";
pub const CMD_REPLICATE: &str = "replicate";
pub const CMD_APPLY: &str = "apply";
pub const CMD_MERGE: &str = "merge";
pub const CMD_RESIZE: &str = "resize";
pub const CMD_SHUTDOWN: &str = "shutdown";
pub const CMD_KICK: &str = "kick";
pub const CMD_GET: &str = "get";

/// Targets of the `get` command.
pub const GET_STATE: &str = "state";
pub const GET_HOST_TYPE: &str = "host-type";
pub const GET_VOL: &str = "vol";
pub const GET_PID: &str = "pid";
pub const GET_DIFF: &str = "diff";
pub const GET_UUID: &str = "uuid";
pub const GET_BASE: &str = "base";
pub const GET_VOL_SIZE: &str = "vol-size";
pub const GET_RESTORED: &str = "restored";
pub const GET_RESTORABLE: &str = "restorable";
