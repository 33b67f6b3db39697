//! Wire-protocol constants and a few process-wide tunables.

/// Every command header (in either direction) starts with this magic.
pub const CMD_MAGIC: u32 = 0x1234_5678;

/// The banner magic the agent sends immediately after accept.
pub const BANNER_MAGIC: u32 = 0x8888_8800;

/// Width of the zero-padded `uname().sysname` field in the banner.
pub const BANNER_SYSNAME_LEN: usize = 256;

/// Width of the fixed dlopen filename / dlsym symbol-name fields.
pub const FIXED_STR_LEN: usize = 1024;

/// Largest arity the call trampoline supports.
pub const MAX_CALL_ARGC: usize = 11;

/// pid sent back to the controller when spawn itself failed.
pub const SPAWN_FAIL_SENTINEL_PID: u32 = 0xFFFF_FFFF;

/// Buffer size used by the foreground PTY pump; the spec requires at least 64KiB.
pub const PUMP_BUF_SIZE: usize = 64 * 1024;

/// Backlog passed to listen(2); the spec requires at least 1024.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Default port the CLI binds when `-p` is not given.
pub const DEFAULT_PORT: u16 = 5910;

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Exec = 0,
    Dlopen = 1,
    Dlclose = 2,
    Dlsym = 3,
    Call = 4,
    Peek = 5,
    Poke = 6,
    ReplyError = 7,
    ReplyPeek = 8,
    GetDummyBlock = 9,
    Close = 10,
    ReplyPoke = 11,
}

impl TryFrom<u32> for CommandKind {
    type Error = anyhow::Error;

    fn try_from(v: u32) -> anyhow::Result<Self> {
        use CommandKind::*;
        Ok(match v {
            0 => Exec,
            1 => Dlopen,
            2 => Dlclose,
            3 => Dlsym,
            4 => Call,
            5 => Peek,
            6 => Poke,
            7 => ReplyError,
            8 => ReplyPeek,
            9 => GetDummyBlock,
            10 => Close,
            11 => ReplyPoke,
            _ => anyhow::bail!("unknown command kind {}", v),
        })
    }
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    Stdout = 0,
    Exit = 1,
}
