//! Framing I/O and the binary command codec.
//!
//! Every multi-byte integer on the wire is little-endian and every struct is
//! packed (no implicit padding): we never derive a codec from a Rust struct
//! layout, we read and write fields one at a time with `byteorder`.

use std::io::{self, Read, Write};

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::consts::{self, ChunkKind, CommandKind};

/// Whether a `recv_exact_ext` failure was a clean peer shutdown (no bytes at
/// all were read) or a genuine I/O error / truncated message.
pub enum RecvOutcome {
    Full(Vec<u8>),
    CleanEof,
}

/// Fills exactly `n` bytes or fails. Short reads are retried transparently.
pub fn recv_exact<R: Read>(r: &mut R, n: usize) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).context("short read filling buffer")?;
    Ok(buf)
}

/// Like `recv_exact`, but distinguishes a clean peer close (zero bytes read
/// at the very start of the message) from a mid-message error, so callers
/// can tell "the session ended" from "the session is broken".
pub fn recv_exact_ext<R: Read>(r: &mut R, n: usize) -> anyhow::Result<RecvOutcome> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let read = match r.read(&mut buf[filled..]) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("reading from peer"),
        };
        if read == 0 {
            if filled == 0 {
                return Ok(RecvOutcome::CleanEof);
            }
            return Err(anyhow!("peer closed mid-message after {} of {} bytes", filled, n));
        }
        filled += read;
    }
    Ok(RecvOutcome::Full(buf))
}

/// Writes every byte of `buf`, looping over partial writes.
pub fn send_all<W: Write>(w: &mut W, buf: &[u8]) -> anyhow::Result<()> {
    w.write_all(buf).context("writing to peer")
}

/// The fixed command header shared by both directions of the protocol.
#[derive(Copy, Clone, Debug)]
pub struct CommandHeader {
    pub magic: u32,
    pub kind: u32,
}

impl CommandHeader {
    pub const WIRE_LEN: usize = 8;

    pub fn new(kind: CommandKind) -> Self {
        CommandHeader { magic: consts::CMD_MAGIC, kind: kind as u32 }
    }

    pub fn read<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let magic = r.read_u32::<LittleEndian>().context("reading command magic")?;
        let kind = r.read_u32::<LittleEndian>().context("reading command kind")?;
        Ok(CommandHeader { magic, kind })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> anyhow::Result<()> {
        w.write_u32::<LittleEndian>(self.magic).context("writing command magic")?;
        w.write_u32::<LittleEndian>(self.kind).context("writing command kind")?;
        Ok(())
    }

    pub fn is_valid_magic(&self) -> bool {
        self.magic == consts::CMD_MAGIC
    }
}

/// Sends a bare reply header (used for `REPLY_ERROR`, `REPLY_PEEK`, `REPLY_POKE`).
pub fn write_reply_header<W: Write>(w: &mut W, kind: CommandKind) -> anyhow::Result<()> {
    CommandHeader::new(kind).write(w)
}

/// Sends the 260-byte connect banner: magic, then the zero-padded sysname.
pub fn write_banner<W: Write>(w: &mut W) -> anyhow::Result<()> {
    w.write_u32::<LittleEndian>(consts::BANNER_MAGIC).context("writing banner magic")?;

    let mut sysname_field = [0u8; consts::BANNER_SYSNAME_LEN];
    let sysname = uname_sysname()?;
    let bytes = sysname.as_bytes();
    let n = bytes.len().min(consts::BANNER_SYSNAME_LEN);
    sysname_field[..n].copy_from_slice(&bytes[..n]);

    w.write_all(&sysname_field).context("writing banner sysname")?;
    Ok(())
}

fn uname_sysname() -> anyhow::Result<String> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::uname(&mut uts) };
    if rc != 0 {
        return Err(anyhow!("uname failed: {}", io::Error::last_os_error()));
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(uts.sysname.as_ptr()) };
    Ok(cstr.to_string_lossy().into_owned())
}

/// A parsed EXEC request body.
pub struct ExecRequest {
    pub background: bool,
    pub argv: Vec<Vec<u8>>,
    pub envp: Vec<Vec<u8>>,
}

impl ExecRequest {
    pub fn read<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let background = r.read_u8().context("reading background flag")? != 0;

        let argc = r.read_u32::<LittleEndian>().context("reading argc")? as usize;
        if argc == 0 {
            return Err(anyhow!("argc must be >= 1 (argv[0] is the program)"));
        }
        let argv = read_length_prefixed_vec(r, argc).context("reading argv")?;

        let envc = r.read_u32::<LittleEndian>().context("reading envc")? as usize;
        let envp = read_length_prefixed_vec(r, envc).context("reading envp")?;

        Ok(ExecRequest { background, argv, envp })
    }
}

fn read_length_prefixed_vec<R: Read>(r: &mut R, count: usize) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let len = r.read_u32::<LittleEndian>().context("reading entry length prefix")? as usize;
        let mut entry = vec![0u8; len];
        r.read_exact(&mut entry).context("reading entry bytes")?;
        out.push(entry);
    }
    Ok(out)
}

/// Writes a 4-byte pid, little-endian (used for both success and the
/// `SPAWN_FAIL_SENTINEL_PID` failure case).
pub fn write_pid<W: Write>(w: &mut W, pid: u32) -> anyhow::Result<()> {
    w.write_u32::<LittleEndian>(pid).context("writing pid")
}

/// A typed, length-prefixed fragment streamed during a foreground exec.
pub struct ExecChunk<'a> {
    pub kind: ChunkKind,
    pub payload: &'a [u8],
}

impl<'a> ExecChunk<'a> {
    pub fn stdout(payload: &'a [u8]) -> Self {
        ExecChunk { kind: ChunkKind::Stdout, payload }
    }

    pub fn exit(payload: &'a [u8; 4]) -> Self {
        ExecChunk { kind: ChunkKind::Exit, payload }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> anyhow::Result<()> {
        w.write_u32::<LittleEndian>(self.kind as u32).context("writing chunk kind")?;
        w.write_u32::<LittleEndian>(self.payload.len() as u32).context("writing chunk size")?;
        w.write_all(self.payload).context("writing chunk payload")?;
        Ok(())
    }
}

/// Fixed-width string field used by DLOPEN (filename) and DLSYM (symbol
/// name): a null-terminated byte string inside a `FIXED_STR_LEN`-byte field.
pub fn read_fixed_str<R: Read>(r: &mut R) -> anyhow::Result<String> {
    let mut buf = [0u8; consts::FIXED_STR_LEN];
    r.read_exact(&mut buf).context("reading fixed-width string field")?;
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..nul]).into_owned())
}

pub fn write_fixed_str<W: Write>(w: &mut W, s: &str) -> anyhow::Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() >= consts::FIXED_STR_LEN {
        return Err(anyhow!("string {:?} too long for fixed field", s));
    }
    let mut buf = [0u8; consts::FIXED_STR_LEN];
    buf[..bytes.len()].copy_from_slice(bytes);
    w.write_all(&buf).context("writing fixed-width string field")
}

pub struct DlopenRequest {
    pub filename: String,
    pub mode: i32,
}

impl DlopenRequest {
    pub fn read<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let filename = read_fixed_str(r)?;
        let mode = r.read_i32::<LittleEndian>().context("reading dlopen mode")?;
        Ok(DlopenRequest { filename, mode })
    }
}

pub struct DlsymRequest {
    pub handle: u64,
    pub name: String,
}

impl DlsymRequest {
    pub fn read<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let handle = r.read_u64::<LittleEndian>().context("reading dlsym handle")?;
        let name = read_fixed_str(r)?;
        Ok(DlsymRequest { handle, name })
    }
}

pub struct CallRequest {
    pub address: u64,
    pub args: Vec<u64>,
}

impl CallRequest {
    pub fn read<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let address = r.read_u64::<LittleEndian>().context("reading call address")?;
        let argc = r.read_u64::<LittleEndian>().context("reading call argc")? as usize;
        if argc > consts::MAX_CALL_ARGC {
            return Err(anyhow!("call argc {} exceeds max {}", argc, consts::MAX_CALL_ARGC));
        }
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(r.read_u64::<LittleEndian>().context("reading call argument")?);
        }
        Ok(CallRequest { address, args })
    }
}

pub struct MemRegionRequest {
    pub address: u64,
    pub size: u64,
}

impl MemRegionRequest {
    pub fn read<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let address = r.read_u64::<LittleEndian>().context("reading memory address")?;
        let size = r.read_u64::<LittleEndian>().context("reading memory size")?;
        Ok(MemRegionRequest { address, size })
    }
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> anyhow::Result<()> {
    w.write_u64::<LittleEndian>(v).context("writing u64 reply")
}

pub fn read_u64<R: Read>(r: &mut R) -> anyhow::Result<u64> {
    r.read_u64::<LittleEndian>().context("reading u64 field")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn command_header_round_trips() {
        let hdr = CommandHeader::new(CommandKind::Exec);
        let mut buf = Vec::new();
        hdr.write(&mut buf).unwrap();
        assert_eq!(buf.len(), CommandHeader::WIRE_LEN);

        let parsed = CommandHeader::read(&mut Cursor::new(buf)).unwrap();
        assert!(parsed.is_valid_magic());
        assert_eq!(parsed.kind, CommandKind::Exec as u32);
    }

    #[test]
    fn bad_magic_is_detected() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(CommandKind::Close as u32).unwrap();
        let parsed = CommandHeader::read(&mut Cursor::new(buf)).unwrap();
        assert!(!parsed.is_valid_magic());
    }

    #[test]
    fn exec_request_rejects_empty_argv() {
        let mut buf = Vec::new();
        buf.write_u8(0).unwrap(); // background = false
        buf.write_u32::<LittleEndian>(0).unwrap(); // argc = 0
        assert!(ExecRequest::read(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn exec_request_parses_argv_and_envp() {
        let mut buf = Vec::new();
        buf.write_u8(1).unwrap(); // background = true
        buf.write_u32::<LittleEndian>(2).unwrap(); // argc
        for entry in [&b"/bin/echo"[..], &b"hi"[..]] {
            buf.write_u32::<LittleEndian>(entry.len() as u32).unwrap();
            buf.write_all(entry).unwrap();
        }
        buf.write_u32::<LittleEndian>(0).unwrap(); // envc

        let req = ExecRequest::read(&mut Cursor::new(buf)).unwrap();
        assert!(req.background);
        assert_eq!(req.argv, vec![b"/bin/echo".to_vec(), b"hi".to_vec()]);
        assert!(req.envp.is_empty());
    }

    #[test]
    fn fixed_str_round_trips_and_rejects_overlong() {
        let mut buf = Vec::new();
        write_fixed_str(&mut buf, "libc.so.6").unwrap();
        assert_eq!(buf.len(), consts::FIXED_STR_LEN);
        let parsed = read_fixed_str(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed, "libc.so.6");

        let mut w = Vec::new();
        let long = "x".repeat(consts::FIXED_STR_LEN);
        assert!(write_fixed_str(&mut w, &long).is_err());
    }

    #[test]
    fn call_request_rejects_oversized_argc() {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(0xdead_beef).unwrap();
        buf.write_u64::<LittleEndian>(12).unwrap();
        assert!(CallRequest::read(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn recv_exact_ext_reports_clean_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        match recv_exact_ext(&mut cursor, 8).unwrap() {
            RecvOutcome::CleanEof => {}
            RecvOutcome::Full(_) => panic!("expected clean eof"),
        }
    }
}
