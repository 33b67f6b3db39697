//! Exercises the binary over a real TCP socket, per the scenarios in the
//! protocol's testable-properties section.

mod support;

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ntest::timeout;

use support::{Agent, BANNER_MAGIC, CMD_MAGIC};

fn read_banner(stream: &mut std::net::TcpStream) -> anyhow::Result<[u8; 256]> {
    let magic = stream.read_u32::<LittleEndian>()?;
    assert_eq!(magic, BANNER_MAGIC, "banner magic");
    let mut sysname = [0u8; 256];
    stream.read_exact(&mut sysname)?;
    Ok(sysname)
}

#[test]
#[timeout(10000)]
fn banner_is_sent_on_every_connection() -> anyhow::Result<()> {
    let agent = Agent::spawn()?;

    for _ in 0..3 {
        let mut stream = agent.connect()?;
        let sysname = read_banner(&mut stream)?;
        let nul = sysname.iter().position(|&b| b == 0).unwrap_or(sysname.len());
        assert!(!sysname[..nul].is_empty(), "sysname prefix should be non-empty");
    }
    Ok(())
}

#[test]
#[timeout(10000)]
fn bad_magic_closes_without_a_reply() -> anyhow::Result<()> {
    let agent = Agent::spawn()?;
    let mut stream = agent.connect()?;
    read_banner(&mut stream)?;

    // magic = 0, kind = EXEC
    stream.write_u32::<LittleEndian>(0)?;
    stream.write_u32::<LittleEndian>(0)?;
    stream.flush()?;

    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf)?;
    assert_eq!(n, 0, "server must close without replying on bad magic");
    Ok(())
}

#[test]
#[timeout(10000)]
fn close_command_is_clean() -> anyhow::Result<()> {
    let agent = Agent::spawn()?;
    let mut stream = agent.connect()?;
    read_banner(&mut stream)?;

    stream.write_u32::<LittleEndian>(CMD_MAGIC)?;
    stream.write_u32::<LittleEndian>(10 /* CLOSE */)?;
    stream.flush()?;

    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf)?;
    assert_eq!(n, 0, "server must close with no further bytes after CLOSE");
    Ok(())
}

#[test]
#[timeout(10000)]
fn background_exec_returns_a_real_pid() -> anyhow::Result<()> {
    let agent = Agent::spawn()?;
    let mut stream = agent.connect()?;
    read_banner(&mut stream)?;

    support::write_argv(&mut stream, true, &["/bin/true"])?;
    stream.flush()?;

    let pid = stream.read_u32::<LittleEndian>()?;
    assert_ne!(pid, 0xFFFF_FFFF, "background spawn of /bin/true should succeed");
    Ok(())
}

#[test]
#[timeout(10000)]
fn foreground_exec_echoes_stdin_and_reports_exit() -> anyhow::Result<()> {
    let agent = Agent::spawn()?;
    let mut stream = agent.connect()?;
    read_banner(&mut stream)?;

    support::write_argv(&mut stream, false, &["/bin/echo", "hi"])?;
    stream.flush()?;

    let pid = stream.read_u32::<LittleEndian>()?;
    assert_ne!(pid, 0xFFFF_FFFF);

    let mut collected = Vec::new();
    let mut exit_status: Option<u32> = None;
    loop {
        let kind = stream.read_u32::<LittleEndian>()?;
        let size = stream.read_u32::<LittleEndian>()? as usize;
        let mut payload = vec![0u8; size];
        stream.read_exact(&mut payload)?;
        match kind {
            0 => collected.extend_from_slice(&payload),
            1 => {
                exit_status = Some(u32::from_le_bytes(payload.try_into().unwrap()));
                break;
            }
            other => panic!("unexpected chunk kind {other}"),
        }
    }

    let text = String::from_utf8_lossy(&collected);
    assert!(text.starts_with("hi"), "expected echoed output to start with 'hi', got {text:?}");
    let status = exit_status.expect("exit chunk must be present");
    assert_eq!(status & 0xff, 0, "exit chunk low byte encodes the exited-normally case");
    Ok(())
}

#[test]
#[timeout(10000)]
fn dlopen_dlsym_call_round_trip_reports_own_pid() -> anyhow::Result<()> {
    let agent = Agent::spawn()?;
    let mut stream = agent.connect()?;
    read_banner(&mut stream)?;

    let libname = if cfg!(target_os = "macos") { "/usr/lib/libSystem.dylib" } else { "libc.so.6" };

    stream.write_u32::<LittleEndian>(CMD_MAGIC)?;
    stream.write_u32::<LittleEndian>(1 /* DLOPEN */)?;
    let mut filename_field = [0u8; 1024];
    filename_field[..libname.len()].copy_from_slice(libname.as_bytes());
    stream.write_all(&filename_field)?;
    stream.write_i32::<LittleEndian>(2 /* RTLD_NOW */)?;
    stream.flush()?;
    let handle = stream.read_u64::<LittleEndian>()?;
    assert_ne!(handle, 0, "dlopen of {libname} should succeed");

    stream.write_u32::<LittleEndian>(CMD_MAGIC)?;
    stream.write_u32::<LittleEndian>(3 /* DLSYM */)?;
    stream.write_u64::<LittleEndian>(handle)?;
    let mut symbol_field = [0u8; 1024];
    symbol_field[.."getpid".len()].copy_from_slice(b"getpid");
    stream.write_all(&symbol_field)?;
    stream.flush()?;
    let address = stream.read_u64::<LittleEndian>()?;
    assert_ne!(address, 0, "getpid should resolve");

    stream.write_u32::<LittleEndian>(CMD_MAGIC)?;
    stream.write_u32::<LittleEndian>(4 /* CALL */)?;
    stream.write_u64::<LittleEndian>(address)?;
    stream.write_u64::<LittleEndian>(0)?; // argc = 0
    stream.flush()?;
    let ret = stream.read_u64::<LittleEndian>()?;
    assert_ne!(ret, 0, "agent's own pid should never be 0");

    stream.write_u32::<LittleEndian>(CMD_MAGIC)?;
    stream.write_u32::<LittleEndian>(2 /* DLCLOSE */)?;
    stream.write_u64::<LittleEndian>(handle)?;
    stream.flush()?;
    let status = stream.read_u64::<LittleEndian>()?;
    assert_eq!(status, 0);
    Ok(())
}

#[test]
#[timeout(10000)]
fn isolation_across_concurrent_sessions() -> anyhow::Result<()> {
    let agent = Agent::spawn()?;

    // session A commits a protocol violation...
    let mut bad = agent.connect()?;
    read_banner(&mut bad)?;
    bad.write_u32::<LittleEndian>(0)?;
    bad.write_u32::<LittleEndian>(0)?;
    bad.flush()?;
    let mut buf = [0u8; 1];
    assert_eq!(bad.read(&mut buf)?, 0);

    // ...while session B keeps working normally.
    let mut good = agent.connect()?;
    read_banner(&mut good)?;
    support::write_argv(&mut good, true, &["/bin/true"])?;
    good.flush()?;
    let pid = good.read_u32::<LittleEndian>()?;
    assert_ne!(pid, 0xFFFF_FFFF);
    Ok(())
}
