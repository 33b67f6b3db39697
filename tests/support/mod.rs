//! Spawns a real `hostagentd` subprocess bound to an ephemeral port and
//! hands back a connected `TcpStream`, so the scenarios in the spec's
//! testable-properties section run against the actual compiled binary
//! rather than against library internals.

use std::io::Write as _;
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, WriteBytesExt};

pub const CMD_MAGIC: u32 = 0x1234_5678;
pub const BANNER_MAGIC: u32 = 0x8888_8800;

pub struct Agent {
    child: Child,
    pub port: u16,
}

impl Agent {
    pub fn spawn() -> anyhow::Result<Agent> {
        let port = free_port().context("finding a free port")?;

        let child = Command::new(env!("CARGO_BIN_EXE_hostagentd"))
            .arg("-p")
            .arg(port.to_string())
            .arg("-vv")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning hostagentd")?;

        let mut agent = Agent { child, port };
        agent.wait_until_listening()?;
        Ok(agent)
    }

    fn wait_until_listening(&mut self) -> anyhow::Result<()> {
        let mut backoff = Duration::from_millis(10);
        for _ in 0..12 {
            if TcpStream::connect(("127.0.0.1", self.port)).is_ok() {
                return Ok(());
            }
            thread::sleep(backoff);
            backoff *= 2;
        }
        Err(anyhow!("hostagentd never started listening on port {}", self.port))
    }

    pub fn connect(&self) -> anyhow::Result<TcpStream> {
        TcpStream::connect(("127.0.0.1", self.port)).context("connecting to hostagentd")
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

pub fn write_header(stream: &mut TcpStream, magic: u32, kind: u32) -> anyhow::Result<()> {
    stream.write_u32::<LittleEndian>(magic)?;
    stream.write_u32::<LittleEndian>(kind)?;
    Ok(())
}

pub fn write_len_prefixed(stream: &mut TcpStream, bytes: &[u8]) -> anyhow::Result<()> {
    stream.write_u32::<LittleEndian>(bytes.len() as u32)?;
    stream.write_all(bytes)?;
    Ok(())
}

pub fn write_argv(stream: &mut TcpStream, background: bool, argv: &[&str]) -> anyhow::Result<()> {
    write_header(stream, CMD_MAGIC, 0 /* EXEC */)?;
    stream.write_u8(background as u8)?;
    stream.write_u32::<LittleEndian>(argv.len() as u32)?;
    for a in argv {
        write_len_prefixed(stream, a.as_bytes())?;
    }
    stream.write_u32::<LittleEndian>(0)?; // envc = 0, inherit
    Ok(())
}
