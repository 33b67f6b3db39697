//! The session loop: banner, then a strictly serial read-header /
//! dispatch / reply loop until `CLOSE`, a protocol violation, or a
//! handler failure ends the session.

use std::net::TcpStream;
use std::sync::OnceLock;

use anyhow::{anyhow, Context};
use tracing::{debug, warn};

use crate::call;
use crate::consts::{self, CommandKind};
use crate::dynlink;
use crate::memory;
use crate::protocol::{
    self, CallRequest, CommandHeader, DlopenRequest, DlsymRequest, ExecRequest, MemRegionRequest,
};
use crate::spawn::{self, Spawned};

pub struct Session {
    stream: TcpStream,
}

impl Session {
    pub fn new(stream: TcpStream) -> Self {
        Session { stream }
    }

    /// Runs the whole session lifecycle: banner, then dispatch loop. Every
    /// exit path (clean close, protocol violation, handler failure) is
    /// funneled through here so the socket is always closed on the way
    /// out.
    pub fn run(mut self) -> anyhow::Result<()> {
        protocol::write_banner(&mut self.stream).context("sending banner")?;

        loop {
            // recv_exact_ext distinguishes the controller hanging up
            // between commands (expected, quiet) from a truncated header
            // mid-message (a real framing error).
            let raw = match protocol::recv_exact_ext(&mut self.stream, CommandHeader::WIRE_LEN) {
                Ok(protocol::RecvOutcome::Full(bytes)) => bytes,
                Ok(protocol::RecvOutcome::CleanEof) => {
                    debug!("controller disconnected between commands");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "framing error reading command header, closing session");
                    return Err(e);
                }
            };
            let header =
                CommandHeader::read(&mut std::io::Cursor::new(raw)).context("parsing command header")?;

            if !header.is_valid_magic() {
                warn!(magic = header.magic, "bad command magic, closing session");
                return Ok(());
            }

            let kind = match CommandKind::try_from(header.kind) {
                Ok(k) => k,
                Err(e) => {
                    warn!(kind = header.kind, "unknown command kind, closing session");
                    return Err(e);
                }
            };

            if let Err(e) = self.dispatch(kind) {
                warn!(?kind, error = %e, "handler failed, closing session");
                return Err(e);
            }

            if matches!(kind, CommandKind::Close) {
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, kind: CommandKind) -> anyhow::Result<()> {
        match kind {
            CommandKind::Exec => self.handle_exec(),
            CommandKind::Dlopen => self.handle_dlopen(),
            CommandKind::Dlclose => self.handle_dlclose(),
            CommandKind::Dlsym => self.handle_dlsym(),
            CommandKind::Call => self.handle_call(),
            CommandKind::Peek => self.handle_peek(),
            CommandKind::Poke => self.handle_poke(),
            CommandKind::GetDummyBlock => self.handle_get_dummy_block(),
            CommandKind::Close => Ok(()),
            other => Err(anyhow!("{:?} is not a client-initiated command", other)),
        }
    }

    fn handle_exec(&mut self) -> anyhow::Result<()> {
        let req = ExecRequest::read(&mut self.stream).context("reading exec request")?;

        match spawn::spawn(req.background, &req.argv, &req.envp) {
            Ok(Spawned::Failed) => {
                protocol::write_pid(&mut self.stream, consts::SPAWN_FAIL_SENTINEL_PID)
                    .context("writing spawn-failure sentinel pid")?;
                Ok(())
            }
            Ok(Spawned::Background { pid }) => {
                protocol::write_pid(&mut self.stream, pid).context("writing background pid")
            }
            Ok(Spawned::Foreground { pid, master_fd }) => {
                protocol::write_pid(&mut self.stream, pid).context("writing foreground pid")?;
                let nix_pid = nix::unistd::Pid::from_raw(pid as i32);
                spawn::pump_and_reap(&mut self.stream, master_fd, nix_pid)
            }
            Err(e) => {
                warn!(error = %e, "spawn setup failed before fork");
                protocol::write_pid(&mut self.stream, consts::SPAWN_FAIL_SENTINEL_PID)
                    .context("writing spawn-failure sentinel pid")
            }
        }
    }

    fn handle_dlopen(&mut self) -> anyhow::Result<()> {
        let req = DlopenRequest::read(&mut self.stream).context("reading dlopen request")?;
        let handle = dynlink::dlopen(&req.filename, req.mode)?;
        protocol::write_u64(&mut self.stream, handle).context("writing dlopen handle")
    }

    fn handle_dlclose(&mut self) -> anyhow::Result<()> {
        let handle = protocol::read_u64(&mut self.stream).context("reading dlclose handle")?;
        let status = dynlink::dlclose(handle)?;
        protocol::write_u64(&mut self.stream, status as u64).context("writing dlclose status")
    }

    fn handle_dlsym(&mut self) -> anyhow::Result<()> {
        let req = DlsymRequest::read(&mut self.stream).context("reading dlsym request")?;
        let address = dynlink::dlsym(req.handle, &req.name)?;
        protocol::write_u64(&mut self.stream, address).context("writing dlsym address")
    }

    fn handle_call(&mut self) -> anyhow::Result<()> {
        let req = CallRequest::read(&mut self.stream).context("reading call request")?;
        // Safety: the controller is fully trusted (see the no-authentication
        // non-goal); if `req.address` isn't really callable with this
        // arity, the agent process dies, which is accepted by design.
        let ret = unsafe { call::invoke(req.address, &req.args)? };
        protocol::write_u64(&mut self.stream, ret).context("writing call return value")
    }

    fn handle_peek(&mut self) -> anyhow::Result<()> {
        let req = MemRegionRequest::read(&mut self.stream).context("reading peek request")?;
        match memory::peek(req.address, req.size)? {
            Some(bytes) => {
                protocol::write_reply_header(&mut self.stream, CommandKind::ReplyPeek)
                    .context("writing peek reply header")?;
                protocol::send_all(&mut self.stream, &bytes).context("writing peek payload")
            }
            None => protocol::write_reply_header(&mut self.stream, CommandKind::ReplyError)
                .context("writing peek error reply"),
        }
    }

    fn handle_poke(&mut self) -> anyhow::Result<()> {
        let req = MemRegionRequest::read(&mut self.stream).context("reading poke request")?;
        let data = protocol::recv_exact(&mut self.stream, req.size as usize)
            .context("reading poke payload")?;

        if memory::poke(req.address, &data)? {
            protocol::write_reply_header(&mut self.stream, CommandKind::ReplyPoke)
                .context("writing poke reply header")
        } else {
            protocol::write_reply_header(&mut self.stream, CommandKind::ReplyError)
                .context("writing poke error reply")
        }
    }

    fn handle_get_dummy_block(&mut self) -> anyhow::Result<()> {
        protocol::write_u64(&mut self.stream, dummy_block_address())
            .context("writing dummy block pointer")
    }
}

/// A fixed, process-wide fake block-object literal the controller can
/// probe. Its exact contents don't matter to the agent; what matters is
/// that it's a stable, dereferenceable address handed out once and never
/// reused for anything else.
#[repr(C)]
struct DummyBlock {
    isa: u64,
    flags: u32,
    reserved: u32,
    invoke: u64,
    descriptor: u64,
}

unsafe extern "C" fn dummy_block_invoke() {}

static DUMMY_BLOCK: OnceLock<Box<DummyBlock>> = OnceLock::new();

fn dummy_block_address() -> u64 {
    let block = DUMMY_BLOCK.get_or_init(|| {
        Box::new(DummyBlock {
            isa: 0,
            flags: 0,
            reserved: 0,
            invoke: dummy_block_invoke as usize as u64,
            descriptor: 0,
        })
    });
    block.as_ref() as *const DummyBlock as u64
}
