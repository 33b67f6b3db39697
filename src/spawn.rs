//! Child-spawn and the foreground PTY pump.
//!
//! Foreground execs get a pty, run a poll loop multiplexing the socket and
//! the pty master in the same worker thread, and are reaped inline once
//! the pump ends. Background execs get their standard streams wired to
//! `/dev/null` and are reaped by a detached thread so the worker can go
//! back to serving the session immediately.

use std::ffi::CString;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::thread;

use anyhow::{anyhow, Context};
use nix::fcntl::OFlag;
use nix::pty::openpty;
use nix::unistd::{close, dup2, execvp, execvpe, fork, pipe2, read, setsid, write, ForkResult, Pid};

use crate::consts::PUMP_BUF_SIZE;
use crate::protocol::ExecChunk;
use crate::tty;

/// What the worker thread needs to know once spawn returns.
pub enum Spawned {
    /// Exec failed before or during the child's `exec`; the caller should
    /// send the sentinel pid and otherwise carry on with the session.
    Failed,
    /// Spawned in the background: fire-and-forget, already reaped by a
    /// detached thread.
    Background { pid: u32 },
    /// Spawned in the foreground: caller owns `master_fd` until the pump
    /// finishes and must run `pump_and_reap` next.
    Foreground { pid: u32, master_fd: RawFd },
}

/// Builds argv/envp as NUL-terminated C strings, forks, execs, and
/// (foreground only) sets up a pty first. Uses the classic self-pipe
/// trick so the parent can distinguish "fork succeeded, but the
/// subsequent exec failed" from a real, running child: a `CLOEXEC` pipe
/// is inherited across fork; the child only ever writes to it if `exec`
/// itself returns (i.e. failed), and the write end is closed for free by
/// the kernel the moment `exec` succeeds.
pub fn spawn(background: bool, argv: &[Vec<u8>], envp: &[Vec<u8>]) -> anyhow::Result<Spawned> {
    let argv_c = to_cstrings(argv)?;
    let envp_c = to_cstrings(envp)?;

    let master_fd = if background {
        None
    } else {
        let pty = openpty(None, None).context("opening pty")?;
        // the slave is only needed in the child; closed there after dup2
        Some(pty)
    };

    let (err_read, err_write) =
        pipe2(OFlag::O_CLOEXEC).context("creating spawn-status pipe")?;

    match unsafe { fork() }.context("forking spawn child")? {
        ForkResult::Child => {
            drop(err_read);
            child_main(background, master_fd.as_ref(), &argv_c, &envp_c, err_write.as_raw_fd());
            unreachable!("child_main never returns");
        }
        ForkResult::Parent { child } => {
            drop(err_write);
            // close the slave in the parent; only the child needs it.
            let master_raw = master_fd.map(|pty| {
                drop(pty.slave);
                pty.master
            });

            let exec_failed = wait_for_exec_result(err_read)?;
            if exec_failed {
                // master_raw drops here, closing the master fd exactly
                // once; don't also `close` it by hand, or a fd opened by
                // another worker between the two closes could get reused
                // and closed out from under it.
                drop(master_raw);
                // the forked child is either already gone (execvp failed and
                // it _exit'd) or about to be; reap it so it doesn't zombie.
                let _ = nix::sys::wait::waitpid(child, None);
                return Ok(Spawned::Failed);
            }

            if background {
                spawn_background_reaper(child);
                Ok(Spawned::Background { pid: child.as_raw() as u32 })
            } else {
                let master = master_raw.expect("foreground spawn always opens a pty");
                let master_fd = master.as_raw_fd();
                std::mem::forget(master); // ownership now tracked by the caller via master_fd
                Ok(Spawned::Foreground { pid: child.as_raw() as u32, master_fd })
            }
        }
    }
}

fn to_cstrings(entries: &[Vec<u8>]) -> anyhow::Result<Vec<CString>> {
    entries
        .iter()
        .map(|e| CString::new(e.clone()).context("argv/envp entry contains an embedded NUL"))
        .collect()
}

/// Runs entirely in the forked child. Never returns: either `exec`
/// replaces the process image, or setup/exec failed and we report that
/// over the pipe and `_exit`.
fn child_main(
    background: bool,
    pty: Option<&nix::pty::OpenptyResult>,
    argv: &[CString],
    envp: &[CString],
    err_write: RawFd,
) -> ! {
    let result: anyhow::Result<()> = (|| {
        setsid().context("setsid in spawned child")?;

        if background {
            redirect_stdio_to_null()?;
        } else {
            let pty = pty.expect("foreground spawn always has a pty");
            let slave_fd = pty.slave.as_raw_fd();
            unsafe {
                let _ = libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0);
            }
            dup2(slave_fd, libc::STDIN_FILENO).context("dup2 pty slave to stdin")?;
            dup2(slave_fd, libc::STDOUT_FILENO).context("dup2 pty slave to stdout")?;
            dup2(slave_fd, libc::STDERR_FILENO).context("dup2 pty slave to stderr")?;
            close(pty.master.as_raw_fd()).ok();
            if slave_fd > libc::STDERR_FILENO {
                close(slave_fd).ok();
            }
        }

        if argv.is_empty() {
            return Err(anyhow!("argv must not be empty"));
        }

        if envp.is_empty() {
            execvp(&argv[0], argv).context("execvp")?;
        } else {
            execvpe(&argv[0], argv, envp).context("execvpe")?;
        }
        unreachable!("exec replaces the process image on success")
    })();

    // only reachable if something above failed; tell the parent and die.
    if let Err(e) = result {
        let msg = format!("{:#}", e);
        let _ = write(unsafe { BorrowedFd::borrow_raw(err_write) }, msg.as_bytes());
    }
    std::process::exit(127);
}

fn redirect_stdio_to_null() -> anyhow::Result<()> {
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("opening /dev/null")?;
    let fd = devnull.as_raw_fd();
    dup2(fd, libc::STDIN_FILENO).context("dup2 /dev/null to stdin")?;
    dup2(fd, libc::STDOUT_FILENO).context("dup2 /dev/null to stdout")?;
    dup2(fd, libc::STDERR_FILENO).context("dup2 /dev/null to stderr")?;
    Ok(())
}

/// Blocks until the pipe either delivers an error message (exec failed)
/// or hits EOF (the write end closed because exec succeeded). Consumes
/// the read end so it closes exactly once, on return.
fn wait_for_exec_result(err_read: std::os::fd::OwnedFd) -> anyhow::Result<bool> {
    let mut buf = [0u8; 4096];
    let n = read(&err_read, &mut buf).context("reading spawn-status pipe")?;
    Ok(n > 0)
}

fn spawn_background_reaper(child: Pid) {
    thread::Builder::new()
        .name(format!("reap-{}", child.as_raw()))
        .spawn(move || {
            let _ = nix::sys::wait::waitpid(child, None);
        })
        .expect("spawning background reaper thread");
}

/// Runs the poll loop multiplexing `stream` and `master_fd` until either
/// side closes, then reaps the child and writes the terminating exit
/// chunk. This is the only place the session loop is suspended: the
/// worker thread does nothing else while this runs (§5's "within a
/// foreground exec, the pty pump runs in that same worker").
pub fn pump_and_reap(
    stream: &mut std::net::TcpStream,
    master_fd: RawFd,
    pid: Pid,
) -> anyhow::Result<()> {
    tty::Size::default().set_fd(master_fd).ok();

    let result = pump(stream, master_fd);
    let _ = close(master_fd);

    // the pump loop ending (either side closed) doesn't mean the child
    // has exited yet, but waitpid will block until it does, which is
    // exactly what the spec calls for.
    let status = nix::sys::wait::waitpid(pid, None).context("waitpid on spawned child")?;
    result?;

    let encoded = encode_wait_status(&status);
    ExecChunk::exit(&encoded).write(stream).context("writing exit chunk")?;
    Ok(())
}

fn pump(stream: &mut std::net::TcpStream, master_fd: RawFd) -> anyhow::Result<()> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    let sock_fd = stream.as_raw_fd();
    let mut buf = vec![0u8; PUMP_BUF_SIZE];

    loop {
        let mut fds = [
            PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(master_fd) }, PollFlags::POLLIN),
            PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(sock_fd) }, PollFlags::POLLIN),
        ];

        poll(&mut fds, PollTimeout::NONE).context("polling pty/socket")?;

        let master_ready = fds[0]
            .revents()
            .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
            .unwrap_or(false);
        let sock_ready = fds[1]
            .revents()
            .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
            .unwrap_or(false);

        if master_ready {
            let n = read(unsafe { BorrowedFd::borrow_raw(master_fd) }, &mut buf).unwrap_or(0);
            if n == 0 {
                return Ok(());
            }
            ExecChunk::stdout(&buf[..n]).write(stream).context("forwarding stdout chunk")?;
        }

        if sock_ready {
            let n = match stream.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(e).context("reading from controller socket"),
            };
            if n == 0 {
                return Ok(());
            }
            write_all_to_master(master_fd, &buf[..n])?;
        }
    }
}

fn write_all_to_master(fd: RawFd, mut data: &[u8]) -> anyhow::Result<()> {
    while !data.is_empty() {
        let n = write(unsafe { BorrowedFd::borrow_raw(fd) }, data).context("writing to pty master")?;
        data = &data[n..];
    }
    Ok(())
}

fn encode_wait_status(status: &nix::sys::wait::WaitStatus) -> [u8; 4] {
    // the spec wants the platform's raw waitpid status word; nix doesn't
    // expose the raw int from a parsed WaitStatus, so we reconstruct the
    // usual POSIX encoding (exited: low byte 0, exit code in next byte;
    // signaled: low 7 bits are the signal number).
    use nix::sys::wait::WaitStatus::*;
    let raw: i32 = match *status {
        Exited(_, code) => (code & 0xff) << 8,
        Signaled(_, sig, core_dumped) => (sig as i32) | if core_dumped { 0x80 } else { 0 },
        _ => 0,
    };
    raw.to_le_bytes()
}
