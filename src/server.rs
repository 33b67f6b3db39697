//! The listener: one `accept` loop on the main thread, one dedicated
//! worker thread per accepted connection. There is no shared mutable
//! state between workers in the core beyond what `Session` threads
//! through the handler modules themselves.

use std::net::TcpListener;
use std::os::fd::FromRawFd;
use std::thread;

use anyhow::{anyhow, Context};
use tracing::{error, info};

use crate::consts::LISTEN_BACKLOG;
use crate::session::Session;

/// Binds the dual-stack IPv6 listener described in the listener component:
/// `SO_REUSEADDR`, `IPV6_V6ONLY=0` so IPv4 clients connect via mapped
/// addresses too, close-on-exec, and a backlog of at least
/// `LISTEN_BACKLOG`. We build this by hand with raw libc calls rather than
/// `TcpListener::bind` because the standard library gives us no way to
/// clear `IPV6_V6ONLY` or to request `SOCK_CLOEXEC` atomically at
/// creation time.
pub fn bind(port: u16) -> anyhow::Result<TcpListener> {
    unsafe {
        let fd = libc::socket(libc::AF_INET6, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(last_os_error("socket(2)"));
        }

        let reuseaddr: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuseaddr as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            libc::close(fd);
            return Err(last_os_error("setsockopt(SO_REUSEADDR)"));
        }

        // dual-stack: accept both IPv4-mapped and native IPv6 connections
        // on the same socket.
        let v6only: libc::c_int = 0;
        if libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            &v6only as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            libc::close(fd);
            return Err(last_os_error("setsockopt(IPV6_V6ONLY)"));
        }

        let mut addr: libc::sockaddr_in6 = std::mem::zeroed();
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        addr.sin6_port = port.to_be();
        addr.sin6_addr = libc::in6addr_any;

        let addr_ptr = &addr as *const libc::sockaddr_in6 as *const libc::sockaddr;
        if libc::bind(fd, addr_ptr, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t) != 0 {
            libc::close(fd);
            return Err(last_os_error("bind(2)"));
        }

        if libc::listen(fd, LISTEN_BACKLOG) != 0 {
            libc::close(fd);
            return Err(last_os_error("listen(2)"));
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

fn last_os_error(what: &str) -> anyhow::Error {
    anyhow!("{}: {}", what, std::io::Error::last_os_error())
}

/// Runs the accept loop forever. Each accepted connection gets its own
/// worker thread and its own `Session`; a session ending (cleanly or via
/// protocol violation) never affects any other session.
pub fn serve(listener: TcpListener) -> anyhow::Result<()> {
    info!("listening for controller connections");

    let mut conn_id: u64 = 0;
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        conn_id += 1;
        let id = conn_id;

        thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || {
                info!(conn_id = id, peer = %peer, "accepted connection");
                if let Err(e) = Session::new(stream).run() {
                    error!(conn_id = id, error = %e, "session ended with error");
                } else {
                    info!(conn_id = id, "session ended cleanly");
                }
            })
            .context("spawning session worker thread")?;
    }
}
