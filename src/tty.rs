//! PTY window-size plumbing.
//!
//! The wire protocol never carries a resize message, so the agent just
//! gives every pty a sane fixed size at creation time; this module is the
//! thin ioctl wrapper that does that, kept in its own file because it's
//! the one place we touch `TIOCSWINSZ` directly.

use std::os::unix::io::RawFd;

use anyhow::Context;
use nix::ioctl_write_ptr_bad;
use nix::libc::{self, winsize};

ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, winsize);

#[derive(Copy, Clone, Debug)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Default for Size {
    fn default() -> Self {
        Size { rows: 24, cols: 80 }
    }
}

impl Size {
    pub fn set_fd(&self, fd: RawFd) -> anyhow::Result<()> {
        let ws = winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe { tiocswinsz(fd, &ws) }.context("setting window size")?;
        Ok(())
    }
}
