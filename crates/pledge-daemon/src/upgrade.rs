//! Live-upgrade plumbing: listener hand-off between server generations.
//!
//! On SIGUSR2 the running server spawns a replacement process that inherits
//! the listening socket. The socket's file descriptor number travels in an
//! environment variable with close-on-exec cleared; the parent's pid
//! travels alongside so the child can signal readiness once it is serving,
//! at which point the parent drains and exits.

use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::process::Command;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Environment variable carrying the inherited listener fd.
pub const UPGRADE_FD_ENV: &str = "PLEDGE_UPGRADE_FD";
/// Environment variable carrying the upgrade parent's pid.
pub const UPGRADE_PPID_ENV: &str = "PLEDGE_UPGRADE_PPID";

/// Take the listener inherited from a live-upgrade parent, if any.
///
/// The fd is validated before adoption; a stale or bogus environment value
/// is ignored. The variable is consumed either way so child processes of
/// this server do not adopt it again.
#[must_use]
pub fn inherited_listener() -> Option<TcpListener> {
    let raw = std::env::var(UPGRADE_FD_ENV).ok()?;
    std::env::remove_var(UPGRADE_FD_ENV);

    let fd: RawFd = match raw.parse() {
        Ok(fd) => fd,
        Err(_) => {
            warn!(value = %raw, "ignoring malformed {UPGRADE_FD_ENV}");
            return None;
        },
    };
    // SAFETY: F_GETFD on an arbitrary fd number is harmless; it only
    // queries descriptor flags and fails with EBADF when the fd is not
    // open.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        warn!(fd, "ignoring {UPGRADE_FD_ENV}: descriptor is not open");
        return None;
    }

    debug!(fd, "adopting inherited listener");
    // SAFETY: the fd comes from our own upgrade parent which passed a
    // listening TCP socket; validated open above, and ownership is taken
    // exactly once since the environment variable was consumed.
    Some(unsafe { TcpListener::from_raw_fd(fd) })
}

/// Spawn the replacement server process, handing it `listener`'s socket.
///
/// # Errors
///
/// Returns an IO error when the fd flags cannot be adjusted or the process
/// cannot be spawned.
pub fn spawn_replacement(listener: &TcpListener, args: &[String]) -> io::Result<u32> {
    let fd = listener.as_raw_fd();
    clear_cloexec(fd)?;

    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .args(args)
        .env(UPGRADE_FD_ENV, fd.to_string())
        .env(UPGRADE_PPID_ENV, std::process::id().to_string())
        .spawn()?;
    Ok(child.id())
}

/// In the replacement process: signal the upgrade parent that this server
/// is accepting, so it can drain and exit. Returns whether a parent was
/// notified.
pub fn notify_parent_ready() -> bool {
    let Ok(raw) = std::env::var(UPGRADE_PPID_ENV) else {
        return false;
    };
    std::env::remove_var(UPGRADE_PPID_ENV);

    let Ok(ppid) = raw.parse::<i32>() else {
        warn!(value = %raw, "ignoring malformed {UPGRADE_PPID_ENV}");
        return false;
    };
    match kill(Pid::from_raw(ppid), Signal::SIGTERM) {
        Ok(()) => {
            debug!(ppid, "signalled upgrade parent to drain");
            true
        },
        Err(e) => {
            warn!(ppid, error = %e, "signal upgrade parent");
            false
        },
    }
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd belongs to a live TcpListener borrowed by the caller; the
    // F_GETFD/F_SETFD pair only manipulates descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
