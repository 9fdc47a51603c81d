//! Init-system integration: readiness/watchdog notification over
//! `NOTIFY_SOCKET` and adoption of pre-bound sockets via `LISTEN_FDS`.

use std::os::fd::RawFd;
use std::sync::OnceLock;

use tracing::{debug, warn};

const LISTEN_FDS_START: RawFd = 3;

/// Sends one notification datagram; abstract-namespace sockets (a
/// leading `@`) are supported.
pub(crate) fn notify(message: &str) {
    let Some(path) = std::env::var_os("NOTIFY_SOCKET") else {
        return;
    };
    let path = path.to_string_lossy().into_owned();
    if path.is_empty() {
        return;
    }

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        warn!("failed to create notify socket");
        return;
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        unsafe { libc::close(fd) };
        return;
    }
    for (i, &b) in bytes.iter().enumerate() {
        addr.sun_path[i] = b as libc::c_char;
    }
    let mut len = std::mem::size_of::<libc::sa_family_t>() + bytes.len();
    if addr.sun_path[0] == b'@' as libc::c_char {
        // Abstract namespace: leading NUL instead of '@', no trailing NUL.
        addr.sun_path[0] = 0;
    } else {
        len += 1;
    }

    let rc = unsafe {
        libc::sendto(
            fd,
            message.as_ptr() as *const libc::c_void,
            message.len(),
            0,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len as libc::socklen_t,
        )
    };
    if rc < 0 {
        warn!("failed to notify init system");
    }
    unsafe { libc::close(fd) };
}

pub(crate) fn notify_ready() {
    notify("READY=1");
}

pub(crate) fn notify_watchdog() {
    notify("WATCHDOG=1");
}

/// The watchdog period, when `WATCHDOG_USEC` applies to this process.
pub(crate) fn watchdog_usec() -> Option<u64> {
    let usec = std::env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Ok(pid) = std::env::var("WATCHDOG_PID") {
        if pid.parse::<u32>() != Ok(std::process::id()) {
            return None;
        }
    }
    Some(usec)
}

/// File descriptors passed by the init system, if `LISTEN_PID` names
/// this process. Consumed once; the variables are cleared afterwards.
pub(crate) fn listen_fds() -> &'static [RawFd] {
    static FDS: OnceLock<Vec<RawFd>> = OnceLock::new();
    FDS.get_or_init(|| {
        let pid_matches = std::env::var("LISTEN_PID")
            .ok()
            .and_then(|pid| pid.parse::<u32>().ok())
            == Some(std::process::id());
        if !pid_matches {
            return Vec::new();
        }
        let count = std::env::var("LISTEN_FDS")
            .ok()
            .and_then(|n| n.parse::<i32>().ok())
            .unwrap_or(0);
        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_FDNAMES");
        let fds: Vec<RawFd> = (0..count).map(|i| LISTEN_FDS_START + i).collect();
        if !fds.is_empty() {
            debug!("adopted {} sockets from the init system", fds.len());
        }
        fds
    })
}
