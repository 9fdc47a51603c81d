//! The master process: forks workers, reaps and respawns them, and
//! escalates shutdown signals.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::{error, info, warn};

use super::signal::SignalPipe;
use super::systemd;
use crate::config::Config;
use crate::engine::timer::{self, Precision};

/// A worker exiting with this status asked not to be respawned.
pub const CHEAP_EXIT: i32 = 15;

/// Respawns inside this many rapid restarts trigger a cool-down sleep.
const RESPAWN_LIMIT: u32 = 5;
const RESPAWN_SLEEP: Duration = Duration::from_secs(2);
const GRACEFUL_WAIT: Duration = Duration::from_secs(30);

const MASTER_SIGNALS: &[i32] = &[
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGCHLD,
    libc::SIGHUP,
];

struct WorkerSlot {
    worker: usize,
}

/// Runs the master until all workers are gone. `worker_main` is invoked
/// in each forked child and its return value becomes the child's exit
/// status.
pub(crate) fn run_master<F>(
    config: &Config,
    worker_count: usize,
    worker_main: F,
) -> crate::Result<()>
where
    F: Fn(usize) -> i32,
{
    write_pidfile(config.pidfile.as_deref())?;
    apply_umask(config);
    drop_privileges(config)?;
    write_pidfile(config.pidfile2.as_deref())?;

    let pipe = SignalPipe::new().map_err(crate::Error::new_listen)?;
    pipe.install(MASTER_SIGNALS)
        .map_err(crate::Error::new_listen)?;

    let mut children: HashMap<libc::pid_t, WorkerSlot> = HashMap::new();
    let mut respawn_counts: HashMap<usize, u32> = HashMap::new();
    for worker in 0..worker_count {
        let pid = spawn_worker(worker, &worker_main)?;
        children.insert(pid, WorkerSlot { worker });
    }
    info!("spawned {} workers", worker_count);
    systemd::notify_ready();

    let mut watched = config.touch_reload.clone();
    if config.auto_restart {
        if let Ok(exe) = std::env::current_exe() {
            watched.push(exe);
        }
    }
    let mut touch = TouchWatch::new(&watched);
    // Housekeeping shares one coalesced tick; the watchdog keeps its
    // precise half-period so systemd never starves.
    let tick = timer::round(Duration::from_millis(1000), Precision::Coarse);
    let watchdog = systemd::watchdog_usec()
        .map(|usec| timer::round(Duration::from_micros(usec / 2), Precision::Precise));
    let mut last_watchdog = Instant::now();
    let mut last_decay = Instant::now();

    let mut term_requests = 0u32;
    let mut graceful_deadline: Option<Instant> = None;
    let mut restarting = false;

    loop {
        let signo = pipe
            .wait(tick.as_millis() as i32)
            .map_err(crate::Error::new_io)?;
        match signo {
            Some(libc::SIGINT) | Some(libc::SIGQUIT) => {
                term_requests += 1;
                match term_requests {
                    1 => {
                        info!("shutting down gracefully, terminating workers");
                        signal_children(&children, libc::SIGQUIT);
                        graceful_deadline = Some(Instant::now() + GRACEFUL_WAIT);
                    }
                    2 => {
                        warn!("second interrupt, sending SIGTERM to workers");
                        signal_children(&children, libc::SIGTERM);
                    }
                    _ => {
                        warn!("third interrupt, killing workers");
                        signal_children(&children, libc::SIGKILL);
                    }
                }
            }
            Some(libc::SIGCHLD) => {
                reap_children(
                    &mut children,
                    &mut respawn_counts,
                    term_requests > 0 || restarting,
                    &worker_main,
                )?;
            }
            Some(libc::SIGHUP) => {
                // Reserved.
            }
            _ => {}
        }

        let now = Instant::now();
        if now.duration_since(last_decay) >= Duration::from_secs(1) {
            last_decay = now;
            decay_respawns(&mut respawn_counts);
        }
        if let Some(period) = watchdog {
            if now.duration_since(last_watchdog) >= period {
                last_watchdog = now;
                systemd::notify_watchdog();
            }
        }
        if term_requests == 1 {
            if let Some(deadline) = graceful_deadline {
                if now >= deadline {
                    warn!("graceful shutdown timed out, sending SIGTERM");
                    signal_children(&children, libc::SIGTERM);
                    term_requests = 2;
                }
            }
        }
        if term_requests == 0 && !restarting && touch.changed() {
            info!("configuration touched, restarting workers");
            restarting = true;
            signal_children(&children, libc::SIGQUIT);
        }

        if children.is_empty() {
            if restarting {
                restarting = false;
                for worker in 0..worker_count {
                    let pid = spawn_worker(worker, &worker_main)?;
                    children.insert(pid, WorkerSlot { worker });
                }
                continue;
            }
            break;
        }
    }

    remove_pidfile(config.pidfile.as_deref());
    remove_pidfile(config.pidfile2.as_deref());
    Ok(())
}

fn spawn_worker<F>(worker: usize, worker_main: &F) -> crate::Result<libc::pid_t>
where
    F: Fn(usize) -> i32,
{
    match unsafe { libc::fork() } {
        -1 => Err(crate::Error::new_listen(std::io::Error::last_os_error())),
        0 => {
            SignalPipe::reset(MASTER_SIGNALS);
            let code = worker_main(worker);
            std::process::exit(code);
        }
        pid => Ok(pid),
    }
}

fn reap_children<F>(
    children: &mut HashMap<libc::pid_t, WorkerSlot>,
    respawn_counts: &mut HashMap<usize, u32>,
    shutting_down: bool,
    worker_main: &F,
) -> crate::Result<()>
where
    F: Fn(usize) -> i32,
{
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return Ok(());
        }
        let Some(slot) = children.remove(&pid) else {
            continue;
        };
        if shutting_down {
            continue;
        }

        let clean_exit = libc::WIFEXITED(status);
        let exit_code = if clean_exit { libc::WEXITSTATUS(status) } else { -1 };
        if clean_exit && exit_code == CHEAP_EXIT {
            info!("worker {} cheaped, not respawning", slot.worker);
            continue;
        }

        if clean_exit {
            warn!("worker {} exited with status {}", slot.worker, exit_code);
        } else {
            error!(
                "worker {} (pid {}) died, killed by signal {}, respawning",
                slot.worker,
                pid,
                libc::WTERMSIG(status)
            );
        }

        let respawns = respawn_counts.entry(slot.worker).or_insert(0);
        *respawns += 1;
        if *respawns >= RESPAWN_LIMIT {
            warn!(
                "worker {} is respawning too fast, sleeping before retry",
                slot.worker
            );
            std::thread::sleep(RESPAWN_SLEEP);
        }
        let new_pid = spawn_worker(slot.worker, worker_main)?;
        children.insert(new_pid, WorkerSlot { worker: slot.worker });
    }
}

/// The respawn pressure decays one unit per second per worker.
fn decay_respawns(respawn_counts: &mut HashMap<usize, u32>) {
    respawn_counts.retain(|_, count| {
        *count = count.saturating_sub(1);
        *count > 0
    });
}

fn signal_children(children: &HashMap<libc::pid_t, WorkerSlot>, signo: i32) {
    for &pid in children.keys() {
        unsafe {
            libc::kill(pid, signo);
        }
    }
}

pub(crate) fn write_pidfile(path: Option<&Path>) -> crate::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let mut file = std::fs::File::create(path).map_err(crate::Error::new_listen)?;
    writeln!(file, "{}", std::process::id()).map_err(crate::Error::new_listen)
}

fn remove_pidfile(path: Option<&Path>) {
    if let Some(path) = path {
        let _ = std::fs::remove_file(path);
    }
}

pub(crate) fn apply_umask(config: &Config) {
    if let Some(mask) = config.umask {
        unsafe {
            libc::umask(mask as libc::mode_t);
        }
    }
}

/// Drops gid then uid, with `initgroups` when a named user is given.
pub(crate) fn drop_privileges(config: &Config) -> crate::Result<()> {
    if let Some(gid) = &config.gid {
        let gid_num = resolve_gid(gid)?;
        if unsafe { libc::setgid(gid_num) } != 0 {
            return Err(crate::Error::new_listen(std::io::Error::last_os_error()));
        }
        info!("setgid() to {}", gid_num);

        if let Some(uid) = &config.uid {
            if uid.parse::<u32>().is_err() {
                let user = std::ffi::CString::new(uid.as_str())
                    .map_err(|_| crate::Error::new_config("uid contains NUL"))?;
                if unsafe { libc::initgroups(user.as_ptr(), gid_num as _) } != 0 {
                    return Err(crate::Error::new_listen(std::io::Error::last_os_error()));
                }
            }
        }
    }
    if let Some(uid) = &config.uid {
        let uid_num = resolve_uid(uid)?;
        if unsafe { libc::setuid(uid_num) } != 0 {
            return Err(crate::Error::new_listen(std::io::Error::last_os_error()));
        }
        info!("setuid() to {}", uid_num);
    }
    Ok(())
}

fn resolve_uid(name: &str) -> crate::Result<libc::uid_t> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| crate::Error::new_config("uid contains NUL"))?;
    let pw = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if pw.is_null() {
        return Err(crate::Error::new_config("setuid user not found"));
    }
    Ok(unsafe { (*pw).pw_uid })
}

fn resolve_gid(name: &str) -> crate::Result<libc::gid_t> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| crate::Error::new_config("gid contains NUL"))?;
    let group = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if group.is_null() {
        return Err(crate::Error::new_config("setgid group not found"));
    }
    Ok(unsafe { (*group).gr_gid })
}

/// Watches a set of paths for mtime changes.
struct TouchWatch {
    entries: Vec<(PathBuf, Option<SystemTime>)>,
}

impl TouchWatch {
    fn new(paths: &[PathBuf]) -> TouchWatch {
        TouchWatch {
            entries: paths
                .iter()
                .map(|path| (path.clone(), mtime(path)))
                .collect(),
        }
    }

    fn changed(&mut self) -> bool {
        let mut changed = false;
        for (path, last) in &mut self.entries {
            let current = mtime(path);
            if current != *last {
                *last = current;
                changed = true;
            }
        }
        changed
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
