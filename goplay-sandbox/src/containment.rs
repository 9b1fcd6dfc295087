//! Keeping every process of an execution within reach of one kill
//!
//! The process group alone misses descendants that call `setsid`. On Linux
//! each execution gets its own cgroup v2 directory, torn down with
//! `cgroup.kill`. Without a writable cgroup the service becomes a child
//! subreaper instead: escaped descendants are re-parented to it once their
//! parent dies, and are recognised by their process group or by the
//! execution id in their environment.

use crate::execution::ExecutionId;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Environment variable carrying the execution id into the child
pub const EXECUTION_ENV: &str = "GOPLAY_EXECUTION_ID";

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);
const SETTLE_POLL: Duration = Duration::from_millis(10);

/// How the processes of one execution are tracked and killed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Containment {
    /// One cgroup per execution, created under this directory
    Cgroup(PathBuf),
    /// Orphans are adopted by the service and matched to their execution
    Subreaper,
    /// Process group only; `setsid` escapes it
    ProcessGroup,
}

impl Containment {
    /// Pick the strongest mechanism available.
    ///
    /// `parent` names a delegated cgroup directory; `None` uses the service's
    /// own cgroup. The result for `None` is computed once per process.
    pub fn detect(parent: Option<&Path>) -> Self {
        static DEFAULT: OnceLock<Containment> = OnceLock::new();
        match parent {
            None => DEFAULT.get_or_init(|| Self::select(None)).clone(),
            Some(parent) => Self::select(Some(parent)),
        }
    }

    fn select(parent: Option<&Path>) -> Self {
        let candidate = parent.map(Path::to_path_buf).or_else(own_cgroup);
        if let Some(dir) = candidate {
            match try_cgroup(&dir) {
                Ok(()) => {
                    tracing::info!(cgroup = %dir.display(), "Containing executions in per-execution cgroups");
                    return Containment::Cgroup(dir);
                }
                Err(e) if parent.is_some() => {
                    tracing::warn!(cgroup = %dir.display(), error = %e, "Configured cgroup parent is not usable");
                }
                Err(e) => {
                    tracing::debug!(cgroup = %dir.display(), error = %e, "Cgroup containment unavailable");
                }
            }
        }

        match become_subreaper() {
            Ok(()) => {
                tracing::info!("Containing executions by adopting their orphans");
                Containment::Subreaper
            }
            Err(e) => {
                tracing::warn!(error = %e, "No cgroup or subreaper available, processes that leave the process group are not contained");
                Containment::ProcessGroup
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Containment::Cgroup(_) => "cgroup",
            Containment::Subreaper => "subreaper",
            Containment::ProcessGroup => "process-group",
        }
    }

    /// Prepare the scope for one execution, before its process is spawned
    pub fn enter(&self, id: ExecutionId) -> io::Result<Confinement> {
        let mut scope = Scope {
            id,
            tag: format!("{}={}", EXECUTION_ENV, id).into_bytes(),
            pgid: None,
            cgroup: None,
            adopt_orphans: false,
        };
        let mut join = None;

        match self {
            Containment::Cgroup(parent) => {
                let dir = parent.join(format!("goplay-{}", id));
                fs::create_dir(&dir)?;
                join = Some(procs_path(&dir)?);
                scope.cgroup = Some(dir);
            }
            Containment::Subreaper => scope.adopt_orphans = true,
            Containment::ProcessGroup => {}
        }

        Ok(Confinement {
            join,
            scope: Some(scope),
        })
    }
}

/// The processes of one running execution.
///
/// Dropping it kills them; [`Confinement::release`] also waits until they are gone.
#[derive(Debug)]
pub struct Confinement {
    join: Option<CString>,
    scope: Option<Scope>,
}

impl Confinement {
    /// `cgroup.procs` the child must write itself into before exec
    pub fn join_path(&self) -> Option<CString> {
        self.join.clone()
    }

    /// Record the spawned child; it leads its own process group
    pub fn attach(&mut self, pid: Option<u32>) {
        if let Some(scope) = &mut self.scope {
            scope.pgid = pid.map(|pid| pid as libc::pid_t);
        }
    }

    /// SIGKILL every contained process. Can be called repeatedly.
    pub fn kill(&self) {
        if let Some(scope) = &self.scope {
            scope.kill();
        }
    }

    /// Kill everything and wait until no contained process is left
    pub async fn release(mut self) -> usize {
        let Some(scope) = self.scope.take() else {
            return 0;
        };
        match tokio::task::spawn_blocking(move || scope.settle()).await {
            Ok(orphans) => orphans,
            Err(e) => {
                tracing::warn!(error = %e, "Containment cleanup task failed");
                0
            }
        }
    }
}

impl Drop for Confinement {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.kill();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || scope.settle());
                }
                Err(_) => {
                    scope.settle();
                }
            }
        }
    }
}

#[derive(Debug)]
struct Scope {
    id: ExecutionId,
    tag: Vec<u8>,
    pgid: Option<libc::pid_t>,
    cgroup: Option<PathBuf>,
    adopt_orphans: bool,
}

impl Scope {
    fn kill(&self) {
        if let Some(pgid) = self.pgid {
            // SAFETY: killpg takes plain integers; ESRCH just means the group is gone.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
        if let Some(dir) = &self.cgroup {
            if let Err(e) = kill_cgroup(dir) {
                tracing::warn!(execution_id = %self.id, error = %e, "Failed to kill cgroup");
            }
        }
    }

    /// Blocking: kill until empty, reap adopted orphans, remove the cgroup.
    /// Returns how many processes outside the process group were found.
    fn settle(self) -> usize {
        let give_up = Instant::now() + SETTLE_TIMEOUT;
        let mut orphans = 0;

        self.kill();
        loop {
            if self.adopt_orphans {
                orphans += self.reap_adopted();
            }
            if self.is_empty() {
                break;
            }
            if Instant::now() >= give_up {
                tracing::warn!(execution_id = %self.id, "Processes still alive after cleanup");
                break;
            }
            std::thread::sleep(SETTLE_POLL);
            match &self.cgroup {
                Some(dir) => {
                    let _ = kill_cgroup(dir);
                }
                // is_empty() saw members, so the group id is still ours
                None => self.kill(),
            }
        }

        if let Some(dir) = &self.cgroup {
            if let Err(e) = fs::remove_dir(dir) {
                tracing::warn!(execution_id = %self.id, cgroup = %dir.display(), error = %e, "Failed to remove cgroup");
            }
        }
        if orphans > 0 {
            tracing::warn!(execution_id = %self.id, orphans, "Killed processes that left the process group");
        }
        orphans
    }

    fn is_empty(&self) -> bool {
        match (&self.cgroup, self.adopt_orphans) {
            // zombies leave the cgroup, so `populated` is exact
            (Some(dir), _) => !cgroup_populated(dir),
            (None, true) => self.pgid.map_or(true, |pgid| {
                // SAFETY: signal 0 only checks for existence.
                unsafe { libc::killpg(pgid, 0) != 0 }
            }),
            (None, false) => true,
        }
    }

    /// Kill and reap children of the service that belong to this execution
    fn reap_adopted(&self) -> usize {
        let me = std::process::id() as libc::pid_t;
        let mut reaped = 0;

        for stat in children_of(me) {
            // the leader is reaped by tokio
            if Some(stat.pid) == self.pgid {
                continue;
            }
            let ours = Some(stat.pgrp) == self.pgid || environ_of(stat.pid, &self.tag);
            if !ours {
                continue;
            }
            // SAFETY: `stat.pid` is our own child, so it cannot be recycled until we reap it.
            unsafe {
                libc::kill(stat.pid, libc::SIGKILL);
                libc::waitpid(stat.pid, std::ptr::null_mut(), 0);
            }
            if Some(stat.pgrp) != self.pgid {
                reaped += 1;
            }
        }
        reaped
    }
}

/// Move the calling process into the cgroup whose `cgroup.procs` is `procs`.
///
/// Runs inside `pre_exec`: raw syscalls only, no allocation.
pub fn join_cgroup(procs: &CStr) -> io::Result<()> {
    // SAFETY: `procs` is NUL-terminated and the buffer passed to write is a static slice.
    unsafe {
        let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, b"0".as_ptr().cast(), 1);
        let error = io::Error::last_os_error();
        libc::close(fd);
        if written != 1 {
            return Err(error);
        }
    }
    Ok(())
}

fn procs_path(dir: &Path) -> io::Result<CString> {
    CString::new(dir.join("cgroup.procs").as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// The service's own cgroup v2 directory, from `/proc/self/cgroup`
fn own_cgroup() -> Option<PathBuf> {
    let content = fs::read_to_string("/proc/self/cgroup").ok()?;
    let relative = content.lines().find_map(|line| line.strip_prefix("0::"))?;
    let dir = Path::new(CGROUP_MOUNT).join(relative.trim().trim_start_matches('/'));
    dir.join("cgroup.procs").exists().then_some(dir)
}

/// Check that a child cgroup can be created under `parent` and a process moved into it
fn try_cgroup(parent: &Path) -> io::Result<()> {
    use std::os::unix::process::CommandExt;

    if !parent.join("cgroup.procs").exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "not a cgroup v2 directory",
        ));
    }

    let scratch = parent.join(format!("goplay-check-{}", ExecutionId::new()));
    fs::create_dir(&scratch)?;
    let joined = procs_path(&scratch).and_then(|procs| {
        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.args(["-c", "exit 0"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        // SAFETY: `join_cgroup` only issues open/write/close syscalls.
        unsafe {
            cmd.pre_exec(move || join_cgroup(&procs));
        }
        cmd.status().map(|_| ())
    });
    let removed = fs::remove_dir(&scratch);
    joined?;
    removed
}

fn kill_cgroup(dir: &Path) -> io::Result<()> {
    match fs::write(dir.join("cgroup.kill"), "1") {
        Ok(()) => Ok(()),
        // kernels before 5.14 have no cgroup.kill
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            for pid in fs::read_to_string(dir.join("cgroup.procs"))?
                .lines()
                .filter_map(|line| line.trim().parse::<libc::pid_t>().ok())
            {
                // SAFETY: kill takes plain integers.
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn cgroup_populated(dir: &Path) -> bool {
    fs::read_to_string(dir.join("cgroup.events"))
        .map(|events| events.lines().any(|line| line.trim() == "populated 1"))
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn become_subreaper() -> io::Result<()> {
    static RESULT: OnceLock<Option<i32>> = OnceLock::new();
    let errno = RESULT.get_or_init(|| {
        // SAFETY: PR_SET_CHILD_SUBREAPER takes a plain integer argument.
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_CHILD_SUBREAPER,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        (rc != 0).then(|| io::Error::last_os_error().raw_os_error().unwrap_or(0))
    });
    match errno {
        None => Ok(()),
        Some(code) => Err(io::Error::from_raw_os_error(*code)),
    }
}

#[cfg(not(target_os = "linux"))]
fn become_subreaper() -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "child subreapers are Linux-only",
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    pid: libc::pid_t,
    ppid: libc::pid_t,
    pgrp: libc::pid_t,
}

/// Parse `/proc/<pid>/stat`; the command name may contain spaces and parentheses
fn parse_stat(stat: &str) -> Option<ProcStat> {
    let (head, rest) = stat.rsplit_once(')')?;
    let pid = head.split_whitespace().next()?.parse().ok()?;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some(ProcStat { pid, ppid, pgrp })
}

fn children_of(parent: libc::pid_t) -> Vec<ProcStat> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|stat| parse_stat(&stat))
        .filter(|stat| stat.ppid == parent)
        .collect()
}

fn environ_of(pid: libc::pid_t, tag: &[u8]) -> bool {
    fs::read(format!("/proc/{}/environ", pid))
        .map(|environ| environ_contains(&environ, tag))
        .unwrap_or(false)
}

fn environ_contains(environ: &[u8], entry: &[u8]) -> bool {
    environ.split(|b| *b == 0).any(|var| var == entry)
}
