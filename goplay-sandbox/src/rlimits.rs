//! Kernel resource limits applied to the toolchain process before exec
//!
//! | Limit           | Source                          |
//! |-----------------|---------------------------------|
//! | `RLIMIT_CPU`    | `max_cpu_secs`                  |
//! | `RLIMIT_DATA`   | `max_memory_bytes`              |
//! | `RLIMIT_FSIZE`  | `max_artifact_bytes`            |
//! | `RLIMIT_NOFILE` | `max_open_files`                |
//! | `RLIMIT_CORE`   | always 0                        |
//!
//! `RLIMIT_AS` is not used: the Go runtime reserves large virtual ranges up
//! front and fails to start under an address-space limit.

use goplay_common::ResourceLimits;
use std::io;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

/// Limits applied in the child between fork and exec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessLimits {
    pub cpu_secs: Option<u64>,
    pub data_bytes: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub open_files: Option<u64>,
}

impl From<&ResourceLimits> for ProcessLimits {
    fn from(limits: &ResourceLimits) -> Self {
        Self {
            cpu_secs: limits.max_cpu_secs,
            data_bytes: limits.max_memory_bytes,
            file_size_bytes: Some(limits.max_artifact_bytes),
            open_files: limits.max_open_files,
        }
    }
}

impl ProcessLimits {
    /// Apply every configured limit to the calling process.
    ///
    /// Runs inside `pre_exec`, so it only issues raw syscalls and allocates nothing.
    pub fn apply(&self) -> io::Result<()> {
        set_rlimit(libc::RLIMIT_CORE, 0)?;
        if let Some(secs) = self.cpu_secs {
            set_rlimit(libc::RLIMIT_CPU, secs)?;
        }
        if let Some(bytes) = self.data_bytes {
            set_rlimit(libc::RLIMIT_DATA, bytes)?;
        }
        if let Some(bytes) = self.file_size_bytes {
            set_rlimit(libc::RLIMIT_FSIZE, bytes)?;
        }
        if let Some(files) = self.open_files {
            set_rlimit(libc::RLIMIT_NOFILE, files)?;
        }
        Ok(())
    }
}

/// Lower both soft and hard limits to `limit`, never above the current hard limit
fn set_rlimit(resource: Resource, limit: u64) -> io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid, writable rlimit and `resource` a valid constant.
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let wanted = limit as libc::rlim_t;
    let value = if current.rlim_max == libc::RLIM_INFINITY {
        wanted
    } else {
        wanted.min(current.rlim_max)
    };
    let rlim = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // SAFETY: `rlim` is a valid rlimit and `resource` a valid constant.
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
