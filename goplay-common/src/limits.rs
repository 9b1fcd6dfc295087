//! Resource limits configuration for sandboxed execution

use serde::{Deserialize, Serialize};
use std::time::Duration;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Static ceilings applied to every execution.
///
/// These come from configuration only; a request can never raise them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum accepted source size in bytes
    pub max_source_bytes: usize,

    /// Cap for each captured stream (stdout, stderr)
    pub max_stream_output_bytes: usize,

    /// Cap for stdout + stderr together
    pub max_combined_output_bytes: usize,

    /// Largest build artifact returned to the caller (also the RLIMIT_FSIZE ceiling)
    pub max_artifact_bytes: u64,

    /// Wall-clock deadline for `run` (covers compile and execution)
    #[serde(with = "humantime_serde")]
    pub run_deadline: Duration,

    /// Wall-clock deadline for `compile-wasm`
    #[serde(with = "humantime_serde")]
    pub compile_deadline: Duration,

    /// Wall-clock deadline for `format`
    #[serde(with = "humantime_serde")]
    pub format_deadline: Duration,

    /// RLIMIT_CPU in seconds, per process. `0` in TOML means unlimited.
    #[serde(with = "zero_is_unlimited")]
    pub max_cpu_secs: Option<u64>,

    /// RLIMIT_DATA in bytes, per process. `0` in TOML means unlimited.
    #[serde(with = "zero_is_unlimited")]
    pub max_memory_bytes: Option<u64>,

    /// RLIMIT_NOFILE. `0` in TOML means unlimited.
    #[serde(with = "zero_is_unlimited")]
    pub max_open_files: Option<u64>,
}

/// `None` is written as `0`; TOML has no null
mod zero_is_unlimited {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        let value = u64::deserialize(deserializer)?;
        Ok((value != 0).then_some(value))
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_source_bytes: 5 * MIB,
            max_stream_output_bytes: MIB,
            max_combined_output_bytes: 2 * MIB,
            max_artifact_bytes: 32 * MIB as u64,
            run_deadline: Duration::from_secs(15),
            compile_deadline: Duration::from_secs(10),
            format_deadline: Duration::from_secs(5),
            max_cpu_secs: Some(30),
            max_memory_bytes: Some(1024 * MIB as u64),
            max_open_files: Some(256),
        }
    }
}

impl ResourceLimits {
    /// Tight limits for public deployments
    pub fn strict() -> Self {
        Self {
            max_source_bytes: 64 * KIB,
            max_stream_output_bytes: 64 * KIB,
            max_combined_output_bytes: 128 * KIB,
            max_artifact_bytes: 8 * MIB as u64,
            run_deadline: Duration::from_secs(5),
            compile_deadline: Duration::from_secs(5),
            format_deadline: Duration::from_secs(2),
            max_cpu_secs: Some(10),
            max_memory_bytes: Some(512 * MIB as u64),
            max_open_files: Some(64),
        }
    }

    /// Generous limits for trusted, single-user setups
    pub fn permissive() -> Self {
        Self {
            max_source_bytes: 16 * MIB,
            max_stream_output_bytes: 8 * MIB,
            max_combined_output_bytes: 16 * MIB,
            max_artifact_bytes: 128 * MIB as u64,
            run_deadline: Duration::from_secs(120),
            compile_deadline: Duration::from_secs(120),
            format_deadline: Duration::from_secs(30),
            max_cpu_secs: Some(300),
            max_memory_bytes: None,
            max_open_files: Some(1024),
        }
    }
}
