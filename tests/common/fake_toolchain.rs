//! A shell script that stands in for `go`, `tinygo` and `gofmt`
//!
//! - `go run [flags] main.go` executes `main.go` as a shell script, so tests
//!   submit shell snippets as "programs".
//! - `tinygo build -o out.wasm [flags] main.go` writes a wasm header to the
//!   output, or fails when the source contains `COMPILE_ERROR`.
//! - `gofmt main.go` squeezes repeated spaces, or fails when the source
//!   contains `FORMAT_ERROR`.

use goplay_common::ToolchainConfig;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Bytes the fake `tinygo build` writes
pub const FAKE_WASM: &[u8] = b"\0asm\x01\0\0\0";

const SCRIPT: &str = r#"#!/bin/sh
for last; do :; done
case "$1" in
  run)
    exec /bin/sh "$last"
    ;;
  build)
    if grep -q COMPILE_ERROR "$last"; then
      echo "$last:3:2: undefined: COMPILE_ERROR" >&2
      exit 1
    fi
    printf '\000asm\001\000\000\000' > "$3"
    ;;
  *)
    if grep -q FORMAT_ERROR "$last"; then
      echo "$last:2:1: expected declaration, found FORMAT_ERROR" >&2
      exit 2
    fi
    sed 's/  */ /g' "$last"
    ;;
esac
"#;

static FAKE_TOOLCHAIN: OnceLock<PathBuf> = OnceLock::new();

/// Path of the fake toolchain script, written once per test binary.
///
/// Written before any test spawns children so no forked process holds the
/// file open for writing when it is exec'd.
pub fn fake_toolchain() -> &'static Path {
    FAKE_TOOLCHAIN.get_or_init(|| {
        let dir = tempfile::tempdir()
            .expect("Failed to create temp dir")
            .into_path();
        let script = dir.join("fake-go");
        std::fs::write(&script, SCRIPT).expect("Failed to write fake toolchain");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to make fake toolchain executable");
        script
    })
}

/// Toolchain settings pointing every binary at the fake script
pub fn fake_toolchain_config() -> ToolchainConfig {
    let script = fake_toolchain().to_path_buf();
    ToolchainConfig {
        go_binary: script.clone(),
        tinygo_binary: script.clone(),
        gofmt_binary: script,
        path: Some("/usr/local/bin:/usr/bin:/bin".to_string()),
        ..Default::default()
    }
}

/// Whether a real `go` binary is available on PATH
pub fn real_go_available() -> bool {
    std::process::Command::new("go")
        .arg("version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
