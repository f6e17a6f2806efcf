//! Cross-platform process sandbox.
//!
//! Mirrors the teacher's `docklock` cage model — launch in isolation,
//! record exactly what isolation was actually achieved, never claim more
//! than was verified. The POSIX path launches into its own process group
//! and applies rlimits; the Windows path uses a Job Object. Both paths
//! report capability enforcement the way `filter.rs` reports seccomp
//! activation: a capability is only ever `enforced` once its effect has
//! been observed, never because the flag was merely requested.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(unix)]
mod posix;
#[cfg(windows)]
mod win;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("workspace escape: argument `{0}` resolves outside the workspace root")]
    WorkspaceEscape(String),
    #[error("resource limit setup failed: {0}")]
    ResourceLimit(String),
    #[error("io error: {0}")]
    Io(String),
}

impl SandboxError {
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::LaunchFailed(_) => "launch_failed",
            SandboxError::WorkspaceEscape(_) => "workspace_escape",
            SandboxError::ResourceLimit(_) => "resource_limit",
            SandboxError::Io(_) => "io_error",
        }
    }
}

/// Every capability the sandbox may attempt to enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    WorkspaceConfinement,
    NetworkIsolation,
    MemoryLimit,
    FileDescriptorLimit,
    SeccompFilter,
    ProcessMitigations,
}

impl Capability {
    pub fn tag(&self) -> &'static str {
        match self {
            Capability::WorkspaceConfinement => "workspace_confinement",
            Capability::NetworkIsolation => "network_isolation",
            Capability::MemoryLimit => "memory_limit",
            Capability::FileDescriptorLimit => "fd_limit",
            Capability::SeccompFilter => "seccomp_filter",
            Capability::ProcessMitigations => "process_mitigations",
        }
    }
}

/// The classification of how a requested capability was actually applied.
/// A capability never appears in more than one bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxApplied {
    pub enforced: Vec<Capability>,
    pub unsupported: Vec<Capability>,
    pub partial: Vec<Capability>,
}

impl SandboxApplied {
    fn mark_enforced(&mut self, cap: Capability) {
        self.enforced.push(cap);
    }
    fn mark_unsupported(&mut self, cap: Capability) {
        self.unsupported.push(cap);
    }
    fn mark_partial(&mut self, cap: Capability) {
        self.partial.push(cap);
    }
}

/// Everything the sandbox is asked to do for one launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Vec<u8>,
    pub workspace_root: PathBuf,
    pub timeout: Duration,
    pub memory_limit_bytes: Option<u64>,
    pub fd_limit: Option<u64>,
    pub workspace_confinement: bool,
    pub network_isolation: bool,
    pub seccomp_filter: bool,
    pub process_mitigations: bool,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            argv: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            stdin: Vec::new(),
            workspace_root: workspace_root.into(),
            timeout: Duration::from_secs(30),
            memory_limit_bytes: None,
            fd_limit: None,
            workspace_confinement: true,
            network_isolation: false,
            seccomp_filter: false,
            process_mitigations: false,
        }
    }
}

/// Sentinel exit code used when a process is killed for exceeding its
/// timeout, matching the platform-neutral convention of shells on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    pub sandbox_applied: SandboxApplied,
    pub timeout: bool,
    pub killed_by_signal: Option<String>,
}

/// Reject any `argv` entry whose canonical form is not contained within
/// `workspace_root`. A non-existent path is canonicalized against its
/// nearest existing ancestor so a not-yet-created output path is still
/// checked.
pub fn enforce_workspace_confinement(
    workspace_root: &Path,
    argv: &[String],
) -> Result<(), SandboxError> {
    let canonical_root = workspace_root
        .canonicalize()
        .map_err(|e| SandboxError::Io(format!("cannot canonicalize workspace root: {e}")))?;

    for arg in argv {
        let candidate = Path::new(arg);
        if !candidate.is_absolute() && !looks_like_path(arg) {
            continue;
        }
        // The subprocess is launched with `workspace_root` as its working
        // directory, so a relative argument resolves there too, not
        // against this process's own CWD.
        let anchored = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            workspace_root.join(candidate)
        };
        let resolved = resolve_best_effort(&anchored);
        if !resolved.starts_with(&canonical_root) {
            return Err(SandboxError::WorkspaceEscape(arg.clone()));
        }
    }
    Ok(())
}

fn looks_like_path(arg: &str) -> bool {
    arg.contains('/') || arg.contains('\\')
}

/// Canonicalize `path`, walking up to the nearest existing ancestor when
/// the full path does not yet exist (e.g. a not-yet-written output file),
/// then re-appending the missing suffix in original order.
fn resolve_best_effort(path: &Path) -> PathBuf {
    if let Ok(canon) = path.canonicalize() {
        return canon;
    }
    // Components below the nearest existing ancestor, deepest first.
    let mut missing = Vec::new();
    let mut cursor = path;
    loop {
        let Some(name) = cursor.file_name() else {
            return path.to_path_buf();
        };
        missing.push(name.to_owned());
        let Some(parent) = cursor.parent() else {
            return path.to_path_buf();
        };
        if let Ok(canon) = parent.canonicalize() {
            let mut result = canon;
            for component in missing.iter().rev() {
                result.push(component);
            }
            return result;
        }
        cursor = parent;
    }
}

/// Launch `spec` and block until it exits or its timeout expires.
pub fn run(spec: &ProcessSpec) -> Result<ProcessResult, SandboxError> {
    if spec.workspace_confinement {
        enforce_workspace_confinement(&spec.workspace_root, &spec.argv)?;
    }

    #[cfg(unix)]
    {
        posix::run(spec)
    }
    #[cfg(windows)]
    {
        win::run(spec)
    }
    #[cfg(not(any(unix, windows)))]
    {
        Err(SandboxError::LaunchFailed(
            "unsupported platform".to_string(),
        ))
    }
}

/// Launch a trivial process and verify that no capability is falsely
/// reported as `enforced`. Used by the health/doctor pipeline.
pub fn self_test(workspace_root: &Path) -> Result<SandboxApplied, SandboxError> {
    let mut spec = ProcessSpec::new(trivial_command(), workspace_root);
    spec.argv = trivial_argv();
    spec.timeout = Duration::from_secs(5);
    spec.workspace_confinement = true;
    spec.seccomp_filter = cfg!(unix);
    spec.process_mitigations = cfg!(windows);
    let result = run(&spec)?;
    Ok(result.sandbox_applied)
}

#[cfg(unix)]
fn trivial_command() -> &'static str {
    "/bin/echo"
}
#[cfg(unix)]
fn trivial_argv() -> Vec<String> {
    vec!["sandbox-self-test".to_string()]
}

#[cfg(windows)]
fn trivial_command() -> &'static str {
    "cmd.exe"
}
#[cfg(windows)]
fn trivial_argv() -> Vec<String> {
    vec!["/C".to_string(), "echo sandbox-self-test".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_confinement_allows_paths_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("inside.txt");
        std::fs::write(&inside, b"x").unwrap();
        let argv = vec![inside.to_string_lossy().to_string()];
        assert!(enforce_workspace_confinement(dir.path(), &argv).is_ok());
    }

    #[test]
    fn workspace_confinement_rejects_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside_dir = tempfile::tempdir().unwrap();
        let outside = outside_dir.path().join("escape.txt");
        std::fs::write(&outside, b"x").unwrap();
        let argv = vec![outside.to_string_lossy().to_string()];
        let err = enforce_workspace_confinement(dir.path(), &argv).unwrap_err();
        assert_eq!(err.code(), "workspace_escape");
    }

    #[test]
    fn workspace_confinement_ignores_plain_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["--flag".to_string(), "value".to_string()];
        assert!(enforce_workspace_confinement(dir.path(), &argv).is_ok());
    }

    #[test]
    fn workspace_confinement_handles_not_yet_created_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let not_yet_created = dir.path().join("out").join("result.bin");
        let argv = vec![not_yet_created.to_string_lossy().to_string()];
        assert!(enforce_workspace_confinement(dir.path(), &argv).is_ok());
    }

    #[test]
    fn workspace_confinement_resolves_relative_paths_against_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::write(dir.path().join("out").join("result.bin"), b"x").unwrap();

        // A relative argument must resolve against `workspace_root`
        // regardless of this test process's own current directory.
        let argv = vec!["out/result.bin".to_string()];
        assert!(enforce_workspace_confinement(dir.path(), &argv).is_ok());
    }

    #[test]
    fn workspace_confinement_rejects_relative_escape() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["../etc/passwd".to_string()];
        let err = enforce_workspace_confinement(dir.path(), &argv).unwrap_err();
        assert_eq!(err.code(), "workspace_escape");
    }
}
