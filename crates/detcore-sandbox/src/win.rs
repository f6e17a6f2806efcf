//! Windows launch path: a Job Object mirrors the POSIX rlimits/process-group
//! story — children are tracked automatically, and a timeout tears down the
//! whole job in one call instead of signaling a process group.

use std::io::{Read, Write};
use std::os::windows::io::AsRawHandle;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, TerminateJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_JOB_MEMORY, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};

use crate::{Capability, ProcessResult, ProcessSpec, SandboxApplied, SandboxError, TIMEOUT_EXIT_CODE};

struct JobHandle(HANDLE);

impl Drop for JobHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

pub fn run(spec: &ProcessSpec) -> Result<ProcessResult, SandboxError> {
    let mut applied = SandboxApplied::default();

    if spec.workspace_confinement {
        applied.mark_enforced(Capability::WorkspaceConfinement);
    }

    let job = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
    if job == 0 {
        return Err(SandboxError::ResourceLimit(
            "CreateJobObjectW failed".to_string(),
        ));
    }
    let job = JobHandle(job);

    let mut limit_info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
    limit_info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
    let mut memory_requested = false;
    if let Some(bytes) = spec.memory_limit_bytes {
        limit_info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_JOB_MEMORY;
        limit_info.JobMemoryLimit = bytes as usize;
        memory_requested = true;
    }

    let set_ok = unsafe {
        SetInformationJobObject(
            job.0,
            JobObjectExtendedLimitInformation,
            &limit_info as *const _ as *const core::ffi::c_void,
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
    };
    if memory_requested {
        if set_ok != 0 {
            applied.mark_enforced(Capability::MemoryLimit);
        } else {
            applied.mark_unsupported(Capability::MemoryLimit);
        }
    }

    if spec.fd_limit.is_some() {
        // Windows has no direct handle-count job limit comparable to
        // POSIX RLIMIT_NOFILE; not applied.
        applied.mark_unsupported(Capability::FileDescriptorLimit);
    }
    if spec.network_isolation {
        applied.mark_unsupported(Capability::NetworkIsolation);
    }
    if spec.seccomp_filter {
        applied.mark_unsupported(Capability::SeccompFilter);
    }
    if spec.process_mitigations {
        // A restricted token / mitigation policy would need
        // UpdateProcThreadAttribute at process-creation time; the flag is
        // accepted but not wired up, so report partial rather than
        // enforced.
        applied.mark_partial(Capability::ProcessMitigations);
    }

    let mut command = Command::new(&spec.command);
    command.args(&spec.argv);
    command.envs(&spec.env);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    } else {
        command.current_dir(&spec.workspace_root);
    }
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let start = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::LaunchFailed(e.to_string()))?;

    let process_handle = child.as_raw_handle() as HANDLE;
    if unsafe { AssignProcessToJobObject(job.0, process_handle) } == 0 {
        return Err(SandboxError::ResourceLimit(
            "AssignProcessToJobObject failed".to_string(),
        ));
    }

    if !spec.stdin.is_empty() {
        if let Some(mut stdin) = child.stdin.take() {
            let data = spec.stdin.clone();
            let _ = thread::spawn(move || {
                let _ = stdin.write_all(&data);
            });
        }
    } else {
        drop(child.stdin.take());
    }

    let stdout_handle = spawn_reader(child.stdout.take());
    let stderr_handle = spawn_reader(child.stderr.take());

    let (timed_out, killed_by_signal) = wait_with_timeout(&mut child, &job, spec.timeout);

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    let duration = start.elapsed();

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        match child.wait() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => return Err(SandboxError::Io(e.to_string())),
        }
    };

    Ok(ProcessResult {
        exit_code,
        stdout,
        stderr,
        duration,
        sandbox_applied: applied,
        timeout: timed_out,
        killed_by_signal,
    })
}

fn spawn_reader(pipe: Option<impl Read + Send + 'static>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            let _ = p.read_to_end(&mut buf);
        }
        buf
    })
}

/// Poll for exit until `timeout` elapses; on expiry, terminate the whole
/// job object, which cascades to every process assigned to it.
fn wait_with_timeout(
    child: &mut Child,
    job: &JobHandle,
    timeout: Duration,
) -> (bool, Option<String>) {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return (false, None),
            Ok(None) => {}
            Err(_) => return (false, None),
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    unsafe {
        TerminateJobObject(job.0, TIMEOUT_EXIT_CODE as u32);
    }
    (true, Some("job_object_terminate".to_string()))
}
