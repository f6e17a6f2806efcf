//! Stable C-callable ABI. Every buffer returned to the caller is owned by
//! this library until it is handed back to [`detcore_free_buffer`] — never
//! free a [`DetcoreBuffer`] with anything but that function.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;

use detcore::{
    execute as core_execute, health as core_health, replay as core_replay, Digest, EngineContext,
    InputArtifact, LlmMode, Mode, PolicySpec, Request,
};
use detcore_policy::{ResourceLimits, TimeMode};
use serde::{Deserialize, Serialize};

/// Bumped whenever the JSON request/result shape or the function set
/// below changes in a way existing callers must account for.
pub const DETCORE_ABI_VERSION: u32 = 1;

#[no_mangle]
pub extern "C" fn detcore_abi_version() -> u32 {
    DETCORE_ABI_VERSION
}

/// A callee-owned byte buffer. `ptr` is `null` and `len` is `0` on
/// allocation failure; callers must check before dereferencing.
#[repr(C)]
pub struct DetcoreBuffer {
    pub ptr: *mut u8,
    pub len: usize,
}

impl DetcoreBuffer {
    fn from_vec(mut bytes: Vec<u8>) -> Self {
        bytes.shrink_to_fit();
        let ptr = bytes.as_mut_ptr();
        let len = bytes.len();
        std::mem::forget(bytes);
        DetcoreBuffer { ptr, len }
    }

    fn empty() -> Self {
        DetcoreBuffer {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }
}

/// Free a buffer previously returned by any `detcore_*` function. Safe to
/// call on an empty buffer (`ptr: null`); a no-op in that case.
#[no_mangle]
pub unsafe extern "C" fn detcore_free_buffer(buf: DetcoreBuffer) {
    if buf.ptr.is_null() {
        return;
    }
    let _ = Vec::from_raw_parts(buf.ptr, buf.len, buf.len);
}

#[derive(Debug, Deserialize)]
struct FfiInputArtifact {
    digest_hex: String,
}

#[derive(Debug, Deserialize)]
struct FfiPolicy {
    mode: String,
    time_mode: String,
    determinism_flag: bool,
    allow_outside_workspace: bool,
    timeout_ms: u64,
    memory_limit_bytes: Option<u64>,
    fd_limit: Option<u64>,
    llm_mode: String,
}

#[derive(Debug, Deserialize)]
struct FfiRequest {
    command: String,
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    workspace: String,
    inputs: BTreeMap<String, FfiInputArtifact>,
    policy: FfiPolicy,
    tenant_id: Option<String>,
    request_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct FfiError {
    error: String,
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    match s {
        "repro" => Ok(Mode::Repro),
        "turbo" => Ok(Mode::Turbo),
        other => Err(format!("unknown mode: {other}")),
    }
}

fn parse_time_mode(s: &str) -> Result<TimeMode, String> {
    match s {
        "wall" => Ok(TimeMode::Wall),
        "frozen" => Ok(TimeMode::Frozen),
        other => Err(format!("unknown time_mode: {other}")),
    }
}

fn parse_llm_mode(s: &str) -> Result<LlmMode, String> {
    match s {
        "none" => Ok(LlmMode::None),
        "assist" => Ok(LlmMode::Assist),
        "generate" => Ok(LlmMode::Generate),
        other => Err(format!("unknown llm_mode: {other}")),
    }
}

fn to_request(ffi: FfiRequest) -> Result<Request, String> {
    let mut inputs = BTreeMap::new();
    for (name, artifact) in ffi.inputs {
        let digest = Digest::from_hex(&artifact.digest_hex).map_err(|e| e.to_string())?;
        inputs.insert(name, InputArtifact::ByDigest(digest));
    }

    Ok(Request {
        command: ffi.command,
        argv: ffi.argv,
        env: ffi.env,
        workspace: PathBuf::from(ffi.workspace),
        inputs,
        policy: PolicySpec {
            mode: parse_mode(&ffi.policy.mode)?,
            time_mode: parse_time_mode(&ffi.policy.time_mode)?,
            determinism_flag: ffi.policy.determinism_flag,
            allow_outside_workspace: ffi.policy.allow_outside_workspace,
            timeout_ms: ffi.policy.timeout_ms,
            resource_limits: ResourceLimits {
                memory_limit_bytes: ffi.policy.memory_limit_bytes,
                fd_limit: ffi.policy.fd_limit,
            },
            llm_mode: parse_llm_mode(&ffi.policy.llm_mode)?,
        },
        tenant_id: ffi.tenant_id,
        request_id: ffi.request_id,
    })
}

/// Gate wire bytes through the canonical parser before any typed
/// deserialization: duplicate keys, NaN/Infinity, and structural errors
/// must be rejected here, not silently accepted by a looser JSON reader.
fn canon_gate(wire: &str) -> Result<(), String> {
    detcore_canon::parse(wire.as_bytes())
        .map(|_| ())
        .map_err(|e| format!("{}: {e}", e.code()))
}

fn error_buffer(message: impl Into<String>) -> DetcoreBuffer {
    let message = message.into();
    tracing::error!(%message, "detcore-ffi call failed");
    let payload = FfiError { error: message };
    match serde_json::to_vec(&payload) {
        Ok(bytes) => DetcoreBuffer::from_vec(bytes),
        Err(_) => DetcoreBuffer::empty(),
    }
}

/// # Safety
/// `request_json` and `cas_root` must be valid, nul-terminated UTF-8
/// C strings for the duration of this call.
#[no_mangle]
pub unsafe extern "C" fn detcore_execute(
    request_json: *const c_char,
    cas_root: *const c_char,
) -> DetcoreBuffer {
    if request_json.is_null() || cas_root.is_null() {
        return error_buffer("null argument");
    }
    let request_str = match CStr::from_ptr(request_json).to_str() {
        Ok(s) => s,
        Err(_) => return error_buffer("request_json is not valid UTF-8"),
    };
    let cas_root_str = match CStr::from_ptr(cas_root).to_str() {
        Ok(s) => s,
        Err(_) => return error_buffer("cas_root is not valid UTF-8"),
    };

    if let Err(e) = canon_gate(request_str) {
        return error_buffer(e);
    }
    let ffi_request: FfiRequest = match serde_json::from_str(request_str) {
        Ok(r) => r,
        Err(e) => return error_buffer(format!("parse_structural: {e}")),
    };
    let request = match to_request(ffi_request) {
        Ok(r) => r,
        Err(e) => return error_buffer(e),
    };

    let ctx = match EngineContext::open(PathBuf::from(cas_root_str)) {
        Ok(c) => c,
        Err(e) => return error_buffer(format!("cas_write_failed: {e}")),
    };

    match core_execute(&ctx, request) {
        Ok(result) => match serde_json::to_vec(&result) {
            Ok(bytes) => DetcoreBuffer::from_vec(bytes),
            Err(e) => error_buffer(format!("serialize_failed: {e}")),
        },
        Err(e) => error_buffer(format!("{}: {e}", e.code())),
    }
}

/// # Safety
/// `request_json`, `expected_result_json`, and `cas_root` must be valid,
/// nul-terminated UTF-8 C strings for the duration of this call.
#[no_mangle]
pub unsafe extern "C" fn detcore_replay(
    request_json: *const c_char,
    expected_result_json: *const c_char,
    cas_root: *const c_char,
) -> DetcoreBuffer {
    if request_json.is_null() || expected_result_json.is_null() || cas_root.is_null() {
        return error_buffer("null argument");
    }
    let request_str = match CStr::from_ptr(request_json).to_str() {
        Ok(s) => s,
        Err(_) => return error_buffer("request_json is not valid UTF-8"),
    };
    let expected_str = match CStr::from_ptr(expected_result_json).to_str() {
        Ok(s) => s,
        Err(_) => return error_buffer("expected_result_json is not valid UTF-8"),
    };
    let cas_root_str = match CStr::from_ptr(cas_root).to_str() {
        Ok(s) => s,
        Err(_) => return error_buffer("cas_root is not valid UTF-8"),
    };

    if let Err(e) = canon_gate(request_str) {
        return error_buffer(e);
    }
    let ffi_request: FfiRequest = match serde_json::from_str(request_str) {
        Ok(r) => r,
        Err(e) => return error_buffer(format!("parse_structural: {e}")),
    };
    let request = match to_request(ffi_request) {
        Ok(r) => r,
        Err(e) => return error_buffer(e),
    };
    if let Err(e) = canon_gate(expected_str) {
        return error_buffer(e);
    }
    let expected: detcore_runtime::ExecutionResult = match serde_json::from_str(expected_str) {
        Ok(r) => r,
        Err(e) => return error_buffer(format!("parse_structural: {e}")),
    };

    let ctx = match EngineContext::open(PathBuf::from(cas_root_str)) {
        Ok(c) => c,
        Err(e) => return error_buffer(format!("cas_write_failed: {e}")),
    };

    match core_replay(&ctx, request, &expected) {
        Ok(verdict) => match serde_json::to_vec(&verdict) {
            Ok(bytes) => DetcoreBuffer::from_vec(bytes),
            Err(e) => error_buffer(format!("serialize_failed: {e}")),
        },
        Err(e) => error_buffer(format!("{}: {e}", e.code())),
    }
}

#[no_mangle]
pub extern "C" fn detcore_health() -> DetcoreBuffer {
    let report = core_health();
    match serde_json::to_vec(&report) {
        Ok(bytes) => DetcoreBuffer::from_vec(bytes),
        Err(_) => DetcoreBuffer::empty(),
    }
}

/// Convenience for callers that already hold a `CString`; mirrors the
/// pattern above but avoids a second round of `CStr` validation in tests.
#[cfg(test)]
fn to_cstring(s: &str) -> CString {
    CString::new(s).unwrap()
}
