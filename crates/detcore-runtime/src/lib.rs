//! Single-request execution orchestration (C5) and replay verification (C6).
//!
//! [`execute`] runs the nine-step pipeline: parse, fill defaults, digest
//! the request, stage inputs into CAS, apply policy, launch the sandbox,
//! digest outputs, assemble the result, and persist it. [`replay`] repeats
//! the same pipeline and reports a truthful divergence instead of treating
//! mismatch as an engine error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use detcore_canon::{CanonError, CanonicalValue};
use detcore_cas::{CasError, Compression, ContentStore};
use detcore_hash::{domains, Digest, HashEngine};
use detcore_policy::{self as policy, Confidence, LlmMode, PolicyError, PolicySpec};
use detcore_sandbox::{self as sandbox, ProcessSpec, SandboxApplied, SandboxError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const ENGINE_VERSION: &str = "0.1.0";
/// Bumped from `1` to record the pinned decision that `tenant_id`
/// contributes to the request digest.
pub const CONTRACT_VERSION: &str = "2";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Canon(#[from] CanonError),
    #[error(transparent)]
    Cas(#[from] CasError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl RuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::Canon(e) => e.code(),
            RuntimeError::Cas(e) => e.code(),
            RuntimeError::Sandbox(e) => e.code(),
            RuntimeError::Policy(_) => "policy_invalid",
        }
    }
}

/// A clock isolated behind a trait so tests can freeze time without
/// touching the system clock.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn monotonic_now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// An input artifact is either already content-addressed or provided
/// inline, in which case the runtime stages it into CAS before the
/// request digest is computed.
#[derive(Debug, Clone)]
pub enum InputArtifact {
    ByDigest(Digest),
    Inline(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Request {
    pub command: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workspace: PathBuf,
    pub inputs: BTreeMap<String, InputArtifact>,
    pub policy: PolicySpec,
    pub tenant_id: Option<String>,
    pub request_id: Option<String>,
}

fn policy_to_canonical(policy: &PolicySpec) -> Result<CanonicalValue, CanonError> {
    let mode = match policy.mode {
        policy::Mode::Repro => "repro",
        policy::Mode::Turbo => "turbo",
    };
    let time_mode = match policy.time_mode {
        policy::TimeMode::Wall => "wall",
        policy::TimeMode::Frozen => "frozen",
    };
    let llm_mode = match policy.llm_mode {
        LlmMode::None => "none",
        LlmMode::Assist => "assist",
        LlmMode::Generate => "generate",
    };
    CanonicalValue::object(vec![
        ("mode".into(), CanonicalValue::Str(mode.into())),
        ("time_mode".into(), CanonicalValue::Str(time_mode.into())),
        (
            "deterministic".into(),
            CanonicalValue::Bool(policy.determinism_flag),
        ),
        (
            "allow_outside_workspace".into(),
            CanonicalValue::Bool(policy.allow_outside_workspace),
        ),
        (
            "timeout_ms".into(),
            CanonicalValue::Int(policy.timeout_ms as i64),
        ),
        (
            "memory_limit_bytes".into(),
            match policy.resource_limits.memory_limit_bytes {
                Some(n) => CanonicalValue::Int(n as i64),
                None => CanonicalValue::Null,
            },
        ),
        (
            "fd_limit".into(),
            match policy.resource_limits.fd_limit {
                Some(n) => CanonicalValue::Int(n as i64),
                None => CanonicalValue::Null,
            },
        ),
        ("llm_mode".into(), CanonicalValue::Str(llm_mode.into())),
    ])
}

/// Canonical form of everything that contributes to the request digest.
/// `request_id` is never part of this projection — the id is itself
/// derived from this same digest.
fn request_to_canonical(request: &Request, resolved_inputs: &BTreeMap<String, Digest>) -> Result<CanonicalValue, CanonError> {
    let mut entries = vec![
        ("command".into(), CanonicalValue::Str(request.command.clone())),
        (
            "argv".into(),
            CanonicalValue::Array(
                request.argv.iter().map(|a| CanonicalValue::Str(a.clone())).collect(),
            ),
        ),
        (
            "env".into(),
            CanonicalValue::object(
                request
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), CanonicalValue::Str(v.clone())))
                    .collect(),
            )?,
        ),
        (
            "workspace".into(),
            CanonicalValue::Str(request.workspace.to_string_lossy().into_owned()),
        ),
        (
            "inputs".into(),
            CanonicalValue::object(
                resolved_inputs
                    .iter()
                    .map(|(k, d)| (k.clone(), CanonicalValue::Str(d.to_hex())))
                    .collect(),
            )?,
        ),
        ("policy".into(), policy_to_canonical(&request.policy)?),
    ];
    if let Some(tenant_id) = &request.tenant_id {
        entries.push(("tenant_id".into(), CanonicalValue::Str(tenant_id.clone())));
    }
    CanonicalValue::object(entries)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub ok: bool,
    pub exit_code: i32,
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    pub outputs: BTreeMap<String, Digest>,
    pub sandbox_applied: SandboxApplied,
    pub determinism_confidence: Confidence,
    pub request_digest: Digest,
    pub result_digest: Digest,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub request_id: String,
    pub error_code: Option<String>,
    pub compat_warning: bool,
    pub replay_transcript_digest: Digest,
    pub signature: Option<Vec<u8>>,
}

/// The projection hashed for `result_digest`: excludes timestamps,
/// duration, request-id, and sandbox runtime diagnostics (the latter
/// varies legitimately across hosts/platforms and would otherwise break
/// cross-machine determinism).
fn result_projection_to_canonical(result: &ExecutionResult) -> CanonicalValue {
    CanonicalValue::object(vec![
        ("ok".into(), CanonicalValue::Bool(result.ok)),
        ("exit_code".into(), CanonicalValue::Int(result.exit_code as i64)),
        (
            "stdout_digest".into(),
            CanonicalValue::Str(result.stdout_digest.to_hex()),
        ),
        (
            "stderr_digest".into(),
            CanonicalValue::Str(result.stderr_digest.to_hex()),
        ),
        (
            "outputs".into(),
            CanonicalValue::object(
                result
                    .outputs
                    .iter()
                    .map(|(k, d)| (k.clone(), CanonicalValue::Str(d.to_hex())))
                    .collect(),
            )
            .expect("output names are already deduplicated by BTreeMap"),
        ),
        (
            "determinism_confidence_level".into(),
            CanonicalValue::Str(format!("{:?}", result.determinism_confidence.level)),
        ),
        (
            "request_digest".into(),
            CanonicalValue::Str(result.request_digest.to_hex()),
        ),
        ("compat_warning".into(), CanonicalValue::Bool(result.compat_warning)),
    ])
    .expect("static key set has no duplicates")
}

pub struct EngineContext {
    pub cas: ContentStore,
    pub hash: HashEngine,
    pub clock: Arc<dyn Clock>,
}

impl EngineContext {
    pub fn open(cas_root: impl Into<PathBuf>) -> Result<Self, RuntimeError> {
        Ok(Self {
            cas: ContentStore::open(cas_root.into())?,
            hash: HashEngine::new(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Resolve every input artifact to a CAS content digest, staging inline
/// bytes via `put_atomic` first.
fn stage_inputs(
    ctx: &EngineContext,
    inputs: &BTreeMap<String, InputArtifact>,
) -> Result<BTreeMap<String, Digest>, RuntimeError> {
    let mut resolved = BTreeMap::new();
    for (name, artifact) in inputs {
        let digest = match artifact {
            InputArtifact::ByDigest(d) => {
                if !ctx.cas.contains(d) {
                    return Err(RuntimeError::Cas(CasError::MissingObject(d.to_hex())));
                }
                *d
            }
            InputArtifact::Inline(bytes) => ctx.cas.put_atomic(bytes, Compression::Identity)?,
        };
        resolved.insert(name.clone(), digest);
    }
    Ok(resolved)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TranscriptEvent {
    ProcessStart,
    ProcessExit { exit_code: i32 },
    Timeout,
}

fn transcript_digest(hash: &HashEngine, events: &[TranscriptEvent]) -> Digest {
    let items: Vec<CanonicalValue> = events
        .iter()
        .map(|event| match event {
            TranscriptEvent::ProcessStart => {
                CanonicalValue::object(vec![("event".into(), CanonicalValue::Str("start".into()))])
                    .expect("static keys")
            }
            TranscriptEvent::ProcessExit { exit_code } => CanonicalValue::object(vec![
                ("event".into(), CanonicalValue::Str("exit".into())),
                ("exit_code".into(), CanonicalValue::Int(*exit_code as i64)),
            ])
            .expect("static keys"),
            TranscriptEvent::Timeout => {
                CanonicalValue::object(vec![("event".into(), CanonicalValue::Str("timeout".into()))])
                    .expect("static keys")
            }
        })
        .collect();
    let bytes = CanonicalValue::Array(items).to_canonical_bytes();
    hash.hash_domain(domains::RESULT, &bytes)
}

/// Run the full C5 pipeline for a single request.
pub fn execute(ctx: &EngineContext, request: Request) -> Result<ExecutionResult, RuntimeError> {
    let start_timestamp = ctx.clock.now_utc();
    let start_instant = ctx.clock.monotonic_now();

    let resolved_inputs = stage_inputs(ctx, &request.inputs)?;

    let canonical_request = request_to_canonical(&request, &resolved_inputs)?;
    let canonical_bytes = canonical_request.to_canonical_bytes();
    let request_digest = ctx.hash.hash_domain(domains::REQUEST, &canonical_bytes);
    let request_id = request
        .request_id
        .clone()
        .unwrap_or_else(|| request_digest.to_hex());

    let mut spec = ProcessSpec::new(request.command.clone(), request.workspace.clone());
    spec.argv = request.argv.clone();
    spec.env = request.env.clone();
    spec.timeout = Duration::from_millis(request.policy.timeout_ms);

    let flags = policy::apply(&request.policy, &mut spec)?;
    info!(
        mode = ?request.policy.mode,
        workspace_confinement = flags.workspace_confinement,
        "applying policy to sandbox spec"
    );

    let mut transcript = vec![TranscriptEvent::ProcessStart];

    // Sandbox failure modes (launch_failed, workspace_escape, resource_limit,
    // io_error) are terminal states, not engine errors: they surface as a
    // well-formed `ok: false` result carrying the error code, with no
    // partial CAS objects left behind. Only parse/policy errors fail the
    // request before any side effect.
    let (exit_code, stdout, stderr, sandbox_applied, ok, error_code) = match sandbox::run(&spec) {
        Ok(result) => {
            if result.timeout {
                transcript.push(TranscriptEvent::Timeout);
            }
            transcript.push(TranscriptEvent::ProcessExit {
                exit_code: result.exit_code,
            });
            let ok = !result.timeout && result.exit_code == 0;
            (
                result.exit_code,
                result.stdout,
                result.stderr,
                result.sandbox_applied,
                ok,
                None,
            )
        }
        Err(e) => {
            warn!(error = %e, "sandbox launch failed");
            (1, Vec::new(), Vec::new(), SandboxApplied::default(), false, Some(e.code().to_string()))
        }
    };

    let stdout_digest = ctx.hash.hash_domain(domains::RESULT, &stdout);
    let stderr_digest = ctx.hash.hash_domain(domains::RESULT, &stderr);

    // The pipeline produces no output artifacts beyond stdout/stderr in
    // this engine; a richer collaborator would populate `outputs` from
    // declared output paths written under the workspace.
    let outputs: BTreeMap<String, Digest> = BTreeMap::new();

    let determinism_confidence =
        policy::compute_confidence(&request.policy.llm_mode, &sandbox_applied, request.policy.determinism_flag);

    let end_timestamp = ctx.clock.now_utc();
    let duration_ms = ctx.clock.monotonic_now().duration_since(start_instant).as_millis() as u64;

    let replay_transcript_digest = transcript_digest(&ctx.hash, &transcript);

    let mut result = ExecutionResult {
        ok,
        exit_code,
        stdout_digest,
        stderr_digest,
        outputs,
        sandbox_applied,
        determinism_confidence,
        request_digest,
        result_digest: Digest::ZERO,
        start_timestamp,
        end_timestamp,
        duration_ms,
        request_id,
        error_code,
        compat_warning: ctx.hash.compat_warning(),
        replay_transcript_digest,
        signature: None,
    };
    let projection = result_projection_to_canonical(&result);
    let projection_bytes = projection.to_canonical_bytes();
    result.result_digest = ctx.hash.hash_domain(domains::RESULT, &projection_bytes);

    Ok(result)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayVerdict {
    pub ok: bool,
    pub actual_result_digest: Digest,
    pub mismatches: Vec<String>,
}

/// Re-execute `request` and compare digest-bearing fields against
/// `expected`. Timing and request-id are never compared. A CAS integrity
/// failure propagates as an error rather than a divergence.
pub fn replay(
    ctx: &EngineContext,
    request: Request,
    expected: &ExecutionResult,
) -> Result<ReplayVerdict, RuntimeError> {
    let actual = execute(ctx, request)?;

    let mut mismatches = Vec::new();
    if actual.result_digest != expected.result_digest {
        mismatches.push("result_digest".to_string());
    }
    if actual.request_digest != expected.request_digest {
        mismatches.push("request_digest".to_string());
    }
    if actual.stdout_digest != expected.stdout_digest {
        mismatches.push("stdout_digest".to_string());
    }
    if actual.stderr_digest != expected.stderr_digest {
        mismatches.push("stderr_digest".to_string());
    }
    if actual.outputs != expected.outputs {
        mismatches.push("outputs".to_string());
    }
    if actual.ok != expected.ok {
        mismatches.push("ok".to_string());
    }
    if actual.exit_code != expected.exit_code {
        mismatches.push("exit_code".to_string());
    }

    Ok(ReplayVerdict {
        ok: mismatches.is_empty(),
        actual_result_digest: actual.result_digest,
        mismatches,
    })
}
