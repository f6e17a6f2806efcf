//! Top-level facade: the library entry points a collaborator embeds
//! directly (`execute`, `replay`, `health`), plus the health/doctor
//! pipeline (C9) that gates whether this build may be trusted for
//! production execution.

pub use detcore_canon::{self as canon, CanonError, CanonicalValue};
pub use detcore_cas::{self as cas, CasError, Compression, ContentStore};
pub use detcore_hash::{self as hash, domains, Digest, HashEngine};
pub use detcore_merkle::{self as merkle, MerkleError, MerkleProof, MerkleTree};
pub use detcore_policy::{self as policy, Confidence, ConfidenceLevel, LlmMode, Mode, PolicySpec};
pub use detcore_proof::{self as proof, ProofBundle, SignatureVerifier, VerifyOutcome};
pub use detcore_runtime::{
    execute, replay, Clock, EngineContext, ExecutionResult, InputArtifact, Request, ReplayVerdict,
    RuntimeError, SystemClock, CONTRACT_VERSION, ENGINE_VERSION,
};
pub use detcore_sandbox::{self as sandbox, Capability, SandboxApplied, SandboxError};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Install a `tracing-subscriber` formatter driven by `RUST_LOG`, matching
/// the teacher's ambient logging setup. Call once at process start; safe
/// to call more than once (later calls are a no-op).
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    pub ok: bool,
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
}

/// Run the full self-test pipeline: hash vectors, a CAS round-trip-plus-
/// corruption check, a sandbox self-test, and a replay dry run over a
/// canonical golden request. Any blocker means this build must not be
/// used for production execution.
pub fn health() -> DoctorReport {
    let mut blockers = Vec::new();
    let mut warnings = Vec::new();

    check_hash_vectors(&mut blockers);
    check_cas_round_trip(&mut blockers);
    check_sandbox_self_test(&mut blockers, &mut warnings);
    check_golden_replay(&mut blockers);

    let ok = blockers.is_empty();
    if ok {
        info!("doctor: all checks passed");
    } else {
        error!(blockers = ?blockers, "doctor: blockers present, build is not production-safe");
    }
    DoctorReport { ok, blockers, warnings }
}

fn check_hash_vectors(blockers: &mut Vec<String>) {
    let engine = HashEngine::new();
    if let Err(e) = engine.self_test() {
        blockers.push(format!("hash_unavailable: {e}"));
    }
}

fn check_cas_round_trip(blockers: &mut Vec<String>) {
    let Ok(dir) = tempfile::tempdir() else {
        blockers.push("cas_doctor_setup_failed: could not create scratch directory".to_string());
        return;
    };
    let Ok(store) = ContentStore::open(dir.path()) else {
        blockers.push("cas_doctor_setup_failed: could not open scratch store".to_string());
        return;
    };

    let digest = match store.put(b"doctor self-test payload", Compression::Identity) {
        Ok(d) => d,
        Err(e) => {
            blockers.push(format!("cas_write_failed: {e}"));
            return;
        }
    };
    if store.get(&digest).is_err() {
        blockers.push("cas_round_trip_failed: get(put(bytes)) != bytes".to_string());
        return;
    }

    let hex = digest.to_hex();
    let shard = dir.path().join("objects").join(&hex[0..2]).join(&hex[2..4]).join(&hex);
    match std::fs::read(&shard) {
        Ok(mut bytes) => {
            bytes[0] ^= 0xFF;
            let _ = std::fs::write(&shard, bytes);
        }
        Err(e) => {
            blockers.push(format!("cas_doctor_setup_failed: {e}"));
            return;
        }
    }

    match store.get(&digest) {
        Err(e) if e.code() == "cas_integrity_failure" => {}
        Err(e) => blockers.push(format!("cas_corruption_not_detected_as_expected: {e}")),
        Ok(_) => blockers.push("cas_corruption_not_detected: flipped byte was not caught".to_string()),
    }
}

fn check_sandbox_self_test(blockers: &mut Vec<String>, warnings: &mut Vec<String>) {
    let Ok(dir) = tempfile::tempdir() else {
        blockers.push("sandbox_doctor_setup_failed: could not create scratch workspace".to_string());
        return;
    };
    match sandbox::self_test(dir.path()) {
        Ok(applied) => {
            for cap in &applied.partial {
                warnings.push(format!("sandbox_partial:{}", cap.tag()));
            }
            for cap in &applied.unsupported {
                warnings.push(format!("sandbox_unsupported:{}", cap.tag()));
            }
        }
        Err(e) => blockers.push(format!("{}: {e}", e.code())),
    }
}

fn check_golden_replay(blockers: &mut Vec<String>) {
    let Ok(cas_dir) = tempfile::tempdir() else {
        blockers.push("replay_doctor_setup_failed: could not create scratch CAS".to_string());
        return;
    };
    let Ok(ws_dir) = tempfile::tempdir() else {
        blockers.push("replay_doctor_setup_failed: could not create scratch workspace".to_string());
        return;
    };
    let Ok(ctx) = EngineContext::open(cas_dir.path()) else {
        blockers.push("replay_doctor_setup_failed: could not open engine context".to_string());
        return;
    };

    let request = golden_request(ws_dir.path().to_path_buf());
    let expected = match execute(&ctx, request.clone()) {
        Ok(r) => r,
        Err(e) => {
            blockers.push(format!("golden_request_execution_failed: {e}"));
            return;
        }
    };

    match replay(&ctx, request, &expected) {
        Ok(verdict) if verdict.ok => {}
        Ok(verdict) => blockers.push(format!(
            "replay_divergence on golden request: {:?}",
            verdict.mismatches
        )),
        Err(e) => blockers.push(format!("replay_failed: {e}")),
    }
}

fn golden_request(workspace: PathBuf) -> Request {
    use std::collections::BTreeMap;
    Request {
        command: "/bin/echo".to_string(),
        argv: vec!["doctor-golden".to_string()],
        env: BTreeMap::new(),
        workspace,
        inputs: BTreeMap::new(),
        policy: PolicySpec {
            mode: Mode::Repro,
            time_mode: policy::TimeMode::Wall,
            determinism_flag: true,
            allow_outside_workspace: false,
            timeout_ms: 5_000,
            resource_limits: policy::ResourceLimits {
                memory_limit_bytes: Some(128 * 1024 * 1024),
                fd_limit: Some(128),
            },
            llm_mode: LlmMode::None,
        },
        tenant_id: None,
        request_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_passes_on_this_host() {
        let report = health();
        assert!(report.ok, "doctor blockers: {:?}", report.blockers);
    }
}
