//! A proof bundle built over a real execution must verify, and any
//! single-byte mutation to a leaf or the root must be caught.

use std::collections::BTreeMap;

use detcore::{execute, policy, proof, EngineContext, LlmMode, Mode, PolicySpec, Request};

fn base_policy() -> PolicySpec {
    PolicySpec {
        mode: Mode::Repro,
        time_mode: policy::TimeMode::Wall,
        determinism_flag: true,
        allow_outside_workspace: false,
        timeout_ms: 5_000,
        resource_limits: policy::ResourceLimits {
            memory_limit_bytes: Some(256 * 1024 * 1024),
            fd_limit: Some(256),
        },
        llm_mode: LlmMode::None,
    }
}

#[test]
fn bundle_over_a_real_execution_verifies_and_reports_unsigned() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::open(dir.path().join("cas")).unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let request = Request {
        command: "/bin/echo".to_string(),
        argv: vec!["proof".to_string()],
        env: BTreeMap::new(),
        workspace: ws,
        inputs: BTreeMap::new(),
        policy: base_policy(),
        tenant_id: None,
        request_id: None,
    };

    let result = execute(&ctx, request).unwrap();
    let bundle = proof::build(proof::BuildInput {
        input_digests: &[],
        output_digests: &result.outputs.values().copied().collect::<Vec<_>>(),
        policy_digest: result.request_digest,
        replay_transcript_digest: result.replay_transcript_digest,
        engine_version: detcore::ENGINE_VERSION.to_string(),
        contract_version: detcore::CONTRACT_VERSION.to_string(),
    })
    .unwrap();

    let outcome = proof::verify(&bundle, None);
    assert!(outcome.ok);
    assert_eq!(outcome.reason.as_deref(), Some("unsigned"));
}

#[test]
fn mutated_merkle_root_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::open(dir.path().join("cas")).unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let request = Request {
        command: "/bin/echo".to_string(),
        argv: vec!["proof".to_string()],
        env: BTreeMap::new(),
        workspace: ws,
        inputs: BTreeMap::new(),
        policy: base_policy(),
        tenant_id: None,
        request_id: None,
    };

    let result = execute(&ctx, request).unwrap();
    let mut bundle = proof::build(proof::BuildInput {
        input_digests: &[],
        output_digests: &[],
        policy_digest: result.request_digest,
        replay_transcript_digest: result.replay_transcript_digest,
        engine_version: detcore::ENGINE_VERSION.to_string(),
        contract_version: detcore::CONTRACT_VERSION.to_string(),
    })
    .unwrap();

    bundle.merkle_root = detcore::hash::HashEngine::new().hash(b"not the real root");
    let outcome = proof::verify(&bundle, None);
    assert!(!outcome.ok);
}
