//! End-to-end determinism scenarios driven through the public `detcore`
//! facade rather than any single crate's internals.

use std::collections::BTreeMap;

use detcore::{
    execute, policy, replay, EngineContext, InputArtifact, LlmMode, Mode, PolicySpec, Request,
};

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

fn echo_request(workspace: std::path::PathBuf, arg: &str) -> Request {
    Request {
        command: "/bin/echo".to_string(),
        argv: vec![arg.to_string()],
        env: BTreeMap::new(),
        workspace,
        inputs: BTreeMap::new(),
        policy: base_policy(),
        tenant_id: None,
        request_id: None,
    }
}

#[test]
fn repeated_execution_is_byte_for_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::open(dir.path().join("cas")).unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let mut seen = Vec::new();
    for _ in 0..20 {
        let result = execute(&ctx, echo_request(ws.clone(), "hello")).unwrap();
        seen.push((result.result_digest, result.stdout_digest, result.exit_code));
    }
    assert!(seen.iter().all(|s| *s == seen[0]));
}

#[test]
fn replay_confirms_an_unmodified_request_and_detects_tampering() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::open(dir.path().join("cas")).unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let expected = execute(&ctx, echo_request(ws.clone(), "hello")).unwrap();
    let verdict = replay(&ctx, echo_request(ws.clone(), "hello"), &expected).unwrap();
    assert!(verdict.ok, "unmodified replay should match: {:?}", verdict.mismatches);

    let mut tampered = expected.clone();
    tampered.stdout_digest = detcore::hash::Digest::ZERO;
    let verdict = replay(&ctx, echo_request(ws, "hello"), &tampered).unwrap();
    assert!(!verdict.ok);
    assert!(verdict.mismatches.contains(&"stdout_digest".to_string()));
}

#[test]
fn different_tenant_ids_diverge_but_same_tenant_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::open(dir.path().join("cas")).unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let mut req_a = echo_request(ws.clone(), "hello");
    req_a.tenant_id = Some("tenant-a".to_string());
    let mut req_b = echo_request(ws, "hello");
    req_b.tenant_id = Some("tenant-b".to_string());

    let result_a = execute(&ctx, req_a.clone()).unwrap();
    let result_a_again = execute(&ctx, req_a).unwrap();
    let result_b = execute(&ctx, req_b).unwrap();

    assert_eq!(result_a.request_digest, result_a_again.request_digest);
    assert_ne!(result_a.request_digest, result_b.request_digest);
}

#[test]
fn inline_input_digest_depends_on_its_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::open(dir.path().join("cas")).unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let mut req_a = echo_request(ws.clone(), "hello");
    req_a.inputs.insert("payload".into(), InputArtifact::Inline(b"one".to_vec()));
    let mut req_b = echo_request(ws, "hello");
    req_b.inputs.insert("payload".into(), InputArtifact::Inline(b"two".to_vec()));

    let result_a = execute(&ctx, req_a).unwrap();
    let result_b = execute(&ctx, req_b).unwrap();
    assert_ne!(result_a.request_digest, result_b.request_digest);
}
