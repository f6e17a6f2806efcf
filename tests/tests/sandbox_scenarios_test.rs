//! Sandbox failure modes surface as terminal, well-formed results rather
//! than engine errors — a collaborator should never see a panic or a
//! bare `Err` for a workspace escape or a timeout.

use std::collections::BTreeMap;

use detcore::{execute, policy, sandbox, EngineContext, LlmMode, Mode, PolicySpec, Request};

fn strict_policy(timeout_ms: u64) -> PolicySpec {
    PolicySpec {
        mode: Mode::Repro,
        time_mode: policy::TimeMode::Wall,
        determinism_flag: true,
        allow_outside_workspace: false,
        timeout_ms,
        resource_limits: policy::ResourceLimits {
            memory_limit_bytes: Some(256 * 1024 * 1024),
            fd_limit: Some(256),
        },
        llm_mode: LlmMode::None,
    }
}

#[test]
fn argument_path_outside_workspace_is_rejected_without_launch() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::open(dir.path().join("cas")).unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let request = Request {
        command: "/bin/cat".to_string(),
        argv: vec!["/etc/passwd".to_string()],
        env: BTreeMap::new(),
        workspace: ws,
        inputs: BTreeMap::new(),
        policy: strict_policy(5_000),
        tenant_id: None,
        request_id: None,
    };

    let result = execute(&ctx, request).unwrap();
    assert!(!result.ok);
    assert_eq!(result.error_code.as_deref(), Some("workspace_escape"));
}

#[test]
fn relative_argument_path_escaping_the_workspace_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::open(dir.path().join("cas")).unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let request = Request {
        command: "/bin/cat".to_string(),
        argv: vec!["../outside.txt".to_string()],
        env: BTreeMap::new(),
        workspace: ws,
        inputs: BTreeMap::new(),
        policy: strict_policy(5_000),
        tenant_id: None,
        request_id: None,
    };

    let result = execute(&ctx, request).unwrap();
    assert!(!result.ok);
    assert_eq!(result.error_code.as_deref(), Some("workspace_escape"));
}

#[test]
fn a_process_that_overruns_its_timeout_is_killed_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::open(dir.path().join("cas")).unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let request = Request {
        command: "/bin/sleep".to_string(),
        argv: vec!["5".to_string()],
        env: BTreeMap::new(),
        workspace: ws,
        inputs: BTreeMap::new(),
        policy: strict_policy(150),
        tenant_id: None,
        request_id: None,
    };

    let result = execute(&ctx, request).unwrap();
    assert!(!result.ok);
    assert_eq!(result.exit_code, sandbox::TIMEOUT_EXIT_CODE);
}
