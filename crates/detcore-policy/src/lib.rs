//! Execution-policy validation and determinism-confidence scoring.

use detcore_sandbox::{Capability, ProcessSpec, SandboxApplied};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    #[error("mode `{0}` is unknown")]
    UnknownMode(String),
    #[error("repro mode requires `{0}` but it was not requested")]
    ReproRequirementViolated(String),
}

/// Execution mode. `Repro` is the strict, fully-confined mode; `Turbo`
/// allows relaxations, but only on fields excluded from the result digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Repro,
    Turbo,
}

/// LLM involvement in producing the request, if any. Any mode other than
/// `None` demotes confidence — an LLM in the loop is not a source of
/// byte-for-byte repeatability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmMode {
    None,
    Assist,
    Generate,
}

impl LlmMode {
    fn tag(&self) -> &'static str {
        match self {
            LlmMode::None => "none",
            LlmMode::Assist => "assist",
            LlmMode::Generate => "generate",
        }
    }
}

/// Whether a request's clock reads real wall time or a frozen value
/// supplied by the caller — `frozen` is what lets a `repro`-mode request
/// stay reproducible across machines with different wall clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeMode {
    Wall,
    Frozen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_limit_bytes: Option<u64>,
    pub fd_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    pub mode: Mode,
    pub time_mode: TimeMode,
    pub determinism_flag: bool,
    pub allow_outside_workspace: bool,
    pub timeout_ms: u64,
    pub resource_limits: ResourceLimits,
    pub llm_mode: LlmMode,
}

/// The sandbox flags a policy mode implies, before the runtime actually
/// launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSandboxFlags {
    pub workspace_confinement: bool,
    pub network_isolation: bool,
    pub seccomp_filter: bool,
    pub process_mitigations: bool,
}

/// Validate `policy` and derive the sandbox flags/resource limits the
/// runtime should apply to a [`ProcessSpec`].
pub fn apply(policy: &PolicySpec, spec: &mut ProcessSpec) -> Result<EffectiveSandboxFlags, PolicyError> {
    validate(policy)?;

    spec.memory_limit_bytes = policy.resource_limits.memory_limit_bytes;
    spec.fd_limit = policy.resource_limits.fd_limit;

    let flags = match policy.mode {
        Mode::Repro => EffectiveSandboxFlags {
            workspace_confinement: true,
            network_isolation: true,
            seccomp_filter: true,
            process_mitigations: true,
        },
        Mode::Turbo => EffectiveSandboxFlags {
            workspace_confinement: !policy.allow_outside_workspace,
            network_isolation: false,
            seccomp_filter: false,
            process_mitigations: false,
        },
    };

    spec.workspace_confinement = flags.workspace_confinement;
    spec.network_isolation = flags.network_isolation;
    spec.seccomp_filter = flags.seccomp_filter;
    spec.process_mitigations = flags.process_mitigations;
    spec.timeout = std::time::Duration::from_millis(policy.timeout_ms);

    Ok(flags)
}

/// `repro` mode must keep confinement and the determinism flag on and
/// must set resource limits; `turbo` has no structural constraints beyond
/// what [`apply`] already fixes.
pub fn validate(policy: &PolicySpec) -> Result<(), PolicyError> {
    if policy.mode == Mode::Repro {
        if !policy.determinism_flag {
            return Err(PolicyError::ReproRequirementViolated(
                "determinism_flag".into(),
            ));
        }
        if policy.allow_outside_workspace {
            return Err(PolicyError::ReproRequirementViolated(
                "allow_outside_workspace".into(),
            ));
        }
        if policy.resource_limits.memory_limit_bytes.is_none()
            || policy.resource_limits.fd_limit.is_none()
        {
            return Err(PolicyError::ReproRequirementViolated(
                "resource_limits".into(),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    BestEffort,
}

impl ConfidenceLevel {
    fn demote(self) -> Self {
        match self {
            ConfidenceLevel::High => ConfidenceLevel::Medium,
            ConfidenceLevel::Medium => ConfidenceLevel::Low,
            ConfidenceLevel::Low | ConfidenceLevel::BestEffort => ConfidenceLevel::BestEffort,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confidence {
    pub level: ConfidenceLevel,
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Derive a [`Confidence`] from policy inputs and what the sandbox
/// actually achieved, per the demotion ladder: LLM involvement, partial
/// capabilities, and unsupported-but-requested capabilities each demote
/// one level; `determinism_flag: false` forces the floor regardless.
pub fn compute_confidence(
    llm_mode: &LlmMode,
    sandbox_applied: &SandboxApplied,
    determinism_flag: bool,
) -> Confidence {
    let mut level = ConfidenceLevel::High;
    let mut score = 1.0_f64;
    let mut reasons = Vec::new();

    if *llm_mode != LlmMode::None {
        level = level.demote();
        reasons.push(format!("llm_mode:{}", llm_mode.tag()));
    }

    let mut partial: Vec<&Capability> = sandbox_applied.partial.iter().collect();
    partial.sort();
    for cap in partial {
        level = level.demote();
        score -= 0.1;
        reasons.push(format!("sandbox_partial:{}", cap.tag()));
    }

    let mut unsupported: Vec<&Capability> = sandbox_applied.unsupported.iter().collect();
    unsupported.sort();
    for cap in unsupported {
        level = level.demote();
        score -= 0.2;
        reasons.push(format!("sandbox_unsupported:{}", cap.tag()));
    }

    if !determinism_flag {
        level = ConfidenceLevel::BestEffort;
    }

    Confidence {
        level,
        score: score.max(0.0),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detcore_sandbox::ProcessSpec;
    use std::path::PathBuf;

    fn base_policy(mode: Mode) -> PolicySpec {
        PolicySpec {
            mode,
            time_mode: TimeMode::Wall,
            llm_mode: LlmMode::None,
            resource_limits: ResourceLimits {
                memory_limit_bytes: Some(256 * 1024 * 1024),
                fd_limit: Some(256),
            },
            determinism_flag: true,
            allow_outside_workspace: false,
            timeout_ms: 5000,
        }
    }

    #[test]
    fn repro_mode_turns_on_all_confinement_flags() {
        let policy = base_policy(Mode::Repro);
        let mut spec = ProcessSpec::new("echo", PathBuf::from("/tmp"));
        let flags = apply(&policy, &mut spec).unwrap();
        assert!(flags.workspace_confinement);
        assert!(flags.network_isolation);
        assert!(flags.seccomp_filter);
        assert!(flags.process_mitigations);
    }

    #[test]
    fn repro_mode_without_determinism_flag_is_rejected() {
        let mut policy = base_policy(Mode::Repro);
        policy.determinism_flag = false;
        let mut spec = ProcessSpec::new("echo", PathBuf::from("/tmp"));
        assert_eq!(
            apply(&policy, &mut spec).unwrap_err(),
            PolicyError::ReproRequirementViolated("determinism_flag".into())
        );
    }

    #[test]
    fn repro_mode_without_resource_limits_is_rejected() {
        let mut policy = base_policy(Mode::Repro);
        policy.resource_limits.memory_limit_bytes = None;
        let mut spec = ProcessSpec::new("echo", PathBuf::from("/tmp"));
        assert_eq!(
            apply(&policy, &mut spec).unwrap_err(),
            PolicyError::ReproRequirementViolated("resource_limits".into())
        );
    }

    #[test]
    fn turbo_mode_relaxes_non_digest_fields() {
        let policy = base_policy(Mode::Turbo);
        let mut spec = ProcessSpec::new("echo", PathBuf::from("/tmp"));
        let flags = apply(&policy, &mut spec).unwrap();
        assert!(flags.workspace_confinement);
        assert!(!flags.network_isolation);
        assert!(!flags.seccomp_filter);
    }

    #[test]
    fn clean_run_is_high_confidence() {
        let confidence =
            compute_confidence(&LlmMode::None, &SandboxApplied::default(), true);
        assert_eq!(confidence.level, ConfidenceLevel::High);
        assert_eq!(confidence.score, 1.0);
        assert!(confidence.reasons.is_empty());
    }

    #[test]
    fn llm_mode_demotes_one_level() {
        let confidence =
            compute_confidence(&LlmMode::Assist, &SandboxApplied::default(), true);
        assert_eq!(confidence.level, ConfidenceLevel::Medium);
        assert_eq!(confidence.reasons, vec!["llm_mode:assist"]);
    }

    #[test]
    fn partial_capability_demotes_and_subtracts_score() {
        let mut applied = SandboxApplied::default();
        applied.partial.push(Capability::SeccompFilter);
        let confidence = compute_confidence(&LlmMode::None, &applied, true);
        assert_eq!(confidence.level, ConfidenceLevel::Medium);
        assert!((confidence.score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn unsupported_capability_demotes_and_subtracts_more() {
        let mut applied = SandboxApplied::default();
        applied.unsupported.push(Capability::NetworkIsolation);
        let confidence = compute_confidence(&LlmMode::None, &applied, true);
        assert_eq!(confidence.level, ConfidenceLevel::Medium);
        assert!((confidence.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn determinism_flag_false_forces_best_effort() {
        let confidence = compute_confidence(&LlmMode::None, &SandboxApplied::default(), false);
        assert_eq!(confidence.level, ConfidenceLevel::BestEffort);
    }

    #[test]
    fn level_never_drops_below_best_effort() {
        let mut applied = SandboxApplied::default();
        applied.unsupported = vec![
            Capability::NetworkIsolation,
            Capability::SeccompFilter,
            Capability::MemoryLimit,
            Capability::FileDescriptorLimit,
            Capability::ProcessMitigations,
        ];
        let confidence = compute_confidence(&LlmMode::Generate, &applied, true);
        assert_eq!(confidence.level, ConfidenceLevel::BestEffort);
    }

    #[test]
    fn score_never_drops_below_zero() {
        let mut applied = SandboxApplied::default();
        applied.unsupported = vec![Capability::NetworkIsolation; 10];
        let confidence = compute_confidence(&LlmMode::None, &applied, true);
        assert_eq!(confidence.score, 0.0);
    }

    proptest::proptest! {
        #[test]
        fn score_never_increases_as_unsupported_capabilities_grow(n in 0usize..8) {
            let mut applied = SandboxApplied::default();
            let baseline = compute_confidence(&LlmMode::None, &applied, true).score;
            let mut previous = baseline;
            for _ in 0..n {
                applied.unsupported.push(Capability::NetworkIsolation);
                let score = compute_confidence(&LlmMode::None, &applied, true).score;
                proptest::prop_assert!(score <= previous);
                previous = score;
            }
        }

        #[test]
        fn determinism_flag_false_always_forces_best_effort(
            unsupported_count in 0usize..4,
            llm_generate in proptest::bool::ANY,
        ) {
            let mut applied = SandboxApplied::default();
            applied.unsupported = vec![Capability::NetworkIsolation; unsupported_count];
            let llm_mode = if llm_generate { LlmMode::Generate } else { LlmMode::None };
            let confidence = compute_confidence(&llm_mode, &applied, false);
            proptest::prop_assert_eq!(confidence.level, ConfidenceLevel::BestEffort);
        }
    }
}
