//! End-to-end engine tests: a scripted LLM drives full runs against a
//! real temporary git repository.

use async_trait::async_trait;
use git2::Repository;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use foreman::context::embedding::HashedBagOfWords;
use foreman::context::ContextBundle;
use foreman::patch::{parse_patch, GitWorkspace, ScopeSet};
use foreman::{
    ContextSelector, ForemanConfig, LlmClient, LlmError, LlmResponse, LlmRole, Orchestrator,
    Phase, PhaseState, RunState, SafetyProfile,
};

/// Pops canned replies per role and records every prompt.
struct ScriptedLlm {
    builder: Mutex<VecDeque<String>>,
    auditor: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<(LlmRole, String)>>,
}

impl ScriptedLlm {
    fn new(builder: Vec<String>, auditor: Vec<String>) -> Self {
        Self {
            builder: Mutex::new(builder.into()),
            auditor: Mutex::new(auditor.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn builder_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(role, _)| *role == LlmRole::Builder)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn call(
        &self,
        role: LlmRole,
        prompt: &str,
        _context: &ContextBundle,
    ) -> Result<LlmResponse, LlmError> {
        self.prompts.lock().unwrap().push((role, prompt.to_string()));
        let queue = match role {
            LlmRole::Builder => &self.builder,
            LlmRole::Auditor => &self.auditor,
        };
        let text = queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Provider("script exhausted".into()))?;
        Ok(LlmResponse {
            text,
            tokens_used: 60,
        })
    }

    fn estimate_tokens(&self, _prompt: &str, _context: &ContextBundle) -> u64 {
        60
    }
}

fn builder_reply(patch: &str) -> String {
    serde_json::to_string(&serde_json::json!({
        "status": "proposed",
        "patch": patch,
        "rationale": "implements the phase",
        "self_reported_issues": []
    }))
    .unwrap()
}

fn approve() -> String {
    r#"{"verdict": "approve", "findings": [], "confidence": 0.9}"#.to_string()
}

fn patch_for(path: &str, original: &str, added: &str) -> String {
    format!("--- a/{path}\n+++ b/{path}\n@@ -1,1 +1,2 @@\n {original}\n+{added}\n")
}

fn init_repo(dir: &Path) {
    let repo = Repository::init(dir).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    fs::create_dir_all(dir.join("src")).unwrap();
    fs::create_dir_all(dir.join("docs")).unwrap();
    fs::write(dir.join("src/lib.rs"), "pub fn existing() {}\n").unwrap();
    fs::write(dir.join("docs/readme.md"), "start here\n").unwrap();
}

fn engine_config() -> ForemanConfig {
    let mut config = ForemanConfig::default();
    config.review.backoff_base_ms = 0;
    config.review.max_transient_retries = 1;
    config
}

fn new_orchestrator(
    dir: &Path,
    config: ForemanConfig,
    phases: Vec<Phase>,
    llm: Arc<ScriptedLlm>,
) -> Orchestrator {
    Orchestrator::new(
        dir,
        config,
        phases,
        llm,
        ContextSelector::new(Arc::new(HashedBagOfWords::default())),
    )
    .unwrap()
}

#[tokio::test]
async fn full_run_applies_patches_and_saves_report() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let phases = vec![
        Phase::new("01", "Library", "add a function to the library", vec!["src/**".into()]),
        Phase::new("02", "Docs", "document the new function", vec!["docs/**".into()])
            .with_depends_on(vec!["01".into()]),
    ];
    let llm = Arc::new(ScriptedLlm::new(
        vec![
            builder_reply(&patch_for("src/lib.rs", "pub fn existing() {}", "pub fn added() {}")),
            builder_reply(&patch_for("docs/readme.md", "start here", "see added()")),
        ],
        vec![approve(), approve(), approve(), approve()],
    ));

    let mut orch = new_orchestrator(dir.path(), engine_config(), phases, Arc::clone(&llm));
    let report = orch.execute().await.unwrap();

    assert_eq!(report.run.state, RunState::DoneSuccess);
    assert!(report.run.completed_at.is_some());
    assert_eq!(report.run.tokens_used, 6 * 60);
    assert!(fs::read_to_string(dir.path().join("src/lib.rs"))
        .unwrap()
        .contains("pub fn added"));
    assert!(fs::read_to_string(dir.path().join("docs/readme.md"))
        .unwrap()
        .contains("see added()"));

    // Every applied patch left a commit behind.
    let repo = Repository::open(dir.path()).unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.push_head().unwrap();
    assert!(walk.count() >= 2);

    let report_path = dir.path().join("run-report.json");
    report.save(&report_path).unwrap();
    let loaded: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(loaded["run"]["state"], "done_success");
}

#[tokio::test]
async fn out_of_scope_patch_is_rejected_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let phases = vec![Phase::new(
        "01",
        "Library",
        "add a function",
        vec!["src/**".into()],
    )];
    // First patch reaches outside the scope; the retry behaves.
    let llm = Arc::new(ScriptedLlm::new(
        vec![
            builder_reply(&patch_for("docs/readme.md", "start here", "sneaky change")),
            builder_reply(&patch_for("src/lib.rs", "pub fn existing() {}", "pub fn added() {}")),
        ],
        vec![approve(), approve()],
    ));

    let mut orch = new_orchestrator(dir.path(), engine_config(), phases, Arc::clone(&llm));
    let report = orch.execute().await.unwrap();

    assert_eq!(report.run.state, RunState::DoneSuccess);
    // The out-of-scope file was never modified.
    assert_eq!(
        fs::read_to_string(dir.path().join("docs/readme.md")).unwrap(),
        "start here\n"
    );
    assert!(report
        .incidents
        .iter()
        .any(|i| i.category == foreman::IncidentCategory::ScopeViolation));

    // The retry prompt carries the violation feedback and the scope rule.
    let prompts = llm.builder_prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("out-of-scope"));
    assert!(prompts[1].contains("src/**"));
}

#[tokio::test]
async fn prevention_rules_carry_across_phases_within_a_run() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let truncated = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,1 +1,2 @@\n pub fn existing() {}\n+...\n";
    let phases = vec![
        Phase::new("01", "Library", "add a function", vec!["src/**".into()]),
        Phase::new("02", "Docs", "update the docs", vec!["docs/**".into()]),
    ];
    // Phase 01 emits a truncated patch once, then recovers. Phase 02's
    // first builder prompt must already carry the derived rule.
    let llm = Arc::new(ScriptedLlm::new(
        vec![
            builder_reply(truncated),
            builder_reply(&patch_for("src/lib.rs", "pub fn existing() {}", "pub fn added() {}")),
            builder_reply(&patch_for("docs/readme.md", "start here", "see added()")),
        ],
        vec![approve(), approve(), approve(), approve()],
    ));

    let mut orch = new_orchestrator(dir.path(), engine_config(), phases, Arc::clone(&llm));
    let report = orch.execute().await.unwrap();

    assert_eq!(report.run.state, RunState::DoneSuccess);
    let prompts = llm.builder_prompts();
    assert_eq!(prompts.len(), 3);
    assert!(!prompts[0].contains("PREVENTION RULES"));
    assert!(prompts[2].contains("PREVENTION RULES"));
    assert!(prompts[2].contains("never elide content"));
}

#[tokio::test]
async fn conservative_run_halts_while_permissive_tolerates_minor_findings() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let minor_heavy = r#"{"verdict": "approve", "findings": [
        {"severity": "minor", "message": "naming nit one"},
        {"severity": "minor", "message": "naming nit two"},
        {"severity": "minor", "message": "naming nit three"},
        {"severity": "minor", "message": "naming nit four"}
    ], "confidence": 0.7}"#;

    let mut config = engine_config();
    config.review.safety_profile = SafetyProfile::Permissive;
    config.review.auditor_count = 1;

    let phases = vec![Phase::new("01", "Library", "add a function", vec!["src/**".into()])];
    let llm = Arc::new(ScriptedLlm::new(
        vec![builder_reply(&patch_for(
            "src/lib.rs",
            "pub fn existing() {}",
            "pub fn added() {}",
        ))],
        vec![minor_heavy.to_string()],
    ));

    let mut orch = new_orchestrator(dir.path(), config, phases, llm);
    let report = orch.execute().await.unwrap();
    // Four minor findings pass under Permissive; Standard would reject.
    assert_eq!(report.run.state, RunState::DoneSuccess);
    assert!(report.phases[0].state.is_complete());
    assert_eq!(report.phases[0].state, PhaseState::Complete);
}

#[test]
fn rollback_restores_exact_bytes() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let workspace = GitWorkspace::open(dir.path()).unwrap();
    workspace.snapshot_before("01").unwrap();
    let original = fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();

    let scope = ScopeSet::from_globs(&["src/**".to_string()]).unwrap();
    let parsed = parse_patch(&patch_for(
        "src/lib.rs",
        "pub fn existing() {}",
        "pub fn added() {}",
    ))
    .unwrap();
    let applied = workspace.apply(&parsed, &scope, "01").unwrap();
    assert_ne!(
        fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(),
        original
    );

    let rollback = workspace.rollback(&applied.commit).unwrap();
    assert!(rollback.unrestorable.is_empty());
    assert_eq!(
        fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(),
        original
    );
}
