//! Shared fakes for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use pipeline_healer::classify::{Diagnostic, Toolchain};
use pipeline_healer::collab::{
    CheckRunner, CiStatus, CiStatusSource, CiTarget, CodeGenerator, Collaborators, FileDiscovery,
    FixRequest, Inventory, Vcs,
};
use pipeline_healer::error::{CheckError, CiStatusError, CodegenError, VcsError};
use pipeline_healer::run::is_protected_ref;
use pipeline_healer::verify::ManualClock;
use pipeline_healer::{HealerConfig, Orchestrator, RunRegistry};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const REPO_URL: &str = "https://github.com/acme/calculator";

pub const APP_SOURCE: &str = "import os\n\ndef add(a, b):\n    return a - b\n";

/// Flake8 line reporting an unused import in `src/app.py`.
pub fn failing_lint() -> Vec<Diagnostic> {
    vec![Diagnostic::new(
        Toolchain::Flake8,
        "src/app.py:1:1: F401 'os' imported but unused\n",
        true,
    )]
}

pub fn passing() -> Vec<Diagnostic> {
    vec![Diagnostic::new(Toolchain::Pytest, "3 passed in 0.01s\n", false)]
}

// =============================================================================
// Version control
// =============================================================================

/// In-memory remote: cloning writes the seeded files, commits are counted.
pub struct FakeVcs {
    files: Vec<(String, String)>,
    fail_clone: bool,
    fail_push: bool,
    pinned: Option<String>,
    refs: Mutex<HashSet<String>>,
    current: Mutex<String>,
    commits: Mutex<Vec<String>>,
    pushes: Mutex<Vec<String>>,
}

impl FakeVcs {
    pub fn seeded(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
                .collect(),
            fail_clone: false,
            fail_push: false,
            pinned: None,
            refs: Mutex::new(["main".to_string()].into_iter().collect()),
            current: Mutex::new("main".to_string()),
            commits: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            fail_clone: true,
            ..Self::seeded(&[])
        }
    }

    /// Commits succeed locally but every push is rejected by the remote.
    pub fn rejecting_pushes(mut self) -> Self {
        self.fail_push = true;
        self
    }

    /// Checkouts report success but HEAD never leaves `branch`.
    pub fn pinned_to(mut self, branch: &str) -> Self {
        self.pinned = Some(branch.to_string());
        self
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), VcsError> {
        if self.fail_clone {
            return Err(VcsError::Command {
                command: format!("git clone {url}"),
                stderr: "fatal: repository not found".into(),
            });
        }
        for (path, content) in &self.files {
            let target = dest.join(path);
            std::fs::create_dir_all(target.parent().unwrap())?;
            std::fs::write(target, content)?;
        }
        std::fs::create_dir_all(dest)?;
        Ok(())
    }

    async fn resolve_ref(&self, _workdir: &Path, name: &str) -> Result<Option<String>, VcsError> {
        Ok(self
            .refs
            .lock()
            .unwrap()
            .contains(name)
            .then(|| "base".to_string()))
    }

    async fn current_branch(&self, _workdir: &Path) -> Result<String, VcsError> {
        if let Some(pinned) = &self.pinned {
            return Ok(pinned.clone());
        }
        Ok(self.current.lock().unwrap().clone())
    }

    async fn create_branch(&self, _w: &Path, name: &str, _start: &str) -> Result<(), VcsError> {
        self.refs.lock().unwrap().insert(name.to_string());
        *self.current.lock().unwrap() = name.to_string();
        Ok(())
    }

    async fn checkout(&self, _workdir: &Path, name: &str) -> Result<(), VcsError> {
        *self.current.lock().unwrap() = name.to_string();
        Ok(())
    }

    async fn has_changes(&self, _workdir: &Path) -> Result<bool, VcsError> {
        Ok(true)
    }

    async fn commit_all(&self, workdir: &Path, message: &str) -> Result<String, VcsError> {
        let current = self.current_branch(workdir).await?;
        if is_protected_ref(&current) {
            return Err(VcsError::ProtectedRef(current));
        }
        let mut commits = self.commits.lock().unwrap();
        commits.push(message.to_string());
        Ok(format!("sha{}", commits.len()))
    }

    async fn push(&self, _workdir: &Path, branch: &str) -> Result<(), VcsError> {
        if self.fail_push {
            return Err(VcsError::Command {
                command: format!("git push --force origin {branch}"),
                stderr: "remote: Permission to acme/calculator.git denied".into(),
            });
        }
        self.pushes.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn head(&self, _workdir: &Path) -> Result<String, VcsError> {
        Ok(format!("sha{}", self.commits.lock().unwrap().len()))
    }
}

// =============================================================================
// Checks
// =============================================================================

/// Returns scripted diagnostics in order, repeating the last script forever.
pub struct ScriptedChecks {
    script: Mutex<VecDeque<Vec<Diagnostic>>>,
    last: Mutex<Vec<Diagnostic>>,
    broken: bool,
    calls: AtomicUsize,
}

impl ScriptedChecks {
    pub fn new(script: Vec<Vec<Diagnostic>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Vec::new()),
            broken: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails as if the toolchain were missing.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn always(diagnostics: Vec<Diagnostic>) -> Self {
        Self::new(vec![diagnostics])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckRunner for ScriptedChecks {
    async fn run_checks(
        &self,
        _workdir: &Path,
        _inventory: &Inventory,
    ) -> Result<Vec<Diagnostic>, CheckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(CheckError::Other("python: command not found".into()));
        }
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = next;
        }
        Ok(last.clone())
    }
}

// =============================================================================
// Code generation
// =============================================================================

/// Appends a marker line to the file on each call, or echoes it unchanged.
pub struct FakeGenerator {
    echo: bool,
    calls: AtomicUsize,
}

impl FakeGenerator {
    pub fn editing() -> Self {
        Self {
            echo: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn echoing() -> Self {
        Self {
            echo: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CodeGenerator for FakeGenerator {
    async fn propose_fix(&self, request: &FixRequest) -> Result<String, CodegenError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.echo {
            return Ok(request.content.clone());
        }
        Ok(format!("```python\n{}# fix {n}\n```", request.content))
    }
}

// =============================================================================
// Remote CI
// =============================================================================

/// Reports scripted statuses in order, repeating the last one.
pub struct FakeCi {
    script: Mutex<VecDeque<CiStatus>>,
    last: Mutex<CiStatus>,
    polls: AtomicUsize,
}

impl FakeCi {
    pub fn new(script: Vec<CiStatus>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(CiStatus::Running),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CiStatusSource for FakeCi {
    fn supports(&self, repo_url: &str) -> bool {
        repo_url.starts_with("https://github.com/")
    }

    async fn status(&self, _target: &CiTarget) -> Result<CiStatus, CiStatusError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = next;
        }
        Ok(*last)
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub vcs: Arc<FakeVcs>,
    pub checks: Arc<ScriptedChecks>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn config_in(dir: &TempDir) -> HealerConfig {
    HealerConfig {
        repos_dir: dir.path().join("repos"),
        results_dir: dir.path().join("results"),
        ..HealerConfig::default()
    }
}

pub fn harness(
    vcs: FakeVcs,
    checks: ScriptedChecks,
    generator: FakeGenerator,
    ci: Option<Arc<FakeCi>>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let vcs = Arc::new(vcs);
    let checks = Arc::new(checks);
    let clock = Arc::new(ManualClock::new());
    let collab = Collaborators {
        vcs: vcs.clone(),
        discovery: Arc::new(FileDiscovery::new()),
        checks: checks.clone(),
        codegen: Arc::new(generator),
        ci: ci.map(|c| c as Arc<dyn CiStatusSource>),
        clock: clock.clone(),
    };
    let orchestrator = Arc::new(Orchestrator::new(
        config_in(&dir),
        collab,
        RunRegistry::new(),
    ));
    Harness {
        dir,
        vcs,
        checks,
        clock,
        orchestrator,
    }
}

pub fn seeded_repo() -> FakeVcs {
    FakeVcs::seeded(&[
        ("src/app.py", APP_SOURCE),
        ("tests/test_app.py", "from src.app import add\n"),
        ("requirements.txt", "pytest\n"),
    ])
}
