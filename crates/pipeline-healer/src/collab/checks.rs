//! Runs the project's own test and lint tools in the working copy.
//!
//! The test framework is detected from the project manifests. Tests are run
//! first, then linters over the discovered test files. A missing linter is
//! skipped; a test command that cannot start is a [`CheckError`].

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{CheckRunner, Inventory};
use crate::classify::{Diagnostic, Toolchain};
use crate::error::CheckError;

/// Written after a successful `pip install` so later iterations skip it.
const DEPS_MARKER: &str = ".deps_installed";

/// Pytest exit code when no tests were collected.
const PYTEST_NO_TESTS: i32 = 5;

/// Shell exit code for "command not found".
const COMMAND_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    Pytest,
    Jest,
    Vitest,
    /// No manifest decides; run whatever the test files call for
    Auto,
}

/// Pick the test framework from `package.json`, then Python manifests.
pub fn detect_framework(workdir: &Path) -> Framework {
    if let Ok(raw) = std::fs::read_to_string(workdir.join("package.json")) {
        if let Ok(manifest) = serde_json::from_str::<Value>(&raw) {
            let has_dep = |name: &str| {
                ["dependencies", "devDependencies"]
                    .iter()
                    .any(|section| manifest[section].get(name).is_some())
            };
            if has_dep("vitest") {
                return Framework::Vitest;
            }
            if has_dep("jest") || has_dep("@jest/core") {
                return Framework::Jest;
            }
        }
    }
    if ["requirements.txt", "setup.py", "pyproject.toml"]
        .iter()
        .any(|f| workdir.join(f).is_file())
    {
        return Framework::Pytest;
    }
    Framework::Auto
}

fn is_python(file: &str) -> bool {
    Path::new(file).extension().is_some_and(|e| e == "py")
}

fn is_javascript(file: &str) -> bool {
    Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e, "js" | "jsx" | "ts" | "tsx"))
}

/// Captured output of one process.
#[derive(Debug)]
struct ProcessOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl ProcessOutput {
    fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Pytest reports failure on any exit code other than success or "no tests".
fn pytest_failed(code: Option<i32>) -> bool {
    !matches!(code, Some(0 | PYTEST_NO_TESTS))
}

/// Whether a linter run means the linter itself is not installed.
fn linter_unavailable(output: &ProcessOutput) -> bool {
    output.code == Some(COMMAND_NOT_FOUND)
        || output.stderr.contains("No module named flake8")
        || output.stderr.contains("could not determine executable to run")
}

pub struct ToolchainRunner {
    timeout: Duration,
}

impl ToolchainRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exec(
        &self,
        workdir: &Path,
        program: &str,
        args: &[String],
    ) -> Result<ProcessOutput, CheckError> {
        let command = format!("{program} {}", args.first().map_or("", String::as_str));
        debug!(command = %command, workdir = %workdir.display(), "Running checker");

        let child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .env("PYTHONPATH", workdir)
            .env("CI", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CheckError::Spawn {
                command: command.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CheckError::Timeout {
                command: command.clone(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|source| CheckError::Spawn {
                command: command.clone(),
                source,
            })?;

        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn install_python_deps(&self, workdir: &Path) {
        if !workdir.join("requirements.txt").is_file() || workdir.join(DEPS_MARKER).exists() {
            return;
        }
        info!(workdir = %workdir.display(), "Installing Python dependencies");
        let args = strings(&["-m", "pip", "install", "-r", "requirements.txt", "--quiet"]);
        match self.exec(workdir, "python", &args).await {
            Ok(out) if out.success() => {
                if let Err(e) = tokio::fs::write(workdir.join(DEPS_MARKER), "").await {
                    warn!(error = %e, "Failed to write dependency marker");
                }
            }
            Ok(out) => warn!(code = ?out.code, "pip install failed; running checks anyway"),
            Err(e) => warn!(error = %e, "pip install could not run"),
        }
    }

    async fn install_node_deps(&self, workdir: &Path) {
        if !workdir.join("package.json").is_file() || workdir.join("node_modules").exists() {
            return;
        }
        info!(workdir = %workdir.display(), "Installing Node dependencies");
        match self.exec(workdir, "npm", &strings(&["install", "--silent"])).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(code = ?out.code, "npm install failed; running checks anyway"),
            Err(e) => warn!(error = %e, "npm install could not run"),
        }
    }

    async fn run_pytest(&self, workdir: &Path) -> Result<Diagnostic, CheckError> {
        self.install_python_deps(workdir).await;
        let args = strings(&["-m", "pytest", "--tb=short", "-v", "--no-header", "-rN"]);
        let out = self.exec(workdir, "python", &args).await?;
        Ok(Diagnostic::new(
            Toolchain::Pytest,
            out.combined(),
            pytest_failed(out.code),
        ))
    }

    async fn run_jest(&self, workdir: &Path, framework: Framework) -> Result<Diagnostic, CheckError> {
        self.install_node_deps(workdir).await;
        let args = match framework {
            Framework::Vitest => strings(&["vitest", "run", "--reporter=json"]),
            _ => strings(&["jest", "--json", "--no-coverage", "--maxWorkers=2"]),
        };
        let out = self.exec(workdir, "npx", &args).await?;
        Ok(Diagnostic::new(Toolchain::Jest, out.combined(), !out.success()))
    }

    async fn run_linter(
        &self,
        workdir: &Path,
        toolchain: Toolchain,
        files: &[&String],
    ) -> Option<Diagnostic> {
        if files.is_empty() {
            return None;
        }
        let (program, mut args) = match toolchain {
            Toolchain::Flake8 => (
                "python",
                strings(&[
                    "-m",
                    "flake8",
                    "--format=%(path)s:%(row)d:%(col)d: %(code)s %(text)s",
                ]),
            ),
            _ => ("npx", strings(&["eslint", "--format=json"])),
        };
        args.extend(files.iter().map(|f| (*f).clone()));

        match self.exec(workdir, program, &args).await {
            Ok(out) if linter_unavailable(&out) => {
                warn!(linter = %toolchain, "Linter not available, skipping");
                None
            }
            Ok(out) => {
                let mut diagnostic = Diagnostic::new(toolchain, out.stdout, false);
                if files.len() == 1 {
                    diagnostic = diagnostic.with_hint(files[0].clone());
                }
                Some(diagnostic)
            }
            Err(e) => {
                warn!(linter = %toolchain, error = %e, "Linter could not run, skipping");
                None
            }
        }
    }
}

#[async_trait]
impl CheckRunner for ToolchainRunner {
    async fn run_checks(
        &self,
        workdir: &Path,
        inventory: &Inventory,
    ) -> Result<Vec<Diagnostic>, CheckError> {
        let framework = detect_framework(workdir);
        let py_tests: Vec<&String> = inventory.test_files.iter().filter(|f| is_python(f)).collect();
        let js_tests: Vec<&String> = inventory
            .test_files
            .iter()
            .filter(|f| is_javascript(f))
            .collect();
        info!(
            workdir = %workdir.display(),
            ?framework,
            python_tests = py_tests.len(),
            js_tests = js_tests.len(),
            "Running checks"
        );

        let mut diagnostics = Vec::new();
        match framework {
            Framework::Pytest => diagnostics.push(self.run_pytest(workdir).await?),
            Framework::Jest | Framework::Vitest => {
                diagnostics.push(self.run_jest(workdir, framework).await?);
            }
            Framework::Auto => {
                if !py_tests.is_empty() {
                    diagnostics.push(self.run_pytest(workdir).await?);
                }
                if !js_tests.is_empty() {
                    diagnostics.push(self.run_jest(workdir, Framework::Jest).await?);
                }
            }
        }

        if let Some(lint) = self.run_linter(workdir, Toolchain::Flake8, &py_tests).await {
            diagnostics.push(lint);
        }
        if let Some(lint) = self.run_linter(workdir, Toolchain::Eslint, &js_tests).await {
            diagnostics.push(lint);
        }

        let root = workdir.display().to_string();
        Ok(diagnostics
            .into_iter()
            .map(|d| d.with_root(root.clone()))
            .collect())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_detect_jest_from_dev_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"devDependencies": {"jest": "^29.0.0"}}"#,
        )
        .unwrap();
        assert_eq!(detect_framework(dir.path()), Framework::Jest);
    }

    #[test]
    fn test_detect_vitest_wins_over_jest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"jest": "1"}, "devDependencies": {"vitest": "1"}}"#,
        )
        .unwrap();
        assert_eq!(detect_framework(dir.path()), Framework::Vitest);
    }

    #[test]
    fn test_detect_pytest_from_python_manifests() {
        for manifest in ["requirements.txt", "setup.py", "pyproject.toml"] {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join(manifest), "").unwrap();
            assert_eq!(detect_framework(dir.path()), Framework::Pytest, "{manifest}");
        }
    }

    #[test]
    fn test_detect_auto_without_manifests() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("package.json"), r#"{"name": "x"}"#).unwrap();
        assert_eq!(detect_framework(dir.path()), Framework::Auto);
    }

    #[test]
    fn test_pytest_exit_codes() {
        assert!(!pytest_failed(Some(0)));
        assert!(!pytest_failed(Some(5)));
        assert!(pytest_failed(Some(1)));
        assert!(pytest_failed(Some(2)));
        assert!(pytest_failed(None));
    }

    #[test]
    fn test_linter_unavailable() {
        let missing = ProcessOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "/usr/bin/python: No module named flake8".into(),
        };
        assert!(linter_unavailable(&missing));

        let findings = ProcessOutput {
            code: Some(1),
            stdout: "tests/test_a.py:1:1: F401 'os' imported but unused".into(),
            stderr: String::new(),
        };
        assert!(!linter_unavailable(&findings));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ToolchainRunner::new(Duration::from_secs(5));
        let err = runner
            .exec(dir.path(), "definitely-not-a-real-checker", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Spawn { .. }));
    }
}
