//! Patch workflow: one remediation request per file, applied to the working copy.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collab::prompt::NO_CONFIDENT_FIX;
use crate::collab::{CodeGenerator, FixRequest};
use crate::error::{CodegenError, PatchError};
use crate::run::{Category, Failure, Fix, FixOutcome};

const FENCE: &str = "```";

static TEST_SOURCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)\.(?:test|spec)\.([jt]sx?)$").unwrap());

/// Failures of one target file, in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup<'a> {
    pub target: String,
    pub failures: Vec<&'a Failure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub file: String,
    pub reason: String,
}

/// What one pass of the workflow did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub fixes: Vec<Fix>,
    pub changed_files: Vec<String>,
    pub skipped: Vec<SkippedFile>,
}

impl PatchReport {
    pub fn applied_count(&self) -> usize {
        self.fixes
            .iter()
            .filter(|f| f.outcome == FixOutcome::Applied)
            .count()
    }
}

pub struct PatchWorkflow {
    generator: Arc<dyn CodeGenerator>,
    timeout: Duration,
}

impl PatchWorkflow {
    pub fn new(generator: Arc<dyn CodeGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    /// Remediate every failing file. Per-file errors are logged and skipped.
    pub async fn apply(&self, workdir: &Path, iteration: u32, failures: &[Failure]) -> PatchReport {
        let mut report = PatchReport::default();

        for group in group_by_target(workdir, failures) {
            match self.remediate(workdir, iteration, &group).await {
                Ok(Some(fix)) => {
                    if fix.outcome == FixOutcome::Applied {
                        info!(iteration, file = %group.target, category = %fix.category, "Applied fix");
                        report.changed_files.push(group.target.clone());
                    }
                    report.fixes.push(fix);
                }
                Ok(None) => {
                    debug!(iteration, file = %group.target, "Generator returned unchanged content");
                    report.skipped.push(SkippedFile {
                        file: group.target,
                        reason: "no changes proposed".to_string(),
                    });
                }
                Err(e) => {
                    warn!(iteration, file = %group.target, error = %e, "Skipping file");
                    report.skipped.push(SkippedFile {
                        file: group.target,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn remediate(
        &self,
        workdir: &Path,
        iteration: u32,
        group: &FileGroup<'_>,
    ) -> Result<Option<Fix>, PatchError> {
        let path = resolve_in_workdir(workdir, &group.target)?;
        let original =
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| PatchError::Read {
                    path: group.target.clone(),
                    source,
                })?;

        let request = FixRequest {
            path: group.target.clone(),
            content: original.clone(),
            failures: group.failures.iter().map(|f| (*f).clone()).collect(),
        };
        let response = tokio::time::timeout(self.timeout, self.generator.propose_fix(&request))
            .await
            .map_err(|_| CodegenError::Timeout {
                secs: self.timeout.as_secs(),
            })??;

        let Some(mut content) = strip_code_fences(&response) else {
            return Err(CodegenError::NoConfidentFix.into());
        };
        if content.trim() == NO_CONFIDENT_FIX {
            return Err(CodegenError::NoConfidentFix.into());
        }
        if original.ends_with('\n') && !content.ends_with('\n') {
            content.push('\n');
        }
        if content == original {
            return Ok(None);
        }

        let first = group.failures[0];
        let mut fix = Fix {
            iteration,
            file: group.target.clone(),
            category: first.category,
            categories: distinct_categories(&group.failures),
            line: first.line,
            commit_message: commit_message(first.category, &group.target, first.line),
            outcome: FixOutcome::Applied,
        };

        if let Err(source) = tokio::fs::write(&path, content).await {
            let err = PatchError::Write {
                path: group.target.clone(),
                source,
            };
            warn!(iteration, error = %err, "Fix could not be written");
            fix.outcome = FixOutcome::FailedToApply;
        }
        Ok(Some(fix))
    }
}

/// Group failures by the file that should be edited, preserving first-seen order.
pub fn group_by_target<'a>(workdir: &Path, failures: &'a [Failure]) -> Vec<FileGroup<'a>> {
    let mut groups: Vec<FileGroup<'a>> = Vec::new();
    for failure in failures {
        let target = remediation_target(workdir, &failure.file);
        match groups.iter_mut().find(|g| g.target == target) {
            Some(group) => group.failures.push(failure),
            None => groups.push(FileGroup {
                target,
                failures: vec![failure],
            }),
        }
    }
    groups
}

/// `x.test.js` / `x.spec.ts` failures are fixed in `x.js` / `x.ts` when it exists.
pub fn remediation_target(workdir: &Path, file: &str) -> String {
    if let Some(caps) = TEST_SOURCE.captures(file) {
        let source = format!("{}.{}", &caps[1], &caps[2]);
        if workdir.join(&source).is_file() {
            return source;
        }
    }
    file.to_string()
}

/// Extract code from a generator response. A fenced reply runs from the
/// line after the first fence to the last fence, so fences inside the file
/// itself survive. Unfenced replies are trimmed. `None` when nothing usable
/// remains.
pub fn strip_code_fences(response: &str) -> Option<String> {
    let body = match response.find(FENCE) {
        Some(open) => {
            let after_open = &response[open + FENCE.len()..];
            // Drop the info string (```python) along with the fence.
            let inner = after_open.find('\n').map_or(after_open, |nl| &after_open[nl + 1..]);
            let inner = inner.rfind(FENCE).map_or(inner, |close| &inner[..close]);
            let inner = inner.strip_suffix('\n').unwrap_or(inner);
            inner.strip_suffix('\r').unwrap_or(inner).to_string()
        }
        None => response.trim().to_string(),
    };
    if body.trim().is_empty() {
        None
    } else {
        Some(body)
    }
}

pub fn commit_message(category: Category, path: &str, line: u32) -> String {
    format!(
        "[AI-AGENT] Fix {} error in {} line {}\n  → {}",
        category,
        path,
        line,
        category.fix_action()
    )
}

fn distinct_categories(failures: &[&Failure]) -> Vec<Category> {
    let mut categories = Vec::new();
    for failure in failures {
        if !categories.contains(&failure.category) {
            categories.push(failure.category);
        }
    }
    categories
}

/// Join a repository-relative path onto the working copy, refusing escapes.
fn resolve_in_workdir(workdir: &Path, relative: &str) -> Result<PathBuf, PatchError> {
    let rel = Path::new(relative);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || escapes {
        return Err(PatchError::OutsideWorkdir(relative.to_string()));
    }
    Ok(workdir.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn failure(file: &str, line: u32, category: Category) -> Failure {
        Failure {
            file: file.to_string(),
            line,
            category,
            description: format!("{category} at {line}"),
        }
    }

    /// Returns the scripted response and records every request.
    struct ScriptedGenerator {
        response: Result<String, fn() -> CodegenError>,
        requests: Mutex<Vec<FixRequest>>,
    }

    impl ScriptedGenerator {
        fn ok(response: &str) -> Self {
            Self {
                response: Ok(response.to_string()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn err(make: fn() -> CodegenError) -> Self {
            Self {
                response: Err(make),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CodeGenerator for ScriptedGenerator {
        async fn propose_fix(&self, request: &FixRequest) -> Result<String, CodegenError> {
            self.requests.lock().unwrap().push(request.clone());
            match &self.response {
                Ok(text) => Ok(text.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(
            strip_code_fences("```python\ndef f():\n    return 1\n```"),
            Some("def f():\n    return 1".to_string())
        );
        assert_eq!(
            strip_code_fences("Here you go:\n```\nx = 1\n```\nDone."),
            Some("x = 1".to_string())
        );
        assert_eq!(strip_code_fences("  x = 1  \n"), Some("x = 1".to_string()));
        assert_eq!(strip_code_fences("```\n```"), None);
        assert_eq!(strip_code_fences("   "), None);
    }

    #[test]
    fn test_inner_fence_is_kept() {
        let file = "def f():\n    \"\"\"Example:\n\n    ```\n    f()\n    ```\n    \"\"\"\n    return 1";
        let reply = format!("```python\n{file}\n```\n");
        assert_eq!(strip_code_fences(&reply), Some(file.to_string()));
    }

    #[test]
    fn test_commit_message_format() {
        assert_eq!(
            commit_message(Category::Linting, "src/utils.py", 15),
            "[AI-AGENT] Fix LINTING error in src/utils.py line 15\n  → resolve the lint warning"
        );
    }

    #[test]
    fn test_grouping_preserves_first_seen_order() {
        let dir = tempfile::tempdir().unwrap();
        let failures = vec![
            failure("b.py", 3, Category::Logic),
            failure("a.py", 1, Category::Import),
            failure("b.py", 9, Category::Syntax),
        ];
        let groups = group_by_target(dir.path(), &failures);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].target, "b.py");
        assert_eq!(groups[0].failures.len(), 2);
        assert_eq!(groups[1].target, "a.py");
    }

    #[test]
    fn test_test_file_redirects_to_existing_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sum.js"), "module.exports = 1;\n").unwrap();
        assert_eq!(remediation_target(dir.path(), "sum.test.js"), "sum.js");
        assert_eq!(remediation_target(dir.path(), "other.spec.ts"), "other.spec.ts");
        assert_eq!(remediation_target(dir.path(), "app.py"), "app.py");
    }

    #[test]
    fn test_resolve_refuses_escapes() {
        let root = Path::new("/work");
        assert!(resolve_in_workdir(root, "../etc/passwd").is_err());
        assert!(resolve_in_workdir(root, "/etc/passwd").is_err());
        assert_eq!(
            resolve_in_workdir(root, "src/a.py").unwrap(),
            PathBuf::from("/work/src/a.py")
        );
    }

    #[tokio::test]
    async fn test_apply_writes_changed_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calc.py"), "import os\ndef add(a, b):\n    return a - b\n").unwrap();
        let generator = Arc::new(ScriptedGenerator::ok(
            "```python\ndef add(a, b):\n    return a + b\n```",
        ));
        let workflow = PatchWorkflow::new(generator.clone(), Duration::from_secs(5));
        let failures = vec![
            failure("calc.py", 1, Category::Import),
            failure("calc.py", 3, Category::Logic),
        ];

        let report = workflow.apply(dir.path(), 2, &failures).await;

        assert_eq!(report.fixes.len(), 1);
        assert_eq!(report.applied_count(), 1);
        let fix = &report.fixes[0];
        assert_eq!(fix.iteration, 2);
        assert_eq!(fix.category, Category::Import);
        assert_eq!(fix.categories, vec![Category::Import, Category::Logic]);
        assert_eq!(fix.line, 1);
        assert_eq!(report.changed_files, vec!["calc.py"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("calc.py")).unwrap(),
            "def add(a, b):\n    return a + b\n"
        );

        let requests = generator.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].failures.len(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_content_is_not_a_fix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let workflow = PatchWorkflow::new(
            Arc::new(ScriptedGenerator::ok("x = 1")),
            Duration::from_secs(5),
        );
        let report = workflow
            .apply(dir.path(), 1, &[failure("a.py", 1, Category::Unknown)])
            .await;
        assert!(report.fixes.is_empty());
        assert_eq!(report.skipped.len(), 1);
    }

    #[tokio::test]
    async fn test_generator_failure_skips_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "y = 2\n").unwrap();
        let workflow = PatchWorkflow::new(
            Arc::new(ScriptedGenerator::err(|| CodegenError::NoConfidentFix)),
            Duration::from_secs(5),
        );
        let report = workflow
            .apply(
                dir.path(),
                1,
                &[failure("a.py", 1, Category::Logic), failure("b.py", 1, Category::Logic)],
            )
            .await;
        assert!(report.fixes.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.py")).unwrap(), "x = 1\n");
    }

    #[tokio::test]
    async fn test_fenced_no_fix_reply_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let workflow = PatchWorkflow::new(
            Arc::new(ScriptedGenerator::ok("```\nNO_CONFIDENT_FIX\n```")),
            Duration::from_secs(5),
        );
        let report = workflow
            .apply(dir.path(), 1, &[failure("a.py", 1, Category::Logic)])
            .await;
        assert!(report.fixes.is_empty());
        assert!(report.changed_files.is_empty());
        assert_eq!(report.skipped[0].reason, CodegenError::NoConfidentFix.to_string());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.py")).unwrap(), "x = 1\n");
    }

    #[tokio::test]
    async fn test_docstring_fence_survives_apply() {
        let dir = tempfile::tempdir().unwrap();
        let original = "def f():\n    return 0\n";
        std::fs::write(dir.path().join("doc.py"), original).unwrap();
        let fixed = "def f():\n    \"\"\"Example:\n\n    ```\n    >>> f()\n    1\n    ```\n    \"\"\"\n    return 1\n";
        let workflow = PatchWorkflow::new(
            Arc::new(ScriptedGenerator::ok(&format!("```python\n{fixed}```"))),
            Duration::from_secs(5),
        );
        let report = workflow
            .apply(dir.path(), 1, &[failure("doc.py", 2, Category::Logic)])
            .await;
        assert_eq!(report.applied_count(), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("doc.py")).unwrap(), fixed);
    }

    #[tokio::test]
    async fn test_missing_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = PatchWorkflow::new(
            Arc::new(ScriptedGenerator::ok("anything")),
            Duration::from_secs(5),
        );
        let report = workflow
            .apply(dir.path(), 1, &[failure("unknown", 0, Category::Unknown)])
            .await;
        assert!(report.fixes.is_empty());
        assert_eq!(report.skipped[0].file, "unknown");
    }
}
