//! Source and test file discovery over the working copy.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::info;
use walkdir::WalkDir;

use super::{Inventory, SourceDiscovery};
use crate::error::SetupError;

const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "rb", "go", "java", "cs", "cpp", "c",
];

const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".pytest_cache",
    "venv",
    "env",
    ".env",
    "dist",
    "build",
    ".next",
    ".cache",
    "coverage",
    ".tox",
    "eggs",
    ".eggs",
];

/// Matched against both the relative path and the file name.
static TEST_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(^|/)test_[^/]*\.py$").unwrap(),
        Regex::new(r"_test\.py$").unwrap(),
        Regex::new(r"\.test\.[jt]sx?$").unwrap(),
        Regex::new(r"\.spec\.[jt]sx?$").unwrap(),
        Regex::new(r"(^|/)__tests__/.*\.[jt]sx?$").unwrap(),
        Regex::new(r"(^|/)tests?/.*\.py$").unwrap(),
        Regex::new(r"(^|/)spec/.*\.(rb|js|ts)$").unwrap(),
    ]
});

/// Walks the working copy, skipping dependency, output and VCS directories.
#[derive(Debug, Clone, Default)]
pub struct FileDiscovery;

impl FileDiscovery {
    pub fn new() -> Self {
        Self
    }

    /// Blocking walk; relative paths use `/` separators and are sorted.
    pub fn scan(root: &Path) -> Result<Inventory, SetupError> {
        if !root.is_dir() {
            return Err(SetupError::Discovery {
                path: root.display().to_string(),
                message: "not a directory".to_string(),
            });
        }

        let mut inventory = Inventory::default();
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored_dir(e))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() || !is_source_file(entry.path()) {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if is_test_file(&relative) {
                inventory.test_files.push(relative.clone());
            }
            inventory.source_files.push(relative);
        }

        inventory.source_files.sort();
        inventory.test_files.sort();
        Ok(inventory)
    }
}

#[async_trait]
impl SourceDiscovery for FileDiscovery {
    async fn discover(&self, root: &Path) -> Result<Inventory, SetupError> {
        let root_buf: PathBuf = root.to_path_buf();
        let inventory = tokio::task::spawn_blocking(move || Self::scan(&root_buf))
            .await
            .map_err(|e| SetupError::Discovery {
                path: root.display().to_string(),
                message: e.to_string(),
            })??;
        info!(
            root = %root.display(),
            sources = inventory.source_files.len(),
            tests = inventory.test_files.len(),
            "Discovered files"
        );
        Ok(inventory)
    }
}

fn is_ignored_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

pub fn is_test_file(relative: &str) -> bool {
    TEST_PATTERNS.iter().any(|p| p.is_match(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_test_file_conventions() {
        assert!(is_test_file("test_app.py"));
        assert!(is_test_file("pkg/app_test.py"));
        assert!(is_test_file("src/sum.test.js"));
        assert!(is_test_file("src/api.spec.tsx"));
        assert!(is_test_file("src/__tests__/util.js"));
        assert!(is_test_file("tests/helpers.py"));
        assert!(is_test_file("spec/models/user.rb"));
        assert!(!is_test_file("src/app.py"));
        assert!(!is_test_file("src/contest.js"));
    }

    #[tokio::test]
    async fn test_discover_skips_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "src/app.py");
        touch(root, "tests/test_app.py");
        touch(root, "web/sum.test.js");
        touch(root, "README.md");
        touch(root, "node_modules/lib/index.js");
        touch(root, ".git/hooks/pre-commit.py");
        touch(root, "build/out.js");

        let inventory = FileDiscovery::new().discover(root).await.unwrap();

        assert_eq!(
            inventory.source_files,
            vec!["src/app.py", "tests/test_app.py", "web/sum.test.js"]
        );
        assert_eq!(inventory.test_files, vec!["tests/test_app.py", "web/sum.test.js"]);
    }

    #[tokio::test]
    async fn test_missing_root_is_setup_error() {
        let err = FileDiscovery::new()
            .discover(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::Discovery { .. }));
    }
}
