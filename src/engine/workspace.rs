//! Per-scan working directory: `<working_dir>/<scan_id>/base` holds the clone.
//!
//! Between plugins the clone is put back to HEAD (the `git clean -dxf` plus
//! `git reset --hard` pair, done through git2) and the scan's path rules are
//! re-applied, so files one plugin writes never leak into the next.

use std::path::{Path, PathBuf};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{FetchOptions, ObjectType, RemoteCallbacks, Repository, ResetType, Status, StatusOptions};

use crate::errors::EngineError;

const REPO_DIR: &str = "base";
/// Never removed by exclude rules.
const EXCLUDE_EXEMPTIONS: [&str; 2] = [".git", ".gitignore"];

/// Path include/exclude rules applied after every reset.
#[derive(Debug, Clone, Default)]
pub struct PathRules {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub mandatory_include: Vec<String>,
}

impl PathRules {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(working_dir: &Path, scan_id: &str) -> Self {
        Self {
            root: working_dir.join(scan_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root.join(REPO_DIR)
    }

    fn error(&self, message: impl std::fmt::Display) -> EngineError {
        EngineError::Workspace {
            path: self.repo_dir(),
            message: message.to_string(),
        }
    }

    /// Clone `url` into the workspace. The token is only handed to git through
    /// the credential callback so it never lands in `.git/config`.
    pub fn clone_repo(
        &self,
        url: &str,
        branch: Option<&str>,
        depth: Option<u32>,
        token: Option<&str>,
    ) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.root).map_err(|e| self.error(e))?;

        let mut callbacks = RemoteCallbacks::new();
        if let Some(token) = token {
            let token = token.to_string();
            callbacks.credentials(move |_url, _username, _allowed| {
                git2::Cred::userpass_plaintext("x-access-token", &token)
            });
        }
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(callbacks);
        if let Some(depth) = depth.filter(|d| *d > 0) {
            fetch.depth(depth as i32);
        }

        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch);
        if let Some(branch) = branch {
            builder.branch(branch);
        }
        builder
            .clone(url, &self.repo_dir())
            .map_err(|e| self.error(format!("clone failed: {}", e.message())))?;
        Ok(())
    }

    /// Discard everything a plugin may have written, then re-apply `rules`.
    pub fn reset(&self, rules: &PathRules) -> Result<(), EngineError> {
        let repo = Repository::open(self.repo_dir()).map_err(|e| self.error(e.message()))?;
        self.clean(&repo)?;

        let head = repo
            .head()
            .and_then(|h| h.peel(ObjectType::Commit))
            .map_err(|e| self.error(e.message()))?;
        repo.reset(&head, ResetType::Hard, None)
            .map_err(|e| self.error(e.message()))?;

        self.apply_path_rules(&repo, rules)
    }

    /// Remove untracked and ignored paths, like `git clean -dxf`.
    fn clean(&self, repo: &Repository) -> Result<(), EngineError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .include_ignored(true)
            .recurse_untracked_dirs(false)
            .recurse_ignored_dirs(false);
        let statuses = repo
            .statuses(Some(&mut opts))
            .map_err(|e| self.error(e.message()))?;

        let base = self.repo_dir();
        let mut removed = 0;
        for entry in statuses.iter() {
            if !entry.status().intersects(Status::WT_NEW | Status::IGNORED) {
                continue;
            }
            let Some(rel) = entry.path() else { continue };
            remove_path(&base.join(rel.trim_end_matches('/'))).map_err(|e| self.error(e))?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, "removed untracked files");
        }
        Ok(())
    }

    fn apply_path_rules(&self, repo: &Repository, rules: &PathRules) -> Result<(), EngineError> {
        let base = self.repo_dir();
        // Expand includes before anything is deleted so the globs still match.
        let inclusions = self.gather_inclusions(&rules.include)?;

        for pattern in &rules.exclude {
            tracing::debug!(pattern = %pattern, "removing excluded path");
            for path in self.glob(pattern)? {
                let exempt = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| EXCLUDE_EXEMPTIONS.contains(&n));
                if exempt {
                    continue;
                }
                remove_path(&path).map_err(|e| self.error(e))?;
            }
        }

        for path in inclusions.iter().chain(&rules.mandatory_include) {
            tracing::debug!(path = %path, "restoring included path");
            let mut checkout = CheckoutBuilder::new();
            checkout.force().path(path.as_str());
            if let Err(e) = repo.checkout_head(Some(&mut checkout)) {
                tracing::error!(path = %path, error = %e.message(), "failed to restore path");
            }
        }

        if !rules.is_empty() {
            tracing::info!(root = %base.display(), "applied path rules");
        }
        Ok(())
    }

    fn gather_inclusions(&self, patterns: &[String]) -> Result<Vec<String>, EngineError> {
        let base = self.repo_dir();
        let exemptions: Vec<PathBuf> = EXCLUDE_EXEMPTIONS.iter().map(|e| base.join(e)).collect();
        let mut found = Vec::new();
        for pattern in patterns {
            for path in self.glob(pattern)? {
                if exemptions.iter().any(|e| path.starts_with(e)) {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&base) {
                    found.push(rel.to_string_lossy().into_owned());
                }
            }
        }
        Ok(found)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, EngineError> {
        let full = self.repo_dir().join(pattern.trim_start_matches('/'));
        let paths = glob::glob(&full.to_string_lossy())
            .map_err(|e| self.error(format!("invalid path pattern {}: {}", pattern, e)))?;
        Ok(paths.filter_map(Result::ok).collect())
    }

    /// Delete the whole scan directory. Missing is fine.
    pub fn remove(&self) -> Result<(), EngineError> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(e)),
        }
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        // A parent matched by an earlier glob may already be gone.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// The largest repos seen take twice their reported size on disk.
pub fn has_disk_space(repo_size_kb: u64, available_bytes: u64) -> bool {
    repo_size_kb.saturating_mul(2).saturating_mul(1024) < available_bytes
}

pub fn available_space(path: &Path) -> std::io::Result<u64> {
    let mut existing = path;
    // fs2 needs an existing path; walk up until one exists.
    while !existing.exists() {
        match existing.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => existing = parent,
            _ => return fs2::available_space("."),
        }
    }
    fs2::available_space(existing)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use git2::{IndexAddOption, Repository, RepositoryInitOptions, Signature};

    /// Create a repository at `dir` with the given files committed on HEAD.
    pub fn init_repo(dir: &Path, files: &[(&str, &str)]) -> Repository {
        std::fs::create_dir_all(dir).unwrap();
        let repo =
            Repository::init_opts(dir, RepositoryInitOptions::new().initial_head("main")).unwrap();
        for (path, content) in files {
            let full = dir.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, content).unwrap();
        }
        {
            let mut index = repo.index().unwrap();
            index
                .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = Signature::now("test", "test@test.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .unwrap();
        }
        repo
    }
}

#[cfg(test)]
mod tests {
    use super::testing::init_repo;
    use super::*;

    fn workspace_with(files: &[(&str, &str)]) -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path(), "scan-1");
        init_repo(&ws.repo_dir(), files);
        (dir, ws)
    }

    #[test]
    fn test_reset_discards_untracked_and_modified_files() {
        let (_dir, ws) = workspace_with(&[
            ("src/main.rs", "fn main() {}"),
            (".gitignore", "target/\n"),
        ]);
        let base = ws.repo_dir();
        std::fs::write(base.join("src/main.rs"), "changed").unwrap();
        std::fs::write(base.join("report.json"), "{}").unwrap();
        std::fs::create_dir_all(base.join("target/debug")).unwrap();
        std::fs::write(base.join("target/debug/out"), "bin").unwrap();
        std::fs::create_dir_all(base.join("node_modules/x")).unwrap();
        std::fs::write(base.join("node_modules/x/index.js"), "").unwrap();

        ws.reset(&PathRules::default()).unwrap();

        assert_eq!(
            std::fs::read_to_string(base.join("src/main.rs")).unwrap(),
            "fn main() {}"
        );
        assert!(!base.join("report.json").exists());
        assert!(!base.join("target").exists());
        assert!(!base.join("node_modules").exists());
        assert!(base.join(".git").exists());
    }

    #[test]
    fn test_reset_reapplies_excludes_and_restores_includes() {
        let (_dir, ws) = workspace_with(&[
            ("app/main.py", "print()"),
            ("docs/index.md", "# docs"),
            ("docs/keep.md", "keep"),
            ("tests/test_app.py", "def test(): pass"),
            ("LICENSE", "MIT"),
        ]);
        let base = ws.repo_dir();
        let rules = PathRules {
            include: vec!["docs/keep.md".into()],
            exclude: vec!["docs".into(), "tests/*".into(), ".git".into()],
            mandatory_include: vec!["LICENSE".into()],
        };

        ws.reset(&rules).unwrap();

        assert!(base.join("app/main.py").exists());
        assert!(!base.join("docs/index.md").exists());
        assert!(base.join("docs/keep.md").exists());
        assert!(!base.join("tests/test_app.py").exists());
        assert!(base.join("LICENSE").exists());
        assert!(base.join(".git").exists());
    }

    #[test]
    fn test_mandatory_include_survives_wildcard_exclude() {
        let (_dir, ws) = workspace_with(&[("a.txt", "a"), ("b.txt", "b"), (".gitignore", "")]);
        let base = ws.repo_dir();
        let rules = PathRules {
            include: vec![],
            exclude: vec!["*".into(), ".*".into()],
            mandatory_include: vec!["b.txt".into()],
        };

        ws.reset(&rules).unwrap();

        assert!(!base.join("a.txt").exists());
        assert!(base.join("b.txt").exists());
        assert!(base.join(".gitignore").exists());
        assert!(base.join(".git").exists());
    }

    #[test]
    fn test_clone_from_local_repository() {
        let src = tempfile::tempdir().unwrap();
        init_repo(src.path(), &[("README.md", "hello")]);
        let work = tempfile::tempdir().unwrap();
        let ws = Workspace::new(work.path(), "scan-2");

        ws.clone_repo(&src.path().to_string_lossy(), None, None, None)
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(ws.repo_dir().join("README.md")).unwrap(),
            "hello"
        );
        ws.remove().unwrap();
        assert!(!ws.root().exists());
        ws.remove().unwrap();
    }

    #[test]
    fn test_clone_failure_is_workspace_error() {
        let work = tempfile::tempdir().unwrap();
        let ws = Workspace::new(work.path(), "scan-3");
        let missing = work.path().join("does-not-exist");

        let err = ws
            .clone_repo(&missing.to_string_lossy(), None, None, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Workspace { .. }));
    }

    #[test]
    fn test_disk_space_needs_twice_repo_size() {
        assert!(has_disk_space(100, 300 * 1024));
        assert!(!has_disk_space(100, 200 * 1024));
        assert!(has_disk_space(0, 1));
    }

    #[test]
    fn test_available_space_walks_up_to_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let space = available_space(&dir.path().join("a/b/c")).unwrap();
        assert!(space > 0);
    }
}
