//! Git-backed action sources.
//!
//! Each remote is checked out once into its own directory under the
//! registry root. Jobs hold a repository's read lock while running from it;
//! the periodic pull holds the write lock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};

use crate::action::RepositorySource;
use crate::error::RepositoryError;

/// Clone and fast-forward operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Clone `source` into `dest`, which does not exist yet.
    async fn clone_repo(&self, source: &RepositorySource, dest: &Path)
        -> Result<(), RepositoryError>;

    /// Fast-forward the checkout at `path`.
    async fn pull(&self, path: &Path) -> Result<(), RepositoryError>;
}

/// Shells out to the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    async fn git(&self, command: &str, args: &[&str], url: &str) -> Result<(), RepositoryError> {
        let output = Command::new(&self.program)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }

        Err(RepositoryError::Git {
            command: command.to_string(),
            url: url.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl GitBackend for GitCli {
    async fn clone_repo(
        &self,
        source: &RepositorySource,
        dest: &Path,
    ) -> Result<(), RepositoryError> {
        let dest = dest.to_string_lossy().into_owned();
        let mut args = vec!["clone", "--depth", "1"];
        if let Some(branch) = source.branch.as_deref() {
            args.extend(["--branch", branch]);
        }
        args.extend([source.url.as_str(), dest.as_str()]);

        self.git("clone", &args, &source.url).await
    }

    async fn pull(&self, path: &Path) -> Result<(), RepositoryError> {
        let dir = path.to_string_lossy().into_owned();
        self.git("pull", &["-C", dir.as_str(), "pull", "--ff-only"], &dir)
            .await
    }
}

/// One local checkout.
#[derive(Debug)]
pub struct Repository {
    source: RepositorySource,
    path: PathBuf,
    lock: RwLock<()>,
}

impl Repository {
    pub fn url(&self) -> &str {
        &self.source.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hold off pulls while a job runs from this checkout.
    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }
}

/// All checkouts owned by one processor, keyed by remote URL.
pub struct RepositoryRegistry {
    root: PathBuf,
    git: Arc<dyn GitBackend>,
    repositories: Mutex<HashMap<String, Arc<Repository>>>,
}

impl RepositoryRegistry {
    pub fn new(root: impl Into<PathBuf>, git: Arc<dyn GitBackend>) -> Self {
        Self {
            root: root.into(),
            git,
            repositories: Mutex::new(HashMap::new()),
        }
    }

    /// Return the checkout for `source`, cloning it on first use.
    pub async fn checkout(
        &self,
        source: &RepositorySource,
    ) -> Result<Arc<Repository>, RepositoryError> {
        let mut repositories = self.repositories.lock().await;
        if let Some(repository) = repositories.get(&source.url) {
            return Ok(repository.clone());
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(uuid::Uuid::new_v4().to_string());

        tracing::info!(url = %source.url, path = %path.display(), "Checking out repository");
        self.git.clone_repo(source, &path).await?;

        let repository = Arc::new(Repository {
            source: source.clone(),
            path,
            lock: RwLock::new(()),
        });
        repositories.insert(source.url.clone(), repository.clone());
        Ok(repository)
    }

    pub async fn get(&self, url: &str) -> Option<Arc<Repository>> {
        self.repositories.lock().await.get(url).cloned()
    }

    pub async fn len(&self) -> usize {
        self.repositories.lock().await.len()
    }

    /// Fast-forward every checkout. Returns the number that failed.
    pub async fn pull_all(&self) -> usize {
        let snapshot: Vec<Arc<Repository>> =
            self.repositories.lock().await.values().cloned().collect();

        let mut failed = 0;
        for repository in snapshot {
            let _guard = repository.lock.write().await;
            match self.git.pull(&repository.path).await {
                Ok(()) => tracing::debug!(url = %repository.url(), "Repository updated"),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(url = %repository.url(), error = %e, "Repository pull failed");
                }
            }
        }
        failed
    }

    /// Forget every checkout and delete it from disk.
    pub async fn remove_all(&self) {
        let drained: Vec<Arc<Repository>> = self
            .repositories
            .lock()
            .await
            .drain()
            .map(|(_, repository)| repository)
            .collect();

        for repository in drained {
            let _guard = repository.lock.write().await;
            match tokio::fs::remove_dir_all(&repository.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        path = %repository.path.display(),
                        error = %e,
                        "Failed to remove checkout"
                    );
                }
            }
        }
    }
}
