use std::{collections::BTreeSet, fmt, path::Path};

use crate::error::CommandError;

/// Remote name of the server a mirror was cloned from. Backup targets may not use it.
pub const ORIGIN: &str = "origin";

/// A repository to protect. `name` is the last `/` segment of the url, taken literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRepository {
  url: String,
  name: String,
}

impl SourceRepository {
  pub fn new(url: impl Into<String>) -> Self {
    let url = url.into().trim().to_owned();
    let name = url.rsplit('/').next().unwrap_or_default().to_owned();
    Self { url, name }
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl fmt::Display for SourceRepository {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.name, self.url)
  }
}

/// A remote server that receives a mirror of every repository.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
  pub name: String,
  #[serde(rename = "url")]
  pub base_url: String,
}

impl BackupTarget {
  pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
    Self { name: name.into(), base_url: base_url.into() }
  }

  pub fn remote_url(&self, repo: &SourceRepository) -> String {
    format!("{}/{}", self.base_url.trim_end_matches('/'), repo.name())
  }
}

impl fmt::Display for BackupTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.name, self.base_url)
  }
}

pub type CommandResult<T = ()> = Result<T, CommandError>;

/// The version-control operations the orchestrator needs. Every path is a bare mirror.
#[async_trait::async_trait]
pub trait Vcs: Send + Sync {
  async fn mirror_clone(&self, url: &str, dest: &Path) -> CommandResult;
  async fn list_remotes(&self, path: &Path) -> CommandResult<BTreeSet<String>>;
  /// Refresh from `origin`, dropping refs deleted upstream.
  async fn fetch_prune(&self, path: &Path) -> CommandResult;
  async fn add_remote(&self, path: &Path, name: &str, url: &str) -> CommandResult;
  /// Push every ref, deletions included.
  async fn push_mirror(&self, path: &Path, name: &str) -> CommandResult;
}
