//! Mirrors every registered repository to every backup target.
//!
//! Each repository runs `clone (once) -> list remotes -> {fetch, add remote, push}` per target.
//! A failed command is recorded against its repository and the next step still runs.

use std::{
  collections::BTreeSet,
  fmt,
  future::Future,
  path::{Path, PathBuf},
  sync::Arc,
};

use log::{error, info, warn};
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
  error::CommandError,
  git::{BackupTarget, CommandResult, SourceRepository, Vcs, ORIGIN},
  registry::Registry,
};

#[derive(Debug, Clone)]
pub struct BackupSettings {
  pub backup_dir: PathBuf,
  /// Repositories processed at once.
  pub jobs: usize,
  /// Extra attempts per failed command.
  pub retries: u32,
}

impl BackupSettings {
  pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
    Self { backup_dir: backup_dir.into(), jobs: 1, retries: 0 }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Prepare,
  Clone,
  DiscoverRemotes,
  Refresh,
  AddRemote,
  Push,
  Internal,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Stage::Prepare => "prepare",
      Stage::Clone => "clone",
      Stage::DiscoverRemotes => "discover remotes",
      Stage::Refresh => "refresh",
      Stage::AddRemote => "add remote",
      Stage::Push => "push",
      Stage::Internal => "internal",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage}: {detail}")]
pub struct Failure {
  pub stage: Stage,
  pub detail: String,
}

impl Failure {
  pub fn new(stage: Stage, detail: impl Into<String>) -> Self {
    Self { stage, detail: detail.into() }
  }

  fn at(stage: Stage) -> impl Fn(CommandError) -> Failure {
    move |err| Failure::new(stage, err.to_string())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryOutcome {
  Completed,
  Failed(Failure),
  /// Never started because the run was stopped.
  Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
  pub target: String,
  pub refreshed: bool,
  pub remote_added: bool,
  pub pushed: bool,
  /// First failure against this target.
  pub failure: Option<Failure>,
}

impl TargetReport {
  fn new(target: &BackupTarget) -> Self {
    Self { target: target.name.clone(), refreshed: false, remote_added: false, pushed: false, failure: None }
  }

  fn fail(&mut self, failure: Failure) {
    self.failure.get_or_insert(failure);
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryReport {
  /// 1-based position in the registry.
  pub index: usize,
  pub name: String,
  pub url: String,
  pub cloned: bool,
  pub outcome: RepositoryOutcome,
  /// First clone or remote-discovery failure.
  pub failure: Option<Failure>,
  pub targets: Vec<TargetReport>,
}

impl RepositoryReport {
  fn new(index: usize, repo: &SourceRepository, outcome: RepositoryOutcome) -> Self {
    Self {
      index,
      name: repo.name().to_owned(),
      url: repo.url().to_owned(),
      cloned: false,
      outcome,
      failure: None,
      targets: vec![],
    }
  }

  fn fail(&mut self, failure: Failure) {
    self.failure.get_or_insert(failure);
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
  pub repositories: Vec<RepositoryReport>,
}

impl BackupReport {
  fn count(&self, pred: impl Fn(&RepositoryOutcome) -> bool) -> usize {
    self.repositories.iter().filter(|r| pred(&r.outcome)).count()
  }

  pub fn completed(&self) -> usize {
    self.count(|o| matches!(o, RepositoryOutcome::Completed))
  }

  pub fn failed(&self) -> usize {
    self.count(|o| matches!(o, RepositoryOutcome::Failed(_)))
  }

  pub fn cancelled(&self) -> usize {
    self.count(|o| matches!(o, RepositoryOutcome::Cancelled))
  }
}

enum Pending {
  Running(usize, SourceRepository, JoinHandle<RepositoryReport>),
  Skipped(usize, SourceRepository),
}

#[derive(Clone)]
pub struct Orchestrator {
  settings: Arc<BackupSettings>,
  registry: Arc<Registry>,
  vcs: Arc<dyn Vcs>,
}

impl Orchestrator {
  pub fn new(settings: BackupSettings, registry: Arc<Registry>, vcs: Arc<dyn Vcs>) -> Self {
    Self { settings: Arc::new(settings), registry, vcs }
  }

  /// Attempts every repository once. Cancelling stops new repositories from starting.
  pub async fn run(&self, cancel: CancellationToken) -> BackupReport {
    let repos = self.registry.repositories();
    info!(
      "Starting backup of {} repositories to {} targets in {}",
      repos.len(),
      self.registry.targets().len(),
      self.settings.backup_dir.display()
    );

    let semaphore = Arc::new(Semaphore::new(self.settings.jobs.max(1)));
    let mut pending = Vec::with_capacity(repos.len());

    for (i, repo) in repos.iter().enumerate() {
      let index = i + 1;
      let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
      };
      let Some(permit) = permit else {
        pending.push(Pending::Skipped(index, repo.clone()));
        continue;
      };

      let this = self.clone();
      let owned = repo.clone();
      let handle = tokio::spawn(async move {
        let _permit = permit;
        this.process_repository(index, &owned).await
      });
      pending.push(Pending::Running(index, repo.clone(), handle));
    }

    let mut report = BackupReport::default();
    for entry in pending {
      let repo_report = match entry {
        Pending::Running(index, repo, handle) => match handle.await {
          Ok(r) => r,
          Err(err) => {
            error!("Repository #{} [{}] aborted: {}", index, repo.name(), err);
            let failure = Failure::new(Stage::Internal, err.to_string());
            RepositoryReport::new(index, &repo, RepositoryOutcome::Failed(failure))
          },
        },
        Pending::Skipped(index, repo) => {
          warn!("Repository #{} [{}] skipped, backup was cancelled", index, repo.name());
          RepositoryReport::new(index, &repo, RepositoryOutcome::Cancelled)
        },
      };
      report.repositories.push(repo_report);
    }

    info!(
      "Backup finished: {} completed, {} failed, {} cancelled",
      report.completed(),
      report.failed(),
      report.cancelled()
    );
    report
  }

  async fn process_repository(&self, index: usize, repo: &SourceRepository) -> RepositoryReport {
    info!("Backing up repository #{} [{}]", index, repo.name());
    let mut report = RepositoryReport::new(index, repo, RepositoryOutcome::Completed);

    let result = self.mirror_repository(repo, &mut report).await;
    let failure = match result {
      Ok(()) => report
        .failure
        .clone()
        .or_else(|| report.targets.iter().find_map(|t| t.failure.clone())),
      Err(failure) => Some(failure),
    };

    match failure {
      None => info!("Finished repository #{} [{}]", index, repo.name()),
      Some(failure) => {
        error!("Repository #{} [{}] did not complete: {}", index, repo.name(), failure);
        report.outcome = RepositoryOutcome::Failed(failure);
      },
    }
    report
  }

  // Only an unusable destination ends the repository early. Command failures
  // are recorded and the remaining steps still run.
  async fn mirror_repository(&self, repo: &SourceRepository, report: &mut RepositoryReport) -> Result<(), Failure> {
    let dest = self.prepare(repo).await?;

    let exists = tokio::fs::try_exists(&dest)
      .await
      .map_err(|e| Failure::new(Stage::Prepare, format!("cannot inspect {}: {}", dest.display(), e)))?;
    if !exists {
      match self.clone_mirror(repo, &dest).await {
        Ok(()) => report.cloned = true,
        Err(failure) => {
          error!("[{}]: Clone failed, continuing: {}", repo.name(), failure);
          report.fail(failure);
        },
      }
    }

    let mut remotes = match self.attempt(|| self.vcs.list_remotes(&dest)).await {
      Ok(remotes) => remotes,
      Err(err) => {
        warn!("[{}]: Cannot list remotes, adding every target: {}", repo.name(), err);
        report.fail(Failure::new(Stage::DiscoverRemotes, err.to_string()));
        BTreeSet::new()
      },
    };

    for target in self.registry.targets() {
      let target_report = self.push_target(repo, &dest, target, &mut remotes).await;
      report.targets.push(target_report);
    }
    Ok(())
  }

  async fn prepare(&self, repo: &SourceRepository) -> Result<PathBuf, Failure> {
    let name = repo.name();
    if name.is_empty() || name == "." || name == ".." || name.contains('\\') {
      return Err(Failure::new(
        Stage::Prepare,
        format!("cannot derive a directory name from {:?}", repo.url()),
      ));
    }
    tokio::fs::create_dir_all(&self.settings.backup_dir).await.map_err(|e| {
      Failure::new(Stage::Prepare, format!("cannot create {}: {}", self.settings.backup_dir.display(), e))
    })?;
    Ok(self.settings.backup_dir.join(name))
  }

  // Clones next to the destination and renames on success, so an existing
  // destination is always a finished clone.
  async fn clone_mirror(&self, repo: &SourceRepository, dest: &Path) -> Result<(), Failure> {
    let staging = dest.with_file_name(format!("{}.partial", repo.name()));
    info!("[{}]: Cloning mirror of {}", repo.name(), repo.url());

    let (vcs, url, staging_ref) = (&self.vcs, repo.url(), &staging);
    self
      .attempt(|| async move {
        clear_staging(staging_ref).await?;
        vcs.mirror_clone(url, staging_ref).await
      })
      .await
      .map_err(Failure::at(Stage::Clone))?;

    tokio::fs::rename(&staging, dest)
      .await
      .map_err(|e| Failure::new(Stage::Clone, format!("cannot move clone into {}: {}", dest.display(), e)))
  }

  async fn push_target(
    &self,
    repo: &SourceRepository,
    dest: &Path,
    target: &BackupTarget,
    remotes: &mut BTreeSet<String>,
  ) -> TargetReport {
    let name = repo.name();
    let mut report = TargetReport::new(target);

    info!("[{}]: Fetching updates from {}", name, ORIGIN);
    match self.attempt(|| self.vcs.fetch_prune(dest)).await {
      Ok(()) => report.refreshed = true,
      Err(err) => {
        warn!("[{}]: Refresh before pushing to {} failed: {}", name, target.name, err);
        report.fail(Failure::new(Stage::Refresh, err.to_string()));
      },
    }

    if !remotes.contains(&target.name) {
      let url = target.remote_url(repo);
      info!("[{}]: Adding remote [{}] at {}", name, target.name, url);
      match self.attempt(|| self.vcs.add_remote(dest, &target.name, &url)).await {
        Ok(()) => {
          remotes.insert(target.name.clone());
          report.remote_added = true;
        },
        Err(err) => {
          warn!("[{}]: Cannot add remote [{}], pushing anyway: {}", name, target.name, err);
          report.fail(Failure::new(Stage::AddRemote, err.to_string()));
        },
      }
    }

    info!("[{}]: Pushing mirror to remote [{}]", name, target.name);
    match self.attempt(|| self.vcs.push_mirror(dest, &target.name)).await {
      Ok(()) => report.pushed = true,
      Err(err) => {
        error!("[{}]: Push to [{}] failed: {}", name, target.name, err);
        report.fail(Failure::new(Stage::Push, err.to_string()));
      },
    }
    report
  }

  async fn attempt<T, F, Fut>(&self, mut op: F) -> CommandResult<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = CommandResult<T>>,
  {
    let mut tries = 0;
    loop {
      match op().await {
        Err(err) if tries < self.settings.retries => {
          tries += 1;
          warn!("{} (attempt {}/{}), retrying", err, tries, self.settings.retries + 1);
        },
        result => return result,
      }
    }
  }
}

async fn clear_staging(staging: &Path) -> CommandResult {
  let exists = tokio::fs::try_exists(staging)
    .await
    .map_err(|e| CommandError::new(format!("inspect {}", staging.display()), e.to_string()))?;
  if exists {
    warn!("Removing incomplete clone at {}", staging.display());
    tokio::fs::remove_dir_all(staging)
      .await
      .map_err(|e| CommandError::new(format!("remove {}", staging.display()), e.to_string()))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{collections::HashSet, sync::Mutex};

  use tokio::sync::Notify;

  use serde_yaml::Value;

  #[derive(Debug, Clone, PartialEq, Eq)]
  enum Call {
    Clone(String),
    List(String),
    Fetch(String),
    Add(String, String, String),
    Push(String, String),
  }

  impl Call {
    fn repo(&self) -> &str {
      match self {
        Call::Clone(url) => url.rsplit('/').next().unwrap_or_default(),
        Call::List(r) | Call::Fetch(r) | Call::Add(r, _, _) | Call::Push(r, _) => r,
      }
    }
  }

  /// Records calls; a mirror is a directory whose `remotes` file lists remote names.
  #[derive(Default)]
  struct FakeVcs {
    calls: Mutex<Vec<Call>>,
    fail_clone: HashSet<String>,
    fail_add: HashSet<String>,
    fail_push: HashSet<String>,
    fetch_failures: Mutex<u32>,
    fail_list: HashSet<String>,
    panic_on_list: HashSet<String>,
    hold_list: Option<Arc<Hold>>,
  }

  /// Parks `list_remotes` for one repository until released.
  struct Hold {
    repo: String,
    started: Notify,
    release: Notify,
  }

  fn dir_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
  }

  fn read_remotes(path: &Path) -> CommandResult<BTreeSet<String>> {
    std::fs::read_to_string(path.join("remotes"))
      .map(|s| s.lines().map(str::to_owned).collect())
      .map_err(|e| CommandError::new("git remote", e.to_string()))
  }

  impl FakeVcs {
    fn calls(&self) -> Vec<Call> {
      self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
      self.calls.lock().unwrap().push(call);
    }
  }

  #[async_trait::async_trait]
  impl Vcs for FakeVcs {
    async fn mirror_clone(&self, url: &str, dest: &Path) -> CommandResult {
      self.record(Call::Clone(url.to_owned()));
      if self.fail_clone.contains(url) {
        return Err(CommandError::new("git clone --mirror", "repository not found"));
      }
      assert!(!dest.exists(), "clone into existing {}", dest.display());
      std::fs::create_dir_all(dest).unwrap();
      std::fs::write(dest.join("remotes"), "origin\n").unwrap();
      Ok(())
    }

    async fn list_remotes(&self, path: &Path) -> CommandResult<BTreeSet<String>> {
      let repo = dir_name(path);
      self.record(Call::List(repo.clone()));
      if self.panic_on_list.contains(&repo) {
        panic!("corrupt mirror {}", repo);
      }
      if let Some(hold) = self.hold_list.as_ref().filter(|h| h.repo == repo) {
        hold.started.notify_one();
        hold.release.notified().await;
      }
      if self.fail_list.contains(&repo) {
        return Err(CommandError::new("git remote", "unable to lock config file"));
      }
      read_remotes(path)
    }

    async fn fetch_prune(&self, path: &Path) -> CommandResult {
      self.record(Call::Fetch(dir_name(path)));
      let mut failures = self.fetch_failures.lock().unwrap();
      if *failures > 0 {
        *failures -= 1;
        return Err(CommandError::new("git fetch -p origin", "network unreachable"));
      }
      Ok(())
    }

    async fn add_remote(&self, path: &Path, name: &str, url: &str) -> CommandResult {
      self.record(Call::Add(dir_name(path), name.to_owned(), url.to_owned()));
      let mut remotes = read_remotes(path)?;
      if self.fail_add.contains(name) || !remotes.insert(name.to_owned()) {
        return Err(CommandError::new("git remote add", format!("remote {} already exists", name)));
      }
      let text: String = remotes.iter().map(|r| format!("{}\n", r)).collect();
      std::fs::write(path.join("remotes"), text).unwrap();
      Ok(())
    }

    async fn push_mirror(&self, path: &Path, name: &str) -> CommandResult {
      self.record(Call::Push(dir_name(path), name.to_owned()));
      if self.fail_push.contains(name) {
        return Err(CommandError::new("git push --mirror", "permission denied"));
      }
      Ok(())
    }
  }

  const BASE: &str = "https://example.com/group";

  fn registry(repos: &[&str], targets: &[&str]) -> Arc<Registry> {
    let mut registry = Registry::new();
    let repos: Vec<Value> = repos
      .iter()
      .map(|r| serde_yaml::from_str(&format!("{{url: '{}/{}'}}", BASE, r)).unwrap())
      .collect();
    registry.add_repositories(&Value::Sequence(repos)).unwrap();
    let targets = targets
      .iter()
      .map(|t| serde_yaml::from_str(&format!("{{name: {0}, url: 'git@{0}:mirrors'}}", t)).unwrap())
      .collect();
    registry.add_targets(&Value::Sequence(targets)).unwrap();
    Arc::new(registry)
  }

  fn existing_mirror(root: &Path, name: &str, remotes: &[&str]) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let text: String = remotes.iter().map(|r| format!("{}\n", r)).collect();
    std::fs::write(dir.join("remotes"), text).unwrap();
  }

  async fn run(root: &Path, registry: Arc<Registry>, vcs: Arc<FakeVcs>, retries: u32) -> BackupReport {
    let mut settings = BackupSettings::new(root);
    settings.retries = retries;
    Orchestrator::new(settings, registry, vcs).run(CancellationToken::new()).await
  }

  fn add(repo: &str, target: &str) -> Call {
    Call::Add(repo.to_owned(), target.to_owned(), format!("git@{}:mirrors/{}", target, repo))
  }

  fn fetch(repo: &str) -> Call {
    Call::Fetch(repo.to_owned())
  }

  fn push(repo: &str, target: &str) -> Call {
    Call::Push(repo.to_owned(), target.to_owned())
  }

  #[tokio::test]
  async fn call_sequence_for_existing_and_new_mirror() {
    let root = tempfile::tempdir().unwrap();
    existing_mirror(root.path(), "A", &["origin"]);
    let vcs = Arc::new(FakeVcs::default());

    let report = run(root.path(), registry(&["A", "B"], &["S1", "S2"]), Arc::clone(&vcs), 0).await;

    assert_eq!(
      vcs.calls(),
      vec![
        Call::List("A".into()),
        fetch("A"),
        add("A", "S1"),
        push("A", "S1"),
        fetch("A"),
        add("A", "S2"),
        push("A", "S2"),
        Call::Clone(format!("{}/B", BASE)),
        Call::List("B".into()),
        fetch("B"),
        add("B", "S1"),
        push("B", "S1"),
        fetch("B"),
        add("B", "S2"),
        push("B", "S2"),
      ]
    );
    assert_eq!(report.completed(), 2);
    assert!(!report.repositories[0].cloned);
    assert!(report.repositories[1].cloned);
    assert!(root.path().join("B").is_dir());
    assert!(!root.path().join("B.partial").exists());
  }

  #[tokio::test]
  async fn second_run_skips_clone_and_known_remotes() {
    let root = tempfile::tempdir().unwrap();
    let registry = registry(&["A"], &["S1", "S2"]);

    let first = Arc::new(FakeVcs::default());
    run(root.path(), Arc::clone(&registry), Arc::clone(&first), 0).await;
    assert!(first.calls().contains(&Call::Clone(format!("{}/A", BASE))));

    let second = Arc::new(FakeVcs::default());
    let report = run(root.path(), registry, Arc::clone(&second), 0).await;

    assert_eq!(
      second.calls(),
      vec![Call::List("A".into()), fetch("A"), push("A", "S1"), fetch("A"), push("A", "S2")]
    );
    assert_eq!(report.completed(), 1);
    assert!(report.repositories[0].targets.iter().all(|t| t.pushed && !t.remote_added));
  }

  #[tokio::test]
  async fn clone_failure_does_not_stop_later_repositories() {
    let root = tempfile::tempdir().unwrap();
    let vcs = Arc::new(FakeVcs {
      fail_clone: HashSet::from([format!("{}/R1", BASE)]),
      ..Default::default()
    });

    let report = run(root.path(), registry(&["R1", "R2"], &["S1"]), Arc::clone(&vcs), 0).await;

    let r1: Vec<Call> = vcs.calls().into_iter().filter(|c| c.repo() == "R1").collect();
    assert_eq!(
      r1,
      vec![Call::Clone(format!("{}/R1", BASE)), Call::List("R1".into()), fetch("R1"), add("R1", "S1"), push("R1", "S1")]
    );
    let r2: Vec<Call> = vcs.calls().into_iter().filter(|c| c.repo() == "R2").collect();
    assert_eq!(
      r2,
      vec![Call::Clone(format!("{}/R2", BASE)), Call::List("R2".into()), fetch("R2"), add("R2", "S1"), push("R2", "S1")]
    );
    assert!(matches!(
      &report.repositories[0].outcome,
      RepositoryOutcome::Failed(Failure { stage: Stage::Clone, .. })
    ));
    assert_eq!(report.repositories[1].outcome, RepositoryOutcome::Completed);
    assert!(!root.path().join("R1").exists());
  }

  #[tokio::test]
  async fn every_target_gets_a_refresh_and_a_push() {
    let root = tempfile::tempdir().unwrap();
    existing_mirror(root.path(), "A", &["origin", "S1", "S2", "S3"]);
    let vcs = Arc::new(FakeVcs::default());

    run(root.path(), registry(&["A"], &["S1", "S2", "S3"]), Arc::clone(&vcs), 0).await;

    let calls = vcs.calls();
    let pushes: Vec<usize> = calls.iter().enumerate().filter(|(_, c)| matches!(c, Call::Push(..))).map(|(i, _)| i).collect();
    assert_eq!(pushes.len(), 3);
    for i in pushes {
      assert_eq!(calls[i - 1], fetch("A"));
    }
  }

  #[tokio::test]
  async fn add_remote_failure_still_pushes() {
    let root = tempfile::tempdir().unwrap();
    existing_mirror(root.path(), "A", &["origin"]);
    let vcs = Arc::new(FakeVcs { fail_add: HashSet::from(["S1".to_owned()]), ..Default::default() });

    let report = run(root.path(), registry(&["A"], &["S1", "S2"]), Arc::clone(&vcs), 0).await;

    assert_eq!(
      vcs.calls(),
      vec![
        Call::List("A".into()),
        fetch("A"),
        add("A", "S1"),
        push("A", "S1"),
        fetch("A"),
        add("A", "S2"),
        push("A", "S2"),
      ]
    );
    let targets = &report.repositories[0].targets;
    assert_eq!(targets[0].failure.as_ref().map(|f| f.stage), Some(Stage::AddRemote));
    assert!(targets[0].pushed && !targets[0].remote_added);
    assert!(targets[1].pushed && targets[1].failure.is_none());
    assert!(matches!(
      &report.repositories[0].outcome,
      RepositoryOutcome::Failed(Failure { stage: Stage::AddRemote, .. })
    ));
  }

  #[tokio::test]
  async fn remote_listing_failure_still_pushes_every_target() {
    let root = tempfile::tempdir().unwrap();
    existing_mirror(root.path(), "A", &["origin", "S1", "S2"]);
    let vcs = Arc::new(FakeVcs { fail_list: HashSet::from(["A".to_owned()]), ..Default::default() });

    let report = run(root.path(), registry(&["A"], &["S1", "S2"]), Arc::clone(&vcs), 0).await;

    assert_eq!(
      vcs.calls(),
      vec![
        Call::List("A".into()),
        fetch("A"),
        add("A", "S1"),
        push("A", "S1"),
        fetch("A"),
        add("A", "S2"),
        push("A", "S2"),
      ]
    );
    let repo = &report.repositories[0];
    assert_eq!(repo.failure.as_ref().map(|f| f.stage), Some(Stage::DiscoverRemotes));
    assert!(repo.targets.iter().all(|t| t.pushed));
    assert!(matches!(
      &repo.outcome,
      RepositoryOutcome::Failed(Failure { stage: Stage::DiscoverRemotes, .. })
    ));
  }

  #[tokio::test]
  async fn push_failure_is_reported_and_batch_continues() {
    let root = tempfile::tempdir().unwrap();
    existing_mirror(root.path(), "A", &["origin", "S1"]);
    existing_mirror(root.path(), "B", &["origin", "S1"]);
    let vcs = Arc::new(FakeVcs { fail_push: HashSet::from(["S1".to_owned()]), ..Default::default() });

    let report = run(root.path(), registry(&["A", "B"], &["S1"]), Arc::clone(&vcs), 0).await;

    assert_eq!(report.failed(), 2);
    assert!(vcs.calls().contains(&push("B", "S1")));
    let failure = &report.repositories[1].targets[0].failure;
    assert_eq!(failure.as_ref().map(|f| f.stage), Some(Stage::Push));
    assert!(failure.as_ref().is_some_and(|f| f.detail.contains("permission denied")));
  }

  #[tokio::test]
  async fn refresh_failure_still_pushes() {
    let root = tempfile::tempdir().unwrap();
    existing_mirror(root.path(), "A", &["origin", "S1"]);
    let vcs = Arc::new(FakeVcs { fetch_failures: Mutex::new(1), ..Default::default() });

    let report = run(root.path(), registry(&["A"], &["S1"]), Arc::clone(&vcs), 0).await;

    assert_eq!(vcs.calls(), vec![Call::List("A".into()), fetch("A"), push("A", "S1")]);
    let target = &report.repositories[0].targets[0];
    assert!(!target.refreshed);
    assert!(target.pushed);
    assert_eq!(target.failure.as_ref().map(|f| f.stage), Some(Stage::Refresh));
  }

  #[tokio::test]
  async fn retries_repeat_failed_commands() {
    let root = tempfile::tempdir().unwrap();
    existing_mirror(root.path(), "A", &["origin", "S1"]);
    let vcs = Arc::new(FakeVcs { fetch_failures: Mutex::new(1), ..Default::default() });

    let report = run(root.path(), registry(&["A"], &["S1"]), Arc::clone(&vcs), 1).await;

    assert_eq!(vcs.calls(), vec![Call::List("A".into()), fetch("A"), fetch("A"), push("A", "S1")]);
    assert_eq!(report.repositories[0].outcome, RepositoryOutcome::Completed);
  }

  #[tokio::test]
  async fn unusable_name_fails_before_any_command() {
    let root = tempfile::tempdir().unwrap();
    let mut reg = Registry::new();
    reg
      .add_repositories(&serde_yaml::from_str("[ {url: 'https://example.com/group/'}, {url: 'https://example.com/group/ok'} ]").unwrap())
      .unwrap();
    reg.add_targets(&serde_yaml::from_str("[ {name: S1, url: 'git@S1:mirrors'} ]").unwrap()).unwrap();
    let vcs = Arc::new(FakeVcs::default());

    let report = run(root.path(), Arc::new(reg), Arc::clone(&vcs), 0).await;

    assert!(matches!(
      &report.repositories[0].outcome,
      RepositoryOutcome::Failed(Failure { stage: Stage::Prepare, .. })
    ));
    assert!(vcs.calls().iter().all(|c| c.repo() == "ok"));
    assert_eq!(report.repositories[1].outcome, RepositoryOutcome::Completed);
  }

  #[tokio::test]
  async fn stale_partial_clone_is_replaced() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("A.partial/objects")).unwrap();
    let vcs = Arc::new(FakeVcs::default());

    let report = run(root.path(), registry(&["A"], &["S1"]), Arc::clone(&vcs), 0).await;

    assert_eq!(report.completed(), 1);
    assert!(root.path().join("A/remotes").is_file());
    assert!(!root.path().join("A.partial").exists());
  }

  #[tokio::test]
  async fn panicking_repository_is_isolated() {
    let root = tempfile::tempdir().unwrap();
    existing_mirror(root.path(), "A", &["origin"]);
    let vcs = Arc::new(FakeVcs { panic_on_list: HashSet::from(["A".to_owned()]), ..Default::default() });

    let report = run(root.path(), registry(&["A", "B"], &["S1"]), Arc::clone(&vcs), 0).await;

    assert!(matches!(
      &report.repositories[0].outcome,
      RepositoryOutcome::Failed(Failure { stage: Stage::Internal, .. })
    ));
    assert_eq!(report.repositories[0].name, "A");
    assert_eq!(report.repositories[1].outcome, RepositoryOutcome::Completed);
  }

  #[tokio::test]
  async fn cancelled_before_start_runs_nothing() {
    let root = tempfile::tempdir().unwrap();
    let vcs = Arc::new(FakeVcs::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let orchestrator = Orchestrator::new(BackupSettings::new(root.path()), registry(&["A", "B"], &["S1"]), vcs.clone());
    let report = orchestrator.run(cancel).await;

    assert_eq!(report.cancelled(), 2);
    assert!(vcs.calls().is_empty());
    assert_eq!(report.repositories.iter().map(|r| r.index).collect::<Vec<_>>(), vec![1, 2]);
  }

  #[tokio::test]
  async fn cancel_lets_running_repository_finish() {
    let root = tempfile::tempdir().unwrap();
    existing_mirror(root.path(), "A", &["origin", "S1"]);
    let hold = Arc::new(Hold { repo: "A".to_owned(), started: Notify::new(), release: Notify::new() });
    let vcs = Arc::new(FakeVcs { hold_list: Some(Arc::clone(&hold)), ..Default::default() });
    let cancel = CancellationToken::new();

    let orchestrator = Orchestrator::new(BackupSettings::new(root.path()), registry(&["A", "B", "C"], &["S1"]), vcs.clone());
    let running = tokio::spawn({
      let cancel = cancel.clone();
      async move { orchestrator.run(cancel).await }
    });

    hold.started.notified().await;
    cancel.cancel();
    hold.release.notify_one();
    let report = running.await.unwrap();

    assert_eq!(report.repositories[0].outcome, RepositoryOutcome::Completed);
    assert!(report.repositories[0].targets[0].pushed);
    assert_eq!(report.repositories[1].outcome, RepositoryOutcome::Cancelled);
    assert_eq!(report.repositories[2].outcome, RepositoryOutcome::Cancelled);
    assert!(vcs.calls().iter().all(|c| c.repo() == "A"));
  }

  #[tokio::test]
  async fn parallel_jobs_keep_per_repository_order() {
    let root = tempfile::tempdir().unwrap();
    let vcs = Arc::new(FakeVcs::default());
    let mut settings = BackupSettings::new(root.path());
    settings.jobs = 3;

    let report = Orchestrator::new(settings, registry(&["A", "B", "C", "D"], &["S1", "S2"]), vcs.clone())
      .run(CancellationToken::new())
      .await;

    assert_eq!(report.completed(), 4);
    let names: Vec<&str> = report.repositories.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "C", "D"]);
    for repo in ["A", "B", "C", "D"] {
      let calls: Vec<Call> = vcs.calls().into_iter().filter(|c| c.repo() == repo).collect();
      assert_eq!(
        calls,
        vec![
          Call::Clone(format!("{}/{}", BASE, repo)),
          Call::List(repo.into()),
          fetch(repo),
          add(repo, "S1"),
          push(repo, "S1"),
          fetch(repo),
          add(repo, "S2"),
          push(repo, "S2"),
        ]
      );
    }
  }
}
