use std::{
  collections::{BTreeSet, HashSet},
  path::{Path, PathBuf},
};

use git2::{
  build::RepoBuilder, AutotagOption, Cred, CredentialType, Direction, FetchOptions, FetchPrune, PushOptions,
  ReferenceType, RemoteCallbacks, Repository,
};
use log::debug;

use crate::{
  error::CommandError,
  git::{CommandResult, Vcs, ORIGIN},
};

const MIRROR_REFSPEC: &str = "+refs/*:refs/*";
const MAX_AUTH_ATTEMPTS: usize = 3;

/// In-process git via libgit2. Calls run on the blocking pool.
#[derive(Debug, Clone)]
pub struct LibGit {
  ssh_key: Option<PathBuf>,
}

impl LibGit {
  pub fn new(ssh_key: Option<PathBuf>) -> Self {
    Self { ssh_key }
  }

  fn callbacks<'a>(&self) -> RemoteCallbacks<'a> {
    let ssh_key = self.ssh_key.clone();
    let mut attempts = 0;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username, allowed| {
      attempts += 1;
      if attempts > MAX_AUTH_ATTEMPTS {
        return Err(git2::Error::from_str("authentication failed"));
      }
      credentials(ssh_key.as_deref(), attempts, url, username, allowed)
    });
    callbacks
  }

  async fn blocking<T, F>(&self, operation: String, f: F) -> CommandResult<T>
  where
    T: Send + 'static,
    F: FnOnce(LibGit) -> Result<T, git2::Error> + Send + 'static,
  {
    let this = self.clone();
    match tokio::task::spawn_blocking(move || f(this)).await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(err)) => Err(CommandError::new(operation, err.message())),
      Err(err) => Err(CommandError::new(operation, format!("task failed: {}", err))),
    }
  }

  fn clone_mirror(&self, url: &str, dest: &Path) -> Result<(), git2::Error> {
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(self.callbacks());
    opts.download_tags(AutotagOption::All);

    let mut builder = RepoBuilder::new();
    builder.fetch_options(opts);
    builder.bare(true);
    builder.remote_create(|repo, name, url| repo.remote_with_fetch(name, url, MIRROR_REFSPEC));

    let repo = builder.clone(url, dest)?;
    repo.config()?.set_bool("remote.origin.mirror", true)?;
    Ok(())
  }

  fn fetch(&self, path: &Path) -> Result<(), git2::Error> {
    let repo = Repository::open(path)?;
    let mut remote = repo.find_remote(ORIGIN)?;

    let mut opts = FetchOptions::new();
    opts.remote_callbacks(self.callbacks());
    opts.download_tags(AutotagOption::All);
    opts.prune(FetchPrune::On);

    remote.fetch(&[] as &[&str], Some(&mut opts), None)?;

    let stats = remote.stats();
    debug!(
      "Received {}/{} objects in {} bytes",
      stats.indexed_objects(),
      stats.total_objects(),
      stats.received_bytes()
    );
    Ok(())
  }

  fn push(&self, path: &Path, name: &str) -> Result<(), git2::Error> {
    let repo = Repository::open(path)?;
    let mut remote = repo.find_remote(name)?;

    let mut local = HashSet::new();
    for reference in repo.references()? {
      let reference = reference?;
      if reference.kind() == Some(ReferenceType::Symbolic) {
        continue;
      }
      if let Some(name) = reference.name() {
        local.insert(name.to_owned());
      }
    }

    let remote_refs: Vec<String> = {
      let connection = remote.connect_auth(Direction::Push, Some(self.callbacks()), None)?;
      connection
        .list()?
        .iter()
        .map(|head| head.name().to_owned())
        .filter(|name| name.starts_with("refs/") && !name.ends_with("^{}"))
        .collect()
    };

    let mut refspecs: Vec<String> = local.iter().map(|r| format!("+{}:{}", r, r)).collect();
    refspecs.extend(remote_refs.iter().filter(|r| !local.contains(*r)).map(|r| format!(":{}", r)));
    refspecs.sort();
    if refspecs.is_empty() {
      debug!("Nothing to push to {}", name);
      return Ok(());
    }

    let mut rejected = Vec::new();
    let mut callbacks = self.callbacks();
    callbacks.push_update_reference(|refname, status| {
      if let Some(msg) = status {
        rejected.push(format!("{} ({})", refname, msg));
      }
      Ok(())
    });
    let mut opts = PushOptions::new();
    opts.remote_callbacks(callbacks);

    remote.push(refspecs.as_slice(), Some(&mut opts))?;
    drop(opts);

    if rejected.is_empty() {
      Ok(())
    } else {
      Err(git2::Error::from_str(&format!("rejected: {}", rejected.join(", "))))
    }
  }
}

fn credentials(
  ssh_key: Option<&Path>,
  attempt: usize,
  url: &str,
  username: Option<&str>,
  allowed: CredentialType,
) -> Result<Cred, git2::Error> {
  let user = username.unwrap_or("git");
  if allowed.contains(CredentialType::SSH_KEY) {
    // Try the agent first, then the key file.
    if attempt == 1 {
      return Cred::ssh_key_from_agent(user);
    }
    let key = match ssh_key {
      Some(key) => key.to_path_buf(),
      None => {
        let home = std::env::var_os("HOME").ok_or_else(|| git2::Error::from_str("HOME is not set"))?;
        PathBuf::from(home).join(".ssh/id_rsa")
      },
    };
    return Cred::ssh_key(user, None, &key, None);
  }
  if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
    let config = git2::Config::open_default()?;
    return Cred::credential_helper(&config, url, username);
  }
  Cred::default()
}

#[async_trait::async_trait]
impl Vcs for LibGit {
  async fn mirror_clone(&self, url: &str, dest: &Path) -> CommandResult {
    let (url, dest) = (url.to_owned(), dest.to_owned());
    self
      .blocking(format!("mirror clone of {}", url), move |git| git.clone_mirror(&url, &dest))
      .await
  }

  async fn list_remotes(&self, path: &Path) -> CommandResult<BTreeSet<String>> {
    let path = path.to_owned();
    self
      .blocking(format!("list remotes in {}", path.display()), move |_| {
        let repo = Repository::open(&path)?;
        let remotes = repo.remotes()?;
        Ok(remotes.iter().flatten().map(str::to_owned).collect())
      })
      .await
  }

  async fn fetch_prune(&self, path: &Path) -> CommandResult {
    let path = path.to_owned();
    self
      .blocking(format!("fetch {} in {}", ORIGIN, path.display()), move |git| git.fetch(&path))
      .await
  }

  async fn add_remote(&self, path: &Path, name: &str, url: &str) -> CommandResult {
    let (path, name, url) = (path.to_owned(), name.to_owned(), url.to_owned());
    self
      .blocking(format!("add remote {}", name), move |_| {
        let repo = Repository::open(&path)?;
        repo.remote(&name, &url)?;
        Ok(())
      })
      .await
  }

  async fn push_mirror(&self, path: &Path, name: &str) -> CommandResult {
    let (path, name) = (path.to_owned(), name.to_owned());
    self
      .blocking(format!("mirror push to {}", name), move |git| git.push(&path, &name))
      .await
  }
}
