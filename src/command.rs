use std::{collections::BTreeSet, ffi::OsStr, path::Path};

use log::debug;
use tokio::process::Command;

use crate::{
  error::CommandError,
  git::{CommandResult, Vcs, ORIGIN},
};

/// Drives the `git` executable found on `PATH`.
#[derive(Debug, Clone)]
pub struct CommandGit {
  program: String,
}

impl Default for CommandGit {
  fn default() -> Self {
    Self { program: "git".to_owned() }
  }
}

impl CommandGit {
  pub fn new(program: impl Into<String>) -> Self {
    Self { program: program.into() }
  }

  async fn run<I, S>(&self, cwd: Option<&Path>, args: I) -> CommandResult<String>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
  {
    let args: Vec<S> = args.into_iter().collect();
    let display = std::iter::once(self.program.clone())
      .chain(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()))
      .collect::<Vec<_>>()
      .join(" ");

    let mut cmd = Command::new(&self.program);
    cmd.args(&args).env("GIT_TERMINAL_PROMPT", "0").kill_on_drop(true);
    if let Some(dir) = cwd {
      cmd.current_dir(dir);
    }
    // Keep terminal SIGINT away from git so a cancelled run can finish its push.
    #[cfg(unix)]
    cmd.process_group(0);

    debug!("Running `{}`", display);
    let output = cmd
      .output()
      .await
      .map_err(|e| CommandError::new(&display, format!("failed to start: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
      debug!("`{}` stderr: {}", display, stderr.trim());
    }

    if output.status.success() {
      Ok(stdout)
    } else {
      let detail = match stderr.trim() {
        "" => output.status.to_string(),
        msg => format!("{}: {}", output.status, msg),
      };
      Err(CommandError::new(display, detail))
    }
  }
}

#[async_trait::async_trait]
impl Vcs for CommandGit {
  async fn mirror_clone(&self, url: &str, dest: &Path) -> CommandResult {
    self
      .run(None, [OsStr::new("clone"), OsStr::new("--mirror"), OsStr::new(url), dest.as_os_str()])
      .await
      .map(|_| ())
  }

  async fn list_remotes(&self, path: &Path) -> CommandResult<BTreeSet<String>> {
    let out = self.run(Some(path), ["remote"]).await?;
    Ok(out.split_whitespace().map(str::to_owned).collect())
  }

  async fn fetch_prune(&self, path: &Path) -> CommandResult {
    self.run(Some(path), ["fetch", "-p", ORIGIN]).await.map(|_| ())
  }

  async fn add_remote(&self, path: &Path, name: &str, url: &str) -> CommandResult {
    self.run(Some(path), ["remote", "add", name, url]).await.map(|_| ())
  }

  async fn push_mirror(&self, path: &Path, name: &str) -> CommandResult {
    self.run(Some(path), ["push", "--mirror", name]).await.map(|_| ())
  }
}
