use std::{future::Future, path::PathBuf, sync::Arc};

use clap::Parser;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
  backup::{BackupSettings, Orchestrator, RepositoryOutcome},
  command::CommandGit,
  config::{Backend, GitBackupSettings},
  git::Vcs,
  libgit::LibGit,
  registry::{Admission, Registry},
};

pub mod backup;
pub mod command;
pub mod config;
pub mod error;
pub mod git;
pub mod libgit;
pub mod registry;

/// Mirror git repositories to backup remotes
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
  /// Settings file
  #[arg(short, long, env = "GIT_MIRROR_BACKUP_CONFIG", default_value = "config.yml")]
  config: PathBuf,

  /// Repositories processed in parallel
  #[arg(short, long)]
  jobs: Option<usize>,

  /// Extra attempts for a failed git command
  #[arg(long)]
  retries: Option<u32>,

  #[arg(long, value_enum)]
  backend: Option<Backend>,
}

impl Args {
  fn apply(&self, cfg: &mut GitBackupSettings) {
    if let Some(jobs) = self.jobs {
      cfg.jobs = jobs;
    }
    if let Some(retries) = self.retries {
      cfg.retries = retries;
    }
    if let Some(backend) = self.backend {
      cfg.backend = backend;
    }
  }
}

fn report_admission(kind: &str, admission: &Admission) {
  if admission.rejected.is_empty() {
    info!("Registered {} {}", admission.accepted, kind);
  } else {
    warn!("Registered {} {}, skipped {}", admission.accepted, kind, admission.rejected.len());
  }
}

fn build_registry(cfg: &GitBackupSettings) -> anyhow::Result<Registry> {
  let mut registry = Registry::new();
  report_admission("targets", &registry.add_targets(&cfg.target_entries()?)?);
  report_admission("repositories", &registry.add_repositories(&cfg.repository_entries()?)?);
  Ok(registry)
}

/// The first interrupt cancels the run; returns true once a second one arrives.
async fn relay_interrupts<F, Fut>(mut interrupt: F, cancel: CancellationToken) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = std::io::Result<()>>,
{
  if interrupt().await.is_err() {
    return false;
  }
  warn!("Interrupted, letting repositories in progress finish (Ctrl-C again to abort)");
  cancel.cancel();
  interrupt().await.is_ok()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());
  pretty_env_logger::formatted_builder().parse_filters(&filters).init();

  let args = Args::parse();
  let mut cfg = GitBackupSettings::load(&args.config)?;
  args.apply(&mut cfg);

  let registry = build_registry(&cfg)?;
  let vcs: Arc<dyn Vcs> = match cfg.backend {
    Backend::Command => Arc::new(CommandGit::default()),
    Backend::Libgit2 => Arc::new(LibGit::new(cfg.ssh_key.clone())),
  };
  let settings = BackupSettings { backup_dir: cfg.backup_dir.clone(), jobs: cfg.jobs, retries: cfg.retries };

  let cancel = CancellationToken::new();
  tokio::spawn({
    let cancel = cancel.clone();
    async move {
      if relay_interrupts(tokio::signal::ctrl_c, cancel).await {
        error!("Aborted");
        std::process::exit(130);
      }
    }
  });

  let report = Orchestrator::new(settings, Arc::new(registry), vcs).run(cancel).await;
  for repo in &report.repositories {
    if let RepositoryOutcome::Failed(failure) = &repo.outcome {
      error!("#{} [{}] {}", repo.index, repo.name, failure);
    }
  }

  Ok(())
}
