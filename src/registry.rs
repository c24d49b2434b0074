use log::{info, warn};
use serde_yaml::Value;

use crate::{
  error::RegistryError,
  git::{BackupTarget, SourceRepository, ORIGIN},
};

/// A raw entry that was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
  pub index: usize,
  pub raw: String,
  pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
  pub accepted: usize,
  pub rejected: Vec<Rejected>,
}

/// Repositories and targets for one run. Append-only; frozen once the run starts.
#[derive(Debug, Default)]
pub struct Registry {
  repositories: Vec<SourceRepository>,
  targets: Vec<BackupTarget>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn repositories(&self) -> &[SourceRepository] {
    &self.repositories
  }

  pub fn targets(&self) -> &[BackupTarget] {
    &self.targets
  }

  pub fn add_repositories(&mut self, input: &Value) -> Result<Admission, RegistryError> {
    let entries = input
      .as_sequence()
      .ok_or_else(|| RegistryError::InvalidArgument("repositories must be a list".to_owned()))?;

    let mut admission = Admission::default();
    for (index, entry) in entries.iter().enumerate() {
      match parse_repository(entry) {
        Ok(repo) => {
          info!("Added repository: {}", repo);
          self.repositories.push(repo);
          admission.accepted += 1;
        },
        Err(reason) => admission.rejected.push(reject("repository", index, entry, reason)),
      }
    }
    Ok(admission)
  }

  pub fn add_targets(&mut self, input: &Value) -> Result<Admission, RegistryError> {
    let entries = input
      .as_sequence()
      .ok_or_else(|| RegistryError::InvalidArgument("targets must be a list".to_owned()))?;

    let mut admission = Admission::default();
    for (index, entry) in entries.iter().enumerate() {
      let parsed = parse_target(entry).and_then(|target| {
        if self.targets.iter().any(|t| t.name == target.name) {
          Err(format!("duplicate target name '{}'", target.name))
        } else {
          Ok(target)
        }
      });
      match parsed {
        Ok(target) => {
          info!("Added backup target: {}", target);
          self.targets.push(target);
          admission.accepted += 1;
        },
        Err(reason) => admission.rejected.push(reject("target", index, entry, reason)),
      }
    }
    Ok(admission)
  }
}

fn reject(kind: &str, index: usize, entry: &Value, reason: String) -> Rejected {
  let raw = render(entry);
  warn!("Skipping {} entry #{} {}: {}", kind, index + 1, raw, reason);
  Rejected { index, raw, reason }
}

fn render(entry: &Value) -> String {
  match entry {
    Value::String(s) => format!("{:?}", s),
    other => serde_yaml::to_string(other)
      .map(|s| s.trim_end().replace('\n', " "))
      .unwrap_or_else(|_| format!("{:?}", other)),
  }
}

fn parse_repository(entry: &Value) -> Result<SourceRepository, String> {
  let url = match entry {
    Value::Mapping(map) => map
      .get("url")
      .and_then(Value::as_str)
      .ok_or_else(|| "mapping has no string 'url'".to_owned())?,
    _ => return Err("expected a mapping with 'url'".to_owned()),
  };
  if url.trim().is_empty() {
    return Err("empty url".to_owned());
  }
  Ok(SourceRepository::new(url))
}

fn parse_target(entry: &Value) -> Result<BackupTarget, String> {
  if !entry.is_mapping() {
    return Err("expected a mapping with 'name' and 'url'".to_owned());
  }
  let target: BackupTarget = serde_yaml::from_value(entry.clone()).map_err(|e| e.to_string())?;
  let target = BackupTarget::new(target.name.trim(), target.base_url.trim());
  if target.name.is_empty() {
    return Err("empty name".to_owned());
  }
  if target.name == ORIGIN {
    return Err(format!("'{}' is reserved for the source remote", ORIGIN));
  }
  if target.base_url.is_empty() {
    return Err("empty url".to_owned());
  }
  Ok(target)
}
