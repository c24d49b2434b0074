use std::path::{Path, PathBuf};

use log::info;
use serde_yaml::Value;

use crate::error::ConfigError;

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
  /// Run the `git` executable.
  #[default]
  Command,
  /// Use libgit2 in-process.
  Libgit2,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct GitBackupSettings {
  #[serde(default = "default_backup_dir")]
  pub backup_dir: PathBuf,

  #[serde(default = "empty_list")]
  pub repositories: Value,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub repositories_file: Option<PathBuf>,

  #[serde(default = "empty_list")]
  pub targets: Value,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub targets_file: Option<PathBuf>,

  #[serde(default)]
  pub backend: Backend,
  #[serde(default = "default_jobs")]
  pub jobs: usize,
  #[serde(default)]
  pub retries: u32,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub ssh_key: Option<PathBuf>,
}

fn default_backup_dir() -> PathBuf {
  PathBuf::from("./git_repositorys")
}

fn empty_list() -> Value {
  Value::Sequence(vec![])
}

fn default_jobs() -> usize {
  1
}

impl GitBackupSettings {
  pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
    serde_yaml::from_str(text).map_err(|source| ConfigError::Parse { path: path.to_owned(), source })
  }

  /// Reads the settings file and makes every path in it absolute relative to the file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let text = read(path)?;
    let mut cfg = Self::from_yaml(&text, path)?;
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    cfg.resolve_paths(&base);
    Ok(cfg)
  }

  pub fn resolve_paths(&mut self, base: &Path) {
    self.backup_dir = resolve(base, &self.backup_dir);
    self.repositories_file = self.repositories_file.as_deref().map(|p| resolve(base, p));
    self.targets_file = self.targets_file.as_deref().map(|p| resolve(base, p));
    self.ssh_key = self.ssh_key.as_deref().map(|p| resolve(base, p));
  }

  /// Inline repositories followed by those listed in `repositories_file`.
  /// A bare url string is shorthand for `{url: ...}`.
  pub fn repository_entries(&self) -> Result<Value, ConfigError> {
    let mut entries = match &self.repositories {
      Value::Sequence(list) => Value::Sequence(
        list
          .iter()
          .map(|entry| match entry {
            Value::String(url) => url_entry(url),
            other => other.clone(),
          })
          .collect(),
      ),
      other => other.clone(),
    };
    if let Some(file) = &self.repositories_file {
      append(&mut entries, read_repositories_file(file)?);
    }
    Ok(entries)
  }

  pub fn target_entries(&self) -> Result<Value, ConfigError> {
    let mut entries = self.targets.clone();
    if let Some(file) = &self.targets_file {
      append(&mut entries, read_targets_file(file)?);
    }
    Ok(entries)
  }
}

// Malformed inline lists are left alone so the registry can refuse them.
fn append(entries: &mut Value, extra: Vec<Value>) {
  if let Value::Sequence(list) = entries {
    list.extend(extra);
  }
}

fn read(path: &Path) -> Result<String, ConfigError> {
  std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })
}

fn content_lines(text: &str) -> impl Iterator<Item = &str> {
  text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#'))
}

fn url_entry(url: &str) -> Value {
  let mut map = serde_yaml::Mapping::new();
  map.insert(Value::from("url"), Value::from(url));
  Value::Mapping(map)
}

/// One repository per line; only the first token counts.
pub fn parse_repositories(text: &str) -> Vec<Value> {
  content_lines(text)
    .filter_map(|line| line.split_whitespace().next())
    .map(url_entry)
    .collect()
}

/// `name url` per line. Anything else is passed through as a raw string.
pub fn parse_targets(text: &str) -> Vec<Value> {
  content_lines(text)
    .map(|line| {
      let parts: Vec<&str> = line.split_whitespace().collect();
      match parts.as_slice() {
        [name, url] => {
          let mut map = serde_yaml::Mapping::new();
          map.insert(Value::from("name"), Value::from(*name));
          map.insert(Value::from("url"), Value::from(*url));
          Value::Mapping(map)
        },
        _ => Value::String(line.to_owned()),
      }
    })
    .collect()
}

pub fn read_repositories_file(path: &Path) -> Result<Vec<Value>, ConfigError> {
  let entries = parse_repositories(&read(path)?);
  info!("Loaded {} repository lines from {}", entries.len(), path.display());
  Ok(entries)
}

pub fn read_targets_file(path: &Path) -> Result<Vec<Value>, ConfigError> {
  let entries = parse_targets(&read(path)?);
  info!("Loaded {} target lines from {}", entries.len(), path.display());
  Ok(entries)
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
  let expanded = match path.strip_prefix("~") {
    Ok(rest) => match std::env::var_os("HOME") {
      Some(home) => PathBuf::from(home).join(rest),
      None => path.to_path_buf(),
    },
    Err(_) => path.to_path_buf(),
  };
  if expanded.is_absolute() {
    expanded
  } else {
    base.join(expanded)
  }
}
