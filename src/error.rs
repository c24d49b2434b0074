use std::path::PathBuf;

/// Raised when the Registry is handed something other than a list.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("invalid argument: {0}")]
  InvalidArgument(String),
}

/// Failure of a single version-control command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {detail}")]
pub struct CommandError {
  pub operation: String,
  pub detail: String,
}

impl CommandError {
  pub fn new(operation: impl Into<String>, detail: impl Into<String>) -> Self {
    Self { operation: operation.into(), detail: detail.into() }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("cannot read {path}: {source}")]
  Read { path: PathBuf, source: std::io::Error },

  #[error("cannot parse {path}: {source}")]
  Parse { path: PathBuf, source: serde_yaml::Error },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn command_error_display() {
    let err = CommandError::new("git push --mirror backup", "connection refused");
    assert_eq!(err.to_string(), "git push --mirror backup failed: connection refused");
  }

  #[test]
  fn registry_error_display() {
    let err = RegistryError::InvalidArgument("repositories must be a list".to_owned());
    assert_eq!(err.to_string(), "invalid argument: repositories must be a list");
  }
}
