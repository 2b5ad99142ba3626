use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("duplicate manifold name: {0}")]
  DuplicateName(String),

  #[error("manifold '{name}' declares input '{input}' more than once")]
  DuplicateInput { name: String, input: String },

  #[error("manifold '{name}' depends on unknown manifold '{input}'")]
  UnknownInput { name: String, input: String },

  #[error("dependency cycle detected: {}", .path.join(" -> "))]
  CycleDetected { path: Vec<String> },
}
