// Copyright 2026 the modload authors. MIT license.

use crate::module_specifier::ModuleId;
use std::borrow::Cow;
use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

/// A generic wrapper that can encapsulate any concrete error type.
pub type AnyError = anyhow::Error;

/// Creates a new error with a caller-specified error class name and message.
pub fn custom_error(
  class: &'static str,
  message: impl Into<Cow<'static, str>>,
) -> AnyError {
  CustomError {
    class,
    message: message.into(),
  }
  .into()
}

pub fn generic_error(message: impl Into<Cow<'static, str>>) -> AnyError {
  custom_error("Error", message)
}

/// A simple error type that lets the creator specify both the error message
/// and the error class name. This type is private; externally it only ever
/// appears wrapped in an `anyhow::Error`. To retrieve the error class name
/// from a wrapped `CustomError`, use the function
/// `get_custom_error_class()`.
#[derive(Debug)]
struct CustomError {
  class: &'static str,
  message: Cow<'static, str>,
}

impl Display for CustomError {
  fn fmt(&self, f: &mut Formatter) -> fmt::Result {
    f.write_str(&self.message)
  }
}

impl std::error::Error for CustomError {}

/// If this error was created with `custom_error()`, return the specified
/// error class name. In all other cases this function returns `None`.
pub fn get_custom_error_class(error: &AnyError) -> Option<&'static str> {
  error.downcast_ref::<CustomError>().map(|e| e.class)
}

/// Error indicating the reason normalizing a raw module name failed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum NormalizeError {
  #[error("empty module name")]
  EmptyName,
  #[error("module name \"{0}\" has an empty plugin segment")]
  EmptyPluginSegment(String),
}

/// The failure kind carried by a [`LoadError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadErrorKind {
  /// A network or script-execution failure. Never retried automatically.
  LoadFailed,
  /// More than one anonymous definition surfaced from a single script
  /// execution. Fatal for that load cycle.
  DefinitionConflict,
  /// The identifier has neither a declaration nor a reachable loader.
  /// A caller-side error, distinct from "still loading".
  NotDeclared,
  /// A script executed to completion without registering a definition and
  /// no shim was configured for it.
  NoDefinition,
  /// The bounded wait for a declaration to arrive elapsed.
  LoadTimeout,
  /// A module factory returned an error during activation.
  FactoryFailed,
  /// The raw module name could not be normalized.
  InvalidName,
}

impl Display for LoadErrorKind {
  fn fmt(&self, f: &mut Formatter) -> fmt::Result {
    let s = match self {
      LoadErrorKind::LoadFailed => "load failed",
      LoadErrorKind::DefinitionConflict => "definition conflict",
      LoadErrorKind::NotDeclared => "not declared",
      LoadErrorKind::NoDefinition => "no definition",
      LoadErrorKind::LoadTimeout => "load timed out",
      LoadErrorKind::FactoryFailed => "factory failed",
      LoadErrorKind::InvalidName => "invalid name",
    };
    f.write_str(s)
  }
}

/// A load failure recorded against a module identifier and propagated to
/// every pending request whose dependency set includes that identifier.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct LoadError {
  kind: LoadErrorKind,
  id: ModuleId,
  path: Option<String>,
  message: String,
}

impl LoadError {
  pub fn new(
    kind: LoadErrorKind,
    id: ModuleId,
    path: Option<String>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      kind,
      id,
      path,
      message: message.into(),
    }
  }

  pub fn load_failed(id: &ModuleId, path: &str, reason: &AnyError) -> Self {
    Self::new(
      LoadErrorKind::LoadFailed,
      id.clone(),
      Some(path.to_string()),
      format!("Error loading script {}: {} ({:#})", id, path, reason),
    )
  }

  pub fn definition_conflict(id: &ModuleId, path: &str) -> Self {
    Self::new(
      LoadErrorKind::DefinitionConflict,
      id.clone(),
      Some(path.to_string()),
      format!("More than one anonymous definition in script {}", path),
    )
  }

  pub fn not_declared(id: &ModuleId) -> Self {
    Self::new(
      LoadErrorKind::NotDeclared,
      id.clone(),
      None,
      format!("Module {} has no declaration and no loader", id),
    )
  }

  pub fn no_definition(id: &ModuleId, path: &str) -> Self {
    Self::new(
      LoadErrorKind::NoDefinition,
      id.clone(),
      Some(path.to_string()),
      format!("Script {} registered no definition for {}", path, id),
    )
  }

  pub fn timeout(id: &ModuleId, path: &str) -> Self {
    Self::new(
      LoadErrorKind::LoadTimeout,
      id.clone(),
      Some(path.to_string()),
      format!("Timed out waiting for a definition from {}: {}", id, path),
    )
  }

  pub fn factory_failed(id: &ModuleId, reason: &AnyError) -> Self {
    Self::new(
      LoadErrorKind::FactoryFailed,
      id.clone(),
      None,
      format!("Factory for module {} failed: {:#}", id, reason),
    )
  }

  pub fn invalid_name(raw: &str, reason: &NormalizeError) -> Self {
    Self::new(
      LoadErrorKind::InvalidName,
      ModuleId::from_canonical(raw.to_string()),
      None,
      format!("Invalid module name \"{}\": {}", raw, reason),
    )
  }

  pub fn kind(&self) -> LoadErrorKind {
    self.kind
  }

  pub fn id(&self) -> &ModuleId {
    &self.id
  }

  pub fn path(&self) -> Option<&str> {
    self.path.as_deref()
  }

  pub fn message(&self) -> &str {
    &self.message
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::module_specifier::normalize;

  #[test]
  fn custom_error_class() {
    let err = custom_error("NotFound", "a thing was not found");
    assert_eq!(get_custom_error_class(&err), Some("NotFound"));
    let err = generic_error("nope");
    assert_eq!(get_custom_error_class(&err), Some("Error"));
  }

  #[test]
  fn load_error_message() {
    let id = normalize("", "app/main").unwrap();
    let err = LoadError::timeout(&id, "/modules/app/main.js");
    assert_eq!(err.kind(), LoadErrorKind::LoadTimeout);
    assert_eq!(err.path(), Some("/modules/app/main.js"));
    assert!(err.to_string().contains("app/main"));
  }
}
