// Copyright 2026 the modload authors. MIT license.

use crate::error::AnyError;
use crate::modules::RawDefinition;
use futures::future::LocalBoxFuture;

/// A fetched text resource plus the strong validator the server attached to
/// it, if any. Responses without a validator are never stored in the
/// content cache.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TextResponse {
  pub text: String,
  pub validator: Option<String>,
}

impl TextResponse {
  pub fn new(text: impl Into<String>, validator: Option<String>) -> Self {
    Self {
      text: text.into(),
      validator,
    }
  }
}

pub type FetchTextFuture =
  LocalBoxFuture<'static, Result<TextResponse, AnyError>>;
pub type PostFuture = LocalBoxFuture<'static, Result<String, AnyError>>;

/// The network collaborator. The loader never talks to the network itself;
/// it asks this trait for text and hands the staleness-check protocol
/// through `post`.
pub trait SourceFetcher {
  /// GET `url` as UTF-8 text.
  fn fetch_text(&self, url: &str) -> FetchTextFuture;

  /// POST `body` to `url` and return the response body. Used by the
  /// content cache staleness check.
  fn post(&self, url: &str, body: String) -> PostFuture;
}

/// Everything a script registered while it executed.
#[derive(Default)]
pub struct ScriptOutcome {
  pub definitions: Vec<RawDefinition>,
}

impl ScriptOutcome {
  pub fn new(definitions: Vec<RawDefinition>) -> Self {
    Self { definitions }
  }
}

pub type ExecuteFuture =
  LocalBoxFuture<'static, Result<ScriptOutcome, AnyError>>;

/// The script execution collaborator. It can run arbitrary code; the
/// definitions that code registers come back as the completion payload,
/// which is the loader's declaration-arrived event.
pub trait ScriptHost {
  /// Fetch and execute the script at `url`.
  fn execute(&self, url: &str) -> ExecuteFuture;

  /// Execute synchronously in place, the way a worker scope loads scripts.
  /// Hosts without that capability return `None`.
  fn execute_sync(&self, _url: &str) -> Option<Result<ScriptOutcome, AnyError>> {
    None
  }

  /// Evaluate source text that was already fetched on the host's behalf
  /// (the content-cache path).
  fn evaluate(&self, url: &str, source: &str)
    -> Result<ScriptOutcome, AnyError>;
}
