// Copyright 2026 the modload authors. MIT license.

use crate::error::generic_error;
use crate::error::AnyError;
use crate::error::LoadError;
use crate::error::LoadErrorKind;
use crate::module_specifier::ModuleId;
use crate::modules::ExportValue;
use crate::modules::FETCH_TEXT;
use crate::modules::FETCH_WORKER;
use crate::runtime::Loader;
use crate::runtime::ScopedRequire;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::rc::Rc;

/// Plugin prefixes that complete without any asynchronous work, so a
/// single-name `require` can resolve them synchronously.
pub(crate) const SYNC_PLUGINS: [&str; 2] = ["asset-url", "webworker"];

/// Completion handle for one plugin load. Consuming it registers a
/// synthetic value declaration under the full plugin-prefixed identifier
/// and re-drives the load queue.
pub struct PluginDone {
  loader: Loader,
  id: ModuleId,
}

impl PluginDone {
  pub(crate) fn new(loader: Loader, id: ModuleId) -> Self {
    Self { loader, id }
  }

  /// The full plugin-prefixed identifier being loaded.
  pub fn id(&self) -> &ModuleId {
    &self.id
  }

  pub fn value(self, value: ExportValue) {
    self.loader.finish_plugin_value(self.id, value);
  }

  pub fn error(self, err: AnyError) {
    let err = LoadError::new(
      LoadErrorKind::LoadFailed,
      self.id.clone(),
      None,
      format!("Error loading {}: {:#}", self.id, err),
    );
    self.loader.fail_load(err);
  }

  /// Completes asynchronously: the future joins the loader's in-flight set
  /// and its value (or error) lands when the loader is next driven.
  pub fn wait(
    self,
    fut: LocalBoxFuture<'static, Result<ExportValue, AnyError>>,
  ) {
    self.loader.spawn_plugin_wait(self.id, fut);
  }
}

/// A named loader extension. `resource` is the identifier with this
/// plugin's own prefix stripped (chained prefixes still attached);
/// `require` is scoped to the full identifier being loaded.
pub trait LoaderPlugin {
  fn load(&self, resource: &str, require: ScopedRequire, done: PluginDone);
}

/// `text!resource`: fetch the resource as UTF-8 text (cache-aware) and
/// register the text itself as the export.
struct TextPlugin;

impl LoaderPlugin for TextPlugin {
  fn load(&self, resource: &str, require: ScopedRequire, done: PluginDone) {
    let url = require.to_url(resource, "");
    if !require.mark_fetched(&url, FETCH_TEXT) {
      // The in-flight fetch registers the definition.
      return;
    }
    let fut = require.fetch_text_cached(url);
    done.wait(
      async move {
        let text = fut.await?;
        Ok(ExportValue::text(text))
      }
      .boxed_local(),
    );
  }
}

/// `json!resource`: delegate to the text plugin, parse, and register the
/// parsed value.
struct JsonPlugin;

impl LoaderPlugin for JsonPlugin {
  fn load(&self, resource: &str, require: ScopedRequire, done: PluginDone) {
    let text_id = format!("text!{}", resource);
    require.request_result(&[text_id.as_str()], move |result| match result {
      Ok(values) => {
        match values.first().and_then(|value| value.as_str()) {
          Some(text) => match serde_json::from_str(text) {
            Ok(value) => done.value(ExportValue::Json(value)),
            Err(err) => done.error(err.into()),
          },
          None => {
            done.error(generic_error("text plugin produced a non-text export"))
          }
        }
      }
      Err(err) => done.error(err.into()),
    });
  }
}

/// `asset-url!resource`: register the computed absolute URL of a static
/// asset without fetching it.
struct AssetUrlPlugin;

impl LoaderPlugin for AssetUrlPlugin {
  fn load(&self, resource: &str, require: ScopedRequire, done: PluginDone) {
    let name = resource.rsplit('!').next().unwrap_or(resource);
    done.value(ExportValue::Url(require.to_asset_url(name)));
  }
}

/// `webworker!resource`: register the computed absolute script URL for use
/// as a worker entry point without fetching or executing it.
struct WebworkerPlugin;

impl LoaderPlugin for WebworkerPlugin {
  fn load(&self, resource: &str, require: ScopedRequire, done: PluginDone) {
    let name = resource.rsplit('!').next().unwrap_or(resource);
    let url = require.to_url(name, ".js");
    if !require.mark_fetched(&url, FETCH_WORKER) {
      return;
    }
    done.value(ExportValue::Url(url));
  }
}

/// `architect!resource`: an ordinary script load of the prefixed
/// identifier; the activation engine wraps the factory for deferred
/// two-phase initialization.
struct ArchitectPlugin;

impl LoaderPlugin for ArchitectPlugin {
  fn load(&self, resource: &str, require: ScopedRequire, _done: PluginDone) {
    // The definitions arrive from the script execution itself.
    require
      .loader()
      .dispatch_script(resource, require.parent().clone());
  }
}

pub(crate) fn builtin_plugins() -> Vec<(&'static str, Rc<dyn LoaderPlugin>)> {
  vec![
    ("text", Rc::new(TextPlugin)),
    ("json", Rc::new(JsonPlugin)),
    ("asset-url", Rc::new(AssetUrlPlugin)),
    ("webworker", Rc::new(WebworkerPlugin)),
    ("architect", Rc::new(ArchitectPlugin)),
  ]
}
