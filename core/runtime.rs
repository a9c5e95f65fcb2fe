// Copyright 2026 the modload authors. MIT license.

// Implementation note: the loader is a single-threaded, event-driven
// context. Every method borrows the interior state only for short,
// non-overlapping windows and releases it before invoking factories,
// callbacks or plugins, all of which may re-enter the loader.

use crate::cache::CacheStore;
use crate::cache::ContentCache;
use crate::cache::MemoryCacheStore;
use crate::config::Capabilities;
use crate::config::LoaderConfig;
use crate::config::LoaderOptions;
use crate::error::AnyError;
use crate::error::LoadError;
use crate::error::LoadErrorKind;
use crate::error::generic_error;
use crate::fetcher::ScriptHost;
use crate::fetcher::ScriptOutcome;
use crate::fetcher::SourceFetcher;
use crate::module_specifier::ModuleId;
use crate::module_specifier::RESERVED_IDS;
use crate::module_specifier::normalize;
use crate::modules::Declaration;
use crate::modules::ErrorCallback;
use crate::modules::ExportFn;
use crate::modules::ExportValue;
use crate::modules::ExportsObject;
use crate::modules::FETCH_SCRIPT;
use crate::modules::FactoryArg;
use crate::modules::FactoryFn;
use crate::modules::ModuleFactory;
use crate::modules::ModuleHandle;
use crate::modules::PendingRequest;
use crate::modules::RawDefinition;
use crate::modules::Registry;
use crate::modules::SuccessCallback;
use crate::plugins::LoaderPlugin;
use crate::plugins::PluginDone;
use crate::plugins::SYNC_PLUGINS;
use crate::plugins::builtin_plugins;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::task::Context;
use std::task::Poll;

const ARCHITECT_PREFIX: &str = "architect";

/// A pre-registered substitute declaration for scripts that register no
/// definition themselves. A shim without a factory exports `null` once its
/// dependencies are loaded.
#[derive(Clone, Debug)]
pub struct Shim {
  pub deps: Vec<String>,
  pub factory: Option<ModuleFactory>,
}

enum PluginSlot {
  Ready(Rc<dyn LoaderPlugin>),
  /// The implementation module is being loaded; resources requested in the
  /// meantime are buffered and re-driven together once it is ready.
  Loading { waiting: Vec<ModuleId> },
}

struct CacheFill {
  text: String,
  validator: String,
}

enum LoadCompletion {
  Script {
    id: ModuleId,
    url: String,
    deps_hint: Option<Vec<String>>,
    cache_fill: Option<CacheFill>,
    result: Result<ScriptOutcome, LoadError>,
  },
  PluginValue {
    id: ModuleId,
    result: Result<ExportValue, LoadError>,
  },
  CacheReconciled {
    result: Result<usize, AnyError>,
  },
  CacheWrite {
    result: Result<(), AnyError>,
  },
}

pub(crate) enum ActivateError {
  /// Not activatable yet; the transitive closure of unavailable
  /// dependencies, for the caller to enqueue.
  Missing(Vec<ModuleId>),
  Failed(LoadError),
}

struct LoaderInner {
  registry: RefCell<Registry>,
  queue: RefCell<Vec<PendingRequest>>,
  plugins: RefCell<HashMap<String, PluginSlot>>,
  shims: RefCell<HashMap<String, Shim>>,
  config: RefCell<LoaderConfig>,
  capabilities: Capabilities,
  cache: ContentCache,
  in_flight: RefCell<FuturesUnordered<LocalBoxFuture<'static, LoadCompletion>>>,
  fetcher: Rc<dyn SourceFetcher>,
  host: Rc<dyn ScriptHost>,
}

/// The loader context: registry, load queue, plugin table, configuration
/// and the in-flight set, behind one cheaply clonable handle. There are no
/// module-level singletons; independent loaders coexist freely.
#[derive(Clone)]
pub struct Loader {
  inner: Rc<LoaderInner>,
}

impl Loader {
  pub fn new(
    options: LoaderOptions,
    capabilities: Capabilities,
    fetcher: Rc<dyn SourceFetcher>,
    host: Rc<dyn ScriptHost>,
  ) -> Self {
    Self::with_cache_store(
      options,
      capabilities,
      fetcher,
      host,
      Rc::new(MemoryCacheStore::default()),
    )
  }

  pub fn with_cache_store(
    options: LoaderOptions,
    capabilities: Capabilities,
    fetcher: Rc<dyn SourceFetcher>,
    host: Rc<dyn ScriptHost>,
    store: Rc<dyn CacheStore>,
  ) -> Self {
    let config = LoaderConfig::from_options(options);
    let mut plugins = HashMap::new();
    for (prefix, plugin) in builtin_plugins() {
      plugins.insert(prefix.to_string(), PluginSlot::Ready(plugin));
    }
    let loader = Self {
      inner: Rc::new(LoaderInner {
        registry: RefCell::new(Registry::new()),
        queue: RefCell::new(Vec::new()),
        plugins: RefCell::new(plugins),
        shims: RefCell::new(HashMap::new()),
        config: RefCell::new(config),
        capabilities,
        cache: ContentCache::new(store),
        in_flight: RefCell::new(FuturesUnordered::new()),
        fetcher,
        host,
      }),
    };
    loader.sync_cache_state();
    loader
  }

  /// Merges `options` into the active configuration.
  pub fn configure(&self, options: LoaderOptions) {
    self.inner.config.borrow_mut().apply(options);
    self.sync_cache_state();
  }

  /// Replaces the configuration wholesale.
  pub fn reset_config(&self, options: LoaderOptions) {
    *self.inner.config.borrow_mut() = LoaderConfig::from_options(options);
    self.sync_cache_state();
  }

  /// A snapshot of the active configuration.
  pub fn config(&self) -> LoaderConfig {
    self.inner.config.borrow().clone()
  }

  /// Drops all registry state, pending requests, shims, custom plugins and
  /// in-flight loads. The configuration survives.
  pub fn reset(&self) {
    *self.inner.registry.borrow_mut() = Registry::new();
    self.inner.queue.borrow_mut().clear();
    self.inner.shims.borrow_mut().clear();
    {
      let mut plugins = self.inner.plugins.borrow_mut();
      plugins.clear();
      for (prefix, plugin) in builtin_plugins() {
        plugins.insert(prefix.to_string(), PluginSlot::Ready(plugin));
      }
    }
    *self.inner.in_flight.borrow_mut() = FuturesUnordered::new();
  }

  pub fn register_shim(
    &self,
    name: &str,
    deps: &[&str],
    factory: Option<ModuleFactory>,
  ) {
    self.inner.shims.borrow_mut().insert(
      name.to_string(),
      Shim {
        deps: deps.iter().map(|d| d.to_string()).collect(),
        factory,
      },
    );
  }

  /// Registers (or replaces) a loader plugin under `prefix`. Resources
  /// buffered behind a pending bootstrap of the same prefix are re-driven.
  pub fn register_plugin(&self, prefix: &str, plugin: Rc<dyn LoaderPlugin>) {
    let waiting = {
      let mut plugins = self.inner.plugins.borrow_mut();
      match plugins.insert(prefix.to_string(), PluginSlot::Ready(plugin)) {
        Some(PluginSlot::Loading { waiting }) => waiting,
        _ => Vec::new(),
      }
    };
    self.redrive(waiting);
  }

  /// Registers a named module. Dependencies default to the standard
  /// `require`/`exports`/`module` injection for function factories.
  pub fn define(
    &self,
    name: &str,
    deps: Option<&[&str]>,
    factory: ModuleFactory,
  ) -> Result<(), AnyError> {
    let deps = deps.map(|deps| deps.iter().map(|d| d.to_string()).collect());
    if let Some(id) = self.register_raw(name, deps, factory)? {
      self.process_queue(&[id]);
    }
    Ok(())
  }

  /// Synchronously resolves a single name: returns the export when it is
  /// already materialized, or can be materialized without waiting (worker
  /// scopes and synchronous plugins).
  pub fn require(&self, name: &str) -> Option<ExportValue> {
    self.require_from("", name)
  }

  pub(crate) fn require_from(
    &self,
    parent: &str,
    name: &str,
  ) -> Option<ExportValue> {
    let id = normalize(parent, name).ok()?;
    match self.activate(&id) {
      Ok(value) => Some(value),
      Err(_) => {
        let sync_plugin = id
          .head_plugin()
          .map(|p| SYNC_PLUGINS.contains(&p))
          .unwrap_or(false);
        if self.inner.capabilities.worker_scope || sync_plugin {
          self.request_normalized(vec![id.clone()], None, None);
          self.activate(&id).ok()
        } else {
          None
        }
      }
    }
  }

  /// Requests a batch of names; `on_success` fires with the materialized
  /// values once every dependency is available, `on_error` fires (exactly
  /// once) if any of them fails to load.
  pub fn request(
    &self,
    names: &[&str],
    on_success: impl FnOnce(Vec<ExportValue>) + 'static,
    on_error: impl FnOnce(LoadError) + 'static,
  ) {
    self.request_from("", names, on_success, on_error);
  }

  pub fn request_from(
    &self,
    parent: &str,
    names: &[&str],
    on_success: impl FnOnce(Vec<ExportValue>) + 'static,
    on_error: impl FnOnce(LoadError) + 'static,
  ) {
    let deps: Result<Vec<ModuleId>, LoadError> = names
      .iter()
      .map(|raw| {
        normalize(parent, raw).map_err(|e| LoadError::invalid_name(raw, &e))
      })
      .collect();
    match deps {
      Ok(deps) => self.request_normalized(
        deps,
        Some(Box::new(on_success)),
        Some(Box::new(on_error)),
      ),
      Err(err) => on_error(err),
    }
  }

  /// Callback form folding both outcomes into one `Result`.
  pub fn request_result(
    &self,
    parent: &str,
    names: &[&str],
    cb: impl FnOnce(Result<Vec<ExportValue>, LoadError>) + 'static,
  ) {
    let cb = Rc::new(RefCell::new(Some(cb)));
    let ok = cb.clone();
    let fail = cb;
    self.request_from(
      parent,
      names,
      move |values| {
        if let Some(cb) = ok.borrow_mut().take() {
          cb(Ok(values));
        }
      },
      move |err| {
        if let Some(cb) = fail.borrow_mut().take() {
          cb(Err(err));
        }
      },
    );
  }

  /// Async convenience over [`Loader::request`]: drives the in-flight set
  /// until this batch resolves or fails.
  pub async fn import(
    &self,
    names: &[&str],
  ) -> Result<Vec<ExportValue>, AnyError> {
    let slot: Rc<RefCell<Option<Result<Vec<ExportValue>, LoadError>>>> =
      Rc::new(RefCell::new(None));
    let ok = slot.clone();
    let fail = slot.clone();
    self.request(
      names,
      move |values| {
        ok.borrow_mut().replace(Ok(values));
      },
      move |err| {
        fail.borrow_mut().replace(Err(err));
      },
    );
    futures::future::poll_fn(|cx| {
      if let Some(result) = slot.borrow_mut().take() {
        return Poll::Ready(result.map_err(AnyError::from));
      }
      match self.poll_loads(cx) {
        Poll::Ready(()) => match slot.borrow_mut().take() {
          Some(result) => Poll::Ready(result.map_err(AnyError::from)),
          None => Poll::Ready(Err(generic_error(format!(
            "module load stalled for {:?}",
            names
          )))),
        },
        Poll::Pending => match slot.borrow_mut().take() {
          Some(result) => Poll::Ready(result.map_err(AnyError::from)),
          None => Poll::Pending,
        },
      }
    })
    .await
  }

  /// Polls the in-flight set to completion. Resolves once the loader is
  /// idle; request callbacks fire along the way.
  pub async fn drive(&self) {
    futures::future::poll_fn(|cx| self.poll_loads(cx)).await
  }

  fn poll_loads(&self, cx: &mut Context) -> Poll<()> {
    loop {
      // The borrow must not outlive the poll: completions re-enter the
      // loader and push new loads.
      let next = self.inner.in_flight.borrow_mut().poll_next_unpin(cx);
      match next {
        Poll::Ready(Some(completion)) => self.finish_load(completion),
        Poll::Ready(None) => return Poll::Ready(()),
        Poll::Pending => return Poll::Pending,
      }
    }
  }

  /// Computes the physical URL for `name` under the active configuration.
  pub fn to_url(&self, name: &str, ext: &str) -> String {
    self.inner.config.borrow().to_url(name, ext)
  }

  pub fn has_export(&self, name: &str) -> bool {
    match normalize("", name) {
      Ok(id) => self.inner.registry.borrow().has_export(id.as_str()),
      Err(_) => false,
    }
  }

  pub fn is_declared(&self, name: &str) -> bool {
    match normalize("", name) {
      Ok(id) => self.inner.registry.borrow().is_declared(id.as_str()),
      Err(_) => false,
    }
  }

  pub fn recorded_error(&self, name: &str) -> Option<LoadError> {
    let id = normalize("", name).ok()?;
    self.inner.registry.borrow().error(id.as_str()).cloned()
  }

  /// The content cache handle (for `clear` and store inspection).
  pub fn cache(&self) -> &ContentCache {
    &self.inner.cache
  }

  /// Purges cached state for one identifier, or — recursively — for an
  /// entire identifier subtree including plugin/resource pairs sharing
  /// that root. Prefix matching respects path-segment boundaries.
  pub fn undef(&self, name: &str, recursive: bool) {
    let Ok(id) = normalize("", name) else {
      return;
    };
    if !recursive {
      let url = self.inner.config.borrow().to_url(id.as_str(), ".js");
      self.inner.registry.borrow_mut().undef_one(id.as_str(), &url);
      return;
    }
    let root = format!("{}/", id.as_str().trim_end_matches('/'));
    let known = self.inner.registry.borrow().known_ids();
    let config = self.inner.config.borrow().clone();
    let mut registry = self.inner.registry.borrow_mut();
    for key in known {
      if key == id || key.as_str().starts_with(&root) {
        let url = config.to_url(key.as_str(), ".js");
        registry.undef_one(key.as_str(), &url);
      }
      if key.has_plugin() {
        let head = key.head_plugin().unwrap_or("").to_string();
        let rest = key.rest().to_string();
        if rest == *id.as_str()
          || rest.starts_with(&root)
          || head.starts_with(&root)
        {
          let url = config.to_url(key.as_str(), "");
          registry.undef_one(key.as_str(), &url);
          let rest_url = config.to_url(&rest, "");
          registry.undef_one(&rest, &rest_url);
        }
      }
    }
  }

  // --- resolution & activation -------------------------------------------

  fn request_normalized(
    &self,
    deps: Vec<ModuleId>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
  ) {
    // Identifiers that already failed fail the whole request immediately;
    // the physical load is not re-attempted.
    let recorded = {
      let registry = self.inner.registry.borrow();
      deps.iter().find_map(|dep| registry.error(dep.as_str()).cloned())
    };
    if let Some(err) = recorded {
      if let Some(cb) = on_error {
        cb(err);
      }
      return;
    }

    let missing = self.inner.registry.borrow().check_missing(&deps);
    if missing.is_empty() {
      match self.materialize(&deps) {
        Ok(values) => {
          if let Some(cb) = on_success {
            cb(values);
          }
        }
        // Dependencies discovered mid-activation: enqueue for them.
        Err(ActivateError::Missing(more)) => {
          self.enqueue(deps, more, on_success, on_error)
        }
        Err(ActivateError::Failed(err)) => {
          if let Some(cb) = on_error {
            cb(err);
          }
        }
      }
    } else {
      self.enqueue(deps, missing, on_success, on_error);
    }
  }

  fn enqueue(
    &self,
    deps: Vec<ModuleId>,
    missing: Vec<ModuleId>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
  ) {
    log::debug!(
      "queueing request, missing [{}]",
      missing
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
    );
    self
      .inner
      .queue
      .borrow_mut()
      .push(PendingRequest::new(deps, &missing, on_success, on_error));
    let mut to_dispatch = Vec::new();
    {
      let mut registry = self.inner.registry.borrow_mut();
      for id in &missing {
        // Dedup before dispatch: one physical load per identifier no
        // matter how many requests reference it.
        if registry.mark_loading(id) {
          to_dispatch.push(id.clone());
        }
      }
    }
    for id in to_dispatch {
      self.dispatch(&id);
    }
  }

  fn materialize(
    &self,
    deps: &[ModuleId],
  ) -> Result<Vec<ExportValue>, ActivateError> {
    deps
      .iter()
      .map(|dep| {
        if dep.is_reserved() {
          Ok(ExportValue::Json(Value::Null))
        } else {
          self.activate(dep)
        }
      })
      .collect()
  }

  /// Executes a declared module's factory exactly once, injecting its
  /// resolved dependencies, and memoizes the export value.
  fn activate(&self, id: &ModuleId) -> Result<ExportValue, ActivateError> {
    if let Some(value) =
      self.inner.registry.borrow().export(id.as_str()).cloned()
    {
      return Ok(value);
    }
    let (deps, factory, exports) = {
      let registry = self.inner.registry.borrow();
      match registry.declaration(id.as_str()) {
        Some(decl) => {
          (decl.deps.clone(), decl.factory.clone(), decl.exports.clone())
        }
        None => {
          return Err(ActivateError::Failed(LoadError::not_declared(id)));
        }
      }
    };
    let missing = self.inner.registry.borrow().check_missing(&deps);
    if !missing.is_empty() {
      return Err(ActivateError::Missing(missing));
    }

    let keep_loaders = self.inner.config.borrow().keep_loaders;

    let value = match factory {
      ModuleFactory::Value(value) => value,
      ModuleFactory::Function(factory) => {
        // Publish the in-progress exports object before anything else runs
        // so re-entrant lookups during a dependency cycle observe it
        // instead of re-activating.
        self.inner.registry.borrow_mut().insert_export(
          id.clone(),
          ExportValue::Object(exports.clone()),
        );
        let mut args = Vec::with_capacity(factory.arity().min(deps.len()));
        for dep in deps.iter().take(factory.arity()) {
          let arg = match dep.as_str() {
            "require" => {
              FactoryArg::Require(ScopedRequire::new(self.clone(), id.clone()))
            }
            "exports" => FactoryArg::Exports(exports.clone()),
            "module" => FactoryArg::Module(ModuleHandle {
              id: id.clone(),
              exports: exports.clone(),
            }),
            _ => match self.activate(dep) {
              Ok(value) => FactoryArg::Export(value),
              Err(err) => {
                self.inner.registry.borrow_mut().remove_export(id.as_str());
                return Err(err);
              }
            },
          };
          args.push(arg);
        }
        if id.head_plugin() == Some(ARCHITECT_PREFIX) {
          architect_wrap(factory, args, exports)
        } else {
          match factory.call(&args) {
            Ok(Some(value)) => value,
            Ok(None) => ExportValue::Object(exports),
            Err(err) => {
              let err = LoadError::factory_failed(id, &err);
              let mut registry = self.inner.registry.borrow_mut();
              registry.remove_export(id.as_str());
              registry.record_error(err.clone());
              return Err(ActivateError::Failed(err));
            }
          }
        }
      }
    };

    let mut registry = self.inner.registry.borrow_mut();
    registry.insert_export(id.clone(), value.clone());
    if !keep_loaders {
      registry.remove_declaration(id.as_str());
    }
    Ok(value)
  }

  // --- physical dispatch --------------------------------------------------

  fn dispatch(&self, id: &ModuleId) {
    log::debug!("dispatch {}", id);
    match id.head_plugin() {
      Some(prefix) => {
        let prefix = prefix.to_string();
        self.dispatch_plugin(prefix, id);
      }
      None => self.dispatch_script(id.as_str(), id.clone()),
    }
  }

  fn dispatch_plugin(&self, prefix: String, id: &ModuleId) {
    enum Action {
      Invoke(Rc<dyn LoaderPlugin>),
      Bootstrap,
      Buffered,
    }
    let action = {
      let mut plugins = self.inner.plugins.borrow_mut();
      match plugins.get_mut(&prefix) {
        Some(PluginSlot::Ready(plugin)) => Action::Invoke(plugin.clone()),
        Some(PluginSlot::Loading { waiting }) => {
          waiting.push(id.clone());
          Action::Buffered
        }
        None => {
          if self.inner.config.borrow().base_url.is_empty() {
            log::error!("module loader plugin \"{}\" missing", prefix);
            Action::Buffered
          } else {
            plugins.insert(
              prefix.clone(),
              PluginSlot::Loading {
                waiting: vec![id.clone()],
              },
            );
            Action::Bootstrap
          }
        }
      }
    };
    match action {
      Action::Invoke(plugin) => {
        let require = ScopedRequire::new(self.clone(), id.clone());
        let done = PluginDone::new(self.clone(), id.clone());
        plugin.load(id.rest(), require, done);
      }
      Action::Bootstrap => {
        // Load the plugin implementation itself as an ordinary module,
        // then wrap its export and re-drive everything that queued up
        // behind it.
        let ok = self.clone();
        let ok_prefix = prefix.clone();
        let fail = self.clone();
        let fail_prefix = prefix.clone();
        self.request_normalized(
          vec![ModuleId::from_canonical(prefix)],
          Some(Box::new(move |values| {
            ok.finish_plugin_bootstrap(&ok_prefix, values.into_iter().next());
          })),
          Some(Box::new(move |err| {
            fail.fail_plugin_bootstrap(&fail_prefix, err);
          })),
        );
      }
      Action::Buffered => {}
    }
  }

  fn finish_plugin_bootstrap(&self, prefix: &str, value: Option<ExportValue>) {
    let plugin = match value {
      Some(ExportValue::Plugin(plugin)) => plugin,
      _ => {
        log::error!(
          "module \"{}\" does not export a loader plugin",
          prefix
        );
        let err = LoadError::new(
          LoadErrorKind::LoadFailed,
          ModuleId::from_canonical(prefix.to_string()),
          None,
          format!("Module \"{}\" does not export a loader plugin", prefix),
        );
        self.fail_plugin_bootstrap(prefix, err);
        return;
      }
    };
    let waiting = {
      let mut plugins = self.inner.plugins.borrow_mut();
      match plugins.insert(prefix.to_string(), PluginSlot::Ready(plugin)) {
        Some(PluginSlot::Loading { waiting }) => waiting,
        _ => Vec::new(),
      }
    };
    self.redrive(waiting);
  }

  fn fail_plugin_bootstrap(&self, prefix: &str, err: LoadError) {
    let waiting = {
      let mut plugins = self.inner.plugins.borrow_mut();
      match plugins.remove(prefix) {
        Some(PluginSlot::Loading { waiting }) => waiting,
        Some(other) => {
          plugins.insert(prefix.to_string(), other);
          Vec::new()
        }
        None => Vec::new(),
      }
    };
    for id in waiting {
      self.fail_load(LoadError::new(
        LoadErrorKind::LoadFailed,
        id.clone(),
        None,
        format!("Loader plugin \"{}\" failed to load: {}", prefix, err),
      ));
    }
  }

  fn redrive(&self, waiting: Vec<ModuleId>) {
    let mut to_dispatch = Vec::new();
    {
      let mut registry = self.inner.registry.borrow_mut();
      for id in &waiting {
        registry.clear_loading(id.as_str());
      }
      for id in &waiting {
        if registry.mark_loading(id) {
          to_dispatch.push(id.clone());
        }
      }
    }
    for id in to_dispatch {
      self.dispatch(&id);
    }
  }

  /// Performs a physical script load for `url_name`, attributed to the
  /// identifier `trigger`. Idempotent per URL for the script load kind.
  pub(crate) fn dispatch_script(&self, url_name: &str, trigger: ModuleId) {
    let (url, timeout) = {
      let config = self.inner.config.borrow();
      (config.to_url(url_name, ".js"), config.load_timeout)
    };
    if !self.inner.registry.borrow_mut().mark_fetched(&url, FETCH_SCRIPT) {
      return;
    }

    // Worker-style hosts load and execute synchronously in place.
    if self.inner.capabilities.worker_scope {
      if let Some(result) = self.inner.host.execute_sync(&url) {
        match result {
          Ok(outcome) => self.finish_script(trigger, url, None, None, outcome),
          Err(err) => {
            let err = LoadError::load_failed(&trigger, &url, &err);
            self.fail_load(err);
          }
        }
        return;
      }
    }

    let host = self.inner.host.clone();
    let fetcher = self.inner.fetcher.clone();
    let cache = self.inner.cache.clone();
    let use_cache = cache.enabled();
    let timeout_id = trigger.clone();
    let timeout_url = url.clone();
    let id = trigger;

    let fut = async move {
      if use_cache {
        // Cache-aware path: serve from the store when possible, otherwise
        // fetch the text ourselves and evaluate it, remembering the bytes
        // for a validator-gated store.
        match cache.get(&url).await {
          Ok(Some(entry)) => {
            let result = host
              .evaluate(&url, &entry.text)
              .map_err(|e| LoadError::load_failed(&id, &url, &e));
            return LoadCompletion::Script {
              id,
              url,
              deps_hint: entry.deps,
              cache_fill: None,
              result,
            };
          }
          Ok(None) => {}
          Err(err) => {
            log::debug!("content cache read failed for {}: {:#}", url, err);
          }
        }
        return match fetcher.fetch_text(&url).await {
          Ok(response) => {
            let result = host
              .evaluate(&url, &response.text)
              .map_err(|e| LoadError::load_failed(&id, &url, &e));
            let cache_fill = response.validator.map(|validator| CacheFill {
              text: response.text,
              validator,
            });
            LoadCompletion::Script {
              id,
              url,
              deps_hint: None,
              cache_fill,
              result,
            }
          }
          Err(err) => {
            let failure = LoadError::load_failed(&id, &url, &err);
            LoadCompletion::Script {
              id,
              url,
              deps_hint: None,
              cache_fill: None,
              result: Err(failure),
            }
          }
        };
      }

      let result = host
        .execute(&url)
        .await
        .map_err(|e| LoadError::load_failed(&id, &url, &e));
      LoadCompletion::Script {
        id,
        url,
        deps_hint: None,
        cache_fill: None,
        result,
      }
    };

    // The declaration-arrived wait is bounded; an elapsed timeout is a
    // distinct failure kind.
    let fut: LocalBoxFuture<'static, LoadCompletion> = match timeout {
      Some(duration) => async move {
        match tokio::time::timeout(duration, fut).await {
          Ok(completion) => completion,
          Err(_) => {
            let err = LoadError::timeout(&timeout_id, &timeout_url);
            LoadCompletion::Script {
              id: timeout_id,
              url: timeout_url,
              deps_hint: None,
              cache_fill: None,
              result: Err(err),
            }
          }
        }
      }
      .boxed_local(),
      None => fut.boxed_local(),
    };
    self.inner.in_flight.borrow_mut().push(fut);
  }

  // --- completion processing ---------------------------------------------

  fn finish_load(&self, completion: LoadCompletion) {
    match completion {
      LoadCompletion::Script {
        id,
        url,
        deps_hint,
        cache_fill,
        result,
      } => match result {
        Ok(outcome) => {
          self.finish_script(id, url, deps_hint, cache_fill, outcome)
        }
        Err(err) => self.fail_load(err),
      },
      LoadCompletion::PluginValue { id, result } => match result {
        Ok(value) => self.finish_plugin_value(id, value),
        Err(err) => self.fail_load(err),
      },
      LoadCompletion::CacheReconciled { result } => match result {
        Ok(evicted) => {
          log::debug!("content cache reconciled, {} stale entries evicted", evicted)
        }
        Err(err) => {
          log::debug!("content cache reconciliation failed: {:#}", err)
        }
      },
      LoadCompletion::CacheWrite { result } => {
        if let Err(err) = result {
          log::debug!("content cache write failed: {:#}", err);
        }
      }
    }
  }

  fn finish_script(
    &self,
    trigger: ModuleId,
    url: String,
    deps_hint: Option<Vec<String>>,
    cache_fill: Option<CacheFill>,
    outcome: ScriptOutcome,
  ) {
    let mut anonymous: Option<RawDefinition> = None;
    let mut named: Vec<RawDefinition> = Vec::new();
    for definition in outcome.definitions {
      if definition.name.is_some() {
        named.push(definition);
      } else if anonymous.is_some() {
        self.fail_load(LoadError::definition_conflict(&trigger, &url));
        return;
      } else {
        anonymous = Some(definition);
      }
    }

    let mut newly: Vec<ModuleId> = Vec::new();
    for definition in named {
      let RawDefinition {
        name,
        deps,
        factory,
      } = definition;
      let Some(name) = name else {
        continue;
      };
      match self.register_raw(&name, deps, factory) {
        Ok(Some(id)) => newly.push(id),
        Ok(None) => {}
        Err(err) => log::debug!("skipping definition \"{}\": {}", name, err),
      }
    }

    if let Some(definition) = anonymous {
      // An anonymous definition pairs with the identifier that triggered
      // this script execution; cached dependency metadata pre-fills the
      // dependency list when the definition brought none.
      let deps = definition.deps.or(deps_hint);
      match self.register_raw(trigger.as_str(), deps, definition.factory) {
        Ok(Some(id)) => newly.push(id),
        Ok(None) => {}
        Err(err) => {
          log::debug!("skipping definition \"{}\": {}", trigger, err)
        }
      }
    } else {
      let declared = {
        let registry = self.inner.registry.borrow();
        registry.is_declared(trigger.as_str())
          || registry.has_export(trigger.as_str())
      };
      if !declared {
        let shim = self.inner.shims.borrow().get(trigger.as_str()).cloned();
        match shim {
          Some(shim) => {
            let factory = shim
              .factory
              .unwrap_or(ModuleFactory::Value(ExportValue::Json(Value::Null)));
            if let Ok(Some(id)) =
              self.register_raw(trigger.as_str(), Some(shim.deps), factory)
            {
              newly.push(id);
            }
          }
          None => {
            self.fail_load(LoadError::no_definition(&trigger, &url));
            return;
          }
        }
      }
    }

    {
      let mut registry = self.inner.registry.borrow_mut();
      registry.clear_loading(trigger.as_str());
      for id in &newly {
        registry.clear_loading(id.as_str());
      }
    }

    if let Some(fill) = cache_fill {
      self.store_in_cache(&trigger, url, fill);
    }

    self.process_queue(&newly);
  }

  fn store_in_cache(&self, trigger: &ModuleId, url: String, fill: CacheFill) {
    if !self.inner.cache.enabled() {
      return;
    }
    let deps = {
      let registry = self.inner.registry.borrow();
      registry.declaration(trigger.as_str()).map(|decl| {
        decl.deps.iter().map(|d| d.as_str().to_string()).collect::<Vec<_>>()
      })
    };
    let cache = self.inner.cache.clone();
    let fut = async move {
      LoadCompletion::CacheWrite {
        result: cache.set(&url, fill.text, Some(fill.validator), deps).await,
      }
    };
    self.inner.in_flight.borrow_mut().push(fut.boxed_local());
  }

  pub(crate) fn finish_plugin_value(&self, id: ModuleId, value: ExportValue) {
    {
      let mut registry = self.inner.registry.borrow_mut();
      registry.insert_declaration(Declaration::new(
        id.clone(),
        Vec::new(),
        ModuleFactory::Value(value),
      ));
      registry.clear_loading(id.as_str());
    }
    self.process_queue(&[id]);
  }

  pub(crate) fn spawn_plugin_wait(
    &self,
    id: ModuleId,
    fut: LocalBoxFuture<'static, Result<ExportValue, AnyError>>,
  ) {
    let completion = async move {
      let result = match fut.await {
        Ok(value) => Ok(value),
        Err(err) => Err(LoadError::new(
          LoadErrorKind::LoadFailed,
          id.clone(),
          None,
          format!("Error loading {}: {:#}", id, err),
        )),
      };
      LoadCompletion::PluginValue { id, result }
    };
    self.inner.in_flight.borrow_mut().push(completion.boxed_local());
  }

  /// Re-scans the queue after `newly` became available. Satisfied requests
  /// re-resolve from scratch so transitively discovered dependencies
  /// re-enqueue instead of resolving prematurely. Callbacks fire in
  /// satisfaction order, not enqueue order.
  fn process_queue(&self, newly: &[ModuleId]) {
    let ready = {
      let mut queue = self.inner.queue.borrow_mut();
      for request in queue.iter_mut() {
        for id in newly {
          request.note_available(id);
        }
      }
      let mut ready = Vec::new();
      let mut i = 0;
      while i < queue.len() {
        if queue[i].is_satisfied() {
          ready.push(queue.remove(i));
        } else if queue[i].is_dead() {
          queue.remove(i);
        } else {
          i += 1;
        }
      }
      ready
    };
    for request in ready {
      let (deps, on_success, on_error) = request.into_parts();
      self.request_normalized(deps, on_success, on_error);
    }
  }

  /// Records a failure against its identifier and fails every pending
  /// request whose membership includes it, exactly once each.
  pub(crate) fn fail_load(&self, err: LoadError) {
    log::debug!("load failed: {}", err);
    let callbacks = {
      let mut registry = self.inner.registry.borrow_mut();
      registry.record_error(err.clone());
      registry.clear_loading(err.id().as_str());
      let mut queue = self.inner.queue.borrow_mut();
      let mut callbacks = Vec::new();
      queue.retain_mut(|request| {
        if request.contains(err.id()) {
          if let Some(cb) = request.fail() {
            callbacks.push(cb);
          }
          false
        } else {
          true
        }
      });
      callbacks
    };
    for cb in callbacks {
      cb(err.clone());
    }
  }

  fn register_raw(
    &self,
    name: &str,
    deps: Option<Vec<String>>,
    factory: ModuleFactory,
  ) -> Result<Option<ModuleId>, LoadError> {
    let id =
      normalize("", name).map_err(|e| LoadError::invalid_name(name, &e))?;
    let raw_deps = match (deps, &factory) {
      (Some(deps), _) => deps,
      (None, ModuleFactory::Function(_)) => {
        RESERVED_IDS.iter().map(|s| s.to_string()).collect()
      }
      (None, ModuleFactory::Value(_)) => Vec::new(),
    };
    let mut dep_ids = Vec::with_capacity(raw_deps.len());
    for raw in &raw_deps {
      dep_ids.push(
        normalize(id.as_str(), raw)
          .map_err(|e| LoadError::invalid_name(raw, &e))?,
      );
    }
    let mut registry = self.inner.registry.borrow_mut();
    let inserted =
      registry.insert_declaration(Declaration::new(id.clone(), dep_ids, factory));
    registry.clear_loading(id.as_str());
    Ok(if inserted { Some(id) } else { None })
  }

  pub(crate) fn fetch_text_cached(
    &self,
    url: String,
  ) -> LocalBoxFuture<'static, Result<String, AnyError>> {
    let cache = self.inner.cache.clone();
    let fetcher = self.inner.fetcher.clone();
    async move {
      match cache.get(&url).await {
        Ok(Some(entry)) => return Ok(entry.text),
        Ok(None) => {}
        Err(err) => {
          log::debug!("content cache read failed for {}: {:#}", url, err);
        }
      }
      let response = fetcher.fetch_text(&url).await?;
      if let Err(err) = cache
        .set(&url, response.text.clone(), response.validator.clone(), None)
        .await
      {
        log::debug!("content cache write failed for {}: {:#}", url, err);
      }
      Ok(response.text)
    }
    .boxed_local()
  }

  fn sync_cache_state(&self) {
    let (allowed, base, transform) = {
      let config = self.inner.config.borrow();
      let mut base = config.base_url.clone();
      if base.starts_with('/') && !config.host.is_empty() {
        base = format!("{}{}", config.host, base);
      }
      (
        config.cache_allowed(&self.inner.capabilities),
        base,
        config.transform_segment(),
      )
    };
    self.inner.cache.set_enabled(allowed);
    if !allowed || base.is_empty() {
      return;
    }
    // One reconciliation pass per session.
    if !self.inner.cache.take_reconcile_ticket() {
      return;
    }
    let fut =
      self.inner.cache.reconcile(self.inner.fetcher.clone(), base, transform);
    self.inner.in_flight.borrow_mut().push(
      async move {
        LoadCompletion::CacheReconciled { result: fut.await }
      }
      .boxed_local(),
    );
  }
}

fn architect_wrap(
  factory: FactoryFn,
  args: Vec<FactoryArg>,
  exports: ExportsObject,
) -> ExportValue {
  // Deferred two-phase initialization: every invocation re-runs the
  // original factory with the originally injected arguments; an export
  // that is itself a function declaring the `consumes` capability is then
  // invoked again with the outer arguments.
  ExportValue::Function(ExportFn::new(move |call_args| {
    let produced = factory.call(&args)?;
    let value =
      produced.unwrap_or_else(|| ExportValue::Object(exports.clone()));
    match value {
      ExportValue::Function(f) if f.consumes() => f.call(call_args),
      other => Ok(other),
    }
  }))
}

/// The `require` pseudo-module injected into factories and handed to
/// plugins: a requester scoped to the identifier it was created for.
#[derive(Clone)]
pub struct ScopedRequire {
  loader: Loader,
  parent: ModuleId,
}

impl ScopedRequire {
  pub(crate) fn new(loader: Loader, parent: ModuleId) -> Self {
    Self { loader, parent }
  }

  pub fn parent(&self) -> &ModuleId {
    &self.parent
  }

  /// Synchronous single-name resolution, relative to the parent.
  pub fn get(&self, name: &str) -> Option<ExportValue> {
    self.loader.require_from(self.parent.as_str(), name)
  }

  pub fn request(
    &self,
    names: &[&str],
    on_success: impl FnOnce(Vec<ExportValue>) + 'static,
    on_error: impl FnOnce(LoadError) + 'static,
  ) {
    self
      .loader
      .request_from(self.parent.as_str(), names, on_success, on_error);
  }

  pub fn request_result(
    &self,
    names: &[&str],
    cb: impl FnOnce(Result<Vec<ExportValue>, LoadError>) + 'static,
  ) {
    self.loader.request_result(self.parent.as_str(), names, cb);
  }

  pub fn to_url(&self, name: &str, ext: &str) -> String {
    self.loader.inner.config.borrow().to_url(name, ext)
  }

  pub fn to_asset_url(&self, name: &str) -> String {
    self.loader.inner.config.borrow().to_asset_url(name)
  }

  /// A snapshot of the loader configuration.
  pub fn config(&self) -> LoaderConfig {
    self.loader.config()
  }

  /// Marks `url` as fetched for a load kind; false when already fetched.
  pub fn mark_fetched(&self, url: &str, kind: u8) -> bool {
    self.loader.inner.registry.borrow_mut().mark_fetched(url, kind)
  }

  /// Cache-aware text fetch through the loader's fetcher.
  pub fn fetch_text_cached(
    &self,
    url: String,
  ) -> LocalBoxFuture<'static, Result<String, AnyError>> {
    self.loader.fetch_text_cached(url)
  }

  pub(crate) fn loader(&self) -> &Loader {
    &self.loader
  }
}
