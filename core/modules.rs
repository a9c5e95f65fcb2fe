// Copyright 2026 the modload authors. MIT license.

// Implementation note: the registry deliberately knows nothing about
// physical loading. It tracks declarations, export values, recorded errors
// and in-flight markers; the loader in runtime.rs drives it. Keeping the
// two apart means the resolver and activation bookkeeping can be tested
// without any async machinery.

use crate::error::AnyError;
use crate::error::LoadError;
use crate::module_specifier::ModuleId;
use crate::plugins::LoaderPlugin;
use crate::runtime::ScopedRequire;
use indexmap::IndexSet;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Load kinds recorded per physical URL, preventing duplicate network
/// requests for the same URL.
pub const FETCH_SCRIPT: u8 = 0b001;
pub const FETCH_TEXT: u8 = 0b010;
pub const FETCH_WORKER: u8 = 0b100;

/// The mutable exports object injected into factories as the `exports`
/// pseudo-module. Kept behind an `Rc` so its identity survives activation:
/// dependents that received it mid-cycle observe later mutations.
pub type ExportsObject = Rc<RefCell<serde_json::Map<String, serde_json::Value>>>;

/// A callable export. The `consumes` capability is declared explicitly at
/// construction; the architect two-phase wrapper forwards its invocation
/// arguments only to exports that declare it.
#[derive(Clone)]
pub struct ExportFn {
  consumes: bool,
  f: Rc<dyn Fn(&[ExportValue]) -> Result<ExportValue, AnyError>>,
}

impl ExportFn {
  pub fn new(
    f: impl Fn(&[ExportValue]) -> Result<ExportValue, AnyError> + 'static,
  ) -> Self {
    Self {
      consumes: false,
      f: Rc::new(f),
    }
  }

  /// Like [`ExportFn::new`], but declares the `consumes` capability.
  pub fn consuming(
    f: impl Fn(&[ExportValue]) -> Result<ExportValue, AnyError> + 'static,
  ) -> Self {
    Self {
      consumes: true,
      f: Rc::new(f),
    }
  }

  pub fn consumes(&self) -> bool {
    self.consumes
  }

  pub fn call(&self, args: &[ExportValue]) -> Result<ExportValue, AnyError> {
    (self.f)(args)
  }

  fn ptr_eq(&self, other: &Self) -> bool {
    Rc::ptr_eq(&self.f, &other.f)
  }
}

impl fmt::Debug for ExportFn {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("ExportFn")
      .field("consumes", &self.consumes)
      .finish_non_exhaustive()
  }
}

/// The materialized result of activating a declaration.
#[derive(Clone)]
pub enum ExportValue {
  /// Structured data.
  Json(serde_json::Value),
  /// Plain UTF-8 text.
  Text(Arc<str>),
  /// A computed URL registered without fetching.
  Url(String),
  /// The (possibly mutated) exports object, identity preserved.
  Object(ExportsObject),
  /// A callable export.
  Function(ExportFn),
  /// A module export usable as a loader plugin.
  Plugin(Rc<dyn LoaderPlugin>),
}

impl ExportValue {
  pub fn text(s: impl Into<String>) -> Self {
    ExportValue::Text(Arc::from(s.into()))
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      ExportValue::Text(s) => Some(s),
      ExportValue::Url(s) => Some(s),
      ExportValue::Json(serde_json::Value::String(s)) => Some(s),
      _ => None,
    }
  }

  pub fn as_json(&self) -> Option<&serde_json::Value> {
    match self {
      ExportValue::Json(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_object(&self) -> Option<&ExportsObject> {
    match self {
      ExportValue::Object(o) => Some(o),
      _ => None,
    }
  }

  pub fn as_function(&self) -> Option<&ExportFn> {
    match self {
      ExportValue::Function(f) => Some(f),
      _ => None,
    }
  }

  pub fn as_plugin(&self) -> Option<&Rc<dyn LoaderPlugin>> {
    match self {
      ExportValue::Plugin(p) => Some(p),
      _ => None,
    }
  }
}

impl fmt::Debug for ExportValue {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      ExportValue::Json(v) => f.debug_tuple("Json").field(v).finish(),
      ExportValue::Text(s) => f.debug_tuple("Text").field(s).finish(),
      ExportValue::Url(u) => f.debug_tuple("Url").field(u).finish(),
      ExportValue::Object(o) => f.debug_tuple("Object").field(o).finish(),
      ExportValue::Function(func) => {
        f.debug_tuple("Function").field(func).finish()
      }
      ExportValue::Plugin(_) => f.write_str("Plugin(..)"),
    }
  }
}

impl PartialEq for ExportValue {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (ExportValue::Json(a), ExportValue::Json(b)) => a == b,
      (ExportValue::Text(a), ExportValue::Text(b)) => a == b,
      (ExportValue::Url(a), ExportValue::Url(b)) => a == b,
      (ExportValue::Object(a), ExportValue::Object(b)) => Rc::ptr_eq(a, b),
      (ExportValue::Function(a), ExportValue::Function(b)) => a.ptr_eq(b),
      (ExportValue::Plugin(a), ExportValue::Plugin(b)) => Rc::ptr_eq(a, b),
      _ => false,
    }
  }
}

/// A positional argument injected into a module factory: a resolved
/// dependency export, or one of the three reserved pseudo-modules.
#[derive(Clone)]
pub enum FactoryArg {
  Export(ExportValue),
  Require(ScopedRequire),
  Exports(ExportsObject),
  Module(ModuleHandle),
}

impl FactoryArg {
  pub fn as_export(&self) -> Option<&ExportValue> {
    match self {
      FactoryArg::Export(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_require(&self) -> Option<&ScopedRequire> {
    match self {
      FactoryArg::Require(r) => Some(r),
      _ => None,
    }
  }

  pub fn as_exports(&self) -> Option<&ExportsObject> {
    match self {
      FactoryArg::Exports(e) => Some(e),
      _ => None,
    }
  }

  pub fn as_module(&self) -> Option<&ModuleHandle> {
    match self {
      FactoryArg::Module(m) => Some(m),
      _ => None,
    }
  }
}

/// The `module` pseudo-module: the declaration as the factory sees it.
#[derive(Clone, Debug)]
pub struct ModuleHandle {
  pub id: ModuleId,
  pub exports: ExportsObject,
}

/// A factory function with its declared arity. Factories are invoked with
/// at most `arity` positional arguments, exactly once per declaration.
#[derive(Clone)]
pub struct FactoryFn {
  arity: usize,
  f: Rc<dyn Fn(&[FactoryArg]) -> Result<Option<ExportValue>, AnyError>>,
}

impl FactoryFn {
  pub fn new(
    arity: usize,
    f: impl Fn(&[FactoryArg]) -> Result<Option<ExportValue>, AnyError> + 'static,
  ) -> Self {
    Self {
      arity,
      f: Rc::new(f),
    }
  }

  pub fn arity(&self) -> usize {
    self.arity
  }

  pub fn call(
    &self,
    args: &[FactoryArg],
  ) -> Result<Option<ExportValue>, AnyError> {
    (self.f)(args)
  }
}

impl fmt::Debug for FactoryFn {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("FactoryFn")
      .field("arity", &self.arity)
      .finish_non_exhaustive()
  }
}

/// What produces a module's export value when it activates.
#[derive(Clone, Debug)]
pub enum ModuleFactory {
  /// A fixed value; no code runs.
  Value(ExportValue),
  /// A function invoked once with the resolved dependencies.
  Function(FactoryFn),
}

impl ModuleFactory {
  pub fn value(v: ExportValue) -> Self {
    ModuleFactory::Value(v)
  }

  pub fn from_fn(
    arity: usize,
    f: impl Fn(&[FactoryArg]) -> Result<Option<ExportValue>, AnyError> + 'static,
  ) -> Self {
    ModuleFactory::Function(FactoryFn::new(arity, f))
  }
}

/// A definition as reported by an executed script, before pairing and
/// dependency normalization. A missing name marks an anonymous definition,
/// later paired with the identifier that triggered the script execution.
/// Missing dependencies default to the standard
/// `require`/`exports`/`module` injection.
pub struct RawDefinition {
  pub name: Option<String>,
  pub deps: Option<Vec<String>>,
  pub factory: ModuleFactory,
}

impl RawDefinition {
  pub fn named(
    name: impl Into<String>,
    deps: Option<Vec<String>>,
    factory: ModuleFactory,
  ) -> Self {
    Self {
      name: Some(name.into()),
      deps,
      factory,
    }
  }

  pub fn anonymous(deps: Option<Vec<String>>, factory: ModuleFactory) -> Self {
    Self {
      name: None,
      deps,
      factory,
    }
  }
}

/// A registered-but-not-yet-activated module.
#[derive(Debug)]
pub struct Declaration {
  pub id: ModuleId,
  pub deps: Vec<ModuleId>,
  pub factory: ModuleFactory,
  pub exports: ExportsObject,
}

impl Declaration {
  pub fn new(id: ModuleId, deps: Vec<ModuleId>, factory: ModuleFactory) -> Self {
    Self {
      id,
      deps,
      factory,
      exports: ExportsObject::default(),
    }
  }
}

/// The loader's bookkeeping: declared modules, activated export values,
/// recorded load errors, in-flight markers and the per-URL fetch-kind
/// bitmask. Page-lifetime state with no teardown besides selective
/// invalidation.
#[derive(Default)]
pub struct Registry {
  declarations: HashMap<ModuleId, Declaration>,
  exports: HashMap<ModuleId, ExportValue>,
  errors: HashMap<ModuleId, LoadError>,
  loading: HashSet<ModuleId>,
  fetched: HashMap<String, u8>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_declared(&self, id: &str) -> bool {
    self.declarations.contains_key(id)
  }

  pub fn declaration(&self, id: &str) -> Option<&Declaration> {
    self.declarations.get(id)
  }

  /// Registers a declaration. A module that is already declared or already
  /// activated keeps its first registration.
  pub fn insert_declaration(&mut self, decl: Declaration) -> bool {
    if self.is_declared(decl.id.as_str()) || self.has_export(decl.id.as_str())
    {
      log::debug!("already-registered module defined again: {}", decl.id);
      return false;
    }
    log::debug!("register {}", decl.id);
    self.declarations.insert(decl.id.clone(), decl);
    true
  }

  pub fn remove_declaration(&mut self, id: &str) -> Option<Declaration> {
    self.declarations.remove(id)
  }

  pub fn has_export(&self, id: &str) -> bool {
    self.exports.contains_key(id)
  }

  pub fn export(&self, id: &str) -> Option<&ExportValue> {
    self.exports.get(id)
  }

  pub fn insert_export(&mut self, id: ModuleId, value: ExportValue) {
    self.exports.insert(id, value);
  }

  pub fn remove_export(&mut self, id: &str) -> Option<ExportValue> {
    self.exports.remove(id)
  }

  pub fn error(&self, id: &str) -> Option<&LoadError> {
    self.errors.get(id)
  }

  pub fn record_error(&mut self, err: LoadError) {
    self.errors.insert(err.id().clone(), err);
  }

  pub fn is_loading(&self, id: &str) -> bool {
    self.loading.contains(id)
  }

  /// Marks `id` as in flight; returns false when it already was.
  pub fn mark_loading(&mut self, id: &ModuleId) -> bool {
    self.loading.insert(id.clone())
  }

  pub fn clear_loading(&mut self, id: &str) {
    self.loading.remove(id);
  }

  /// Marks `url` as fetched for the given load kind; returns false when
  /// that kind was already dispatched for the URL.
  pub fn mark_fetched(&mut self, url: &str, kind: u8) -> bool {
    let flags = self.fetched.entry(url.to_string()).or_insert(0);
    if *flags & kind != 0 {
      return false;
    }
    *flags |= kind;
    true
  }

  pub fn clear_fetched(&mut self, url: &str) {
    self.fetched.remove(url);
  }

  /// Every identifier the registry knows anything about. Used by recursive
  /// invalidation.
  pub fn known_ids(&self) -> Vec<ModuleId> {
    let mut ids: IndexSet<ModuleId> = IndexSet::new();
    ids.extend(self.declarations.keys().cloned());
    ids.extend(self.exports.keys().cloned());
    ids.extend(self.errors.keys().cloned());
    ids.extend(self.loading.iter().cloned());
    ids.into_iter().collect()
  }

  /// Purges every trace of `id`: export value, declaration, recorded
  /// error, in-flight marker and the fetch-state of its physical URL.
  pub fn undef_one(&mut self, id: &str, url: &str) {
    self.errors.remove(id);
    self.declarations.remove(id);
    self.exports.remove(id);
    self.loading.remove(id);
    self.fetched.remove(url);
  }

  /// Computes the transitive closure of dependency identifiers that are not
  /// yet available: no export value and either no declaration, or a
  /// declaration whose own dependencies are missing. A dependency visited
  /// twice in the same traversal is not re-expanded, so cyclic graphs
  /// terminate.
  pub fn check_missing(&self, deps: &[ModuleId]) -> Vec<ModuleId> {
    let mut missing = IndexSet::new();
    let mut seen = HashSet::new();
    self.walk_missing(deps, &mut seen, &mut missing);
    missing.into_iter().collect()
  }

  fn walk_missing(
    &self,
    deps: &[ModuleId],
    seen: &mut HashSet<ModuleId>,
    missing: &mut IndexSet<ModuleId>,
  ) {
    for dep in deps {
      if dep.is_reserved() || self.exports.contains_key(dep.as_str()) {
        continue;
      }
      match self.declarations.get(dep.as_str()) {
        None => {
          missing.insert(dep.clone());
        }
        Some(decl) => {
          if !missing.contains(dep.as_str()) && seen.insert(dep.clone()) {
            self.walk_missing(&decl.deps, seen, missing);
          }
        }
      }
    }
  }
}

pub type SuccessCallback = Box<dyn FnOnce(Vec<ExportValue>)>;
pub type ErrorCallback = Box<dyn FnOnce(LoadError)>;

/// One batch of identifiers a caller is waiting on. Tracks exactly the
/// identifiers that were missing at enqueue time; a failed request is
/// tombstoned with a negative count so later completions ignore it.
pub struct PendingRequest {
  deps: Vec<ModuleId>,
  membership: HashSet<ModuleId>,
  remaining: isize,
  on_success: Option<SuccessCallback>,
  on_error: Option<ErrorCallback>,
}

impl PendingRequest {
  pub fn new(
    deps: Vec<ModuleId>,
    missing: &[ModuleId],
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
  ) -> Self {
    Self {
      deps,
      membership: missing.iter().cloned().collect(),
      remaining: missing.len() as isize,
      on_success,
      on_error,
    }
  }

  pub fn deps(&self) -> &[ModuleId] {
    &self.deps
  }

  pub fn contains(&self, id: &ModuleId) -> bool {
    self.membership.contains(id)
  }

  /// Notes that `id` became available. No-op for tombstoned requests and
  /// identifiers outside this request's membership.
  pub fn note_available(&mut self, id: &ModuleId) {
    if self.remaining > 0 && self.membership.contains(id) {
      self.remaining -= 1;
    }
  }

  pub fn is_satisfied(&self) -> bool {
    self.remaining == 0
  }

  pub fn is_dead(&self) -> bool {
    self.remaining < 0
  }

  /// Tombstones the request and hands back its error callback, exactly
  /// once.
  pub fn fail(&mut self) -> Option<ErrorCallback> {
    self.remaining = -1;
    self.on_success = None;
    self.on_error.take()
  }

  pub fn into_parts(
    self,
  ) -> (Vec<ModuleId>, Option<SuccessCallback>, Option<ErrorCallback>) {
    (self.deps, self.on_success, self.on_error)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::module_specifier::normalize;
  use serde_json::json;

  fn id(name: &str) -> ModuleId {
    normalize("", name).unwrap()
  }

  fn declare(registry: &mut Registry, name: &str, deps: &[&str]) {
    let deps = deps.iter().map(|d| id(d)).collect();
    registry.insert_declaration(Declaration::new(
      id(name),
      deps,
      ModuleFactory::value(ExportValue::Json(json!(name))),
    ));
  }

  #[test]
  fn check_missing_is_transitive() {
    let mut registry = Registry::new();
    declare(&mut registry, "a", &["b"]);
    declare(&mut registry, "b", &["c", "d"]);
    registry.insert_export(id("d"), ExportValue::Json(json!(1)));

    // `c` is undeclared; `a` and `b` are declared but not activatable.
    assert_eq!(registry.check_missing(&[id("a")]), vec![id("c")]);

    declare(&mut registry, "c", &[]);
    assert!(registry.check_missing(&[id("a")]).is_empty());
  }

  #[test]
  fn check_missing_guards_against_cycles() {
    let mut registry = Registry::new();
    declare(&mut registry, "a", &["b"]);
    declare(&mut registry, "b", &["a", "x"]);

    assert_eq!(registry.check_missing(&[id("a")]), vec![id("x")]);
  }

  #[test]
  fn reserved_ids_are_always_available() {
    let mut registry = Registry::new();
    declare(&mut registry, "a", &["require", "exports", "module"]);
    assert!(registry.check_missing(&[id("a")]).is_empty());
  }

  #[test]
  fn first_declaration_wins() {
    let mut registry = Registry::new();
    declare(&mut registry, "a", &["b"]);
    assert!(!registry.insert_declaration(Declaration::new(
      id("a"),
      vec![],
      ModuleFactory::value(ExportValue::Json(json!("other"))),
    )));
    assert_eq!(registry.declaration("a").unwrap().deps, vec![id("b")]);
  }

  #[test]
  fn fetch_kinds_deduplicate_per_url() {
    let mut registry = Registry::new();
    assert!(registry.mark_fetched("/m/a.js", FETCH_SCRIPT));
    assert!(!registry.mark_fetched("/m/a.js", FETCH_SCRIPT));
    // A different kind for the same URL is a distinct physical load.
    assert!(registry.mark_fetched("/m/a.js", FETCH_TEXT));
    registry.clear_fetched("/m/a.js");
    assert!(registry.mark_fetched("/m/a.js", FETCH_SCRIPT));
  }

  #[test]
  fn pending_request_tombstones_once() {
    let fired = Rc::new(RefCell::new(0));
    let fired2 = fired.clone();
    let mut request = PendingRequest::new(
      vec![id("a")],
      &[id("a")],
      None,
      Some(Box::new(move |_err| *fired2.borrow_mut() += 1)),
    );
    assert!(!request.is_satisfied());
    let cb = request.fail().unwrap();
    cb(LoadError::not_declared(&id("a")));
    assert!(request.is_dead());
    assert!(request.fail().is_none());
    // A late completion does not resurrect the request.
    request.note_available(&id("a"));
    assert!(request.is_dead());
    assert_eq!(*fired.borrow(), 1);
  }

  #[test]
  fn export_value_identity() {
    let object = ExportsObject::default();
    let a = ExportValue::Object(object.clone());
    let b = ExportValue::Object(object);
    assert_eq!(a, b);
    assert_ne!(a, ExportValue::Object(ExportsObject::default()));
    assert_eq!(ExportValue::text("x"), ExportValue::text("x"));
  }
}
