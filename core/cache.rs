// Copyright 2026 the modload authors. MIT license.

//! The optional content cache: a persistent key-value store of fetched
//! text keyed by URL, gated on strong validators, with a once-per-session
//! staleness check against the serving backend.

use crate::error::generic_error;
use crate::error::AnyError;
use crate::fetcher::SourceFetcher;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::hash::Hasher;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// How long the cache stays usable after the staleness check completes.
/// Checking a second time in one session is not supported, so after this
/// window the cache turns itself off.
pub const DEFAULT_CACHE_GRACE: Duration = Duration::from_secs(10);

/// One cached resource: its text, the strong validator the server sent for
/// it, and — for scripts — the dependency list recorded when it was first
/// executed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
  pub text: String,
  pub validator: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub deps: Option<Vec<String>>,
}

pub type StoreGetFuture =
  LocalBoxFuture<'static, Result<Option<CachedEntry>, AnyError>>;
pub type StoreUnitFuture = LocalBoxFuture<'static, Result<(), AnyError>>;
pub type StoreKeysFuture =
  LocalBoxFuture<'static, Result<Vec<(String, String)>, AnyError>>;

/// A persistent key-value store keyed by URL.
pub trait CacheStore {
  fn get(&self, url: &str) -> StoreGetFuture;
  fn set(&self, url: &str, entry: CachedEntry) -> StoreUnitFuture;
  fn remove(&self, url: &str) -> StoreUnitFuture;
  /// Every `(url, validator)` pair currently stored.
  fn keys(&self) -> StoreKeysFuture;
  fn clear(&self) -> StoreUnitFuture;
}

/// An in-memory store, for tests and worker scopes with no persistence.
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
  entries: Rc<RefCell<HashMap<String, CachedEntry>>>,
}

impl CacheStore for MemoryCacheStore {
  fn get(&self, url: &str) -> StoreGetFuture {
    let entry = self.entries.borrow().get(url).cloned();
    futures::future::ready(Ok(entry)).boxed_local()
  }

  fn set(&self, url: &str, entry: CachedEntry) -> StoreUnitFuture {
    self.entries.borrow_mut().insert(url.to_string(), entry);
    futures::future::ready(Ok(())).boxed_local()
  }

  fn remove(&self, url: &str) -> StoreUnitFuture {
    self.entries.borrow_mut().remove(url);
    futures::future::ready(Ok(())).boxed_local()
  }

  fn keys(&self) -> StoreKeysFuture {
    let keys = self
      .entries
      .borrow()
      .iter()
      .map(|(url, entry)| (url.clone(), entry.validator.clone()))
      .collect();
    futures::future::ready(Ok(keys)).boxed_local()
  }

  fn clear(&self) -> StoreUnitFuture {
    self.entries.borrow_mut().clear();
    futures::future::ready(Ok(())).boxed_local()
  }
}

/// Turn a URL into a stable content filename. URLs contain characters that
/// cannot be used in filenames, so they are deterministically hashed.
pub fn url_to_filename(url: &str) -> String {
  let mut hasher = twox_hash::XxHash64::with_seed(0);
  hasher.write(url.as_bytes());
  format!("{:016x}", hasher.finish())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SerializedManifest {
  modules: IndexMap<String, ManifestEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ManifestEntry {
  path: String,
  validator: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  deps: Option<Vec<String>>,
}

/// A disk-backed store: hashed content files next to a `manifest.json`
/// mapping URLs to files, validators and dependency metadata. All writes
/// are atomic (write to a temp file, then rename).
#[derive(Clone)]
pub struct DiskCacheStore {
  inner: Arc<DiskInner>,
}

struct DiskInner {
  root: PathBuf,
  manifest: RwLock<SerializedManifest>,
}

impl DiskCacheStore {
  /// Opens (or lazily creates) a cache directory. A corrupt or missing
  /// manifest starts the cache over from empty.
  pub fn new(root: PathBuf) -> Self {
    let manifest = fs::read(root.join("manifest.json"))
      .ok()
      .and_then(|data| serde_json::from_slice(&data).ok())
      .unwrap_or_default();
    Self {
      inner: Arc::new(DiskInner {
        root,
        manifest: RwLock::new(manifest),
      }),
    }
  }

  fn save_manifest(&self, manifest: &SerializedManifest) -> Result<(), AnyError> {
    let json = serde_json::to_string_pretty(manifest)?;
    atomic_write(&self.inner.root.join("manifest.json"), json.as_bytes())
  }
}

impl CacheStore for DiskCacheStore {
  fn get(&self, url: &str) -> StoreGetFuture {
    let result = (|| -> Result<Option<CachedEntry>, AnyError> {
      let manifest = self.inner.manifest.read();
      let Some(entry) = manifest.modules.get(url) else {
        return Ok(None);
      };
      let text = match fs::read_to_string(self.inner.root.join(&entry.path)) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
      };
      Ok(Some(CachedEntry {
        text,
        validator: entry.validator.clone(),
        deps: entry.deps.clone(),
      }))
    })();
    futures::future::ready(result).boxed_local()
  }

  fn set(&self, url: &str, entry: CachedEntry) -> StoreUnitFuture {
    let result = (|| -> Result<(), AnyError> {
      let path = url_to_filename(url);
      atomic_write(&self.inner.root.join(&path), entry.text.as_bytes())?;
      let mut manifest = self.inner.manifest.write();
      manifest.modules.insert(
        url.to_string(),
        ManifestEntry {
          path,
          validator: entry.validator,
          deps: entry.deps,
        },
      );
      self.save_manifest(&manifest)
    })();
    futures::future::ready(result).boxed_local()
  }

  fn remove(&self, url: &str) -> StoreUnitFuture {
    let result = (|| -> Result<(), AnyError> {
      let mut manifest = self.inner.manifest.write();
      if let Some(entry) = manifest.modules.shift_remove(url) {
        let _ = fs::remove_file(self.inner.root.join(&entry.path));
        self.save_manifest(&manifest)?;
      }
      Ok(())
    })();
    futures::future::ready(result).boxed_local()
  }

  fn keys(&self) -> StoreKeysFuture {
    let keys = self
      .inner
      .manifest
      .read()
      .modules
      .iter()
      .map(|(url, entry)| (url.clone(), entry.validator.clone()))
      .collect();
    futures::future::ready(Ok(keys)).boxed_local()
  }

  fn clear(&self) -> StoreUnitFuture {
    let result = (|| -> Result<(), AnyError> {
      let mut manifest = self.inner.manifest.write();
      for (_, entry) in manifest.modules.drain(..) {
        let _ = fs::remove_file(self.inner.root.join(&entry.path));
      }
      self.save_manifest(&manifest)
    })();
    futures::future::ready(result).boxed_local()
  }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), AnyError> {
  let parent = path
    .parent()
    .ok_or_else(|| generic_error("cache path has no parent directory"))?;
  fs::create_dir_all(parent)?;
  let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
  tmp.write_all(data)?;
  tmp.persist(path)?;
  Ok(())
}

/// The loader-facing cache: wraps a [`CacheStore`] with the enablement
/// gate, the validator rule and the reconciliation protocol.
#[derive(Clone)]
pub struct ContentCache {
  inner: Rc<CacheInner>,
}

struct CacheInner {
  store: Rc<dyn CacheStore>,
  enabled: Cell<bool>,
  reconciled: Cell<bool>,
  grace: Duration,
  expires_at: Cell<Option<Instant>>,
}

impl ContentCache {
  pub fn new(store: Rc<dyn CacheStore>) -> Self {
    Self::with_grace(store, DEFAULT_CACHE_GRACE)
  }

  pub fn with_grace(store: Rc<dyn CacheStore>, grace: Duration) -> Self {
    Self {
      inner: Rc::new(CacheInner {
        store,
        enabled: Cell::new(false),
        reconciled: Cell::new(false),
        grace,
        expires_at: Cell::new(None),
      }),
    }
  }

  pub fn set_enabled(&self, enabled: bool) {
    self.inner.enabled.set(enabled);
  }

  /// Whether the cache is currently usable. Once the post-reconciliation
  /// grace window has elapsed the cache turns itself off for the remainder
  /// of the session.
  pub fn enabled(&self) -> bool {
    if !self.inner.enabled.get() {
      return false;
    }
    if let Some(deadline) = self.inner.expires_at.get() {
      if Instant::now() >= deadline {
        self.inner.enabled.set(false);
        return false;
      }
    }
    true
  }

  /// Claims the one reconciliation pass of this session. Returns false if
  /// it was already claimed.
  pub(crate) fn take_reconcile_ticket(&self) -> bool {
    if self.inner.reconciled.get() {
      return false;
    }
    self.inner.reconciled.set(true);
    true
  }

  pub fn get(&self, url: &str) -> StoreGetFuture {
    if !self.enabled() {
      return futures::future::ready(Ok(None)).boxed_local();
    }
    self.inner.store.get(url)
  }

  /// Stores a fetched resource. Responses without a strong validator are
  /// not cached; neither is anything while the cache is off.
  pub fn set(
    &self,
    url: &str,
    text: String,
    validator: Option<String>,
    deps: Option<Vec<String>>,
  ) -> StoreUnitFuture {
    if !self.enabled() {
      return futures::future::ready(Ok(())).boxed_local();
    }
    let Some(validator) = validator else {
      return futures::future::ready(Ok(())).boxed_local();
    };
    self.inner.store.set(
      url,
      CachedEntry {
        text,
        validator,
        deps,
      },
    )
  }

  pub fn clear(&self) -> StoreUnitFuture {
    self.inner.store.clear()
  }

  /// Posts every cached `(validator, url)` pair to the staleness-check
  /// endpoint under `base_url` and evicts the entries (and their
  /// transform-segment variants) the endpoint reports stale. Returns the
  /// number of stale lines processed. Entries outside `base_url` are
  /// skipped.
  pub fn reconcile(
    &self,
    fetcher: Rc<dyn SourceFetcher>,
    base_url: String,
    transform_segment: Option<String>,
  ) -> LocalBoxFuture<'static, Result<usize, AnyError>> {
    let cache = self.clone();
    async move {
      let keys = cache.inner.store.keys().await?;
      let mut lines = String::new();
      for (url, validator) in &keys {
        let Some(relative) = url.strip_prefix(&base_url) else {
          continue;
        };
        lines.push_str(validator);
        lines.push(' ');
        lines.push_str(relative);
        lines.push('\n');
      }
      if lines.is_empty() {
        cache.finish_reconcile();
        return Ok(0);
      }
      let endpoint = format!("{}__check__", base_url);
      let response = match fetcher.post(&endpoint, lines).await {
        Ok(response) => response,
        Err(err) => {
          cache.finish_reconcile();
          return Err(err);
        }
      };
      let mut evicted = 0;
      for line in response.lines().filter(|line| !line.is_empty()) {
        cache.inner.store.remove(&format!("{}{}", base_url, line)).await?;
        if let Some(segment) = &transform_segment {
          cache
            .inner
            .store
            .remove(&format!("{}{}/{}", base_url, segment, line))
            .await?;
        }
        evicted += 1;
      }
      cache.finish_reconcile();
      Ok(evicted)
    }
    .boxed_local()
  }

  fn finish_reconcile(&self) {
    self.inner.expires_at.set(Some(Instant::now() + self.inner.grace));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fetcher::FetchTextFuture;
  use crate::fetcher::PostFuture;
  use pretty_assertions::assert_eq;

  fn entry(text: &str, validator: &str) -> CachedEntry {
    CachedEntry {
      text: text.to_string(),
      validator: validator.to_string(),
      deps: None,
    }
  }

  #[derive(Clone, Default)]
  struct CheckEndpoint {
    stale: Rc<RefCell<String>>,
    posts: Rc<RefCell<Vec<(String, String)>>>,
  }

  impl SourceFetcher for CheckEndpoint {
    fn fetch_text(&self, _url: &str) -> FetchTextFuture {
      futures::future::ready(Err(generic_error("no fetches expected")))
        .boxed_local()
    }

    fn post(&self, url: &str, body: String) -> PostFuture {
      self.posts.borrow_mut().push((url.to_string(), body));
      let response = self.stale.borrow().clone();
      futures::future::ready(Ok(response)).boxed_local()
    }
  }

  #[tokio::test]
  async fn memory_store_round_trip() {
    let store = MemoryCacheStore::default();
    store.set("/m/a.js", entry("a", "v1")).await.unwrap();
    assert_eq!(store.get("/m/a.js").await.unwrap(), Some(entry("a", "v1")));
    assert_eq!(store.get("/m/b.js").await.unwrap(), None);
    store.remove("/m/a.js").await.unwrap();
    assert_eq!(store.get("/m/a.js").await.unwrap(), None);
  }

  #[tokio::test]
  async fn disabled_cache_reads_and_writes_nothing() {
    let store = MemoryCacheStore::default();
    store.set("/m/a.js", entry("a", "v1")).await.unwrap();
    let cache = ContentCache::new(Rc::new(store.clone()));
    assert!(!cache.enabled());
    assert_eq!(cache.get("/m/a.js").await.unwrap(), None);
    cache
      .set("/m/b.js", "b".to_string(), Some("v2".to_string()), None)
      .await
      .unwrap();
    assert_eq!(store.get("/m/b.js").await.unwrap(), None);
  }

  #[tokio::test]
  async fn responses_without_validators_are_not_stored() {
    let store = MemoryCacheStore::default();
    let cache = ContentCache::new(Rc::new(store.clone()));
    cache.set_enabled(true);
    cache.set("/m/a.js", "a".to_string(), None, None).await.unwrap();
    assert_eq!(store.get("/m/a.js").await.unwrap(), None);
    cache
      .set("/m/a.js", "a".to_string(), Some("v1".to_string()), None)
      .await
      .unwrap();
    assert_eq!(store.get("/m/a.js").await.unwrap(), Some(entry("a", "v1")));
  }

  #[tokio::test]
  async fn reconcile_evicts_reported_entries() {
    let store = MemoryCacheStore::default();
    store.set("/m/a.js", entry("a", "v1")).await.unwrap();
    store.set("/m/b.js", entry("b", "v2")).await.unwrap();
    store
      .set("/m/~/es5/a.js", entry("a5", "v1")).await.unwrap();
    // Entries outside the base URL are not part of the check.
    store.set("https://cdn/x.js", entry("x", "v9")).await.unwrap();

    let cache = ContentCache::new(Rc::new(store.clone()));
    cache.set_enabled(true);
    let endpoint = CheckEndpoint::default();
    *endpoint.stale.borrow_mut() = "a.js\n".to_string();

    let evicted = cache
      .reconcile(
        Rc::new(endpoint.clone()),
        "/m/".to_string(),
        Some("~/es5".to_string()),
      )
      .await
      .unwrap();
    assert_eq!(evicted, 1);
    assert_eq!(store.get("/m/a.js").await.unwrap(), None);
    assert_eq!(store.get("/m/~/es5/a.js").await.unwrap(), None);
    assert_eq!(store.get("/m/b.js").await.unwrap(), Some(entry("b", "v2")));

    let posts = endpoint.posts.borrow();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "/m/__check__");
    assert!(posts[0].1.contains("v1 a.js\n"));
    assert!(posts[0].1.contains("v2 b.js\n"));
    assert!(!posts[0].1.contains("cdn"));
  }

  #[tokio::test]
  async fn cache_disables_itself_after_the_grace_window() {
    let store = MemoryCacheStore::default();
    store.set("/m/a.js", entry("a", "v1")).await.unwrap();
    let cache =
      ContentCache::with_grace(Rc::new(store), Duration::from_secs(0));
    cache.set_enabled(true);
    let endpoint = CheckEndpoint::default();
    cache
      .reconcile(Rc::new(endpoint), "/m/".to_string(), None)
      .await
      .unwrap();
    // The zero-length grace window has already elapsed.
    assert!(!cache.enabled());
    assert_eq!(cache.get("/m/a.js").await.unwrap(), None);
  }

  #[tokio::test]
  async fn disk_store_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = DiskCacheStore::new(dir.path().to_path_buf());
    let mut with_deps = entry("var x;", "W/\"abc\"");
    with_deps.deps = Some(vec!["lib/util".to_string()]);
    store.set("/m/a.js", with_deps.clone()).await.unwrap();
    assert_eq!(store.get("/m/a.js").await.unwrap(), Some(with_deps.clone()));

    // A new store over the same directory sees the persisted manifest.
    let reopened = DiskCacheStore::new(dir.path().to_path_buf());
    assert_eq!(reopened.get("/m/a.js").await.unwrap(), Some(with_deps));
    assert_eq!(
      reopened.keys().await.unwrap(),
      vec![("/m/a.js".to_string(), "W/\"abc\"".to_string())]
    );

    reopened.clear().await.unwrap();
    assert_eq!(reopened.get("/m/a.js").await.unwrap(), None);
  }

  #[test]
  fn url_filenames_are_stable() {
    assert_eq!(url_to_filename("/m/a.js"), url_to_filename("/m/a.js"));
    assert_ne!(url_to_filename("/m/a.js"), url_to_filename("/m/b.js"));
    assert_eq!(url_to_filename("/m/a.js").len(), 16);
  }
}
