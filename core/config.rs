// Copyright 2026 the modload authors. MIT license.

use indexmap::IndexMap;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Default root URL for physical script loads when no `base_url` is
/// configured.
pub const DEFAULT_MODULE_LOAD_URL: &str = "/modules";

const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment capabilities, detected once by the embedder and handed to
/// the loader at construction. Nothing is probed at runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
  /// The embedding context is secure (or trusted enough) for the content
  /// cache to be allowed.
  pub secure_context: bool,
  /// The embedding context can execute scripts synchronously in place, the
  /// way a worker scope does.
  pub worker_scope: bool,
}

/// A package entry: either a bare name, or a name with an explicit location
/// and main module.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum PackageOptions {
  Name(String),
  Full {
    name: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    main: Option<String>,
  },
}

/// One URL-rewrite rule: a path segment inserted for every module, or only
/// for modules whose identifier starts with a prefix.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TransformRule {
  Always(String),
  Prefix(String, String),
}

/// Loader configuration as accepted from the embedder; every field is
/// optional and unset fields leave the current configuration untouched.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoaderOptions {
  pub base_url: Option<String>,
  pub packages: Vec<PackageOptions>,
  pub paths: IndexMap<String, String>,
  pub use_cache: Option<bool>,
  pub transform: Vec<TransformRule>,
  pub asset_url: Option<String>,
  pub module_load_url: Option<String>,
  pub host: Option<String>,
  pub keep_loaders: Option<bool>,
  /// Bounded wait for a script load to produce a declaration, in
  /// milliseconds. `0` disables the timeout.
  pub load_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
  pub location: String,
  pub main: String,
}

/// The normalized, effective loader configuration.
#[derive(Clone, Debug)]
pub struct LoaderConfig {
  pub base_url: String,
  pub packages: IndexMap<String, Package>,
  pub paths: IndexMap<String, String>,
  pub use_cache: bool,
  pub transform: Vec<TransformRule>,
  pub asset_url: Option<String>,
  pub module_load_url: String,
  pub host: String,
  pub keep_loaders: bool,
  pub load_timeout: Option<Duration>,
}

impl Default for LoaderConfig {
  fn default() -> Self {
    Self {
      base_url: String::new(),
      packages: IndexMap::new(),
      paths: IndexMap::new(),
      use_cache: false,
      transform: Vec::new(),
      asset_url: None,
      module_load_url: DEFAULT_MODULE_LOAD_URL.to_string(),
      host: String::new(),
      keep_loaders: false,
      load_timeout: Some(DEFAULT_LOAD_TIMEOUT),
    }
  }
}

impl LoaderConfig {
  pub fn from_options(options: LoaderOptions) -> Self {
    let mut config = Self::default();
    config.apply(options);
    config
  }

  /// Merges `options` into the current configuration. Set fields replace,
  /// table fields accumulate.
  pub fn apply(&mut self, options: LoaderOptions) {
    if let Some(base_url) = options.base_url {
      if !base_url.is_empty() {
        self.base_url = with_trailing_slash(&base_url);
      }
    }
    for pkg in options.packages {
      let (name, location, main) = match pkg {
        PackageOptions::Name(name) => (name, None, None),
        PackageOptions::Full {
          name,
          location,
          main,
        } => (name, location, main),
      };
      let location = with_trailing_slash(&location.unwrap_or_else(|| name.clone()));
      let main = main
        .unwrap_or_else(|| "main".to_string())
        .trim_end_matches(".js")
        .trim_start_matches("./")
        .to_string();
      self.packages.insert(name, Package { location, main });
    }
    for (from, to) in options.paths {
      self.paths.insert(from, to);
    }
    if let Some(use_cache) = options.use_cache {
      self.use_cache = use_cache;
    }
    if !options.transform.is_empty() {
      self.transform = options.transform;
    }
    if let Some(asset_url) = options.asset_url {
      self.asset_url = Some(asset_url);
    }
    if let Some(module_load_url) = options.module_load_url {
      self.module_load_url = module_load_url;
    }
    if let Some(host) = options.host {
      self.host = host;
    }
    if let Some(keep_loaders) = options.keep_loaders {
      self.keep_loaders = keep_loaders;
    }
    if let Some(ms) = options.load_timeout_ms {
      self.load_timeout = if ms == 0 {
        None
      } else {
        Some(Duration::from_millis(ms))
      };
    }
  }

  /// Whether the content cache may be used in this context: opted in via
  /// `use_cache` and running in a secure context or against localhost.
  pub fn cache_allowed(&self, capabilities: &Capabilities) -> bool {
    self.use_cache && (capabilities.secure_context || is_localhost(&self.host))
  }

  /// Computes the physical URL for a module identifier.
  ///
  /// The longest matching identifier prefix (on path-segment boundaries) in
  /// `paths` or `packages` is rewritten; `.ts` sources swap their extension
  /// for `ext`; non-absolute results get the transform segment and a base
  /// URL prepended; root-relative results are qualified with `host`.
  /// Absolute URLs pass through unmodified apart from host qualification.
  pub fn to_url(&self, name: &str, ext: &str) -> String {
    self.resolve_url(name, ext, false)
  }

  /// Computes the URL of a static asset; falls back to `asset_url` instead
  /// of the module load root.
  pub fn to_asset_url(&self, name: &str) -> String {
    self.resolve_url(name, "", true)
  }

  fn resolve_url(&self, name: &str, ext: &str, is_static: bool) -> String {
    // Plugin-prefixed and root-relative names never get an extension.
    let ext = if name.contains('!') || name.starts_with('/') {
      ""
    } else {
      ext
    };

    let mut module_name = name.to_string();
    let mut test_path = name;
    let mut tail = String::new();
    loop {
      if let Some(replacement) = self.paths.get(test_path) {
        module_name = format!("{}{}", replacement, tail);
        break;
      }
      if let Some(pkg) = self.packages.get(test_path) {
        let rest = if tail.is_empty() {
          pkg.main.clone()
        } else {
          tail.trim_start_matches('/').to_string()
        };
        module_name = format!("{}{}", pkg.location, rest);
        break;
      }
      match test_path.rfind('/') {
        Some(i) => {
          tail = format!("{}{}", &test_path[i..], tail);
          test_path = &test_path[..i];
        }
        None => break,
      }
    }

    let mut url = if ext == ".js" && module_name.ends_with(".js") {
      module_name.clone()
    } else {
      format!("{}{}", module_name, ext)
    };
    if module_name.ends_with(".ts") {
      url = format!("{}{}", &module_name[..module_name.len() - 3], ext);
    }

    if !is_absolute_url(&url) {
      if ext == ".js" && !self.transform.is_empty() {
        url = self.add_transform(&url, &module_name);
      }
      let mut base = if !self.base_url.is_empty() {
        self.base_url.clone()
      } else if is_static {
        self
          .asset_url
          .clone()
          .unwrap_or_else(|| format!("{}/../", self.module_load_url))
      } else {
        self.module_load_url.clone()
      };
      if !base.ends_with('/') {
        base.push('/');
      }
      url = format!("{}{}", base, url);
    }

    if url.starts_with('/') && !self.host.is_empty() {
      url = format!("{}{}", self.host, url);
    }
    url
  }

  fn add_transform(&self, url: &str, module_name: &str) -> String {
    let segments: Vec<&str> = self
      .transform
      .iter()
      .filter_map(|rule| match rule {
        TransformRule::Always(segment) => Some(segment.as_str()),
        TransformRule::Prefix(prefix, segment) => {
          module_name.starts_with(prefix.as_str()).then(|| segment.as_str())
        }
      })
      .collect();
    format!("~/{}/{}", segments.join(","), url).replacen("//", "/", 1)
  }

  /// The unconditional transform path segment, used for cache eviction of
  /// transformed URL variants.
  pub fn transform_segment(&self) -> Option<String> {
    let segments: Vec<&str> = self
      .transform
      .iter()
      .filter_map(|rule| match rule {
        TransformRule::Always(segment) => Some(segment.as_str()),
        TransformRule::Prefix(..) => None,
      })
      .collect();
    if segments.is_empty() {
      None
    } else {
      Some(format!("~/{}", segments.join(",")))
    }
  }
}

fn with_trailing_slash(s: &str) -> String {
  format!("{}/", s.trim_end_matches('/'))
}

fn is_absolute_url(url: &str) -> bool {
  url.starts_with('/') || Url::parse(url).is_ok()
}

fn is_localhost(host: &str) -> bool {
  if host.is_empty() {
    return false;
  }
  let host_name = match Url::parse(host) {
    Ok(url) => match url.host_str() {
      Some(h) => h.to_string(),
      None => return false,
    },
    // A bare `host:port` pair.
    Err(_) => host.split(':').next().unwrap_or(host).to_string(),
  };
  host_name == "localhost"
    || host_name == "127.0.0.1"
    || host_name.ends_with(".localhost")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::module_specifier::normalize;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  fn make_config(options: serde_json::Value) -> LoaderConfig {
    LoaderConfig::from_options(serde_json::from_value(options).unwrap())
  }

  #[test]
  fn paths_rewrite_bypasses_base_url() {
    let config = make_config(json!({
      "baseUrl": "/static/modules",
      "paths": { "foo": "/v2/foo" },
    }));
    assert_eq!(config.to_url("foo/bar", ".js"), "/v2/foo/bar.js");
    assert_eq!(config.to_url("foo", ".js"), "/v2/foo.js");
  }

  #[test]
  fn packages_rewrite_location_and_main() {
    let config = make_config(json!({
      "packages": [
        { "name": "editor", "location": "lib/editor", "main": "./index.js" },
        "plain",
      ],
    }));
    assert_eq!(config.to_url("editor", ".js"), "/modules/lib/editor/index.js");
    assert_eq!(
      config.to_url("editor/theme", ".js"),
      "/modules/lib/editor/theme.js"
    );
    assert_eq!(config.to_url("plain", ".js"), "/modules/plain/main.js");
  }

  #[test]
  fn base_url_applies_to_bare_names() {
    let config = make_config(json!({ "baseUrl": "/static/build/modules/" }));
    assert_eq!(
      config.to_url("app/main", ".js"),
      "/static/build/modules/app/main.js"
    );
    // An existing .js suffix is not doubled.
    assert_eq!(
      config.to_url("app/main.js", ".js"),
      "/static/build/modules/app/main.js"
    );
    // TypeScript sources swap their extension.
    assert_eq!(
      config.to_url("app/main.ts", ".js"),
      "/static/build/modules/app/main.js"
    );
  }

  #[test]
  fn absolute_urls_pass_through() {
    let config = make_config(json!({ "baseUrl": "/static/modules/" }));
    assert_eq!(
      config.to_url("https://cdn.example/lib.js", ".js"),
      "https://cdn.example/lib.js"
    );
    // Root-relative names skip the base URL but gain the host.
    let config = make_config(json!({
      "baseUrl": "/static/modules/",
      "host": "https://ide.example",
    }));
    assert_eq!(config.to_url("/vendor/x", ".js"), "https://ide.example/vendor/x");
  }

  #[test]
  fn plugin_prefixed_names_get_no_extension() {
    let config = make_config(json!({ "baseUrl": "/m/" }));
    assert_eq!(config.to_url("text!app/readme.md", ".js"), "/m/text!app/readme.md");
  }

  #[test]
  fn transform_segment_is_inserted() {
    let config = make_config(json!({
      "baseUrl": "/m/",
      "transform": ["es5", ["plugins/", "cdn"]],
    }));
    assert_eq!(config.to_url("app/main", ".js"), "/m/~/es5/app/main.js");
    assert_eq!(
      config.to_url("plugins/panel", ".js"),
      "/m/~/es5,cdn/plugins/panel.js"
    );
    assert_eq!(config.transform_segment(), Some("~/es5".to_string()));
  }

  #[test]
  fn asset_urls_fall_back_to_asset_root() {
    let config = make_config(json!({ "assetUrl": "/static/assets/" }));
    assert_eq!(config.to_asset_url("img/logo.png"), "/static/assets/img/logo.png");
    let config = make_config(json!({}));
    assert_eq!(config.to_asset_url("img/logo.png"), "/modules/../img/logo.png");
  }

  #[test]
  fn to_url_round_trips_with_normalize() {
    let config = make_config(json!({ "baseUrl": "/static/build/modules/" }));
    for id in ["app/main", "lib/util/fs", "single"] {
      let url = config.to_url(id, ".js");
      let relative = url
        .strip_prefix(&config.base_url)
        .and_then(|u| u.strip_suffix(".js"))
        .unwrap();
      assert_eq!(relative, id);
    }
    // A relative self-require from within a module loaded at that URL
    // reproduces the original id.
    for id in ["app/main", "lib/util/fs"] {
      let leaf = &id[id.rfind('/').unwrap() + 1..];
      let back = normalize(id, &format!("./{}", leaf)).unwrap();
      assert_eq!(back.as_str(), id);
    }
  }

  #[test]
  fn apply_merges_and_replaces() {
    let mut config = LoaderConfig::from_options(
      serde_json::from_value(json!({ "paths": { "a": "/1/a" } })).unwrap(),
    );
    config.apply(
      serde_json::from_value(json!({
        "paths": { "b": "/1/b" },
        "baseUrl": "/m",
        "useCache": true,
        "loadTimeoutMs": 0,
      }))
      .unwrap(),
    );
    assert_eq!(config.paths.len(), 2);
    assert_eq!(config.base_url, "/m/");
    assert!(config.use_cache);
    assert_eq!(config.load_timeout, None);
  }

  #[test]
  fn cache_gating_requires_secure_context_or_localhost() {
    let mut config = LoaderConfig::default();
    config.use_cache = true;
    let insecure = Capabilities::default();
    let secure = Capabilities {
      secure_context: true,
      ..Default::default()
    };
    assert!(!config.cache_allowed(&insecure));
    assert!(config.cache_allowed(&secure));
    config.host = "http://localhost:8080".to_string();
    assert!(config.cache_allowed(&insecure));
    config.host = "https://ide.example".to_string();
    assert!(!config.cache_allowed(&insecure));
  }
}
