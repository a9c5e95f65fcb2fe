// Copyright 2026 the modload authors. MIT license.

use crate::error::NormalizeError;
use serde::Serialize;
use serde::Serializer;
use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

/// The dependency names with reserved meaning during activation: the scoped
/// requester function, the in-progress exports object and the declaration
/// itself. They are always considered available and are never fetched.
pub const RESERVED_IDS: [&str; 3] = ["require", "exports", "module"];

pub fn is_reserved(name: &str) -> bool {
  RESERVED_IDS.contains(&name)
}

/// A canonical module identifier, optionally plugin-prefixed
/// (`p1!p2!resource`). All registry lookups are keyed by `ModuleId`s in
/// normalized absolute form; the plugin-chain/resource split is computed
/// once at construction instead of re-slicing the string at each layer.
#[derive(Clone, Debug)]
pub struct ModuleId {
  full: String,
  // Byte offset where the resource part begins (after the last `!`).
  resource_at: usize,
}

impl ModuleId {
  pub(crate) fn from_canonical(full: String) -> Self {
    let resource_at = full.rfind('!').map(|i| i + 1).unwrap_or(0);
    Self { full, resource_at }
  }

  pub fn as_str(&self) -> &str {
    &self.full
  }

  /// The resource part: everything after the last `!`, or the whole
  /// identifier for bare module names.
  pub fn resource(&self) -> &str {
    &self.full[self.resource_at..]
  }

  pub fn has_plugin(&self) -> bool {
    self.resource_at != 0
  }

  /// The plugin prefixes, outermost first.
  pub fn plugin_chain(&self) -> impl Iterator<Item = &str> {
    self.full[..self.resource_at]
      .split('!')
      .filter(|s| !s.is_empty())
  }

  /// The outermost plugin prefix, if any.
  pub fn head_plugin(&self) -> Option<&str> {
    self.plugin_chain().next()
  }

  /// Everything after the outermost plugin prefix, including any remaining
  /// chained prefixes.
  pub fn rest(&self) -> &str {
    match self.head_plugin() {
      Some(head) => &self.full[head.len() + 1..],
      None => &self.full,
    }
  }

  pub fn is_reserved(&self) -> bool {
    is_reserved(&self.full)
  }
}

impl PartialEq for ModuleId {
  fn eq(&self, other: &Self) -> bool {
    self.full == other.full
  }
}

impl Eq for ModuleId {}

impl PartialEq<str> for ModuleId {
  fn eq(&self, other: &str) -> bool {
    self.full == other
  }
}

impl Hash for ModuleId {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.full.hash(state)
  }
}

impl Borrow<str> for ModuleId {
  fn borrow(&self) -> &str {
    &self.full
  }
}

impl fmt::Display for ModuleId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(&self.full)
  }
}

impl Serialize for ModuleId {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&self.full)
  }
}

/// Rewrites a raw module name into its canonical absolute form, resolved
/// against the identifier of the requesting module.
///
/// Plugin-prefixed names are split at the first `!` and both halves are
/// normalized independently against the unqualified requesting id (the
/// requesting id's own plugin prefix, if any, is stripped first). Relative
/// names are resolved against the directory implied by the requesting id's
/// path, keeping a scoped `@scope/name` first segment atomic, and `./` and
/// `../` segments are collapsed until a fixed point. Canonical names pass
/// through unchanged.
///
/// Normalization is a pure function of its inputs and is idempotent.
pub fn normalize(
  requesting: &str,
  raw: &str,
) -> Result<ModuleId, NormalizeError> {
  if raw.is_empty() {
    return Err(NormalizeError::EmptyName);
  }
  if raw.contains('!') && raw.split('!').any(|part| part.is_empty()) {
    return Err(NormalizeError::EmptyPluginSegment(raw.to_string()));
  }
  // The requesting id's own plugin prefix does not participate in
  // resolution; only its resource path does.
  let parent = requesting.rsplit('!').next().unwrap_or(requesting);
  Ok(ModuleId::from_canonical(normalize_str(parent, raw)))
}

fn normalize_str(parent: &str, raw: &str) -> String {
  if let Some(i) = raw.find('!') {
    return format!(
      "{}!{}",
      normalize_str(parent, &raw[..i]),
      normalize_str(parent, &raw[i + 1..])
    );
  }

  if !raw.starts_with('.') {
    return raw.to_string();
  }

  let mut chunks: Vec<&str> = parent.split('/').collect();
  let mut head = chunks.remove(0).to_string();
  // A scoped first segment is an atomic unit.
  if head.starts_with('@') && !chunks.is_empty() {
    head.push('/');
    head.push_str(chunks.remove(0));
  }
  // Drop the last segment: the requesting module's own name.
  chunks.pop();
  let dir = chunks.join("/");

  let mut name = if dir.is_empty() {
    format!("{}/{}", head, raw)
  } else {
    format!("{}/{}/{}", head, dir, raw)
  };

  // Collapse `./` and `../` segments until nothing changes. Sequences that
  // would escape the root are left as-is and surface later as a load
  // failure.
  loop {
    let previous = name.clone();
    name = collapse_current(&name);
    name = collapse_parent(&name);
    if name == previous || !name.contains('.') {
      break;
    }
  }

  name
}

// Removes the first `/./` occurrence.
fn collapse_current(name: &str) -> String {
  match name.find("/./") {
    Some(i) => format!("{}/{}", &name[..i], &name[i + 3..]),
    None => name.to_string(),
  }
}

// Removes the first `segment/../` occurrence, where the segment itself is
// not `..`.
fn collapse_parent(name: &str) -> String {
  let mut search_from = 0;
  while let Some(rel) = name[search_from..].find("/../") {
    let i = search_from + rel;
    let seg_start = name[..i].rfind('/').map(|j| j + 1).unwrap_or(0);
    let segment = &name[seg_start..i];
    if !segment.is_empty() && segment != ".." {
      return format!("{}{}", &name[..seg_start], &name[i + 4..]);
    }
    search_from = i + 1;
  }
  name.to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn norm(parent: &str, raw: &str) -> String {
    normalize(parent, raw).unwrap().as_str().to_string()
  }

  #[test]
  fn canonical_names_pass_through() {
    assert_eq!(norm("app/main", "lib/util"), "lib/util");
    assert_eq!(norm("", "lib/util"), "lib/util");
    assert_eq!(norm("app/main", "require"), "require");
  }

  #[test]
  fn relative_names_resolve_against_parent_dir() {
    assert_eq!(norm("app/ui/panel", "./button"), "app/ui/button");
    assert_eq!(norm("app/ui/panel", "../data/store"), "app/data/store");
    assert_eq!(norm("app/main", "./config"), "app/config");
  }

  #[test]
  fn scoped_first_segment_is_atomic() {
    assert_eq!(norm("@org/pkg/lib/mod", "./peer"), "@org/pkg/lib/peer");
    assert_eq!(norm("@org/pkg/main", "./x"), "@org/pkg/x");
  }

  #[test]
  fn plugin_prefixes_normalize_independently() {
    assert_eq!(norm("app/main", "text!./readme.md"), "text!app/readme.md");
    assert_eq!(norm("app/main", "p1!p2!./res"), "p1!p2!app/res");
    // The requesting id's own plugin prefix is stripped before use.
    assert_eq!(norm("text!app/main", "./other.md"), "app/other.md");
  }

  #[test]
  fn collapse_reaches_a_fixed_point() {
    assert_eq!(norm("a/b/c/d", "./../.././x"), "a/x");
    assert_eq!(norm("a/main", "././x"), "a/x");
  }

  #[test]
  fn escaping_the_root_is_left_as_is() {
    let id = normalize("a/main", "../../x").unwrap();
    assert_eq!(id.as_str(), "../x");
  }

  #[test]
  fn normalize_is_idempotent() {
    let cases = [
      ("app/ui/panel", "./button"),
      ("app/ui/panel", "../data/store"),
      ("text!app/main", "json!./cfg.json"),
      ("@org/pkg/main", "./x"),
      ("", "lib/util"),
    ];
    for (parent, raw) in cases {
      let once = norm(parent, raw);
      assert_eq!(norm(parent, &once), once, "({}, {})", parent, raw);
    }
  }

  #[test]
  fn module_id_plugin_chain() {
    let id = normalize("", "p1!p2!lib/data").unwrap();
    assert!(id.has_plugin());
    assert_eq!(id.head_plugin(), Some("p1"));
    assert_eq!(id.plugin_chain().collect::<Vec<_>>(), vec!["p1", "p2"]);
    assert_eq!(id.resource(), "lib/data");
    assert_eq!(id.rest(), "p2!lib/data");

    let bare = normalize("", "lib/data").unwrap();
    assert!(!bare.has_plugin());
    assert_eq!(bare.head_plugin(), None);
    assert_eq!(bare.rest(), "lib/data");
  }

  #[test]
  fn empty_names_are_rejected() {
    assert_eq!(normalize("", ""), Err(NormalizeError::EmptyName));
    assert!(matches!(
      normalize("", "text!"),
      Err(NormalizeError::EmptyPluginSegment(_))
    ));
  }
}
