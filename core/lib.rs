// Copyright 2026 the modload authors. MIT license.
mod cache;
mod config;
mod error;
mod fetcher;
mod module_specifier;
mod modules;
mod plugins;
mod runtime;

// Re-exports
pub use anyhow;
pub use futures;
pub use serde;
pub use serde_json;
pub use url;

pub use crate::cache::url_to_filename;
pub use crate::cache::CacheStore;
pub use crate::cache::CachedEntry;
pub use crate::cache::ContentCache;
pub use crate::cache::DiskCacheStore;
pub use crate::cache::MemoryCacheStore;
pub use crate::cache::StoreGetFuture;
pub use crate::cache::StoreKeysFuture;
pub use crate::cache::StoreUnitFuture;
pub use crate::cache::DEFAULT_CACHE_GRACE;
pub use crate::config::Capabilities;
pub use crate::config::LoaderConfig;
pub use crate::config::LoaderOptions;
pub use crate::config::Package;
pub use crate::config::PackageOptions;
pub use crate::config::TransformRule;
pub use crate::config::DEFAULT_MODULE_LOAD_URL;
pub use crate::error::custom_error;
pub use crate::error::generic_error;
pub use crate::error::get_custom_error_class;
pub use crate::error::AnyError;
pub use crate::error::LoadError;
pub use crate::error::LoadErrorKind;
pub use crate::error::NormalizeError;
pub use crate::fetcher::ExecuteFuture;
pub use crate::fetcher::FetchTextFuture;
pub use crate::fetcher::PostFuture;
pub use crate::fetcher::ScriptHost;
pub use crate::fetcher::ScriptOutcome;
pub use crate::fetcher::SourceFetcher;
pub use crate::fetcher::TextResponse;
pub use crate::module_specifier::is_reserved;
pub use crate::module_specifier::normalize;
pub use crate::module_specifier::ModuleId;
pub use crate::module_specifier::RESERVED_IDS;
pub use crate::modules::Declaration;
pub use crate::modules::ErrorCallback;
pub use crate::modules::ExportFn;
pub use crate::modules::ExportValue;
pub use crate::modules::ExportsObject;
pub use crate::modules::FactoryArg;
pub use crate::modules::FactoryFn;
pub use crate::modules::ModuleFactory;
pub use crate::modules::ModuleHandle;
pub use crate::modules::PendingRequest;
pub use crate::modules::RawDefinition;
pub use crate::modules::Registry;
pub use crate::modules::SuccessCallback;
pub use crate::modules::FETCH_SCRIPT;
pub use crate::modules::FETCH_TEXT;
pub use crate::modules::FETCH_WORKER;
pub use crate::plugins::LoaderPlugin;
pub use crate::plugins::PluginDone;
pub use crate::runtime::Loader;
pub use crate::runtime::ScopedRequire;
pub use crate::runtime::Shim;
