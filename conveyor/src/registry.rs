//! Extension registry.
//!
//! Extensions (fetchers, sources, emitters, reporters) are declared in
//! config and instantiated from a static table of factories. Each factory
//! owns a typed option block; config deserialization is schema-driven and
//! there is no runtime registration.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json as json;

use crate::config::Config;
use crate::emitter::{file::FileEmitter, Emitter};
use crate::fetcher::{file::FileFetcher, Fetcher};
use crate::reporter::{store::SqliteReporter, LogReporter, NoopReporter, Reporter};
use crate::source::{manifest::ManifestSource, walk::WalkSource, TupleSource};
use crate::temp::RunDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Fetchers,
    Sources,
    Emitters,
    Reporters,
}

impl Category {
    pub const ALL: &'static [Category] = &[
        Category::Fetchers,
        Category::Sources,
        Category::Emitters,
        Category::Reporters,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Fetchers => f.write_str("fetcher"),
            Category::Sources => f.write_str("source"),
            Category::Emitters => f.write_str("emitter"),
            Category::Reporters => f.write_str("reporter"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The config references an extension type that isn't declared.
    #[error("unknown {category} extension type `{type_name}`")]
    UnknownType {
        category: Category,
        type_name: String,
    },
    /// The option block didn't deserialize against the factory's schema.
    #[error("invalid options for {category} `{id}`: {source}")]
    InvalidOptions {
        category: Category,
        id: String,
        source: json::Error,
    },
    /// The factory's validator rejected the option block.
    #[error("{category} `{id}`: {message}")]
    Rejected {
        category: Category,
        id: String,
        message: String,
    },
    /// A component asked for an instance id that isn't registered.
    #[error("no {category} with id `{id}`")]
    NoSuchExtension { category: Category, id: String },
    /// A run needs exactly one source.
    #[error("expected exactly one source, found {0}")]
    AmbiguousSource(usize),
}

impl Error {
    pub fn is_missing_extension(&self) -> bool {
        matches!(
            self,
            Error::UnknownType { .. } | Error::NoSuchExtension { .. }
        )
    }
}

/// What factories can fail with; the registry attaches category and id.
enum BuildError {
    Options(json::Error),
    Rejected(String),
}

impl BuildError {
    fn rejected(e: impl fmt::Display) -> Self {
        Self::Rejected(e.to_string())
    }

    fn into_error(self, category: Category, id: &str) -> Error {
        match self {
            BuildError::Options(source) => Error::InvalidOptions {
                category,
                id: id.to_owned(),
                source,
            },
            BuildError::Rejected(message) => Error::Rejected {
                category,
                id: id.to_owned(),
                message,
            },
        }
    }
}

fn options<T: serde::de::DeserializeOwned>(block: &json::Value) -> Result<T, BuildError> {
    json::from_value(block.clone()).map_err(BuildError::Options)
}

/// State factories get to build instances from: today, the run-scoped
/// temp directory.
pub struct BuildContext {
    pub temp: Arc<RunDir>,
}

type FetcherFactory = fn(&json::Value, &BuildContext) -> Result<Arc<dyn Fetcher>, BuildError>;
type SourceFactory = fn(&json::Value, &BuildContext) -> Result<Box<dyn TupleSource>, BuildError>;
type EmitterFactory = fn(&json::Value, &BuildContext) -> Result<Arc<dyn Emitter>, BuildError>;
type ReporterFactory = fn(&json::Value, &BuildContext) -> Result<Box<dyn Reporter>, BuildError>;

fn file_fetcher(
    block: &json::Value,
    ctx: &BuildContext,
) -> Result<Arc<dyn Fetcher>, BuildError> {
    let opts: crate::fetcher::file::Options = options(block)?;
    if opts.base_path.as_os_str().is_empty() {
        return Err(BuildError::Rejected("`basePath` must not be empty".into()));
    }
    Ok(Arc::new(FileFetcher::new(opts, ctx.temp.clone())))
}

fn file_walk_source(
    block: &json::Value,
    _ctx: &BuildContext,
) -> Result<Box<dyn TupleSource>, BuildError> {
    let opts: crate::source::walk::Options = options(block)?;
    let source = WalkSource::open(opts).map_err(BuildError::rejected)?;
    Ok(Box::new(source))
}

fn manifest_source(
    block: &json::Value,
    _ctx: &BuildContext,
) -> Result<Box<dyn TupleSource>, BuildError> {
    let opts: crate::source::manifest::Options = options(block)?;
    let source = ManifestSource::open(opts).map_err(BuildError::rejected)?;
    Ok(Box::new(source))
}

fn file_emitter(
    block: &json::Value,
    _ctx: &BuildContext,
) -> Result<Arc<dyn Emitter>, BuildError> {
    let opts: crate::emitter::file::Options = options(block)?;
    if opts.base_path.as_os_str().is_empty() {
        return Err(BuildError::Rejected("`basePath` must not be empty".into()));
    }
    Ok(Arc::new(FileEmitter::new(opts)))
}

fn noop_reporter(
    _block: &json::Value,
    _ctx: &BuildContext,
) -> Result<Box<dyn Reporter>, BuildError> {
    Ok(Box::new(NoopReporter))
}

fn log_reporter(
    _block: &json::Value,
    _ctx: &BuildContext,
) -> Result<Box<dyn Reporter>, BuildError> {
    Ok(Box::new(LogReporter))
}

fn sqlite_reporter(
    block: &json::Value,
    _ctx: &BuildContext,
) -> Result<Box<dyn Reporter>, BuildError> {
    let opts: crate::reporter::store::Options = options(block)?;
    let reporter = SqliteReporter::open(opts).map_err(BuildError::rejected)?;
    Ok(Box::new(reporter))
}

static FETCHER_FACTORIES: Lazy<BTreeMap<&'static str, FetcherFactory>> =
    Lazy::new(|| BTreeMap::from([("file-fetcher", file_fetcher as FetcherFactory)]));

static SOURCE_FACTORIES: Lazy<BTreeMap<&'static str, SourceFactory>> = Lazy::new(|| {
    BTreeMap::from([
        ("file-walk-source", file_walk_source as SourceFactory),
        ("manifest-source", manifest_source as SourceFactory),
    ])
});

static EMITTER_FACTORIES: Lazy<BTreeMap<&'static str, EmitterFactory>> =
    Lazy::new(|| BTreeMap::from([("file-emitter", file_emitter as EmitterFactory)]));

static REPORTER_FACTORIES: Lazy<BTreeMap<&'static str, ReporterFactory>> = Lazy::new(|| {
    BTreeMap::from([
        ("noop-reporter", noop_reporter as ReporterFactory),
        ("log-reporter", log_reporter as ReporterFactory),
        ("sqlite-reporter", sqlite_reporter as ReporterFactory),
    ])
});

/// Live extension instances, keyed by instance id.
pub struct Registry {
    fetchers: BTreeMap<String, Arc<dyn Fetcher>>,
    sources: BTreeMap<String, Box<dyn TupleSource>>,
    emitters: BTreeMap<String, Arc<dyn Emitter>>,
    reporters: BTreeMap<String, Box<dyn Reporter>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("fetchers", &self.fetchers.keys().collect::<Vec<_>>())
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("emitters", &self.emitters.keys().collect::<Vec<_>>())
            .field("reporters", &self.reporters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Instantiate every extension the config declares.
    pub fn load(config: &Config, ctx: &BuildContext) -> Result<Self, Error> {
        let mut registry = Registry {
            fetchers: BTreeMap::new(),
            sources: BTreeMap::new(),
            emitters: BTreeMap::new(),
            reporters: BTreeMap::new(),
        };

        for (type_name, instances) in &config.fetchers {
            let factory = FETCHER_FACTORIES.get(type_name.as_str()).ok_or_else(|| {
                Error::UnknownType {
                    category: Category::Fetchers,
                    type_name: type_name.clone(),
                }
            })?;
            for (id, block) in instances {
                let fetcher = factory(block, ctx)
                    .map_err(|e| e.into_error(Category::Fetchers, id))?;
                registry.fetchers.insert(id.clone(), fetcher);
            }
        }
        for (type_name, instances) in &config.sources {
            let factory = SOURCE_FACTORIES.get(type_name.as_str()).ok_or_else(|| {
                Error::UnknownType {
                    category: Category::Sources,
                    type_name: type_name.clone(),
                }
            })?;
            for (id, block) in instances {
                let source =
                    factory(block, ctx).map_err(|e| e.into_error(Category::Sources, id))?;
                registry.sources.insert(id.clone(), source);
            }
        }
        for (type_name, instances) in &config.emitters {
            let factory = EMITTER_FACTORIES.get(type_name.as_str()).ok_or_else(|| {
                Error::UnknownType {
                    category: Category::Emitters,
                    type_name: type_name.clone(),
                }
            })?;
            for (id, block) in instances {
                let emitter = factory(block, ctx)
                    .map_err(|e| e.into_error(Category::Emitters, id))?;
                registry.emitters.insert(id.clone(), emitter);
            }
        }
        for (type_name, instances) in &config.reporters {
            let factory = REPORTER_FACTORIES.get(type_name.as_str()).ok_or_else(|| {
                Error::UnknownType {
                    category: Category::Reporters,
                    type_name: type_name.clone(),
                }
            })?;
            for (id, block) in instances {
                let reporter = factory(block, ctx)
                    .map_err(|e| e.into_error(Category::Reporters, id))?;
                registry.reporters.insert(id.clone(), reporter);
            }
        }
        Ok(registry)
    }

    pub fn fetcher(&self, id: &str) -> Result<Arc<dyn Fetcher>, Error> {
        self.fetchers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NoSuchExtension {
                category: Category::Fetchers,
                id: id.to_owned(),
            })
    }

    pub fn emitter(&self, id: &str) -> Result<Arc<dyn Emitter>, Error> {
        self.emitters
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NoSuchExtension {
                category: Category::Emitters,
                id: id.to_owned(),
            })
    }

    pub fn has_emitter(&self, id: &str) -> bool {
        self.emitters.contains_key(id)
    }

    /// Take the run's source. Exactly one must be configured.
    pub fn take_sole_source(&mut self) -> Result<(String, Box<dyn TupleSource>), Error> {
        if self.sources.len() != 1 {
            return Err(Error::AmbiguousSource(self.sources.len()));
        }
        Ok(self.sources.pop_first().expect("checked non-empty"))
    }

    /// Take the configured reporters, with their ids.
    pub fn take_reporters(&mut self) -> Vec<(String, Box<dyn Reporter>)> {
        std::mem::take(&mut self.reporters).into_iter().collect()
    }

    pub fn emitters(&self) -> impl Iterator<Item = (&str, &Arc<dyn Emitter>)> {
        self.emitters.iter().map(|(id, e)| (id.as_str(), e))
    }

    pub fn fetchers(&self) -> impl Iterator<Item = (&str, &Arc<dyn Fetcher>)> {
        self.fetchers.iter().map(|(id, f)| (id.as_str(), f))
    }

    /// Live instance ids of a category, sorted.
    pub fn list(&self, category: Category) -> Vec<String> {
        match category {
            Category::Fetchers => self.fetchers.keys().cloned().collect(),
            Category::Sources => self.sources.keys().cloned().collect(),
            Category::Emitters => self.emitters.keys().cloned().collect(),
            Category::Reporters => self.reporters.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn context() -> (tempfile::TempDir, BuildContext) {
        let dir = tempfile::tempdir().unwrap();
        let temp = Arc::new(RunDir::create(dir.path()).unwrap());
        (dir, BuildContext { temp })
    }

    #[test]
    fn test_load_and_list() {
        let (dir, ctx) = context();
        let docs = dir.path().join("docs");
        std::fs::create_dir(&docs).unwrap();

        let config: Config = serde_json::from_str(&format!(
            r#"{{
                "fetchers": {{
                    "file-fetcher": {{ "docs": {{ "basePath": {base:?} }} }}
                }},
                "emitters": {{
                    "file-emitter": {{ "out": {{ "basePath": {base:?} }} }}
                }},
                "reporters": {{
                    "log-reporter": {{ "log": {{}} }}
                }}
            }}"#,
            base = docs.display().to_string(),
        ))
        .unwrap();

        let registry = Registry::load(&config, &ctx).unwrap();
        assert_eq!(registry.list(Category::Fetchers), vec!["docs"]);
        assert_eq!(registry.list(Category::Emitters), vec!["out"]);
        assert!(registry.fetcher("docs").is_ok());
        assert!(registry.fetcher("nope").is_err());
    }

    #[test]
    fn test_unknown_type() {
        let (_dir, ctx) = context();
        let config: Config = serde_json::from_str(
            r#"{ "fetchers": { "s3-fetcher": { "archive": {} } } }"#,
        )
        .unwrap();

        let err = Registry::load(&config, &ctx).unwrap_err();
        assert!(err.is_missing_extension());
    }

    #[test]
    fn test_invalid_options() {
        let (_dir, ctx) = context();
        let config: Config = serde_json::from_str(
            r#"{ "fetchers": { "file-fetcher": { "docs": { "wrongKey": 1 } } } }"#,
        )
        .unwrap();

        let err = Registry::load(&config, &ctx).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions { .. }));
    }

    #[test]
    fn test_validator_rejection() {
        let (_dir, ctx) = context();
        let config: Config = serde_json::from_str(
            r#"{ "fetchers": { "file-fetcher": { "docs": { "basePath": "" } } } }"#,
        )
        .unwrap();

        let err = Registry::load(&config, &ctx).unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }));
    }
}
