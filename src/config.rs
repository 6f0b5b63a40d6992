use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::biom::{DEFAULT_ABUNDANCE_CHUNK_SIZE, DEFAULT_GENERATED_BY, DEFAULT_OTU_CHUNK_SIZE};
use crate::cache::{MemoryCache, NoCache, ResultCache, SqliteCache};
use crate::db::Database;
use crate::error::OtuError;
use crate::schema::{FieldDescriptor, SampleSchema};

pub const CONFIG_FILE: &str = "otu-query.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub database: Utf8PathBuf,
    #[serde(default)]
    pub cache: Option<CacheEntry>,
    #[serde(default)]
    pub export_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub generated_by: Option<String>,
    #[serde(default)]
    pub otu_chunk_size: Option<usize>,
    #[serde(default)]
    pub abundance_chunk_size: Option<usize>,
    #[serde(default)]
    pub contextual_fields: Option<Vec<FieldDescriptor>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CacheEntry {
    Shorthand(CacheBackend),
    Detailed(CacheEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CacheEntryObject {
    pub backend: CacheBackend,
    #[serde(default)]
    pub path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Sqlite,
    Memory,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSettings {
    Sqlite(Utf8PathBuf),
    Memory,
    Disabled,
}

impl CacheSettings {
    /// A sqlite cache that cannot be opened degrades to no cache.
    pub fn build(&self) -> Arc<dyn ResultCache> {
        match self {
            CacheSettings::Sqlite(path) => match SqliteCache::open(path) {
                Ok(cache) => Arc::new(cache),
                Err(err) => {
                    warn!(path = %path, error = %err, "cache unavailable, continuing without it");
                    Arc::new(NoCache)
                }
            },
            CacheSettings::Memory => Arc::new(MemoryCache::new()),
            CacheSettings::Disabled => Arc::new(NoCache),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub database: Database,
    pub cache: CacheSettings,
    pub export_dir: Utf8PathBuf,
    pub generated_by: String,
    pub otu_chunk_size: usize,
    pub abundance_chunk_size: usize,
    pub schema: SampleSchema,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, OtuError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(OtuError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| OtuError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| OtuError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, OtuError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let cache = match config.cache {
            None => CacheSettings::Memory,
            Some(CacheEntry::Shorthand(backend)) => cache_settings(backend, None)?,
            Some(CacheEntry::Detailed(obj)) => cache_settings(obj.backend, obj.path)?,
        };

        let export_dir = match config.export_dir {
            Some(dir) => dir,
            None => default_data_dir()?.join("exports"),
        };

        let schema = match config.contextual_fields {
            Some(fields) => SampleSchema::new(fields)?,
            None => SampleSchema::default(),
        };

        let otu_chunk_size = chunk_size(
            "otu_chunk_size",
            config.otu_chunk_size.unwrap_or(DEFAULT_OTU_CHUNK_SIZE),
        )?;
        let abundance_chunk_size = chunk_size(
            "abundance_chunk_size",
            config
                .abundance_chunk_size
                .unwrap_or(DEFAULT_ABUNDANCE_CHUNK_SIZE),
        )?;

        Ok(ResolvedConfig {
            schema_version,
            database: Database::new(config.database),
            cache,
            export_dir,
            generated_by: config
                .generated_by
                .unwrap_or_else(|| DEFAULT_GENERATED_BY.to_string()),
            otu_chunk_size,
            abundance_chunk_size,
            schema,
        })
    }
}

fn cache_settings(
    backend: CacheBackend,
    path: Option<Utf8PathBuf>,
) -> Result<CacheSettings, OtuError> {
    Ok(match backend {
        CacheBackend::Sqlite => match path {
            Some(path) => CacheSettings::Sqlite(path),
            None => CacheSettings::Sqlite(default_data_dir()?.join("cache.sqlite3")),
        },
        CacheBackend::Memory => CacheSettings::Memory,
        CacheBackend::None => CacheSettings::Disabled,
    })
}

fn chunk_size(name: &str, value: usize) -> Result<usize, OtuError> {
    if value == 0 {
        return Err(OtuError::ConfigParse(format!("{name} must be positive")));
    }
    Ok(value)
}

pub fn default_data_dir() -> Result<Utf8PathBuf, OtuError> {
    let base = BaseDirs::new()
        .ok_or_else(|| OtuError::Filesystem("unable to resolve home directory".to_string()))?;
    let dir = base.data_local_dir().join("otu-query");
    Utf8PathBuf::from_path_buf(dir)
        .map_err(|_| OtuError::Filesystem("data directory is not valid UTF-8".to_string()))
}
