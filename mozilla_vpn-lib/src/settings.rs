//! Key/value store for values the daemon keeps across restarts.

use thiserror::Error;
use uuid::Uuid;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::dirs;

pub const FILE_NAME: &str = "settings.toml";
pub const KEY_CONNECTION_UUID: &str = "connection_uuid";
pub const KEY_EXCLUDED_CGROUPS: &str = "excluded_cgroups";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error(transparent)]
    Dirs(#[from] dirs::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
}

pub trait Settings: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), Error>;
    fn get_list(&self, key: &str) -> Vec<String>;
    fn set_list(&mut self, key: &str, values: &[String]) -> Result<(), Error>;
}

/// Persisted tunnel identifier, if one was stored and parses.
pub fn connection_uuid(settings: &dyn Settings) -> Option<Uuid> {
    settings
        .get(KEY_CONNECTION_UUID)
        .and_then(|v| Uuid::parse_str(&v).ok())
}

fn table_get(table: &toml::Table, key: &str) -> Option<String> {
    table.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn table_get_list(table: &toml::Table, key: &str) -> Vec<String> {
    table
        .get(key)
        .and_then(|v| v.as_array())
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn list_value(values: &[String]) -> toml::Value {
    toml::Value::Array(values.iter().cloned().map(toml::Value::String).collect())
}

/// Settings stored as TOML in the daemon state directory.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    table: toml::Table,
}

impl FileSettings {
    pub fn open_default() -> Result<Self, Error> {
        let path = dirs::state_file(FILE_NAME)?;
        Self::open(&path)
    }

    pub fn open(path: &Path) -> Result<Self, Error> {
        let table = match fs::read_to_string(path) {
            Ok(content) => content.parse::<toml::Table>()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => toml::Table::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(FileSettings {
            path: path.to_path_buf(),
            table,
        })
    }

    fn persist(&self) -> Result<(), Error> {
        let content = toml::to_string(&self.table)?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Settings for FileSettings {
    fn get(&self, key: &str) -> Option<String> {
        table_get(&self.table, key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.table.insert(key.to_string(), toml::Value::String(value.to_string()));
        self.persist()
    }

    fn get_list(&self, key: &str) -> Vec<String> {
        table_get_list(&self.table, key)
    }

    fn set_list(&mut self, key: &str, values: &[String]) -> Result<(), Error> {
        self.table.insert(key.to_string(), list_value(values));
        self.persist()
    }
}

/// Non persistent settings for tests and for running without a state directory.
#[derive(Debug, Default)]
pub struct MemorySettings {
    table: toml::Table,
}

impl Settings for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        table_get(&self.table, key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.table.insert(key.to_string(), toml::Value::String(value.to_string()));
        Ok(())
    }

    fn get_list(&self, key: &str) -> Vec<String> {
        table_get_list(&self.table, key)
    }

    fn set_list(&mut self, key: &str, values: &[String]) -> Result<(), Error> {
        self.table.insert(key.to_string(), list_value(values));
        Ok(())
    }
}
