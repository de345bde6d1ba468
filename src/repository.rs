//! Keyed storage abstraction for devices and jobs.
//!
//! Persistent storage is an external collaborator; the in-memory
//! implementation backs the binary and the tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use serde::de::DeserializeOwned;

use crate::error::ConfigError;
use crate::model::{Device, MachineJob};

/// An entity addressable by an `i64` id.
pub trait Keyed {
    fn key(&self) -> i64;
    fn set_key(&mut self, key: i64);
}

impl Keyed for Device {
    fn key(&self) -> i64 {
        self.id
    }

    fn set_key(&mut self, key: i64) {
        self.id = key;
    }
}

impl Keyed for MachineJob {
    fn key(&self) -> i64 {
        self.id
    }

    fn set_key(&mut self, key: i64) {
        self.id = key;
    }
}

pub trait Repository<T>: Send + Sync {
    fn get(&self, id: i64) -> Option<T>;

    fn get_all(&self) -> Vec<T>;

    /// Insert or replace. An entity with id `0` is assigned the next free id.
    fn save(&self, item: T) -> T;

    fn delete(&self, id: i64) -> Option<T>;
}

/// `RwLock`-guarded map ordered by id.
pub struct MemoryRepository<T> {
    items: RwLock<BTreeMap<i64, T>>,
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Keyed + Clone> MemoryRepository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: RwLock::new(items.into_iter().map(|i| (i.key(), i)).collect()),
        }
    }
}

impl<T: Keyed + Clone + DeserializeOwned> MemoryRepository<T> {
    /// Seed a repository from a JSON array file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileReadError`] if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let items: Vec<T> = serde_json::from_str(&raw).map_err(|e| ConfigError::FileReadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::with_items(items))
    }
}

impl<T: Keyed + Clone + Send + Sync> Repository<T> for MemoryRepository<T> {
    fn get(&self, id: i64) -> Option<T> {
        self.items
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    fn get_all(&self) -> Vec<T> {
        self.items
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn save(&self, mut item: T) -> T {
        let mut items = self
            .items
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if item.key() == 0 {
            let next = items.keys().next_back().copied().unwrap_or(0) + 1;
            item.set_key(next);
        }
        items.insert(item.key(), item.clone());
        item
    }

    fn delete(&self, id: i64) -> Option<T> {
        self.items
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
    }
}
