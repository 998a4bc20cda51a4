//! Local store: the on-device cache in front of the remote source.
//!
//! One sled tree per collection, records keyed by id and encoded with
//! bincode. Queries are full-collection scans filtered in memory.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::models::{Preferences, Record};

const SETTINGS_TREE: &str = "settings";
const PREFERENCES_KEY: &str = "preferences";

/// Record collections kept in the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// [`crate::models::Workspace`] records
    Workspaces,
    /// [`crate::models::Channel`] records
    Channels,
    /// [`crate::models::Message`] records
    Messages,
}

impl Collection {
    /// Tree name inside the sled database
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Workspaces => "workspaces",
            Self::Channels => "channels",
            Self::Messages => "messages",
        }
    }
}

/// Durable key-value cache of workspaces, channels and messages
#[derive(Clone)]
pub struct LocalStore {
    db: sled::Db,
}

impl LocalStore {
    /// Open (or create) a store under `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let db = sled::open(path)?;
        debug!(path = %path.display(), "Opened local store");
        Ok(Self { db })
    }

    /// In-memory store that is discarded on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Open the store described by `config`
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        if config.temporary {
            Self::temporary()
        } else {
            Self::open(&config.path)
        }
    }

    fn tree(&self, collection: Collection) -> Result<sled::Tree> {
        Ok(self.db.open_tree(collection.name())?)
    }

    /// Every record in `collection`. An empty collection yields an empty vec.
    ///
    /// Entries that no longer decode are skipped with a warning.
    pub fn get_all<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>> {
        let tree = self.tree(collection)?;
        let mut records = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (key, value) = entry?;
            match bincode::deserialize::<T>(&value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    collection = collection.name(),
                    key = %String::from_utf8_lossy(&key),
                    error = %e,
                    "Skipping undecodable cached record"
                ),
            }
        }
        Ok(records)
    }

    /// Records in `collection` for which `predicate` holds
    pub fn get_all_where<T, F>(&self, collection: Collection, predicate: F) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let mut records: Vec<T> = self.get_all(collection)?;
        records.retain(|r| predicate(r));
        Ok(records)
    }

    /// Single record by id
    pub fn get<T: DeserializeOwned>(&self, collection: Collection, id: &str) -> Result<Option<T>> {
        self.tree(collection)?
            .get(id.as_bytes())?
            .map(|bytes| bincode::deserialize(&bytes).map_err(Into::into))
            .transpose()
    }

    /// Upsert by the record's id; the last writer wins
    pub fn put<T: Serialize + Record>(&self, collection: Collection, record: &T) -> Result<()> {
        let data = bincode::serialize(record)?;
        self.tree(collection)?.insert(record.id().as_bytes(), data)?;
        Ok(())
    }

    /// Upsert each record individually
    pub fn put_all<T: Serialize + Record>(&self, collection: Collection, records: &[T]) -> Result<()> {
        for record in records {
            self.put(collection, record)?;
        }
        Ok(())
    }

    /// Remove one record. Returns whether it existed.
    pub fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        Ok(self.tree(collection)?.remove(id.as_bytes())?.is_some())
    }

    /// Remove every record matching `predicate`. Returns how many went.
    pub fn delete_where<T, F>(&self, collection: Collection, predicate: F) -> Result<usize>
    where
        T: DeserializeOwned + Record,
        F: Fn(&T) -> bool,
    {
        let doomed: Vec<T> = self.get_all_where(collection, predicate)?;
        let tree = self.tree(collection)?;
        for record in &doomed {
            tree.remove(record.id().as_bytes())?;
        }
        Ok(doomed.len())
    }

    /// Stored preferences, or the defaults when none were saved
    pub fn load_preferences(&self) -> Result<Preferences> {
        let settings = self.db.open_tree(SETTINGS_TREE)?;
        match settings.get(PREFERENCES_KEY)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Preferences::default()),
        }
    }

    /// Persist preferences
    pub fn save_preferences(&self, preferences: &Preferences) -> Result<()> {
        let settings = self.db.open_tree(SETTINGS_TREE)?;
        settings.insert(PREFERENCES_KEY, bincode::serialize(preferences)?)?;
        Ok(())
    }

    /// Drop every cached record and setting
    pub fn clear(&self) -> Result<()> {
        for collection in [Collection::Workspaces, Collection::Channels, Collection::Messages] {
            self.tree(collection)?.clear()?;
        }
        self.db.open_tree(SETTINGS_TREE)?.clear()?;
        self.db.flush()?;
        Ok(())
    }

    /// Force buffered writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
