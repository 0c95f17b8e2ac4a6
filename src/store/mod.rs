//! Local lab cache backed by redb.
//!
//! One table holds one JSON-encoded [`Lab`] per lab name. The backend stays
//! authoritative; this store is a read-through cache that
//! [`LabStore::replace_all`] rebuilds inside a single write transaction, so
//! readers see either the old contents or the new ones.

use std::fmt;
use std::sync::Arc;

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use thiserror::Error;
use tracing::debug;

use crate::model::Lab;

/// Default table name for lab records.
pub const DEFAULT_TABLE: &str = "labs";

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by [`LabStore`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// The database file or its directory could not be opened.
    #[error("failed to open lab store: {0}")]
    Open(String),
    /// A transaction could not begin or commit.
    #[error("lab store transaction error: {0}")]
    Transaction(String),
    /// The lab table could not be opened.
    #[error("lab store table error: {0}")]
    Table(String),
    /// A lookup or scan failed.
    #[error("lab store read error: {0}")]
    Read(String),
    /// An insert or removal failed.
    #[error("lab store write error: {0}")]
    Write(String),
    /// A lab record could not be encoded.
    #[error("failed to encode lab record: {0}")]
    Serialize(String),
    /// A stored record could not be decoded.
    #[error("failed to decode lab record: {0}")]
    Deserialize(String),
}

macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Cache of lab records keyed by lab name.
///
/// Cloning is cheap and clones share the same database handle, so one store
/// can serve concurrent orchestrator calls.
#[derive(Clone)]
pub struct LabStore {
    db: Arc<Database>,
    table: String,
}

impl fmt::Debug for LabStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabStore")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl LabStore {
    /// Opens (or creates) the store file at `path`, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] when the directory or database cannot be
    /// created, or a table error when the lab table cannot be initialised.
    pub fn open(path: &Utf8Path, table: impl Into<String>) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            table: table.into(),
        };
        store.ensure_table()?;
        debug!(%path, table = %store.table, "lab store opened");
        Ok(store)
    }

    /// Opens an ephemeral store that lives only as long as its handles.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when redb rejects the in-memory backend.
    pub fn open_in_memory(table: impl Into<String>) -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            table: table.into(),
        };
        store.ensure_table()?;
        debug!(table = %store.table, "in-memory lab store opened");
        Ok(store)
    }

    /// Name of the table holding lab records.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    fn definition(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.table)
    }

    fn ensure_table(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(self.definition()).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Returns the cached record for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails or the record cannot be
    /// decoded.
    pub fn get(&self, name: &str) -> StoreResult<Option<Lab>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(self.definition()).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let lab: Lab =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lab))
            }
            None => Ok(None),
        }
    }

    /// Inserts or overwrites the record for `lab.name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when encoding or the write transaction fails.
    pub fn save(&self, lab: &Lab) -> StoreResult<()> {
        let value = serde_json::to_vec(lab).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(self.definition()).map_err(map_err!(Table))?;
            table
                .insert(lab.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(lab = %lab.name, "lab record saved");
        Ok(())
    }

    /// Removes the record for `name`. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write transaction fails.
    pub fn delete(&self, name: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(self.definition()).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(lab = %name, existed, "lab record deleted");
        Ok(existed)
    }

    /// Returns every cached record, ordered by lab name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the scan fails or a record cannot be
    /// decoded.
    pub fn list(&self) -> StoreResult<Vec<Lab>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(self.definition()).map_err(map_err!(Table))?;
        let mut labs = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let lab: Lab = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            labs.push(lab);
        }
        Ok(labs)
    }

    /// Replaces the whole cache with `labs` in one write transaction.
    ///
    /// Every record is encoded before the transaction starts, so an encoding
    /// failure leaves the previous contents untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when encoding or the write transaction fails.
    pub fn replace_all(&self, labs: &[Lab]) -> StoreResult<()> {
        let encoded = labs
            .iter()
            .map(|lab| {
                serde_json::to_vec(lab)
                    .map(|value| (lab.name.as_str(), value))
                    .map_err(map_err!(Serialize))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.delete_table(self.definition())
            .map_err(map_err!(Table))?;
        {
            let mut table = txn.open_table(self.definition()).map_err(map_err!(Table))?;
            for (name, value) in &encoded {
                table
                    .insert(*name, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(table = %self.table, labs = encoded.len(), "lab store rebuilt");
        Ok(())
    }
}
