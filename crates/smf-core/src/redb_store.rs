//! On-disk object store using redb.
//!
//! # Table design
//!
//! A single `OBJECTS` table keyed by DN (UTF-8 bytes). The value is the
//! JSON-encoded attribute map of the object. Attribute writes are a
//! read-modify-write inside one write transaction, so a crash never leaves a
//! half-written attribute set behind.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Result, SmfError};
use crate::store::{AttrValue, Attributes, ObjectStore, SessionRegistry};

/// Key: DN bytes. Value: JSON-encoded `Attributes`.
const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");

fn store_err(e: impl std::fmt::Display) -> SmfError {
    SmfError::Store(e.to_string())
}

pub struct RedbStore {
    db: Database,
    sessions: SessionRegistry,
}

impl RedbStore {
    /// Open or create the database at `path`.
    ///
    /// Creates the `OBJECTS` table if it doesn't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(OBJECTS).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self {
            db,
            sessions: SessionRegistry::default(),
        })
    }

    fn get(&self, dn: &str) -> Result<Option<Attributes>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(OBJECTS).map_err(store_err)?;
        let entry = table.get(dn.as_bytes()).map_err(store_err)?;
        match entry {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }
}

impl ObjectStore for RedbStore {
    fn exists(&self, dn: &str) -> Result<bool> {
        Ok(self.get(dn)?.is_some())
    }

    fn create(&self, dn: &str, attrs: Attributes) -> Result<()> {
        let value = serde_json::to_vec(&attrs)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(OBJECTS).map_err(store_err)?;
            if table.get(dn.as_bytes()).map_err(store_err)?.is_some() {
                return Err(SmfError::Store(format!("object already exists: {dn}")));
            }
            table
                .insert(dn.as_bytes(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    fn read(&self, dn: &str) -> Result<Option<Attributes>> {
        self.get(dn)
    }

    fn write_attr(&self, dn: &str, name: &str, value: AttrValue) -> Result<()> {
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(OBJECTS).map_err(store_err)?;
            let mut attrs: Attributes = {
                let current = table
                    .get(dn.as_bytes())
                    .map_err(store_err)?
                    .ok_or_else(|| SmfError::Store(format!("object not found: {dn}")))?;
                serde_json::from_slice(current.value())?
            };
            attrs.insert(name.to_string(), value);
            let encoded = serde_json::to_vec(&attrs)?;
            table
                .insert(dn.as_bytes(), encoded.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    fn delete(&self, dn: &str) -> Result<()> {
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(OBJECTS).map_err(store_err)?;
            table.remove(dn.as_bytes()).map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(OBJECTS).map_err(store_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (k, _) = entry.map_err(store_err)?;
            result.push(String::from_utf8_lossy(k.value()).into_owned());
        }
        Ok(result)
    }

    fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
