//! The Document Store Adapter (§4.A): the only persistent layer, holding
//! per-node and per-link JSON attributes plus the type-catalog tables.
//!
//! [`DocumentStore`] is specified as an async trait, the same way the
//! teacher codebase specifies its own storage boundary, so a different
//! backing (a real external document database) can be substituted without
//! touching the topology/mutation/query layers above it. [`FileDocumentStore`]
//! is the shipped implementation: one directory per database, one
//! append-only write-ahead log per table, replayed at startup.
//!
//! # Preconditions
//! - `database` and `table` names are non-empty and contain no path
//!   separators (enforced by `validation::validate_table_name`).
//!
//! # Postconditions
//! - A single call is atomic per-document: either the whole document is
//!   durable, or the call returns an error and nothing changed.

use crate::errors::SynthError;
use anyhow::{bail, ensure, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// How an insert should behave when the target primary key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    Error,
    Replace,
    Update,
}

/// Whether an insert must be fsync'd before the call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Soft,
    Hard,
}

/// Result of a batched insert, per §4.A.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: u64,
    pub replaced: u64,
    pub unchanged: u64,
    pub errors: u64,
}

pub mod validation {
    use anyhow::{ensure, Result};

    pub fn validate_table_name(name: &str) -> Result<()> {
        ensure!(!name.is_empty(), "table/database name cannot be empty");
        ensure!(
            !name.contains('/') && !name.contains('\\'),
            "table/database name cannot contain path separators"
        );
        Ok(())
    }
}

/// The JSON key that, when present on an object passed to `update`, forces
/// literal replacement of that sub-object rather than a deep merge — the
/// "literal-replacement escape" named in §4.A.
pub const LITERAL_ESCAPE_KEY: &str = "$literal";

/// Deep-merge `patch` into `existing`, honoring the literal-replacement
/// escape: an object of the shape `{"$literal": v}` replaces the
/// corresponding position in `existing` with `v` verbatim instead of
/// merging into it.
pub fn merge_with_literal_escape(existing: &Value, patch: &Value) -> Value {
    match patch {
        Value::Object(map) if map.len() == 1 && map.contains_key(LITERAL_ESCAPE_KEY) => {
            map[LITERAL_ESCAPE_KEY].clone()
        }
        Value::Object(patch_map) => {
            let mut merged = existing.as_object().cloned().unwrap_or_default();
            for (k, v) in patch_map {
                let existing_v = merged.get(k).cloned().unwrap_or(Value::Null);
                merged.insert(k.clone(), merge_with_literal_escape(&existing_v, v));
            }
            Value::Object(merged)
        }
        other => other.clone(),
    }
}

/// Thin interface to a JSON KV/table store with secondary indices.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_database(&self, database: &str) -> Result<()>;
    async fn drop_database(&self, database: &str) -> Result<()>;
    async fn database_exists(&self, database: &str) -> Result<bool>;
    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn create_table(&self, database: &str, table: &str) -> Result<()>;
    async fn create_index(&self, database: &str, table: &str, field: &str) -> Result<()>;

    async fn get(&self, database: &str, table: &str, id: &str) -> Result<Option<Value>>;
    async fn get_by_index(
        &self,
        database: &str,
        table: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Value>>;

    /// All documents in `table`, in primary-key order.
    async fn get_all(&self, database: &str, table: &str) -> Result<Vec<Value>>;

    async fn count(&self, database: &str, table: &str) -> Result<u64>;

    async fn insert(
        &self,
        database: &str,
        table: &str,
        docs: Vec<Value>,
        conflict: ConflictMode,
        durability: Durability,
    ) -> Result<InsertReport>;

    /// Merge `patch` into the document at `id` (honoring the literal
    /// escape). Returns `true` if a document existed and was updated.
    async fn update(&self, database: &str, table: &str, id: &str, patch: Value) -> Result<bool>;

    /// Returns `true` if a document existed and was removed.
    async fn delete(&self, database: &str, table: &str, id: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
enum WalEntry {
    Insert { id: String, doc: Value },
    Delete { id: String },
}

struct Table {
    docs: std::collections::BTreeMap<String, Value>,
    /// field name -> (stringified field value -> primary key)
    indices: HashMap<String, HashMap<String, String>>,
    wal_path: PathBuf,
}

impl Table {
    fn index_value(doc: &Value, field: &str) -> Option<String> {
        doc.get(field).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn reindex(&mut self, id: &str, doc: &Value) {
        for (field, map) in self.indices.iter_mut() {
            if let Some(v) = Self::index_value(doc, field) {
                map.insert(v, id.to_string());
            }
        }
    }

    fn unindex(&mut self, id: &str, doc: &Value) {
        for (field, map) in self.indices.iter_mut() {
            if let Some(v) = Self::index_value(doc, field) {
                if map.get(&v).map(|s| s.as_str()) == Some(id) {
                    map.remove(&v);
                }
            }
        }
    }
}

struct Database {
    root: PathBuf,
    tables: HashMap<String, Table>,
}

/// An embedded, file-backed [`DocumentStore`]: each database is a directory,
/// each table an append-only JSON-lines write-ahead log replayed into an
/// in-memory `BTreeMap` at open time. Modeled on the teacher crate's own
/// page/WAL persistence in `native_graph_storage.rs`, simplified to a
/// single flat log per table since documents here are small, independent
/// JSON values rather than graph pages.
pub struct FileDocumentStore {
    root: PathBuf,
    databases: RwLock<HashMap<String, Arc<RwLock<Database>>>>,
}

impl FileDocumentStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        let store = Self {
            root,
            databases: RwLock::new(HashMap::new()),
        };
        store.load_existing_databases().await?;
        Ok(store)
    }

    async fn load_existing_databases(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                self.load_database(&name).await?;
            }
        }
        Ok(())
    }

    async fn load_database(&self, name: &str) -> Result<()> {
        let db_root = self.root.join(name);
        let mut tables = HashMap::new();
        let mut entries = fs::read_dir(&db_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                let file_name = entry.file_name().to_string_lossy().to_string();
                if let Some(table_name) = file_name.strip_suffix(".wal") {
                    let table = Self::load_table(entry.path()).await?;
                    tables.insert(table_name.to_string(), table);
                }
            }
        }
        self.databases.write().await.insert(
            name.to_string(),
            Arc::new(RwLock::new(Database { root: db_root, tables })),
        );
        Ok(())
    }

    async fn load_table(wal_path: PathBuf) -> Result<Table> {
        let mut docs = std::collections::BTreeMap::new();
        if let Ok(contents) = fs::read_to_string(&wal_path).await {
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalEntry>(line) {
                    Ok(WalEntry::Insert { id, doc }) => {
                        docs.insert(id, doc);
                    }
                    Ok(WalEntry::Delete { id }) => {
                        docs.remove(&id);
                    }
                    Err(e) => warn!("skipping corrupt document-store WAL line: {e}"),
                }
            }
        }
        let mut table = Table {
            docs,
            indices: HashMap::new(),
            wal_path,
        };
        let snapshot: Vec<(String, Value)> =
            table.docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (id, doc) in snapshot {
            table.reindex(&id, &doc);
        }
        Ok(table)
    }

    async fn get_database(&self, name: &str) -> Result<Arc<RwLock<Database>>> {
        self.databases
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SynthError::nonexistence(name, "database", name).into())
    }

    async fn append_wal(wal_path: &Path, entry: &WalEntry, durability: Durability) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(wal_path)
            .await?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        if durability == Durability::Hard {
            file.sync_all().await?;
        }
        Ok(())
    }
}

impl serde::Serialize for WalEntry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        match self {
            WalEntry::Insert { id, doc } => {
                let mut s = serializer.serialize_struct("WalEntry", 3)?;
                s.serialize_field("op", "insert")?;
                s.serialize_field("id", id)?;
                s.serialize_field("doc", doc)?;
                s.end()
            }
            WalEntry::Delete { id } => {
                let mut s = serializer.serialize_struct("WalEntry", 2)?;
                s.serialize_field("op", "delete")?;
                s.serialize_field("id", id)?;
                s.end()
            }
        }
    }
}

impl<'de> serde::Deserialize<'de> for WalEntry {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Raw {
            op: String,
            id: String,
            #[serde(default)]
            doc: Option<Value>,
        }
        let raw = Raw::deserialize(deserializer)?;
        match raw.op.as_str() {
            "insert" => Ok(WalEntry::Insert {
                id: raw.id,
                doc: raw.doc.unwrap_or(Value::Null),
            }),
            "delete" => Ok(WalEntry::Delete { id: raw.id }),
            other => Err(serde::de::Error::custom(format!("unknown WAL op '{other}'"))),
        }
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    #[instrument(skip(self))]
    async fn create_database(&self, database: &str) -> Result<()> {
        validation::validate_table_name(database)?;
        let mut dbs = self.databases.write().await;
        ensure!(!dbs.contains_key(database), SynthError::duplicate_id(database));
        let db_root = self.root.join(database);
        fs::create_dir_all(&db_root).await?;
        dbs.insert(
            database.to_string(),
            Arc::new(RwLock::new(Database {
                root: db_root,
                tables: HashMap::new(),
            })),
        );
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> Result<()> {
        let mut dbs = self.databases.write().await;
        if let Some(db) = dbs.remove(database) {
            let root = db.read().await.root.clone();
            fs::remove_dir_all(&root).await.ok();
        }
        Ok(())
    }

    async fn database_exists(&self, database: &str) -> Result<bool> {
        Ok(self.databases.read().await.contains_key(database))
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.databases.read().await.keys().cloned().collect())
    }

    async fn create_table(&self, database: &str, table: &str) -> Result<()> {
        validation::validate_table_name(table)?;
        let db = self.get_database(database).await?;
        let mut db = db.write().await;
        let wal_path = db.root.join(format!("{table}.wal"));
        db.tables.entry(table.to_string()).or_insert_with(|| Table {
            docs: std::collections::BTreeMap::new(),
            indices: HashMap::new(),
            wal_path,
        });
        Ok(())
    }

    async fn create_index(&self, database: &str, table: &str, field: &str) -> Result<()> {
        let db = self.get_database(database).await?;
        let mut db = db.write().await;
        let tbl = db
            .tables
            .get_mut(table)
            .ok_or_else(|| SynthError::nonexistence(database, "table", table))?;
        tbl.indices.entry(field.to_string()).or_default();
        let snapshot: Vec<(String, Value)> = tbl.docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (id, doc) in snapshot {
            tbl.reindex(&id, &doc);
        }
        Ok(())
    }

    async fn get(&self, database: &str, table: &str, id: &str) -> Result<Option<Value>> {
        let db = self.get_database(database).await?;
        let db = db.read().await;
        Ok(db.tables.get(table).and_then(|t| t.docs.get(id).cloned()))
    }

    async fn get_by_index(
        &self,
        database: &str,
        table: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Value>> {
        let db = self.get_database(database).await?;
        let db = db.read().await;
        let Some(tbl) = db.tables.get(table) else {
            return Ok(None);
        };
        let Some(index) = tbl.indices.get(field) else {
            return Ok(None);
        };
        Ok(index.get(value).and_then(|id| tbl.docs.get(id).cloned()))
    }

    async fn get_all(&self, database: &str, table: &str) -> Result<Vec<Value>> {
        let db = self.get_database(database).await?;
        let db = db.read().await;
        Ok(db
            .tables
            .get(table)
            .map(|t| t.docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, database: &str, table: &str) -> Result<u64> {
        let db = self.get_database(database).await?;
        let db = db.read().await;
        Ok(db.tables.get(table).map(|t| t.docs.len() as u64).unwrap_or(0))
    }

    #[instrument(skip(self, docs))]
    async fn insert(
        &self,
        database: &str,
        table: &str,
        docs: Vec<Value>,
        conflict: ConflictMode,
        durability: Durability,
    ) -> Result<InsertReport> {
        let db = self.get_database(database).await?;
        let mut db = db.write().await;
        let wal_path = {
            let tbl = db
                .tables
                .get(table)
                .ok_or_else(|| SynthError::nonexistence(database, "table", table))?;
            tbl.wal_path.clone()
        };

        let mut report = InsertReport::default();
        for doc in docs {
            let Some(id) = doc.get("id").map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }) else {
                report.errors += 1;
                continue;
            };

            let tbl = db.tables.get_mut(table).unwrap();
            let existing = tbl.docs.get(&id).cloned();
            let final_doc = match (&existing, conflict) {
                (None, _) => doc,
                (Some(_), ConflictMode::Error) => {
                    report.errors += 1;
                    continue;
                }
                (Some(_), ConflictMode::Replace) => doc,
                (Some(old), ConflictMode::Update) => merge_with_literal_escape(old, &doc),
            };

            if existing.as_ref() == Some(&final_doc) {
                report.unchanged += 1;
                continue;
            }

            Self::append_wal(
                &wal_path,
                &WalEntry::Insert {
                    id: id.clone(),
                    doc: final_doc.clone(),
                },
                durability,
            )
            .await?;

            if let Some(old) = &existing {
                tbl.unindex(&id, old);
            }
            tbl.docs.insert(id.clone(), final_doc.clone());
            tbl.reindex(&id, &final_doc);

            if existing.is_some() {
                report.replaced += 1;
            } else {
                report.inserted += 1;
            }
        }
        debug!(?report, table, "insert batch complete");
        Ok(report)
    }

    async fn update(&self, database: &str, table: &str, id: &str, patch: Value) -> Result<bool> {
        let db = self.get_database(database).await?;
        let mut db = db.write().await;
        let wal_path = {
            let tbl = db
                .tables
                .get(table)
                .ok_or_else(|| SynthError::nonexistence(database, "table", table))?;
            tbl.wal_path.clone()
        };
        let tbl = db.tables.get_mut(table).unwrap();
        let Some(existing) = tbl.docs.get(id).cloned() else {
            return Ok(false);
        };
        let merged = merge_with_literal_escape(&existing, &patch);
        Self::append_wal(
            &wal_path,
            &WalEntry::Insert {
                id: id.to_string(),
                doc: merged.clone(),
            },
            Durability::Soft,
        )
        .await?;
        tbl.unindex(id, &existing);
        tbl.docs.insert(id.to_string(), merged.clone());
        tbl.reindex(id, &merged);
        Ok(true)
    }

    async fn delete(&self, database: &str, table: &str, id: &str) -> Result<bool> {
        let db = self.get_database(database).await?;
        let mut db = db.write().await;
        let wal_path = {
            let Some(tbl) = db.tables.get(table) else {
                return Ok(false);
            };
            tbl.wal_path.clone()
        };
        let tbl = db.tables.get_mut(table).unwrap();
        let Some(existing) = tbl.docs.remove(id) else {
            return Ok(false);
        };
        tbl.unindex(id, &existing);
        Self::append_wal(&wal_path, &WalEntry::Delete { id: id.to_string() }, Durability::Soft).await?;
        Ok(true)
    }
}
