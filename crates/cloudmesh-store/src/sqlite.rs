//! SQLite implementation of the ObjectStore trait.
//!
//! This is the primary storage backend for a cloudmesh node. It uses
//! rusqlite with bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;

use cloudmesh_core::{Item, ItemId, ItemSummary, Sha1Hash};

use crate::error::Result;
use crate::migration::{self, now_millis};
use crate::notify::ChangeHub;
use crate::traits::{ChangeEvent, ChangeKind, ObjectStore, Provenance, PutResult};

/// SQLite-based store implementation.
///
/// All operations use spawn_blocking to avoid blocking the async runtime.
/// Change notifications are published after the write has committed.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
    hub: ChangeHub,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        tracing::debug!(path = %path.display(), "opened sqlite store");
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            hub: ChangeHub::default(),
        }
    }

    /// Run a closure against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await?
    }
}

type ItemRow = (Vec<u8>, Vec<u8>, i64, Vec<u8>);

fn read_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_item((id, hash, timestamp, payload): ItemRow) -> Result<Item> {
    Ok(Item::from_parts(
        ItemId::try_from(id.as_slice())?,
        Sha1Hash::try_from(hash.as_slice())?,
        timestamp,
        Bytes::from(payload),
    ))
}

fn ensure_collection(conn: &Connection, collection: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?1, ?2)",
        params![collection, now_millis()],
    )?;
    Ok(())
}

#[async_trait]
impl ObjectStore for SqliteStore {
    async fn collections(&self) -> Result<Vec<String>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
        .await
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        let collection = collection.to_string();
        self.blocking(move |conn| {
            ensure_collection(conn, &collection)?;
            Ok(())
        })
        .await
    }

    async fn list(&self, collection: &str) -> Result<Vec<ItemSummary>> {
        let collection = collection.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id, hash, timestamp FROM items
                 WHERE collection = ?1 ORDER BY item_id",
            )?;
            let rows = stmt
                .query_map(params![collection], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(id, hash, timestamp)| {
                    Ok(ItemSummary {
                        id: ItemId::try_from(id.as_slice())?,
                        hash: Sha1Hash::try_from(hash.as_slice())?,
                        timestamp,
                    })
                })
                .collect()
        })
        .await
    }

    async fn get(&self, collection: &str, id: &ItemId) -> Result<Option<Item>> {
        let collection = collection.to_string();
        let id = *id;
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT item_id, hash, timestamp, payload FROM items
                     WHERE collection = ?1 AND item_id = ?2",
                    params![collection, id.as_bytes().as_slice()],
                    read_item_row,
                )
                .optional()?;
            row.map(decode_item).transpose()
        })
        .await
    }

    async fn put(&self, collection: &str, item: &Item, provenance: Provenance) -> Result<PutResult> {
        let owned_collection = collection.to_string();
        let owned_item = item.clone();
        let result = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                let id = owned_item.id.as_bytes().as_slice().to_vec();

                let tombstoned: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM tombstones WHERE collection = ?1 AND item_id = ?2)",
                    params![owned_collection, id],
                    |row| row.get(0),
                )?;
                if tombstoned {
                    return Ok(PutResult::Tombstoned);
                }

                let existed: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM items WHERE collection = ?1 AND item_id = ?2)",
                    params![owned_collection, id],
                    |row| row.get(0),
                )?;

                ensure_collection(&tx, &owned_collection)?;
                tx.execute(
                    "INSERT INTO items (collection, item_id, hash, timestamp, payload, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (collection, item_id) DO UPDATE SET
                        hash = excluded.hash,
                        timestamp = excluded.timestamp,
                        payload = excluded.payload,
                        updated_at = excluded.updated_at",
                    params![
                        owned_collection,
                        id,
                        owned_item.hash.as_bytes().as_slice(),
                        owned_item.timestamp,
                        owned_item.payload.as_ref(),
                        now_millis(),
                    ],
                )?;
                tx.commit()?;

                Ok(if existed {
                    PutResult::Updated
                } else {
                    PutResult::Inserted
                })
            })
            .await?;

        let kind = match result {
            PutResult::Tombstoned => return Ok(result),
            PutResult::Inserted => ChangeKind::Added,
            PutResult::Updated => ChangeKind::Updated,
        };
        self.hub.publish(ChangeEvent {
            collection: collection.to_string(),
            kind,
            id: item.id,
            provenance,
        });

        Ok(result)
    }

    async fn tombstones(&self, collection: &str) -> Result<Vec<ItemId>> {
        let collection = collection.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id FROM tombstones WHERE collection = ?1 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![collection], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter()
                .map(|bytes| Ok(ItemId::try_from(bytes.as_slice())?))
                .collect()
        })
        .await
    }

    async fn is_removed(&self, collection: &str, id: &ItemId) -> Result<bool> {
        let collection = collection.to_string();
        let id = *id;
        self.blocking(move |conn| {
            let removed: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM tombstones WHERE collection = ?1 AND item_id = ?2)",
                params![collection, id.as_bytes().as_slice()],
                |row| row.get(0),
            )?;
            Ok(removed)
        })
        .await
    }

    async fn mark_removed(
        &self,
        collection: &str,
        ids: &[ItemId],
        provenance: Provenance,
    ) -> Result<Vec<ItemId>> {
        let owned_collection = collection.to_string();
        let ids = ids.to_vec();
        let removed = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                ensure_collection(&tx, &owned_collection)?;

                let now = now_millis();
                let mut removed = Vec::new();
                for id in ids {
                    let inserted = tx.execute(
                        "INSERT OR IGNORE INTO tombstones (collection, item_id, removed_at)
                         VALUES (?1, ?2, ?3)",
                        params![owned_collection, id.as_bytes().as_slice(), now],
                    )?;
                    if inserted == 0 {
                        continue;
                    }
                    tx.execute(
                        "DELETE FROM items WHERE collection = ?1 AND item_id = ?2",
                        params![owned_collection, id.as_bytes().as_slice()],
                    )?;
                    removed.push(id);
                }

                tx.commit()?;
                Ok(removed)
            })
            .await?;

        for id in &removed {
            self.hub.publish(ChangeEvent {
                collection: collection.to_string(),
                kind: ChangeKind::Deleted,
                id: *id,
                provenance,
            });
        }

        Ok(removed)
    }

    fn subscribe(&self, collection: &str) -> broadcast::Receiver<ChangeEvent> {
        self.hub.subscribe(collection)
    }
}
