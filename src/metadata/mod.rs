pub mod schema;
pub mod types;

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{BlobHash, BlockId, BlockKey, GatewayError, ObjectId, Result};
use types::{
    BlockRecord, CommitOutcome, CopyStats, FsStats, InodeRecord, Linkage, ObjectRecord, Release,
    Timestamp,
};

/// Thread-safe SQLite-backed metadata database.
///
/// Every refcount transition runs inside one transaction so that a crash
/// between steps cannot leave `blocks`/`objects` refcounts disagreeing with
/// the `inode_blocks` linkage.
pub struct MetadataDb {
    conn: Mutex<Connection>,
}

impl MetadataDb {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        schema::init_schema(&conn)?;
        schema::ensure_root(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        schema::ensure_root(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Block currently linked to the given logical block.
    pub fn block_of(&self, key: BlockKey) -> Result<Option<BlockId>> {
        let conn = self.conn.lock();
        Ok(linked_block(&conn, key)?)
    }

    /// Object holding the given block's content.
    pub fn object_of(&self, block_id: BlockId) -> Result<Option<ObjectId>> {
        let conn = self.conn.lock();
        let obj_id = conn
            .query_row(
                "SELECT obj_id FROM blocks WHERE id = ?1",
                params![block_id.0],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(obj_id.map(ObjectId))
    }

    pub fn get_block(&self, block_id: BlockId) -> Result<Option<BlockRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, hash, refcount, obj_id, size FROM blocks WHERE id = ?1",
        )?;
        Ok(stmt.query_row(params![block_id.0], row_to_block).optional()?)
    }

    pub fn block_by_hash(&self, hash: &BlobHash) -> Result<Option<BlockRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, hash, refcount, obj_id, size FROM blocks WHERE hash = ?1",
        )?;
        Ok(stmt
            .query_row(params![hash.as_slice()], row_to_block)
            .optional()?)
    }

    pub fn get_object(&self, obj_id: ObjectId) -> Result<Option<ObjectRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, refcount, size FROM objects WHERE id = ?1",
                params![obj_id.0],
                |row| {
                    let size: i64 = row.get(2)?;
                    Ok(ObjectRecord {
                        id: ObjectId(row.get(0)?),
                        refcount: row.get(1)?,
                        size: (size >= 0).then_some(size as u64),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Link the logical block `key` to content with the given hash.
    ///
    /// Creates the block and object rows for new content, shares an existing
    /// block when the hash is already known, and releases whatever block the
    /// key pointed at before. All in one transaction.
    pub fn commit_block(&self, key: BlockKey, hash: &BlobHash, size: u64) -> Result<CommitOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let old_block = linked_block(&tx, key)?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM blocks WHERE hash = ?1",
                params![hash.as_slice()],
                |row| row.get(0),
            )
            .optional()?;

        let unconfirmed = match existing {
            Some(id) => tx
                .query_row(
                    "SELECT objects.id FROM blocks JOIN objects ON objects.id = blocks.obj_id
                     WHERE blocks.id = ?1 AND objects.size < 0",
                    params![id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .map(ObjectId),
            None => None,
        };

        let linkage = match existing {
            Some(id) if old_block == Some(BlockId(id)) => {
                tx.commit()?;
                return Ok(CommitOutcome {
                    linkage: Linkage::Unchanged {
                        block_id: BlockId(id),
                    },
                    released: None,
                    unconfirmed,
                });
            }
            Some(id) => {
                tx.execute(
                    "UPDATE blocks SET refcount = refcount + 1 WHERE id = ?1",
                    params![id],
                )?;
                link(&tx, key, BlockId(id))?;
                Linkage::Deduplicated {
                    block_id: BlockId(id),
                }
            }
            None => {
                tx.execute("INSERT INTO objects (refcount, size) VALUES (1, -1)", [])?;
                let obj_id = ObjectId(tx.last_insert_rowid());
                tx.execute(
                    "INSERT INTO blocks (refcount, obj_id, hash, size) VALUES (1, ?1, ?2, ?3)",
                    params![obj_id.0, hash.as_slice(), size as i64],
                )?;
                let block_id = BlockId(tx.last_insert_rowid());
                link(&tx, key, block_id)?;
                debug!(%key, %block_id, %obj_id, "Created new block and object");
                Linkage::New { block_id, obj_id }
            }
        };

        let released = match old_block {
            Some(old) => Some(release_reference(&tx, old)?),
            None => None,
        };
        tx.commit()?;

        Ok(CommitOutcome {
            linkage,
            released,
            unconfirmed,
        })
    }

    /// Record the confirmed stored size of an uploaded object.
    ///
    /// Returns false if the object row was deleted while the upload ran.
    pub fn set_object_size(&self, obj_id: ObjectId, size: u64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE objects SET size = ?1 WHERE id = ?2",
            params![size as i64, obj_id.0],
        )?;
        Ok(rows > 0)
    }

    /// Detach the logical block `key` from its content block.
    ///
    /// Returns `None` if the key was not linked.
    pub fn release_block(&self, key: BlockKey) -> Result<Option<Release>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let Some(block_id) = linked_block(&tx, key)? else {
            return Ok(None);
        };
        tx.execute(
            "DELETE FROM inode_blocks WHERE inode = ?1 AND blockno = ?2",
            params![key.inode as i64, key.blockno as i64],
        )?;
        let release = release_reference(&tx, block_id)?;
        tx.commit()?;
        Ok(Some(release))
    }

    /// Number of `inode_blocks` rows pointing at `block_id`.
    pub fn block_references(&self, block_id: BlockId) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM inode_blocks WHERE block_id = ?1",
            params![block_id.0],
            |row| row.get(0),
        )?)
    }

    pub fn count_blocks(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(id) FROM blocks", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn count_objects(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(id) FROM objects", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Aggregate statistics for status reporting.
    pub fn stats(&self) -> Result<FsStats> {
        let conn = self.conn.lock();
        let get = |sql: &str| -> rusqlite::Result<u64> {
            let v: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(v.max(0) as u64)
        };
        Ok(FsStats {
            entries: get("SELECT COUNT(rowid) FROM contents")?,
            objects: get("SELECT COUNT(id) FROM objects")?,
            inodes: get("SELECT COUNT(id) FROM inodes")?,
            fs_size: get("SELECT COALESCE(SUM(size), 0) FROM inodes")?,
            dedup_size: get("SELECT COALESCE(SUM(size), 0) FROM blocks")?,
            stored_size: get("SELECT COALESCE(SUM(size), 0) FROM objects WHERE size >= 0")?,
        })
    }

    /// Sum of logical file sizes.
    pub fn total_inode_size(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let v: i64 = conn.query_row("SELECT COALESCE(SUM(size), 0) FROM inodes", [], |row| {
            row.get(0)
        })?;
        Ok(v.max(0) as u64)
    }

    /// Create an inode with refcount 0; linking it into a directory raises it.
    pub fn create_inode(&self, mode: u32) -> Result<u64> {
        let conn = self.conn.lock();
        let now = Timestamp::now();
        conn.execute(
            "INSERT INTO inodes (mode, size, refcount, mtime_secs, mtime_nanos,
             ctime_secs, ctime_nanos, locked)
             VALUES (?1, 0, 0, ?2, ?3, ?2, ?3, 0)",
            params![mode, now.secs, now.nanos],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    pub fn get_inode(&self, id: u64) -> Result<Option<InodeRecord>> {
        let conn = self.conn.lock();
        Ok(fetch_inode(&conn, id)?)
    }

    /// Set the logical size of an inode and bump its mtime.
    pub fn set_inode_size(&self, id: u64, size: u64) -> Result<()> {
        let conn = self.conn.lock();
        let now = Timestamp::now();
        let rows = conn.execute(
            "UPDATE inodes SET size = ?1, mtime_secs = ?2, mtime_nanos = ?3,
             ctime_secs = ?2, ctime_nanos = ?3 WHERE id = ?4",
            params![size as i64, now.secs, now.nanos, id as i64],
        )?;
        if rows == 0 {
            return Err(GatewayError::NotFound(format!("inode {id}")));
        }
        Ok(())
    }

    /// Grow an inode to at least `min_size` without undoing a concurrent
    /// larger extension.
    pub fn extend_inode_size(&self, id: u64, min_size: u64) -> Result<()> {
        let conn = self.conn.lock();
        let now = Timestamp::now();
        let rows = conn.execute(
            "UPDATE inodes SET size = MAX(size, ?1), mtime_secs = ?2, mtime_nanos = ?3,
             ctime_secs = ?2, ctime_nanos = ?3 WHERE id = ?4",
            params![min_size as i64, now.secs, now.nanos, id as i64],
        )?;
        if rows == 0 {
            return Err(GatewayError::NotFound(format!("inode {id}")));
        }
        Ok(())
    }

    pub fn delete_inode(&self, id: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM inodes WHERE id = ?1", params![id as i64])?;
        Ok(())
    }

    /// Add a directory entry `name` in `parent` pointing at `inode`.
    pub fn add_entry(&self, parent: u64, name: &str, inode: u64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO names (name, refcount) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET refcount = refcount + 1",
            params![name.as_bytes()],
        )?;
        let name_id: i64 = tx.query_row(
            "SELECT id FROM names WHERE name = ?1",
            params![name.as_bytes()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO contents (name_id, inode, parent_inode) VALUES (?1, ?2, ?3)",
            params![name_id, inode as i64, parent as i64],
        )?;
        tx.execute(
            "UPDATE inodes SET refcount = refcount + 1 WHERE id = ?1",
            params![inode as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Look up the inode of `name` in `parent`.
    pub fn lookup(&self, parent: u64, name: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let inode = conn
            .query_row(
                "SELECT contents.inode FROM contents JOIN names ON names.id = contents.name_id
                 WHERE contents.parent_inode = ?1 AND names.name = ?2",
                params![parent as i64, name.as_bytes()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(inode.map(|i| i as u64))
    }

    /// Names of the entries in directory `parent`, sorted.
    pub fn list_children(&self, parent: u64) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT names.name, contents.inode FROM contents
             JOIN names ON names.id = contents.name_id
             WHERE contents.parent_inode = ?1 ORDER BY names.name",
        )?;
        let children = stmt
            .query_map(params![parent as i64], |row| {
                let name: Vec<u8> = row.get(0)?;
                let inode: i64 = row.get(1)?;
                Ok((String::from_utf8_lossy(&name).to_string(), inode as u64))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(children)
    }

    /// Remove the entry `name` from `parent`.
    ///
    /// Returns the inode it pointed at and that inode's remaining refcount.
    pub fn remove_entry(&self, parent: u64, name: &str) -> Result<(u64, i64)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let found: Option<(i64, i64)> = tx
            .query_row(
                "SELECT names.id, contents.inode FROM contents
                 JOIN names ON names.id = contents.name_id
                 WHERE contents.parent_inode = ?1 AND names.name = ?2",
                params![parent as i64, name.as_bytes()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((name_id, inode)) = found else {
            return Err(GatewayError::NotFound(name.to_string()));
        };

        tx.execute(
            "DELETE FROM contents WHERE parent_inode = ?1 AND name_id = ?2",
            params![parent as i64, name_id],
        )?;
        tx.execute(
            "UPDATE names SET refcount = refcount - 1 WHERE id = ?1",
            params![name_id],
        )?;
        tx.execute(
            "DELETE FROM names WHERE id = ?1 AND refcount <= 0",
            params![name_id],
        )?;
        tx.execute(
            "UPDATE inodes SET refcount = refcount - 1 WHERE id = ?1",
            params![inode],
        )?;
        let refcount: i64 = tx.query_row(
            "SELECT refcount FROM inodes WHERE id = ?1",
            params![inode],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok((inode as u64, refcount))
    }

    /// Replicate the directory tree below `src` into the directory `target`.
    ///
    /// File inodes are copied and share the source's blocks; block refcounts
    /// rise by the number of new references. Inodes with several links inside
    /// the tree stay hard links in the copy.
    pub fn copy_tree(&self, src: u64, target: u64) -> Result<CopyStats> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut stats = CopyStats::default();

        let Some(src_inode) = fetch_inode(&tx, src)? else {
            return Err(GatewayError::NotFound(format!("inode {src}")));
        };
        let rows = tx.execute(
            "UPDATE inodes SET mode = ?1, mtime_secs = ?2, mtime_nanos = ?3,
             ctime_secs = ?4, ctime_nanos = ?5 WHERE id = ?6",
            params![
                src_inode.mode,
                src_inode.mtime.secs,
                src_inode.mtime.nanos,
                src_inode.ctime.secs,
                src_inode.ctime.nanos,
                target as i64
            ],
        )?;
        if rows == 0 {
            return Err(GatewayError::NotFound(format!("inode {target}")));
        }

        let mut queue = vec![(src, target)];
        let mut id_cache: HashMap<u64, u64> = HashMap::new();

        while let Some((src_dir, target_dir)) = queue.pop() {
            let children: Vec<(i64, i64)> = {
                let mut stmt = tx.prepare_cached(
                    "SELECT name_id, inode FROM contents WHERE parent_inode = ?1 ORDER BY name_id",
                )?;
                let rows = stmt
                    .query_map(params![src_dir as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            for (name_id, id) in children {
                let id = id as u64;
                let new_id = match id_cache.get(&id) {
                    Some(&new_id) => {
                        tx.execute(
                            "UPDATE inodes SET refcount = refcount + 1 WHERE id = ?1",
                            params![new_id as i64],
                        )?;
                        new_id
                    }
                    None => {
                        let Some(inode) = fetch_inode(&tx, id)? else {
                            return Err(GatewayError::Other(format!(
                                "directory entry points at missing inode {id}"
                            )));
                        };
                        tx.execute(
                            "INSERT INTO inodes (mode, size, refcount, mtime_secs, mtime_nanos,
                             ctime_secs, ctime_nanos, locked)
                             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, 0)",
                            params![
                                inode.mode,
                                inode.size as i64,
                                inode.mtime.secs,
                                inode.mtime.nanos,
                                inode.ctime.secs,
                                inode.ctime.nanos
                            ],
                        )?;
                        let new_id = tx.last_insert_rowid() as u64;
                        stats.files += 1;
                        stats.size += inode.size;
                        if inode.refcount != 1 {
                            id_cache.insert(id, new_id);
                        }

                        tx.execute(
                            "INSERT INTO inode_blocks (inode, blockno, block_id)
                             SELECT ?1, blockno, block_id FROM inode_blocks WHERE inode = ?2",
                            params![new_id as i64, id as i64],
                        )?;
                        tx.execute(
                            "UPDATE blocks SET refcount = refcount +
                               (SELECT COUNT(*) FROM inode_blocks
                                WHERE inode = ?1 AND block_id = blocks.id)
                             WHERE id IN (SELECT block_id FROM inode_blocks WHERE inode = ?1)",
                            params![new_id as i64],
                        )?;

                        let has_children: bool = tx.query_row(
                            "SELECT EXISTS(SELECT 1 FROM contents WHERE parent_inode = ?1)",
                            params![id as i64],
                            |row| row.get(0),
                        )?;
                        if has_children {
                            queue.push((id, new_id));
                        }
                        new_id
                    }
                };

                tx.execute(
                    "INSERT INTO contents (name_id, inode, parent_inode) VALUES (?1, ?2, ?3)",
                    params![name_id, new_id as i64, target_dir as i64],
                )?;
                tx.execute(
                    "UPDATE names SET refcount = refcount + 1 WHERE id = ?1",
                    params![name_id],
                )?;
            }
        }

        tx.commit()?;
        Ok(stats)
    }
}

fn linked_block(conn: &Connection, key: BlockKey) -> rusqlite::Result<Option<BlockId>> {
    let id = conn
        .query_row(
            "SELECT block_id FROM inode_blocks WHERE inode = ?1 AND blockno = ?2",
            params![key.inode as i64, key.blockno as i64],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(id.map(BlockId))
}

fn link(conn: &Connection, key: BlockKey, block_id: BlockId) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO inode_blocks (block_id, inode, blockno) VALUES (?1, ?2, ?3)",
        params![block_id.0, key.inode as i64, key.blockno as i64],
    )?;
    Ok(())
}

/// Drop one reference to `block_id`, cascading into its object.
fn release_reference(conn: &Connection, block_id: BlockId) -> rusqlite::Result<Release> {
    let (refcount, obj_id): (i64, i64) = conn.query_row(
        "SELECT refcount, obj_id FROM blocks WHERE id = ?1",
        params![block_id.0],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if refcount > 1 {
        conn.execute(
            "UPDATE blocks SET refcount = refcount - 1 WHERE id = ?1",
            params![block_id.0],
        )?;
        return Ok(Release::Decremented(block_id));
    }

    conn.execute("DELETE FROM blocks WHERE id = ?1", params![block_id.0])?;
    let obj_refcount: i64 = conn.query_row(
        "SELECT refcount FROM objects WHERE id = ?1",
        params![obj_id],
        |row| row.get(0),
    )?;
    if obj_refcount > 1 {
        conn.execute(
            "UPDATE objects SET refcount = refcount - 1 WHERE id = ?1",
            params![obj_id],
        )?;
        return Ok(Release::BlockDeleted(block_id));
    }

    conn.execute("DELETE FROM objects WHERE id = ?1", params![obj_id])?;
    Ok(Release::ObjectDeleted(block_id, ObjectId(obj_id)))
}

fn fetch_inode(conn: &Connection, id: u64) -> rusqlite::Result<Option<InodeRecord>> {
    conn.query_row(
        "SELECT id, mode, size, refcount, mtime_secs, mtime_nanos, ctime_secs, ctime_nanos, locked
         FROM inodes WHERE id = ?1",
        params![id as i64],
        |row| {
            Ok(InodeRecord {
                id: row.get::<_, i64>(0)? as u64,
                mode: row.get(1)?,
                size: row.get::<_, i64>(2)?.max(0) as u64,
                refcount: row.get(3)?,
                mtime: Timestamp {
                    secs: row.get(4)?,
                    nanos: row.get(5)?,
                },
                ctime: Timestamp {
                    secs: row.get(6)?,
                    nanos: row.get(7)?,
                },
                locked: row.get(8)?,
            })
        },
    )
    .optional()
}

fn row_to_block(row: &rusqlite::Row) -> rusqlite::Result<BlockRecord> {
    let hash_bytes: Vec<u8> = row.get(1)?;
    let mut hash = [0u8; 32];
    if hash_bytes.len() == hash.len() {
        hash.copy_from_slice(&hash_bytes);
    }
    Ok(BlockRecord {
        id: BlockId(row.get(0)?),
        hash,
        refcount: row.get(2)?,
        obj_id: ObjectId(row.get(3)?),
        size: row.get::<_, i64>(4)?.max(0) as u64,
    })
}
