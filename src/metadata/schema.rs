use rusqlite::Connection;

use crate::metadata::types::{Timestamp, MODE_DIR, ROOT_INODE};

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch("PRAGMA busy_timeout=5000;")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS objects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            refcount INTEGER NOT NULL,
            size INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS blocks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash BLOB NOT NULL UNIQUE,
            refcount INTEGER NOT NULL,
            obj_id INTEGER NOT NULL,
            size INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_blocks_obj ON blocks(obj_id);

        CREATE TABLE IF NOT EXISTS inode_blocks (
            inode INTEGER NOT NULL,
            blockno INTEGER NOT NULL,
            block_id INTEGER NOT NULL,
            PRIMARY KEY (inode, blockno)
        );

        CREATE INDEX IF NOT EXISTS idx_inode_blocks_block ON inode_blocks(block_id);

        CREATE TABLE IF NOT EXISTS inodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mode INTEGER NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            refcount INTEGER NOT NULL,
            mtime_secs INTEGER NOT NULL,
            mtime_nanos INTEGER NOT NULL,
            ctime_secs INTEGER NOT NULL,
            ctime_nanos INTEGER NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS names (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name BLOB NOT NULL UNIQUE,
            refcount INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contents (
            rowid INTEGER PRIMARY KEY AUTOINCREMENT,
            name_id INTEGER NOT NULL,
            inode INTEGER NOT NULL,
            parent_inode INTEGER NOT NULL,
            UNIQUE (parent_inode, name_id)
        );

        CREATE INDEX IF NOT EXISTS idx_contents_parent ON contents(parent_inode);
        ",
    )?;

    Ok(())
}

/// Ensure the root directory inode exists.
pub fn ensure_root(conn: &Connection) -> rusqlite::Result<()> {
    let now = Timestamp::now();
    conn.execute(
        "INSERT OR IGNORE INTO inodes (id, mode, size, refcount, mtime_secs, mtime_nanos,
         ctime_secs, ctime_nanos, locked)
         VALUES (?1, ?2, 0, 1, ?3, ?4, ?3, ?4, 0)",
        rusqlite::params![ROOT_INODE as i64, MODE_DIR | 0o755, now.secs, now.nanos],
    )?;
    Ok(())
}
