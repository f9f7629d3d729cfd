//! Embedded SQLite store: schema, FTS5 projections and a small connection pool.

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

const AUTHOR_COUNTS: &str = r#"
SELECT author, SUM(n) FROM (
    SELECT author, COUNT(*) AS n FROM posts WHERE subreddit = ?1 COLLATE NOCASE GROUP BY author
    UNION ALL
    SELECT author, COUNT(*) AS n FROM comments WHERE subreddit = ?1 COLLATE NOCASE GROUP BY author
)
GROUP BY author
ORDER BY author
"#;

/// Applied to every pooled connection.
const CONNECTION_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;
PRAGMA cache_size = -65536;
"#;

const CREATE_POSTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS posts (
    seq          INTEGER PRIMARY KEY,   -- stable rowid for the FTS projection
    id           TEXT NOT NULL UNIQUE,
    platform     TEXT NOT NULL,
    subreddit    TEXT NOT NULL,
    author       TEXT NOT NULL,
    title        TEXT NOT NULL,
    selftext     TEXT NOT NULL DEFAULT '',
    url          TEXT NOT NULL DEFAULT '',
    permalink    TEXT NOT NULL DEFAULT '',
    created_utc  INTEGER NOT NULL,
    score        INTEGER NOT NULL DEFAULT 0,
    num_comments INTEGER NOT NULL DEFAULT 0,
    is_self      INTEGER NOT NULL DEFAULT 0,
    over_18      INTEGER NOT NULL DEFAULT 0,
    locked       INTEGER NOT NULL DEFAULT 0,
    stickied     INTEGER NOT NULL DEFAULT 0,
    ups          INTEGER,
    downs        INTEGER,
    json_data    TEXT
)
"#;

const CREATE_COMMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS comments (
    seq          INTEGER PRIMARY KEY,
    id           TEXT NOT NULL UNIQUE,
    post_id      TEXT NOT NULL REFERENCES posts(id),
    parent_id    TEXT NOT NULL,
    link_id      TEXT NOT NULL,
    platform     TEXT NOT NULL,
    subreddit    TEXT NOT NULL,
    author       TEXT NOT NULL,
    body         TEXT NOT NULL,
    permalink    TEXT NOT NULL DEFAULT '',
    created_utc  INTEGER NOT NULL,
    score        INTEGER NOT NULL DEFAULT 0,
    depth        INTEGER NOT NULL DEFAULT 0,
    stickied     INTEGER NOT NULL DEFAULT 0,
    ups          INTEGER,
    downs        INTEGER,
    json_data    TEXT
)
"#;

/// External-content FTS5 tables kept in sync by triggers.
const CREATE_FTS: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS posts_fts USING fts5(
    title, selftext, content='posts', content_rowid='seq', tokenize='porter unicode61'
);
CREATE VIRTUAL TABLE IF NOT EXISTS comments_fts USING fts5(
    body, content='comments', content_rowid='seq', tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS posts_fts_ai AFTER INSERT ON posts BEGIN
    INSERT INTO posts_fts(rowid, title, selftext) VALUES (new.seq, new.title, new.selftext);
END;
CREATE TRIGGER IF NOT EXISTS posts_fts_ad AFTER DELETE ON posts BEGIN
    INSERT INTO posts_fts(posts_fts, rowid, title, selftext) VALUES ('delete', old.seq, old.title, old.selftext);
END;
CREATE TRIGGER IF NOT EXISTS posts_fts_au AFTER UPDATE ON posts BEGIN
    INSERT INTO posts_fts(posts_fts, rowid, title, selftext) VALUES ('delete', old.seq, old.title, old.selftext);
    INSERT INTO posts_fts(rowid, title, selftext) VALUES (new.seq, new.title, new.selftext);
END;

CREATE TRIGGER IF NOT EXISTS comments_fts_ai AFTER INSERT ON comments BEGIN
    INSERT INTO comments_fts(rowid, body) VALUES (new.seq, new.body);
END;
CREATE TRIGGER IF NOT EXISTS comments_fts_ad AFTER DELETE ON comments BEGIN
    INSERT INTO comments_fts(comments_fts, rowid, body) VALUES ('delete', old.seq, old.body);
END;
CREATE TRIGGER IF NOT EXISTS comments_fts_au AFTER UPDATE ON comments BEGIN
    INSERT INTO comments_fts(comments_fts, rowid, body) VALUES ('delete', old.seq, old.body);
    INSERT INTO comments_fts(rowid, body) VALUES (new.seq, new.body);
END;
"#;

/// Secondary indexes; safe to drop for bulk loads.
pub(crate) const SECONDARY_INDEXES: &[(&str, &str)] = &[
    ("idx_posts_subreddit", "posts(subreddit)"),
    ("idx_posts_author", "posts(author)"),
    ("idx_posts_created", "posts(created_utc)"),
    ("idx_posts_score", "posts(score)"),
    ("idx_comments_post_id", "comments(post_id)"),
    ("idx_comments_subreddit", "comments(subreddit)"),
    ("idx_comments_author", "comments(author)"),
    ("idx_comments_created", "comments(created_utc)"),
    ("idx_comments_score", "comments(score)"),
];

#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseInfo {
    pub db_size_mb: f64,
    pub post_count: u64,
    pub comment_count: u64,
}

/// Connection pool over one database file.
pub struct Store {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
}

/// A checked-out connection; returned to the pool on drop.
pub struct PooledConn<'a> {
    store: &'a Store,
    conn: Option<Connection>,
}

impl Deref for PooledConn<'_> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        // only None during drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!("connection taken"))
    }
}

impl DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("connection taken"))
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.store.idle.lock().push(conn);
            self.store.available.notify_one();
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open database {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(30))?;
    conn.execute_batch(CONNECTION_PRAGMAS)?;
    Ok(conn)
}

impl Store {
    pub fn open(path: &Path, pool_size: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let conns = (0..pool_size.max(1))
            .map(|_| open_connection(path))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!("opened {} with {} pooled connection(s)", path.display(), conns.len());
        Ok(Self { path: path.to_path_buf(), idle: Mutex::new(conns), available: Condvar::new() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until a connection is free.
    pub fn conn(&self) -> PooledConn<'_> {
        let mut idle = self.idle.lock();
        loop {
            if let Some(conn) = idle.pop() {
                return PooledConn { store: self, conn: Some(conn) };
            }
            self.available.wait(&mut idle);
        }
    }

    /// Create tables, FTS projections, triggers and secondary indexes. Idempotent.
    pub fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(CREATE_POSTS_TABLE)?;
        conn.execute_batch(CREATE_COMMENTS_TABLE)?;
        conn.execute_batch(CREATE_FTS).context("create FTS5 tables (is SQLite built with FTS5?)")?;
        create_indexes(&conn)?;
        Ok(())
    }

    pub fn health_check(&self) -> bool {
        let conn = self.conn();
        match conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)) {
            Ok(1) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("database health check failed: {}", e);
                false
            }
        }
    }

    /// Ask SQLite to drop page caches on every idle connection. Returns how many were shrunk.
    pub fn release_memory(&self) -> usize {
        let idle = self.idle.lock();
        idle.iter()
            .filter(|conn| match conn.execute_batch("PRAGMA shrink_memory;") {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("shrink_memory failed: {}", e);
                    false
                }
            })
            .count()
    }

    /// `(author, rows)` for one subreddit over posts and comments, by author.
    pub fn author_counts(&self, subreddit: &str) -> Result<Vec<(String, u64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(AUTHOR_COUNTS)?;
        let rows = stmt.query_map([subreddit], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?.max(0) as u64)))?;
        let counts = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    pub fn database_info(&self) -> Result<DatabaseInfo> {
        let conn = self.conn();
        let pages: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let post_count: i64 = conn.query_row("SELECT COUNT(*) FROM posts", [], |r| r.get(0))?;
        let comment_count: i64 = conn.query_row("SELECT COUNT(*) FROM comments", [], |r| r.get(0))?;
        Ok(DatabaseInfo {
            db_size_mb: (pages * page_size) as f64 / (1024.0 * 1024.0),
            post_count: post_count as u64,
            comment_count: comment_count as u64,
        })
    }
}

pub(crate) fn create_indexes(conn: &Connection) -> Result<()> {
    for (name, target) in SECONDARY_INDEXES {
        conn.execute_batch(&format!("CREATE INDEX IF NOT EXISTS {name} ON {target};"))?;
    }
    Ok(())
}

pub(crate) fn drop_indexes(conn: &Connection) -> Result<()> {
    for (name, _) in SECONDARY_INDEXES {
        conn.execute_batch(&format!("DROP INDEX IF EXISTS {name};"))?;
    }
    Ok(())
}
