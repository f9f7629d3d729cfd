//! Batched, conflict-tolerant inserts into the store.
//!
//! One transaction and one cached prepared statement per batch. Existing ids are
//! left untouched (first write wins). Comments whose post is not in the store are
//! rejected and counted as failed rather than deferred.

use crate::records::{CanonicalComment, CanonicalPost};
use crate::store::{create_indexes, drop_indexes, Store};
use anyhow::Result;
use rusqlite::params;

const INSERT_POST: &str = r#"
INSERT OR IGNORE INTO posts (
    id, platform, subreddit, author, title, selftext, url, permalink, created_utc,
    score, num_comments, is_self, over_18, locked, stickied, ups, downs, json_data
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
"#;

const INSERT_COMMENT: &str = r#"
INSERT OR IGNORE INTO comments (
    id, post_id, parent_id, link_id, platform, subreddit, author, body, permalink,
    created_utc, score, depth, stickied, ups, downs, json_data
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
"#;

/// Per-batch counts. Duplicates are neither successful nor failed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub successful: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub failed_ids: Vec<String>,
}

impl BatchOutcome {
    fn fail(&mut self, id: &str) {
        self.failed += 1;
        self.failed_ids.push(id.to_string());
    }
}

pub struct BulkLoader<'a> {
    store: &'a Store,
}

impl<'a> BulkLoader<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn insert_posts_batch(&self, posts: &[CanonicalPost]) -> Result<BatchOutcome> {
        let mut out = BatchOutcome::default();
        if posts.is_empty() {
            return Ok(out);
        }
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_POST)?;
            for p in posts {
                let json = serde_json::to_string(&p.json_data)?;
                let res = stmt.execute(params![
                    p.id, p.platform, p.subreddit, p.author, p.title, p.selftext, p.url, p.permalink,
                    p.created_utc, p.score, p.num_comments, p.is_self, p.over_18, p.locked, p.stickied,
                    p.ups, p.downs, json,
                ]);
                match res {
                    Ok(1) => out.successful += 1,
                    Ok(_) => out.duplicates += 1,
                    Err(e) => {
                        tracing::warn!("post {} rejected: {}", p.id, e);
                        out.fail(&p.id);
                    }
                }
            }
        }
        tx.commit()?;
        tracing::debug!(
            "posts batch: {} inserted, {} duplicate, {} failed",
            out.successful, out.duplicates, out.failed
        );
        Ok(out)
    }

    pub fn insert_comments_batch(&self, comments: &[CanonicalComment]) -> Result<BatchOutcome> {
        let mut out = BatchOutcome::default();
        if comments.is_empty() {
            return Ok(out);
        }
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        {
            let mut has_post = tx.prepare_cached("SELECT EXISTS(SELECT 1 FROM posts WHERE id = ?1)")?;
            let mut stmt = tx.prepare_cached(INSERT_COMMENT)?;
            let mut orphans = 0usize;
            for c in comments {
                if !has_post.query_row([&c.post_id], |r| r.get::<_, bool>(0))? {
                    orphans += 1;
                    out.fail(&c.id);
                    continue;
                }
                let json = serde_json::to_string(&c.json_data)?;
                let res = stmt.execute(params![
                    c.id, c.post_id, c.parent_id, c.link_id, c.platform, c.subreddit, c.author, c.body,
                    c.permalink, c.created_utc, c.score, c.depth, c.stickied, c.ups, c.downs, json,
                ]);
                match res {
                    Ok(1) => out.successful += 1,
                    Ok(_) => out.duplicates += 1,
                    Err(e) => {
                        tracing::warn!("comment {} rejected: {}", c.id, e);
                        out.fail(&c.id);
                    }
                }
            }
            if orphans > 0 {
                tracing::debug!("{} comment(s) reference posts not in the store", orphans);
            }
        }
        tx.commit()?;
        Ok(out)
    }

    /// Idempotent.
    pub fn drop_indexes_for_bulk_load(&self) -> Result<()> {
        drop_indexes(&self.store.conn())?;
        tracing::info!("dropped secondary indexes for bulk load");
        Ok(())
    }

    /// Idempotent.
    pub fn create_indexes_after_bulk_load(&self) -> Result<()> {
        create_indexes(&self.store.conn())?;
        tracing::info!("secondary indexes in place");
        Ok(())
    }

    /// Refresh planner statistics and merge FTS segments.
    pub fn analyze_tables(&self) -> Result<()> {
        let conn = self.store.conn();
        conn.execute_batch(
            "ANALYZE posts;
             ANALYZE comments;
             INSERT INTO posts_fts(posts_fts) VALUES ('optimize');
             INSERT INTO comments_fts(comments_fts) VALUES ('optimize');",
        )?;
        Ok(())
    }
}
