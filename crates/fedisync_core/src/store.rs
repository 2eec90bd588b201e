/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::collection_sync::{partial_collection_digest, FOLLOWERS};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    Pending = 0,
    Accepted = 1,
    /// Never stored: removal deletes the row.
    Removed = 2,
}

impl FollowState {
    fn from_db(v: u32) -> Option<Self> {
        match v {
            0 => Some(FollowState::Pending),
            1 => Some(FollowState::Accepted),
            _ => None,
        }
    }
}

/// One local actor following one remote actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub local_actor_id: u64,
    /// Identifier the remote side lists in its followers collection.
    pub local_actor_uri: String,
    pub remote_actor_uri: String,
    pub state: FollowState,
    /// Id of the Follow we sent, used to match Accept/Reject/Undo.
    pub follow_activity_id: Option<String>,
}

pub trait FollowerStore: Send + Sync {
    fn get_pending(&self, local_actor_id: u64, authority: &str) -> Result<Vec<Relationship>>;
    fn get_accepted(&self, local_actor_id: u64, authority: &str) -> Result<Vec<Relationship>>;
    /// Compare-and-set: applies only while the stored state still equals
    /// `rel.state`. Returns whether a row changed.
    fn transition(&self, rel: &Relationship, to: FollowState) -> Result<bool>;
    fn find_by_outbox_activity_id(&self, id: &str) -> Result<Option<Relationship>>;
    fn relationships_for_remote(&self, remote_actor_uri: &str) -> Result<Vec<Relationship>>;
    fn upsert_pending(
        &self,
        local_actor_id: u64,
        local_actor_uri: &str,
        remote_actor_uri: &str,
        follow_activity_id: Option<&str>,
    ) -> Result<Relationship>;
    fn cached_digest(&self, collection_type: &str, remote_actor_uri: &str) -> Result<Option<String>>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    authority: String,
}

impl SqliteStore {
    /// `authority` is this site's `scheme://host[:port]`; the cached
    /// followers digests only cover relationships under it.
    pub fn open(db_path: impl AsRef<Path>, authority: &str) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
        Self::init(conn, authority)
    }

    pub fn open_in_memory(authority: &str) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, authority)
    }

    fn init(conn: Connection, authority: &str) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS relationships (
              local_actor_id INTEGER NOT NULL,
              remote_actor_uri TEXT NOT NULL,
              local_actor_uri TEXT NOT NULL,
              state INTEGER NOT NULL,
              follow_activity_id TEXT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY(local_actor_id, remote_actor_uri)
            );
            CREATE INDEX IF NOT EXISTS idx_rel_follow_id ON relationships(follow_activity_id);
            CREATE INDEX IF NOT EXISTS idx_rel_remote ON relationships(remote_actor_uri);

            CREATE TABLE IF NOT EXISTS collection_digests (
              collection_type TEXT NOT NULL,
              remote_actor_uri TEXT NOT NULL,
              digest TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY(collection_type, remote_actor_uri)
            );

            CREATE TABLE IF NOT EXISTS inbox_items (
              activity_id TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              actor_id TEXT NULL,
              type TEXT NULL,
              activity_json BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_inbox_created ON inbox_items(created_at_ms DESC);

            CREATE TABLE IF NOT EXISTS objects (
              object_id TEXT PRIMARY KEY,
              actor_id TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              deleted INTEGER NOT NULL,
              object_json BLOB NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            authority: authority.trim_end_matches('/').to_string(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-call; SQLite
        // itself rolled back whatever that call had open.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn();
        let _: i64 = conn.query_row("SELECT 1", [], |r| r.get(0))?;
        Ok(())
    }

    fn list_by_state(&self, local_actor_id: u64, authority: &str, state: FollowState) -> Result<Vec<Relationship>> {
        let authority = authority.trim_end_matches('/');
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT local_actor_id, local_actor_uri, remote_actor_uri, state, follow_activity_id
            FROM relationships
            WHERE local_actor_id = ?1 AND state = ?2
              AND (local_actor_uri = ?3 OR substr(local_actor_uri, 1, length(?3) + 1) = ?3 || '/')
            ORDER BY updated_at_ms ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![local_actor_id as i64, state as u32, authority], row_to_relationship)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Remote actors `local_actor_id` has an accepted follow with, newest first.
    pub fn list_following(&self, local_actor_id: u64) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT remote_actor_uri FROM relationships WHERE local_actor_id = ?1 AND state = ?2 ORDER BY updated_at_ms DESC",
        )?;
        let rows = stmt
            .query_map(params![local_actor_id as i64, FollowState::Accepted as u32], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    /// Returns false when the id was already stored (duplicate delivery).
    pub fn store_inbox_activity(
        &self,
        activity_id: &str,
        actor_id: Option<&str>,
        ty: Option<&str>,
        activity_json: &[u8],
    ) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO inbox_items(activity_id, created_at_ms, actor_id, type, activity_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![activity_id, now_ms(), actor_id, ty, activity_json],
        )?;
        Ok(changed > 0)
    }

    #[cfg(test)]
    fn get_inbox(&self, activity_id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT activity_json FROM inbox_items WHERE activity_id = ?1",
            params![activity_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn upsert_object(&self, object_id: &str, actor_id: Option<&str>, object_json: &[u8]) -> Result<()> {
        let now = now_ms();
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO objects(object_id, actor_id, created_at_ms, updated_at_ms, deleted, object_json)
            VALUES (?1, ?2, ?3, ?3, 0, ?4)
            ON CONFLICT(object_id) DO UPDATE SET
              updated_at_ms = excluded.updated_at_ms,
              object_json = excluded.object_json,
              actor_id = COALESCE(excluded.actor_id, objects.actor_id)
            WHERE objects.deleted = 0
            "#,
            params![object_id, actor_id, now, object_json],
        )?;
        Ok(())
    }

    /// Owner of a live (not deleted) object, `None` if unknown.
    pub fn object_owner(&self, object_id: &str) -> Result<Option<Option<String>>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT actor_id FROM objects WHERE object_id = ?1 AND deleted = 0",
            params![object_id],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn mark_object_deleted(&self, object_id: &str) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE objects SET deleted = 1, updated_at_ms = ?2 WHERE object_id = ?1 AND deleted = 0",
            params![object_id, now_ms()],
        )?;
        Ok(changed > 0)
    }

    // Caller holds the connection; keeps the digest in the same write.
    fn refresh_digest(&self, conn: &Connection, remote_actor_uri: &str) -> Result<()> {
        let mut stmt = conn.prepare(
            r#"
            SELECT local_actor_uri FROM relationships
            WHERE remote_actor_uri = ?1 AND state = ?2
              AND (local_actor_uri = ?3 OR substr(local_actor_uri, 1, length(?3) + 1) = ?3 || '/')
            "#,
        )?;
        let ids = stmt
            .query_map(
                params![remote_actor_uri, FollowState::Accepted as u32, self.authority],
                |r| r.get::<_, String>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let digest = partial_collection_digest(ids.iter().map(String::as_str));
        conn.execute(
            r#"
            INSERT INTO collection_digests(collection_type, remote_actor_uri, digest, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(collection_type, remote_actor_uri) DO UPDATE SET
              digest = excluded.digest, updated_at_ms = excluded.updated_at_ms
            "#,
            params![FOLLOWERS, remote_actor_uri, digest, now_ms()],
        )?;
        Ok(())
    }
}

impl FollowerStore for SqliteStore {
    fn get_pending(&self, local_actor_id: u64, authority: &str) -> Result<Vec<Relationship>> {
        self.list_by_state(local_actor_id, authority, FollowState::Pending)
    }

    fn get_accepted(&self, local_actor_id: u64, authority: &str) -> Result<Vec<Relationship>> {
        self.list_by_state(local_actor_id, authority, FollowState::Accepted)
    }

    fn transition(&self, rel: &Relationship, to: FollowState) -> Result<bool> {
        if rel.state == to || rel.state == FollowState::Removed {
            return Ok(false);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = match to {
            FollowState::Removed => tx.execute(
                "DELETE FROM relationships WHERE local_actor_id = ?1 AND remote_actor_uri = ?2 AND state = ?3",
                params![rel.local_actor_id as i64, rel.remote_actor_uri, rel.state as u32],
            )?,
            _ => tx.execute(
                "UPDATE relationships SET state = ?4, updated_at_ms = ?5 WHERE local_actor_id = ?1 AND remote_actor_uri = ?2 AND state = ?3",
                params![
                    rel.local_actor_id as i64,
                    rel.remote_actor_uri,
                    rel.state as u32,
                    to as u32,
                    now_ms()
                ],
            )?,
        };
        if changed > 0 {
            self.refresh_digest(&tx, &rel.remote_actor_uri)?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    fn find_by_outbox_activity_id(&self, id: &str) -> Result<Option<Relationship>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                r#"
                SELECT local_actor_id, local_actor_uri, remote_actor_uri, state, follow_activity_id
                FROM relationships WHERE follow_activity_id = ?1 LIMIT 1
                "#,
                params![id],
                row_to_relationship,
            )
            .optional()?;
        Ok(row.flatten())
    }

    fn relationships_for_remote(&self, remote_actor_uri: &str) -> Result<Vec<Relationship>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT local_actor_id, local_actor_uri, remote_actor_uri, state, follow_activity_id
            FROM relationships WHERE remote_actor_uri = ?1 ORDER BY local_actor_id ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![remote_actor_uri], row_to_relationship)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    fn upsert_pending(
        &self,
        local_actor_id: u64,
        local_actor_uri: &str,
        remote_actor_uri: &str,
        follow_activity_id: Option<&str>,
    ) -> Result<Relationship> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        // An existing Accepted row stays Accepted; only the Follow id is refreshed.
        tx.execute(
            r#"
            INSERT INTO relationships(local_actor_id, remote_actor_uri, local_actor_uri, state, follow_activity_id, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(local_actor_id, remote_actor_uri) DO UPDATE SET
              local_actor_uri = excluded.local_actor_uri,
              follow_activity_id = COALESCE(excluded.follow_activity_id, relationships.follow_activity_id),
              updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                local_actor_id as i64,
                remote_actor_uri,
                local_actor_uri,
                FollowState::Pending as u32,
                follow_activity_id,
                now_ms()
            ],
        )?;
        let rel = tx
            .query_row(
                r#"
                SELECT local_actor_id, local_actor_uri, remote_actor_uri, state, follow_activity_id
                FROM relationships WHERE local_actor_id = ?1 AND remote_actor_uri = ?2
                "#,
                params![local_actor_id as i64, remote_actor_uri],
                row_to_relationship,
            )?
            .context("relationship row has unknown state")?;
        self.refresh_digest(&tx, remote_actor_uri)?;
        tx.commit()?;
        Ok(rel)
    }

    fn cached_digest(&self, collection_type: &str, remote_actor_uri: &str) -> Result<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT digest FROM collection_digests WHERE collection_type = ?1 AND remote_actor_uri = ?2",
            params![collection_type, remote_actor_uri],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }
}

fn row_to_relationship(r: &Row<'_>) -> rusqlite::Result<Option<Relationship>> {
    let state: u32 = r.get(3)?;
    let Some(state) = FollowState::from_db(state) else {
        return Ok(None);
    };
    Ok(Some(Relationship {
        local_actor_id: r.get::<_, i64>(0)? as u64,
        local_actor_uri: r.get(1)?,
        remote_actor_uri: r.get(2)?,
        state,
        follow_activity_id: r.get(4)?,
    }))
}

/// Per-`(local_actor_id, remote_actor_uri)` async locks. Accept handling and
/// reconciliation both take the lock around their read-modify-write.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<(u64, String), Arc<TokioMutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, local_actor_id: u64, remote_actor_uri: &str) -> OwnedMutexGuard<()> {
        let m = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry((local_actor_id, remote_actor_uri.to_string()))
                .or_default()
                .clone()
        };
        m.lock_owned().await
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTH: &str = "https://l.example";

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(AUTH).unwrap()
    }

    #[test]
    fn pending_then_accepted_is_a_single_row() {
        let s = store();
        let rel = s
            .upsert_pending(1, "https://l.example/users/1", "https://r.example/users/bob", Some("https://l.example/f/1"))
            .unwrap();
        assert_eq!(rel.state, FollowState::Pending);
        assert!(s.transition(&rel, FollowState::Accepted).unwrap());

        assert!(s.get_pending(1, AUTH).unwrap().is_empty());
        let accepted = s.get_accepted(1, AUTH).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].follow_activity_id.as_deref(), Some("https://l.example/f/1"));
    }

    #[test]
    fn stale_transition_does_not_apply() {
        let s = store();
        let rel = s
            .upsert_pending(1, "https://l.example/users/1", "https://r.example/users/bob", None)
            .unwrap();
        assert!(s.transition(&rel, FollowState::Accepted).unwrap());
        // Second writer still believes the row is Pending.
        assert!(!s.transition(&rel, FollowState::Removed).unwrap());
        assert_eq!(s.get_accepted(1, AUTH).unwrap().len(), 1);
    }

    #[test]
    fn authority_filter_excludes_foreign_and_lookalike_hosts() {
        let s = store();
        s.upsert_pending(1, "https://l.example/users/1", "https://r.example/a", None).unwrap();
        s.upsert_pending(1, "https://l.example.evil/users/1", "https://r.example/b", None).unwrap();
        s.upsert_pending(1, "https://other.example/users/1", "https://r.example/c", None).unwrap();
        let pending = s.get_pending(1, AUTH).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].remote_actor_uri, "https://r.example/a");
    }

    #[test]
    fn find_by_outbox_activity_id_matches_follow_id_only() {
        let s = store();
        s.upsert_pending(1, "https://l.example/users/1", "https://r.example/bob", Some("https://l.example/f/9"))
            .unwrap();
        assert!(s.find_by_outbox_activity_id("https://l.example/f/9").unwrap().is_some());
        assert!(s.find_by_outbox_activity_id("https://r.example/bob").unwrap().is_none());
    }

    #[test]
    fn digest_tracks_accepted_relationships() {
        let s = store();
        let rel = s.upsert_pending(1, "https://l.example/users/1", "https://r.example/bob", None).unwrap();
        let empty = s.cached_digest(FOLLOWERS, "https://r.example/bob").unwrap().unwrap();
        assert_eq!(empty, partial_collection_digest(std::iter::empty::<&str>()));

        s.transition(&rel, FollowState::Accepted).unwrap();
        let one = s.cached_digest(FOLLOWERS, "https://r.example/bob").unwrap().unwrap();
        assert_eq!(one, partial_collection_digest(["https://l.example/users/1"]));
    }

    #[test]
    fn inbox_activity_is_stored_once() {
        let s = store();
        assert!(s.store_inbox_activity("https://r.example/a/1", None, Some("Create"), b"{}").unwrap());
        assert!(!s.store_inbox_activity("https://r.example/a/1", None, Some("Create"), b"{}").unwrap());
        assert_eq!(s.get_inbox("https://r.example/a/1").unwrap().as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn deleted_objects_are_no_longer_known() {
        let s = store();
        s.upsert_object("https://r.example/n/1", Some("https://r.example/bob"), b"{}").unwrap();
        assert_eq!(
            s.object_owner("https://r.example/n/1").unwrap(),
            Some(Some("https://r.example/bob".to_string()))
        );
        assert!(s.mark_object_deleted("https://r.example/n/1").unwrap());
        assert!(s.object_owner("https://r.example/n/1").unwrap().is_none());
        assert!(!s.mark_object_deleted("https://r.example/n/1").unwrap());
    }

    #[tokio::test]
    async fn keyed_lock_serializes_same_key() {
        let locks = Arc::new(KeyedLocks::default());
        let g = locks.lock(1, "r").await;
        let l2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l2.lock(1, "r").await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        // A different key is independent.
        let _other = locks.lock(2, "r").await;
        drop(g);
        waiter.await.unwrap();
    }
}
