/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::now_ms;
use anyhow::{Context, Result};
use async_trait::async_trait;
use fedisync_protocol::CollectionSyncParams;
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    CollectionSync {
        collection_type: String,
        local_actor_id: u64,
        remote_actor_uri: String,
        params: CollectionSyncParams,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::CollectionSync { .. } => "collection_sync",
        }
    }
}

/// Fire-and-forget deferred execution, at-least-once.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Returns false when an identical job is already waiting.
    async fn schedule_once(&self, delay: Duration, job: Job) -> Result<bool>;
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: Job) -> Result<()>;
}

const STATUS_PENDING: u32 = 0;
const STATUS_RUNNING: u32 = 1;
const STATUS_DONE: u32 = 2;

#[derive(Clone)]
pub struct JobQueue {
    conn: Arc<Mutex<Connection>>,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone)]
struct QueuedJob {
    id: String,
    job: Job,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub done: u64,
}

impl JobQueue {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
              id TEXT PRIMARY KEY,
              job_key TEXT NOT NULL,
              name TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              run_at_ms INTEGER NOT NULL,
              status INTEGER NOT NULL,
              job_json TEXT NOT NULL,
              last_error TEXT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON scheduled_jobs(status, run_at_ms);
            CREATE INDEX IF NOT EXISTS idx_jobs_key ON scheduled_jobs(job_key, status);
            "#,
        )?;
        // Jobs claimed by a process that died never finished: run them again.
        let requeued = conn.execute(
            "UPDATE scheduled_jobs SET status = ?1 WHERE status = ?2",
            params![STATUS_PENDING, STATUS_RUNNING],
        )?;
        if requeued > 0 {
            info!("requeued {requeued} interrupted job(s)");
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notify: Arc::new(Notify::new()),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|p| p.into_inner());
            f(&mut guard)
        })
        .await?
    }

    pub fn start_worker(&self, shutdown: watch::Receiver<bool>, runner: Arc<dyn JobRunner>) {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.run_loop(shutdown, runner).await {
                warn!("job worker stopped: {e:#}");
            }
        });
    }

    async fn run_loop(&self, mut shutdown: watch::Receiver<bool>, runner: Arc<dyn JobRunner>) -> Result<()> {
        let tick = Duration::from_secs(2);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let jobs = self.claim_due(20, now_ms()).await?;
            if jobs.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
            for queued in jobs {
                self.run_one(runner.as_ref(), queued).await?;
            }
        }
        Ok(())
    }

    async fn run_one(&self, runner: &dyn JobRunner, queued: QueuedJob) -> Result<()> {
        let name = queued.job.name();
        debug!(job_id = %queued.id, name, "running job");
        // One shot: a failed run is recorded and not retried.
        let err = match runner.run(queued.job).await {
            Ok(()) => None,
            Err(e) => {
                warn!(job_id = %queued.id, name, "job failed: {e:#}");
                Some(format!("{e:#}"))
            }
        };
        self.mark_done(&queued.id, err).await
    }

    async fn claim_due(&self, limit: u32, now: i64) -> Result<Vec<QueuedJob>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let rows: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    r#"
                    SELECT id, job_json FROM scheduled_jobs
                    WHERE status = ?1 AND run_at_ms <= ?2
                    ORDER BY run_at_ms ASC
                    LIMIT ?3
                    "#,
                )?;
                let rows = stmt
                    .query_map(params![STATUS_PENDING, now, limit], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            let mut out = Vec::new();
            for (id, json) in rows {
                // Undecodable rows are claimed too so they stop coming back.
                tx.execute(
                    "UPDATE scheduled_jobs SET status = ?2 WHERE id = ?1",
                    params![id, STATUS_RUNNING],
                )?;
                match serde_json::from_str::<Job>(&json) {
                    Ok(job) => out.push(QueuedJob { id, job }),
                    Err(e) => warn!(job_id = %id, "dropping undecodable job: {e}"),
                }
            }
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    async fn mark_done(&self, id: &str, err: Option<String>) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_jobs SET status = ?2, last_error = ?3 WHERE id = ?1",
                params![id, STATUS_DONE, err],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.with_conn(|conn| {
            let count = |status: u32| -> Result<u64> {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM scheduled_jobs WHERE status = ?1",
                    params![status],
                    |r| r.get(0),
                )?)
            };
            Ok(QueueStats {
                pending: count(STATUS_PENDING)?,
                done: count(STATUS_DONE)?,
            })
        })
        .await
    }

    pub async fn prune_done_before(&self, cutoff_ms: i64) -> Result<u64> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM scheduled_jobs WHERE status = ?1 AND run_at_ms < ?2",
                params![STATUS_DONE, cutoff_ms],
            )?;
            Ok(n as u64)
        })
        .await
    }
}

#[async_trait]
impl Scheduler for JobQueue {
    async fn schedule_once(&self, delay: Duration, job: Job) -> Result<bool> {
        let json = serde_json::to_string(&job)?;
        let key = hex::encode(sha2::Sha256::digest(json.as_bytes()));
        let name = job.name();
        let created = now_ms();
        let run_at = created.saturating_add(delay.as_millis() as i64);
        let inserted = self
            .with_conn(move |conn| {
                let n = conn.execute(
                    r#"
                    INSERT INTO scheduled_jobs(id, job_key, name, created_at_ms, run_at_ms, status, job_json, last_error)
                    SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL
                    WHERE NOT EXISTS (SELECT 1 FROM scheduled_jobs WHERE job_key = ?2 AND status = ?6)
                    "#,
                    params![new_job_id(), key, name, created, run_at, STATUS_PENDING, json],
                )?;
                Ok(n > 0)
            })
            .await?;
        if inserted {
            self.notify.notify_one();
        }
        Ok(inserted)
    }
}

fn new_job_id() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sync_job(local: u64) -> Job {
        Job::CollectionSync {
            collection_type: "followers".to_string(),
            local_actor_id: local,
            remote_actor_uri: "https://r.example/users/bob".to_string(),
            params: CollectionSyncParams {
                collection_id: "https://r.example/users/bob/followers".to_string(),
                url: Some("https://r.example/users/bob/followers_sync".to_string()),
                digest: "ab".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn delayed_job_is_not_due_before_its_time() {
        let q = JobQueue::open_in_memory().unwrap();
        assert!(q.schedule_once(Duration::from_secs(60), sync_job(1)).await.unwrap());
        assert!(q.claim_due(10, now_ms()).await.unwrap().is_empty());
        let due = q.claim_due(10, now_ms() + 61_000).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job, sync_job(1));
        // Claimed jobs are not handed out twice.
        assert!(q.claim_due(10, now_ms() + 61_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn identical_pending_job_is_not_queued_twice() {
        let q = JobQueue::open_in_memory().unwrap();
        assert!(q.schedule_once(Duration::from_secs(60), sync_job(1)).await.unwrap());
        assert!(!q.schedule_once(Duration::from_secs(60), sync_job(1)).await.unwrap());
        assert!(q.schedule_once(Duration::from_secs(60), sync_job(2)).await.unwrap());
        assert_eq!(q.stats().await.unwrap().pending, 2);
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl JobRunner for Failing {
        async fn run(&self, _job: Job) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("remote down")
        }
    }

    #[tokio::test]
    async fn failed_job_runs_once_and_is_finished() {
        let q = JobQueue::open_in_memory().unwrap();
        q.schedule_once(Duration::ZERO, sync_job(1)).await.unwrap();
        let runner = Failing(AtomicUsize::new(0));
        for queued in q.claim_due(10, now_ms() + 1).await.unwrap() {
            q.run_one(&runner, queued).await.unwrap();
        }
        assert_eq!(runner.0.load(Ordering::SeqCst), 1);
        assert_eq!(q.stats().await.unwrap(), QueueStats { pending: 0, done: 1 });
        assert!(q.claim_due(10, now_ms() + 1).await.unwrap().is_empty());
    }

    #[test]
    fn job_payload_is_tagged_json() {
        let v = serde_json::to_value(sync_job(3)).unwrap();
        assert_eq!(v["kind"], "collection_sync");
        assert_eq!(v["local_actor_id"], 3);
        assert_eq!(v["params"]["collectionId"], "https://r.example/users/bob/followers");
    }
}
