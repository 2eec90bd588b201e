/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::events::{EventSender, FederationEvent};
use crate::fetch::{ordered_item_ids, JsonFetcher};
use crate::scheduler::{Job, JobRunner, Scheduler};
use crate::store::{FollowState, FollowerStore, KeyedLocks, Relationship};
use anyhow::Result;
use async_trait::async_trait;
use fedisync_protocol::CollectionSyncParams;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

pub const MIN_SYNC_DELAY: Duration = Duration::from_secs(60);
pub const SYNC_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    pub delay: Duration,
    pub cache_ttl: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            delay: MIN_SYNC_DELAY,
            cache_ttl: SYNC_CACHE_TTL,
        }
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub confirmed: usize,
    pub accepted: usize,
    pub removed: usize,
}

pub struct Reconciler {
    store: Arc<dyn FollowerStore>,
    fetcher: Arc<dyn JsonFetcher>,
    scheduler: Arc<dyn Scheduler>,
    locks: Arc<KeyedLocks>,
    events: EventSender,
    authority: String,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn FollowerStore>,
        fetcher: Arc<dyn JsonFetcher>,
        scheduler: Arc<dyn Scheduler>,
        locks: Arc<KeyedLocks>,
        events: EventSender,
        authority: &str,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            scheduler,
            locks,
            events,
            authority: authority.trim_end_matches('/').to_string(),
            settings: ReconcileSettings {
                delay: settings.delay.max(MIN_SYNC_DELAY),
                cache_ttl: settings.cache_ttl,
            },
        }
    }

    /// Queues a one-shot reconciliation; never runs it inline.
    pub async fn schedule(
        &self,
        collection_type: &str,
        local_actor_id: u64,
        remote_actor_uri: &str,
        params: CollectionSyncParams,
    ) -> Result<bool> {
        let job = Job::CollectionSync {
            collection_type: collection_type.to_string(),
            local_actor_id,
            remote_actor_uri: remote_actor_uri.to_string(),
            params,
        };
        self.scheduler.schedule_once(self.settings.delay, job).await
    }

    /// Converges local follow state for `local_actor_id` → `remote_actor_uri`
    /// on the remote's partial followers list. `None` means the pass aborted
    /// (no url, fetch failure, malformed collection) and nothing changed.
    pub async fn reconcile(
        &self,
        local_actor_id: u64,
        remote_actor_uri: &str,
        params: &CollectionSyncParams,
    ) -> Result<Option<ReconcileReport>> {
        let Some(url) = params.url.as_deref() else {
            debug!(remote = remote_actor_uri, "sync params without url, nothing to do");
            return Ok(None);
        };

        let mut remaining = match self.fetcher.fetch_json(url, self.settings.cache_ttl).await {
            Ok(doc) => match ordered_item_ids(url, &doc) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(remote = remote_actor_uri, "collection sync aborted: {e}");
                    return Ok(None);
                }
            },
            Err(e) => {
                warn!(remote = remote_actor_uri, "collection sync aborted: {e}");
                return Ok(None);
            }
        };

        let _guard = self.locks.lock(local_actor_id, remote_actor_uri).await;
        let mut report = ReconcileReport::default();

        // Accepted first: a remote entry counts once, and an existing
        // acceptance claims it before any pending request can.
        for rel in self.scoped(self.store.get_accepted(local_actor_id, &self.authority)?, remote_actor_uri) {
            if consume(&mut remaining, &rel.local_actor_uri) {
                report.confirmed += 1;
            } else if self.store.transition(&rel, FollowState::Removed)? {
                report.removed += 1;
                let _ = self.events.send(FederationEvent::follow_removed(local_actor_id, remote_actor_uri));
            }
        }

        for rel in self.scoped(self.store.get_pending(local_actor_id, &self.authority)?, remote_actor_uri) {
            let to = if consume(&mut remaining, &rel.local_actor_uri) {
                FollowState::Accepted
            } else {
                FollowState::Removed
            };
            if self.store.transition(&rel, to)? {
                if to == FollowState::Accepted {
                    report.accepted += 1;
                    let _ = self.events.send(FederationEvent::follow_accepted(local_actor_id, remote_actor_uri));
                } else {
                    report.removed += 1;
                    let _ = self.events.send(FederationEvent::follow_removed(local_actor_id, remote_actor_uri));
                }
            }
        }

        info!(
            local_actor_id,
            remote = remote_actor_uri,
            confirmed = report.confirmed,
            accepted = report.accepted,
            removed = report.removed,
            "followers collection reconciled"
        );
        let _ = self
            .events
            .send(FederationEvent::collection_synced(local_actor_id, remote_actor_uri));
        Ok(Some(report))
    }

    fn scoped(&self, rels: Vec<Relationship>, remote_actor_uri: &str) -> Vec<Relationship> {
        rels.into_iter()
            .filter(|r| r.remote_actor_uri == remote_actor_uri)
            .collect()
    }
}

/// Removes the first exact match; the rest of the list shifts down.
fn consume(remaining: &mut Vec<String>, id: &str) -> bool {
    match remaining.iter().position(|item| item == id) {
        Some(idx) => {
            remaining.remove(idx);
            true
        }
        None => false,
    }
}

#[async_trait]
impl JobRunner for Reconciler {
    async fn run(&self, job: Job) -> Result<()> {
        match job {
            Job::CollectionSync {
                collection_type,
                local_actor_id,
                remote_actor_uri,
                params,
            } => {
                if collection_type != crate::collection_sync::FOLLOWERS {
                    debug!(collection_type = %collection_type, "unsupported collection type, skipping");
                    return Ok(());
                }
                self.reconcile(local_actor_id, &remote_actor_uri, &params).await?;
                Ok(())
            }
        }
    }
}
