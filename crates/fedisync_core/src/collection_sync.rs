/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! FEP-8fcf followers collection synchronization: digest computation and the
//! mismatch check that schedules a reconciliation.

use crate::reconcile::Reconciler;
use crate::store::FollowerStore;
use anyhow::Result;
use fedisync_protocol::CollectionSyncParams;
use http::Uri;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub const FOLLOWERS: &str = "followers";

/// XOR of the SHA-256 of every id, hex encoded. Order independent; the empty
/// set hashes to 64 zeros.
pub fn partial_collection_digest<'a, I>(ids: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut acc = [0u8; 32];
    for id in ids {
        let h = Sha256::digest(id.as_bytes());
        for (a, b) in acc.iter_mut().zip(h.iter()) {
            *a ^= b;
        }
    }
    hex::encode(acc)
}

/// `scheme://authority` of a URL, `None` for relative or malformed input.
pub fn origin_of(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    let scheme = uri.scheme_str()?;
    let authority = uri.authority()?;
    Some(format!("{scheme}://{}", authority.as_str().to_ascii_lowercase()))
}

/// `{actor}/followers`, the followers collection Mastodon-style servers
/// publish for `actor`.
pub fn followers_uri_of(actor_uri: &str) -> String {
    format!("{}/followers", actor_uri.trim_end_matches('/'))
}

/// The header must describe the sender's own followers collection, with a
/// `url` served from the sender's origin.
pub fn params_belong_to(params: &CollectionSyncParams, remote_actor_uri: &str) -> bool {
    let Some(actor_origin) = origin_of(remote_actor_uri) else {
        return false;
    };
    if params.collection_id != followers_uri_of(remote_actor_uri) {
        return false;
    }
    match params.url.as_deref() {
        Some(url) => origin_of(url).as_deref() == Some(actor_origin.as_str()),
        None => true,
    }
}

/// Compares the remote digest with the cached local one and, on mismatch,
/// schedules a reconciliation for each local actor related to the sender.
/// Returns how many jobs were scheduled.
pub async fn check_and_schedule(
    store: &dyn FollowerStore,
    reconciler: &Reconciler,
    remote_actor_uri: &str,
    params: &CollectionSyncParams,
) -> Result<usize> {
    if !params_belong_to(params, remote_actor_uri) {
        debug!(remote = remote_actor_uri, collection = %params.collection_id, "ignoring foreign Collection-Synchronization");
        return Ok(0);
    }

    let local = match store.cached_digest(FOLLOWERS, remote_actor_uri)? {
        Some(d) => d,
        None => partial_collection_digest(std::iter::empty::<&str>()),
    };
    if local.eq_ignore_ascii_case(&params.digest) {
        return Ok(0);
    }

    let related = store.relationships_for_remote(remote_actor_uri)?;
    for rel in &related {
        reconciler
            .schedule(FOLLOWERS, rel.local_actor_id, remote_actor_uri, params.clone())
            .await?;
    }
    if !related.is_empty() {
        info!(remote = remote_actor_uri, jobs = related.len(), "followers digest mismatch, reconciliation scheduled");
    }
    Ok(related.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetch::JsonFetcher;
    use crate::reconcile::ReconcileSettings;
    use crate::scheduler::{Job, Scheduler};
    use crate::store::{KeyedLocks, SqliteStore};
    use std::sync::Arc;

    fn params(collection_id: &str, url: Option<&str>) -> CollectionSyncParams {
        CollectionSyncParams {
            collection_id: collection_id.to_string(),
            url: url.map(str::to_string),
            digest: "00".to_string(),
        }
    }

    #[test]
    fn digest_is_order_independent_and_self_inverse() {
        let a = partial_collection_digest(["https://l.example/users/1", "https://l.example/users/2"]);
        let b = partial_collection_digest(["https://l.example/users/2", "https://l.example/users/1"]);
        assert_eq!(a, b);
        let twice = partial_collection_digest(["x", "x"]);
        assert_eq!(twice, "0".repeat(64));
    }

    #[test]
    fn single_id_digest_is_its_sha256() {
        let d = partial_collection_digest(["https://l.example/users/1"]);
        assert_eq!(d, hex::encode(Sha256::digest(b"https://l.example/users/1")));
    }

    #[test]
    fn params_must_share_sender_origin() {
        let actor = "https://r.example/users/bob";
        assert!(params_belong_to(
            &params("https://r.example/users/bob/followers", Some("https://r.example/sync?x")),
            actor
        ));
        assert!(!params_belong_to(
            &params("https://evil.example/users/bob/followers", None),
            actor
        ));
        assert!(!params_belong_to(
            &params("https://r.example/users/bob/followers", Some("https://evil.example/sync")),
            actor
        ));
    }

    #[test]
    fn params_must_name_the_sender_followers_collection() {
        let bob = "https://r.example/users/bob";
        assert!(!params_belong_to(
            &params("https://r.example/users/alice/following", Some("https://r.example/sync")),
            bob
        ));
        assert!(!params_belong_to(
            &params("https://r.example/users/alice/followers", None),
            bob
        ));
        assert!(!params_belong_to(&params("https://r.example/users/bob/following", None), bob));
        assert_eq!(followers_uri_of("https://r.example/users/bob/"), "https://r.example/users/bob/followers");
    }

    struct RecordingScheduler(std::sync::Mutex<Vec<Job>>);

    #[async_trait::async_trait]
    impl Scheduler for RecordingScheduler {
        async fn schedule_once(&self, _delay: std::time::Duration, job: Job) -> Result<bool> {
            self.0.lock().unwrap().push(job);
            Ok(true)
        }
    }

    struct NoFetch;

    #[async_trait::async_trait]
    impl JsonFetcher for NoFetch {
        async fn fetch_json(&self, url: &str, _ttl: std::time::Duration) -> Result<serde_json::Value, FetchError> {
            Err(FetchError::Timeout { url: url.to_string() })
        }
    }

    #[tokio::test]
    async fn another_collection_on_the_sender_host_schedules_nothing() {
        let bob = "https://r.example/users/bob";
        let store = Arc::new(SqliteStore::open_in_memory("https://l.example").unwrap());
        store.upsert_pending(1, "https://l.example/users/1", bob, None).unwrap();
        let scheduler = Arc::new(RecordingScheduler(std::sync::Mutex::new(Vec::new())));
        let (events, _) = crate::events::channel();
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(NoFetch),
            scheduler.clone(),
            Arc::new(KeyedLocks::default()),
            events,
            "https://l.example",
            ReconcileSettings::default(),
        );

        let foreign = CollectionSyncParams {
            collection_id: "https://r.example/users/alice/following".to_string(),
            url: Some("https://r.example/users/alice/following".to_string()),
            digest: "ff".repeat(32),
        };
        assert_eq!(check_and_schedule(store.as_ref(), &reconciler, bob, &foreign).await.unwrap(), 0);
        assert!(scheduler.0.lock().unwrap().is_empty());

        let own = CollectionSyncParams {
            collection_id: followers_uri_of(bob),
            ..foreign
        };
        assert_eq!(check_and_schedule(store.as_ref(), &reconciler, bob, &own).await.unwrap(), 1);
    }

    #[test]
    fn origin_ignores_path_and_case() {
        assert_eq!(origin_of("https://L.Example:8443/a/b").as_deref(), Some("https://l.example:8443"));
        assert!(origin_of("/relative").is_none());
    }
}
