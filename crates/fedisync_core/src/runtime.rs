/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::{InstanceIdentity, ServiceConfig};
use crate::dispatcher::InboxDispatcher;
use crate::events::{self, EventSender, FederationEvent};
use crate::fetch::{HttpFetcher, SignedFetchConfig};
use crate::follow_state::FollowStateMachine;
use crate::handlers::{register_defaults, ObjectTypeRegistry};
use crate::http_sig::{HttpSignatureVerifier, KeyResolver};
use crate::reconcile::{ReconcileSettings, Reconciler};
use crate::scheduler::JobQueue;
use crate::server::{instance_key_id, router, AppState};
use crate::signature_gate::SignatureGate;
use crate::store::{now_ms, KeyedLocks, SqliteStore};
use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const DONE_JOB_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("static directive")),
        )
        .try_init()
        .ok();
}

/// Everything the HTTP surface and the job worker share.
pub struct Core {
    pub state: AppState,
    pub queue: JobQueue,
    pub events: EventSender,
}

pub fn build(cfg: ServiceConfig) -> Result<Core> {
    cfg.validate()?;
    let data_dir = cfg.data_dir()?;
    let identity = InstanceIdentity::load_or_create(&data_dir)?;
    let authority = cfg.authority()?;

    let store = Arc::new(SqliteStore::open(data_dir.join("fedisync.db"), &authority)?);
    let queue = JobQueue::open(data_dir.join("jobs.db"))?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("fedisync/", env!("CARGO_PKG_VERSION")))
        .timeout(cfg.http_timeout())
        .build()
        .context("build http client")?;
    let signed = cfg.signed_fetch.then(|| SignedFetchConfig {
        private_key_pem: identity.private_key_pem.clone(),
        key_id: instance_key_id(&cfg),
    });
    let fetcher = Arc::new(HttpFetcher::new(http.clone(), cfg.http_timeout(), signed));
    let verifier = Arc::new(HttpSignatureVerifier::new(KeyResolver::new(http), cfg.max_date_skew()));

    let locks = Arc::new(KeyedLocks::default());
    let (events, _) = events::channel();
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        fetcher,
        Arc::new(queue.clone()),
        locks.clone(),
        events.clone(),
        &authority,
        ReconcileSettings {
            delay: cfg.sync_delay(),
            cache_ttl: cfg.fetch_cache_ttl(),
        },
    ));
    let follows = Arc::new(FollowStateMachine::new(store.clone(), locks, events.clone()));

    let mut dispatcher = InboxDispatcher::new();
    let types = Arc::new(ObjectTypeRegistry::with_extra(cfg.extra_object_types.iter().cloned()));
    register_defaults(&mut dispatcher, store.clone(), types, follows.clone());
    if cfg.internal_token().is_none() {
        info!("no internal_token configured, outbox disabled");
    }

    let state = AppState {
        gate: Arc::new(SignatureGate::from_preset(cfg.authorized_fetch, cfg.defer_signatures)),
        cfg: Arc::new(cfg),
        verifier,
        store,
        dispatcher: Arc::new(dispatcher),
        reconciler,
        follows,
        instance_public_key_pem: Arc::new(identity.public_key_pem),
    };
    info!(data_dir = %data_dir.display(), %authority, "core built");
    Ok(Core { state, queue, events })
}

/// Serves until `shutdown` flips to true.
pub async fn run(cfg: ServiceConfig, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = cfg.bind.parse().context("parse bind")?;
    let core = build(cfg)?;

    core.queue
        .start_worker(shutdown.clone(), core.state.reconciler.clone());
    spawn_event_log(core.events.subscribe(), shutdown.clone());
    spawn_queue_prune(core.queue.clone(), shutdown.clone());

    let listener = tokio::net::TcpListener::bind(addr).await.context("bind")?;
    info!("fedisync listening on http://{addr}");

    axum::serve(listener, router(core.state).into_make_service())
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("http server")?;
    info!("fedisync stopped");
    Ok(())
}

fn spawn_event_log(mut rx: broadcast::Receiver<FederationEvent>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Ok(ev) => debug!(event = ?ev, "federation event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("event log lagged by {n}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    });
}

fn spawn_queue_prune(queue: JobQueue, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let cutoff = now_ms().saturating_sub(DONE_JOB_RETENTION.as_millis() as i64);
                    match queue.prune_done_before(cutoff).await {
                        Ok(0) => {}
                        Ok(n) => debug!("pruned {n} finished job(s)"),
                        Err(e) => warn!("job prune failed: {e:#}"),
                    }
                    if let Ok(stats) = queue.stats().await {
                        debug!(pending = stats.pending, done = stats.done, "job queue");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}
