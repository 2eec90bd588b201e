/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::collection_sync::{check_and_schedule, origin_of};
use crate::config::ServiceConfig;
use crate::dispatcher::{activity_type_token, InboxDispatcher};
use crate::follow_state::FollowStateMachine;
use crate::http_sig::{SignatureVerifier, VerifiedSignature};
use crate::reconcile::Reconciler;
use crate::signature_gate::SignatureGate;
use crate::store::SqliteStore;
use axum::{
    body::Body,
    http::{header, HeaderValue, Request, Response, StatusCode},
    routing::any,
    Router,
};
use fedisync_protocol::{Activity, CollectionSyncParams, ObjectRef, AS_CONTEXT, COLLECTION_SYNC_HEADER};
use http::request::Parts;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const INTERNAL_TOKEN_HEADER: &str = "X-Fedisync-Internal";

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<ServiceConfig>,
    pub gate: Arc<SignatureGate>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub store: Arc<SqliteStore>,
    pub dispatcher: Arc<InboxDispatcher>,
    pub reconciler: Arc<Reconciler>,
    pub follows: Arc<FollowStateMachine>,
    /// Public half of the key that signs outbound fetches.
    pub instance_public_key_pem: Arc<String>,
}

pub fn router(state: AppState) -> Router {
    let max_body_bytes = state.cfg.max_body_bytes();
    Router::new()
        .fallback(any(move |req| {
            let st = state.clone();
            async move { handle_request(&st, req).await }
        }))
        .layer(axum::extract::DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

pub async fn handle_request(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let body = match axum::body::to_bytes(body, state.cfg.max_body_bytes()).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };

    // Gate first: nothing below runs for a request that needed a signature.
    let mut signer = None;
    if state.gate.needs_signature(&parts.method, &path) {
        match state.verifier.verify(&parts, &body).await {
            Ok(v) => signer = Some(v),
            Err(e) => debug!(method = %parts.method, path = %path, "signature check failed: {e:#}"),
        }
    }
    if let Err(e) = state.gate.verify(&parts.method, &path, signer.is_some()) {
        return simple(e.status(), &e.to_string());
    }

    match (parts.method.as_str(), path.as_str()) {
        ("GET" | "HEAD", "/healthz") => match state.store.health_check() {
            Ok(()) => simple(StatusCode::OK, "ok"),
            Err(e) => simple(StatusCode::SERVICE_UNAVAILABLE, &format!("db error: {e}")),
        },
        ("GET", "/actor") => instance_actor_get(state),
        ("POST", "/inbox") => inbox(state, &parts, &body, signer.as_ref(), None).await,
        ("POST", p) => {
            if let Some(id) = user_route(p, "inbox") {
                inbox(state, &parts, &body, signer.as_ref(), Some(id)).await
            } else if let Some(id) = user_route(p, "outbox") {
                outbox_post(state, &parts, &body, id).await
            } else {
                simple(StatusCode::NOT_FOUND, "not found")
            }
        }
        ("GET", p) => match user_route(p, "following") {
            Some(id) => following_get(state, id),
            None => simple(StatusCode::NOT_FOUND, "not found"),
        },
        _ => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

/// `/users/{id}/{leaf}` → `id`.
fn user_route(path: &str, leaf: &str) -> Option<u64> {
    let rest = path.strip_prefix("/users/")?;
    let (id, tail) = rest.split_once('/')?;
    if tail != leaf {
        return None;
    }
    id.parse().ok()
}

async fn inbox(
    state: &AppState,
    parts: &Parts,
    body: &[u8],
    signer: Option<&VerifiedSignature>,
    path_user: Option<u64>,
) -> Response<Body> {
    let activity: Activity = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid activity json"),
    };

    if let Some(signer) = signer {
        let Some(actor) = activity.actor_id() else {
            warn!(signer = %signer.actor_url, "signed activity without actor");
            return simple(StatusCode::UNAUTHORIZED, "activity has no actor");
        };
        if origin_of(actor) != origin_of(&signer.actor_url) {
            warn!(actor, signer = %signer.actor_url, "actor does not match signature");
            return simple(StatusCode::UNAUTHORIZED, "actor does not match signature");
        }
    }

    if let Some(id) = activity.id.as_deref() {
        match state
            .store
            .store_inbox_activity(id, activity.actor_id(), Some(activity.ty.as_str()), body)
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(id, "duplicate inbox delivery");
                return simple(StatusCode::ACCEPTED, "duplicate");
            }
            Err(e) => return simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
        }
    }

    let recipients = resolve_recipients(&state.cfg, path_user, &activity);

    let sender = signer.map(|s| s.actor_url.as_str()).or(activity.actor_id());
    if let (Some(sender), Some(params)) = (sender, sync_params(parts)) {
        if let Err(e) = check_and_schedule(state.store.as_ref(), &state.reconciler, sender, &params).await {
            warn!(remote = sender, "collection sync check failed: {e:#}");
        }
    }

    let token = activity_type_token(&activity.ty);
    let handled = state
        .dispatcher
        .dispatch(&activity, &recipients, &token, activity.object.as_ref())
        .await;
    if !handled && !state.dispatcher.has_handler(&token) {
        debug!(id = ?activity.id, activity_type = %token, "no handler registered");
    } else {
        debug!(id = ?activity.id, activity_type = %token, handled, "inbox activity dispatched");
    }
    simple(StatusCode::ACCEPTED, "accepted")
}

fn require_internal(state: &AppState, parts: &Parts) -> Result<(), Response<Body>> {
    let Some(expected) = state.cfg.internal_token() else {
        return Err(simple(StatusCode::FORBIDDEN, "outbox disabled"));
    };
    let token = parts
        .headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if token != expected {
        return Err(simple(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok(())
}

/// Local clients post the Follows they send here. The Follow gets its
/// actor and id filled in and is recorded as Pending; delivery is the
/// client's job.
async fn outbox_post(state: &AppState, parts: &Parts, body: &[u8], local_actor_id: u64) -> Response<Body> {
    if let Err(resp) = require_internal(state, parts) {
        return resp;
    }
    let mut follow: Activity = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid activity json"),
    };
    if follow.ty != "Follow" {
        return simple(StatusCode::UNPROCESSABLE_ENTITY, "only Follow is supported");
    }

    let local_actor_uri = state.cfg.local_actor_uri(local_actor_id);
    match follow.actor_id() {
        Some(actor) if actor != local_actor_uri => return simple(StatusCode::FORBIDDEN, "actor mismatch"),
        Some(_) => {}
        None => follow.actor = Some(ObjectRef::Link(local_actor_uri.clone())),
    }
    let Some(remote) = follow.object_id().filter(|o| origin_of(o).is_some()).map(str::to_string) else {
        return simple(StatusCode::BAD_REQUEST, "object must be an absolute actor url");
    };
    let follow_id = follow
        .id
        .clone()
        .unwrap_or_else(|| format!("{local_actor_uri}/follows/{}", hex::encode(rand::random::<[u8; 16]>())));
    follow.id = Some(follow_id.clone());
    if follow.context.is_none() {
        follow.context = Some(serde_json::Value::String(AS_CONTEXT.to_string()));
    }

    match state
        .follows
        .request_follow(local_actor_id, &local_actor_uri, &remote, &follow_id)
        .await
    {
        Ok(rel) => {
            info!(local_actor_id, remote = %remote, state = ?rel.state, "outbound follow recorded");
            json_activity(StatusCode::CREATED, &follow)
        }
        Err(e) => simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
    }
}

fn sync_params(parts: &Parts) -> Option<CollectionSyncParams> {
    let raw = parts.headers.get(COLLECTION_SYNC_HEADER)?.to_str().ok()?;
    let params = CollectionSyncParams::parse_header(raw);
    if params.is_none() {
        debug!("unparseable {COLLECTION_SYNC_HEADER} header");
    }
    params
}

/// Local actors the activity is for: the inbox owner first, then local
/// actors named in `to`/`cc`, without repeats.
pub fn resolve_recipients(cfg: &ServiceConfig, path_user: Option<u64>, activity: &Activity) -> Vec<u64> {
    let prefix = format!("{}/users/", cfg.public_base_url());
    let mut out: Vec<u64> = path_user.into_iter().collect();
    for addr in activity.audience() {
        let Some(id) = addr.strip_prefix(&prefix).and_then(|rest| rest.parse::<u64>().ok()) else {
            continue;
        };
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

#[derive(Serialize)]
struct OrderedCollection {
    #[serde(rename = "@context")]
    context: &'static str,
    id: String,
    #[serde(rename = "type")]
    ty: &'static str,
    #[serde(rename = "totalItems")]
    total_items: usize,
    #[serde(rename = "orderedItems")]
    ordered_items: Vec<String>,
}

fn following_get(state: &AppState, local_actor_id: u64) -> Response<Body> {
    let items = match state.store.list_following(local_actor_id) {
        Ok(v) => v,
        Err(e) => return simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
    };
    let body = OrderedCollection {
        context: AS_CONTEXT,
        id: format!("{}/following", state.cfg.local_actor_uri(local_actor_id)),
        ty: "OrderedCollection",
        total_items: items.len(),
        ordered_items: items,
    };
    json_activity(StatusCode::OK, &body)
}

pub fn instance_key_id(cfg: &ServiceConfig) -> String {
    format!("{}/actor#main-key", cfg.public_base_url())
}

#[derive(Serialize)]
struct InstanceActor {
    #[serde(rename = "@context")]
    context: [&'static str; 2],
    id: String,
    #[serde(rename = "type")]
    ty: &'static str,
    #[serde(rename = "preferredUsername")]
    preferred_username: &'static str,
    inbox: String,
    #[serde(rename = "publicKey")]
    public_key: InstanceKey,
}

#[derive(Serialize)]
struct InstanceKey {
    id: String,
    owner: String,
    #[serde(rename = "publicKeyPem")]
    public_key_pem: String,
}

// Remote servers resolve our fetch signatures against this document.
fn instance_actor_get(state: &AppState) -> Response<Body> {
    let base = state.cfg.public_base_url();
    let id = format!("{base}/actor");
    let body = InstanceActor {
        context: [AS_CONTEXT, "https://w3id.org/security/v1"],
        id: id.clone(),
        ty: "Application",
        preferred_username: "fedisync",
        inbox: format!("{base}/inbox"),
        public_key: InstanceKey {
            id: instance_key_id(&state.cfg),
            owner: id,
            public_key_pem: state.instance_public_key_pem.to_string(),
        },
    };
    json_activity(StatusCode::OK, &body)
}

fn json_activity<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/activity+json; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}
