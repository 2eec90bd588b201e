/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::dispatcher::{InboxDispatcher, InboxHandler, Inbound};
use crate::follow_state::FollowStateMachine;
use crate::store::SqliteStore;
use anyhow::Result;
use async_trait::async_trait;
use fedisync_protocol::{ApObject, ObjectRef};
use std::{collections::BTreeSet, sync::Arc};
use tracing::debug;

const DEFAULT_OBJECT_TYPES: &[&str] = &["Note", "Article", "Page", "Image", "Video", "Audio", "Event", "Question"];

/// Object types `create` and `update` accept.
#[derive(Debug, Clone)]
pub struct ObjectTypeRegistry {
    types: BTreeSet<String>,
}

impl Default for ObjectTypeRegistry {
    fn default() -> Self {
        Self {
            types: DEFAULT_OBJECT_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ObjectTypeRegistry {
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut reg = Self::default();
        for ty in extra {
            reg.register(ty);
        }
        reg
    }

    pub fn register(&mut self, ty: impl Into<String>) {
        let ty = ty.into();
        if !ty.trim().is_empty() {
            self.types.insert(ty);
        }
    }

    pub fn contains(&self, ty: &str) -> bool {
        self.types.contains(ty)
    }
}

/// `create` and `update`: the object must be embedded and of a known type.
pub struct ObjectUpsertHandler {
    store: Arc<SqliteStore>,
    types: Arc<ObjectTypeRegistry>,
}

impl ObjectUpsertHandler {
    pub fn new(store: Arc<SqliteStore>, types: Arc<ObjectTypeRegistry>) -> Self {
        Self { store, types }
    }

    fn acceptable<'a>(&self, object: Option<&'a ObjectRef>) -> Option<(&'a ApObject, &'a str)> {
        let obj = object?.as_object()?;
        let ty = obj.ty.as_deref()?;
        if !self.types.contains(ty) {
            return None;
        }
        Some((obj, obj.id.as_deref()?))
    }
}

#[async_trait]
impl InboxHandler for ObjectUpsertHandler {
    async fn handle(&self, inbound: &Inbound<'_>) -> Result<bool> {
        let Some((obj, id)) = self.acceptable(inbound.object) else {
            debug!(activity_type = inbound.activity_type, "object not embedded or of unknown type");
            return Ok(false);
        };
        let owner = attributed_actor(obj).or(inbound.activity.actor_id());
        let json = serde_json::to_vec(obj)?;
        self.store.upsert_object(id, owner, &json)?;
        Ok(true)
    }
}

/// `delete`: only objects we already hold, and only by their owner.
pub struct DeleteHandler {
    store: Arc<SqliteStore>,
}

impl DeleteHandler {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl InboxHandler for DeleteHandler {
    async fn handle(&self, inbound: &Inbound<'_>) -> Result<bool> {
        let Some(id) = inbound.object.and_then(ObjectRef::id) else {
            return Ok(false);
        };
        let Some(owner) = self.store.object_owner(id)? else {
            debug!(object = id, "delete for unknown object");
            return Ok(false);
        };
        if let (Some(owner), Some(actor)) = (owner.as_deref(), inbound.activity.actor_id()) {
            if owner != actor {
                debug!(object = id, actor, "delete from non-owner");
                return Ok(false);
            }
        }
        self.store.mark_object_deleted(id)
    }
}

/// `quote_request`: the `instrument` is the quoting post and must point back
/// at the quoted object.
pub struct QuoteRequestHandler {
    store: Arc<SqliteStore>,
}

impl QuoteRequestHandler {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

pub fn well_formed_quote_request(inbound: &Inbound<'_>) -> bool {
    let Some(quoted) = inbound.object.and_then(ObjectRef::id) else {
        return false;
    };
    let Some(instrument) = inbound.activity.instrument.as_ref().and_then(ObjectRef::as_object) else {
        return false;
    };
    instrument.ty.is_some()
        && instrument.id.is_some()
        && instrument.attributed_to.is_some()
        && instrument.content.is_some()
        && instrument.quote.as_ref().and_then(ObjectRef::id) == Some(quoted)
}

#[async_trait]
impl InboxHandler for QuoteRequestHandler {
    async fn handle(&self, inbound: &Inbound<'_>) -> Result<bool> {
        if !well_formed_quote_request(inbound) {
            debug!(id = ?inbound.activity.id, "malformed QuoteRequest");
            return Ok(false);
        }
        let Some(instrument) = inbound.activity.instrument.as_ref().and_then(ObjectRef::as_object) else {
            return Ok(false);
        };
        if let Some(id) = instrument.id.as_deref() {
            let json = serde_json::to_vec(instrument)?;
            self.store
                .upsert_object(id, attributed_actor(instrument).or(inbound.activity.actor_id()), &json)?;
        }
        Ok(true)
    }
}

pub struct AcceptHandler {
    follows: Arc<FollowStateMachine>,
}

#[async_trait]
impl InboxHandler for AcceptHandler {
    async fn handle(&self, inbound: &Inbound<'_>) -> Result<bool> {
        let Some(follow_id) = inbound.activity.object_id() else {
            return Ok(false);
        };
        let Some(owner) = self.follows.follow_owner(follow_id)? else {
            debug!(follow_id, "Accept for unknown Follow");
            return Ok(false);
        };
        // Shared-inbox deliveries carry no recipient; the Follow id names it.
        if !inbound.recipients.is_empty() && !inbound.recipients.contains(&owner) {
            return Ok(false);
        }
        self.follows.handle_accept(inbound.activity, owner).await
    }
}

pub struct RejectHandler {
    follows: Arc<FollowStateMachine>,
}

#[async_trait]
impl InboxHandler for RejectHandler {
    async fn handle(&self, inbound: &Inbound<'_>) -> Result<bool> {
        self.follows.handle_reject(inbound.activity).await
    }
}

pub struct UndoHandler {
    follows: Arc<FollowStateMachine>,
}

#[async_trait]
impl InboxHandler for UndoHandler {
    async fn handle(&self, inbound: &Inbound<'_>) -> Result<bool> {
        self.follows.handle_undo(inbound.activity).await
    }
}

fn attributed_actor(obj: &ApObject) -> Option<&str> {
    match obj.attributed_to.as_ref()? {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Object(m) => m.get("id").and_then(|v| v.as_str()),
        serde_json::Value::Array(items) => items.iter().find_map(|v| match v {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(m) => m.get("id").and_then(|v| v.as_str()),
            _ => None,
        }),
        _ => None,
    }
}

pub fn register_defaults(
    dispatcher: &mut InboxDispatcher,
    store: Arc<SqliteStore>,
    types: Arc<ObjectTypeRegistry>,
    follows: Arc<FollowStateMachine>,
) {
    let upsert: Arc<dyn InboxHandler> = Arc::new(ObjectUpsertHandler::new(store.clone(), types));
    dispatcher
        .register("create", upsert.clone())
        .register("update", upsert)
        .register("delete", Arc::new(DeleteHandler::new(store.clone())))
        .register("quote_request", Arc::new(QuoteRequestHandler::new(store)))
        .register("accept", Arc::new(AcceptHandler { follows: follows.clone() }))
        .register("reject", Arc::new(RejectHandler { follows: follows.clone() }))
        .register("undo", Arc::new(UndoHandler { follows }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FollowerStore, KeyedLocks};
    use fedisync_protocol::Activity;
    use serde_json::json;

    const AUTH: &str = "https://l.example";

    struct Fixture {
        store: Arc<SqliteStore>,
        dispatcher: InboxDispatcher,
        follows: Arc<FollowStateMachine>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory(AUTH).unwrap());
        let (events, _) = crate::events::channel();
        let follows = Arc::new(FollowStateMachine::new(store.clone(), Arc::new(KeyedLocks::default()), events));
        let mut dispatcher = InboxDispatcher::new();
        register_defaults(
            &mut dispatcher,
            store.clone(),
            Arc::new(ObjectTypeRegistry::with_extra(["ChatMessage"])),
            follows.clone(),
        );
        Fixture { store, dispatcher, follows }
    }

    async fn run(f: &Fixture, v: serde_json::Value) -> bool {
        let a: Activity = serde_json::from_value(v).unwrap();
        let token = crate::dispatcher::activity_type_token(&a.ty);
        f.dispatcher.dispatch(&a, &[1], &token, a.object.as_ref()).await
    }

    #[tokio::test]
    async fn create_needs_embedded_known_type() {
        let f = fixture();
        assert!(
            run(&f, json!({"type": "Create", "actor": "https://r.example/bob",
                "object": {"id": "https://r.example/n/1", "type": "Note", "content": "hi"}}))
            .await
        );
        assert!(f.store.object_owner("https://r.example/n/1").unwrap().is_some());
        assert!(run(&f, json!({"type": "Create", "object": {"id": "https://r.example/c/1", "type": "ChatMessage"}})).await);
        assert!(!run(&f, json!({"type": "Create", "object": "https://r.example/n/2"})).await);
        assert!(!run(&f, json!({"type": "Create", "object": {"id": "https://r.example/n/3"}})).await);
        assert!(!run(&f, json!({"type": "Create", "object": {"id": "https://r.example/n/4", "type": "Tombstone"}})).await);
    }

    #[tokio::test]
    async fn delete_only_touches_known_objects_of_the_sender() {
        let f = fixture();
        f.store
            .upsert_object("https://r.example/n/1", Some("https://r.example/bob"), b"{}")
            .unwrap();
        assert!(!run(&f, json!({"type": "Delete", "actor": "https://r.example/bob", "object": "https://r.example/n/404"})).await);
        assert!(!run(&f, json!({"type": "Delete", "actor": "https://evil.example/eve", "object": "https://r.example/n/1"})).await);
        assert!(run(&f, json!({"type": "Delete", "actor": "https://r.example/bob", "object": "https://r.example/n/1"})).await);
        assert!(f.store.object_owner("https://r.example/n/1").unwrap().is_none());
    }

    fn quote_request(back_ref: &str) -> serde_json::Value {
        json!({
            "type": "QuoteRequest",
            "actor": "https://r.example/bob",
            "object": "https://l.example/n/1",
            "instrument": {
                "id": "https://r.example/n/9",
                "type": "Note",
                "attributedTo": "https://r.example/bob",
                "content": "look at this",
                "quote": back_ref
            }
        })
    }

    #[tokio::test]
    async fn quote_request_needs_matching_back_reference() {
        let f = fixture();
        assert!(run(&f, quote_request("https://l.example/n/1")).await);
        assert!(!run(&f, quote_request("https://l.example/n/2")).await);

        let mut missing_content = quote_request("https://l.example/n/1");
        missing_content["instrument"].as_object_mut().unwrap().remove("content");
        assert!(!run(&f, missing_content).await);

        let mut link_only = quote_request("https://l.example/n/1");
        link_only["instrument"] = json!("https://r.example/n/9");
        assert!(!run(&f, link_only).await);
    }

    #[tokio::test]
    async fn accept_reaches_the_follow_state_machine() {
        let f = fixture();
        f.follows
            .request_follow(1, "https://l.example/users/1", "https://r.example/bob", "https://l.example/f/1")
            .await
            .unwrap();
        let accept = json!({
            "type": "Accept",
            "actor": "https://r.example/bob",
            "object": {"id": "https://l.example/f/1", "type": "Follow", "actor": "https://l.example/users/1", "object": "https://r.example/bob"}
        });
        assert!(run(&f, accept).await);
        assert_eq!(f.store.get_accepted(1, AUTH).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn accept_of_unknown_follow_is_not_handled() {
        let f = fixture();
        let accept = json!({
            "type": "Accept",
            "actor": "https://x.example/x",
            "object": {"id": "https://l.example/o1", "type": "Follow", "actor": "https://y.example/y", "object": "https://z.example/z"}
        });
        assert!(!run(&f, accept).await);
    }
}
