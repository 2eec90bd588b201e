/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::events::{EventSender, FederationEvent};
use crate::store::{FollowState, FollowerStore, KeyedLocks, Relationship};
use anyhow::Result;
use fedisync_protocol::{Activity, ObjectRef};
use std::sync::Arc;
use tracing::{debug, info};

/// An `Accept` must embed the Follow it answers: `id`, `actor`, `object`
/// and `type == "Follow"`. Every other activity type passes.
pub fn validate_object(activity: &Activity) -> bool {
    if activity.ty != "Accept" {
        return true;
    }
    let Some(follow) = activity.embedded_object() else {
        return false;
    };
    follow.id.is_some() && follow.actor.is_some() && follow.object.is_some() && follow.type_is("Follow")
}

/// Outbound follow lifecycle driven by Accept, Reject and Undo.
pub struct FollowStateMachine {
    store: Arc<dyn FollowerStore>,
    locks: Arc<KeyedLocks>,
    events: EventSender,
}

impl FollowStateMachine {
    pub fn new(store: Arc<dyn FollowerStore>, locks: Arc<KeyedLocks>, events: EventSender) -> Self {
        Self { store, locks, events }
    }

    /// Records the Follow we sent. An existing Accepted relationship stays
    /// Accepted.
    pub async fn request_follow(
        &self,
        local_actor_id: u64,
        local_actor_uri: &str,
        remote_actor_uri: &str,
        follow_activity_id: &str,
    ) -> Result<Relationship> {
        let _guard = self.locks.lock(local_actor_id, remote_actor_uri).await;
        let rel = self
            .store
            .upsert_pending(local_actor_id, local_actor_uri, remote_actor_uri, Some(follow_activity_id))?;
        debug!(local_actor_id, remote = remote_actor_uri, state = ?rel.state, "follow recorded");
        Ok(rel)
    }

    /// Local actor that sent the Follow `follow_activity_id`, if we know it.
    pub fn follow_owner(&self, follow_activity_id: &str) -> Result<Option<u64>> {
        Ok(self
            .store
            .find_by_outbox_activity_id(follow_activity_id)?
            .map(|r| r.local_actor_id))
    }

    /// Pending → Accepted for the relationship whose stored Follow id equals
    /// `accept.object.id`. Already Accepted is success; an unknown Follow is
    /// a silent no-op.
    pub async fn handle_accept(&self, accept: &Activity, local_actor_id: u64) -> Result<bool> {
        if !validate_object(accept) {
            debug!(id = ?accept.id, "malformed Accept");
            return Ok(false);
        }
        let Some(follow_id) = accept.object_id() else {
            return Ok(false);
        };
        let Some(rel) = self.matching(follow_id, local_actor_id, accept.actor_id())? else {
            return Ok(false);
        };

        let _guard = self.locks.lock(rel.local_actor_id, &rel.remote_actor_uri).await;
        // Re-read under the lock; a reconcile pass may have moved it.
        let Some(current) = self.store.find_by_outbox_activity_id(follow_id)? else {
            return Ok(false);
        };
        match current.state {
            FollowState::Accepted => Ok(true),
            FollowState::Pending => {
                let moved = self.store.transition(&current, FollowState::Accepted)?;
                if moved {
                    info!(local_actor_id, remote = %current.remote_actor_uri, "follow accepted");
                    let _ = self
                        .events
                        .send(FederationEvent::follow_accepted(local_actor_id, &current.remote_actor_uri));
                }
                Ok(moved)
            }
            FollowState::Removed => Ok(false),
        }
    }

    /// `Reject(Follow)` drops the relationship.
    pub async fn handle_reject(&self, reject: &Activity) -> Result<bool> {
        let Some(follow_id) = reject.object_id() else {
            return Ok(false);
        };
        self.remove_by_follow_id(follow_id, reject.actor_id()).await
    }

    /// `Undo(Accept(Follow))`, or an `Undo` pointing straight at our Follow,
    /// drops the relationship.
    pub async fn handle_undo(&self, undo: &Activity) -> Result<bool> {
        let follow_id = match undo.embedded_object() {
            Some(inner) if inner.type_is("Accept") => inner.object.as_ref().and_then(ObjectRef::id),
            _ => undo.object_id(),
        };
        let Some(follow_id) = follow_id else {
            return Ok(false);
        };
        self.remove_by_follow_id(follow_id, undo.actor_id()).await
    }

    async fn remove_by_follow_id(&self, follow_id: &str, sender: Option<&str>) -> Result<bool> {
        let Some(rel) = self.store.find_by_outbox_activity_id(follow_id)? else {
            debug!(follow_id, "no relationship for follow id");
            return Ok(false);
        };
        if !sender_matches(&rel, sender) {
            debug!(follow_id, ?sender, "sender is not the followed actor");
            return Ok(false);
        }
        let _guard = self.locks.lock(rel.local_actor_id, &rel.remote_actor_uri).await;
        let Some(current) = self.store.find_by_outbox_activity_id(follow_id)? else {
            return Ok(false);
        };
        let removed = self.store.transition(&current, FollowState::Removed)?;
        if removed {
            info!(local_actor_id = current.local_actor_id, remote = %current.remote_actor_uri, "follow removed");
            let _ = self
                .events
                .send(FederationEvent::follow_removed(current.local_actor_id, &current.remote_actor_uri));
        }
        Ok(removed)
    }

    fn matching(&self, follow_id: &str, local_actor_id: u64, sender: Option<&str>) -> Result<Option<Relationship>> {
        let Some(rel) = self.store.find_by_outbox_activity_id(follow_id)? else {
            debug!(follow_id, "Accept for unknown Follow");
            return Ok(None);
        };
        if rel.local_actor_id != local_actor_id {
            debug!(follow_id, local_actor_id, "Accept addressed to another local actor");
            return Ok(None);
        }
        if !sender_matches(&rel, sender) {
            debug!(follow_id, ?sender, "Accept not sent by the followed actor");
            return Ok(None);
        }
        Ok(Some(rel))
    }
}

// Only the followed actor may answer our Follow; an anonymous answer never does.
fn sender_matches(rel: &Relationship, sender: Option<&str>) -> bool {
    sender == Some(rel.remote_actor_uri.as_str())
}
