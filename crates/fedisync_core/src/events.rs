/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;
use tokio::sync::broadcast;

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FederationEvent {
    /// A reconciliation pass finished and its mutations are committed.
    CollectionSynced {
        local_actor_id: u64,
        remote_actor_uri: String,
        ts_ms: u64,
    },
    FollowAccepted {
        local_actor_id: u64,
        remote_actor_uri: String,
        ts_ms: u64,
    },
    FollowRemoved {
        local_actor_id: u64,
        remote_actor_uri: String,
        ts_ms: u64,
    },
}

impl FederationEvent {
    pub fn collection_synced(local_actor_id: u64, remote_actor_uri: &str) -> Self {
        Self::CollectionSynced {
            local_actor_id,
            remote_actor_uri: remote_actor_uri.to_string(),
            ts_ms: now_ms_u64(),
        }
    }

    pub fn follow_accepted(local_actor_id: u64, remote_actor_uri: &str) -> Self {
        Self::FollowAccepted {
            local_actor_id,
            remote_actor_uri: remote_actor_uri.to_string(),
            ts_ms: now_ms_u64(),
        }
    }

    pub fn follow_removed(local_actor_id: u64, remote_actor_uri: &str) -> Self {
        Self::FollowRemoved {
            local_actor_id,
            remote_actor_uri: remote_actor_uri.to_string(),
            ts_ms: now_ms_u64(),
        }
    }
}

pub type EventSender = broadcast::Sender<FederationEvent>;

pub fn channel() -> (EventSender, broadcast::Receiver<FederationEvent>) {
    broadcast::channel(256)
}
