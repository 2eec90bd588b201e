/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Inbox fan-out: listeners and per-type handlers in registration order.

use anyhow::Result;
use async_trait::async_trait;
use fedisync_protocol::{Activity, ObjectRef};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

/// `QuoteRequest` → `quote_request`, `Create` → `create`.
pub fn activity_type_token(ty: &str) -> String {
    let mut out = String::with_capacity(ty.len() + 4);
    let mut prev_lower = false;
    for c in ty.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

/// One inbound activity as seen by handlers and listeners.
pub struct Inbound<'a> {
    pub activity: &'a Activity,
    pub recipients: &'a [u64],
    pub activity_type: &'a str,
    pub object: Option<&'a ObjectRef>,
}

#[async_trait]
pub trait InboxHandler: Send + Sync {
    /// `Ok(true)` when the activity passed this handler's structural checks
    /// and was acted on.
    async fn handle(&self, inbound: &Inbound<'_>) -> Result<bool>;
}

pub type Listener = Arc<dyn Fn(&Inbound<'_>) + Send + Sync>;
pub type HandledListener = Arc<dyn Fn(&Inbound<'_>, bool) + Send + Sync>;

#[derive(Default, Clone)]
pub struct InboxDispatcher {
    on_inbox: Vec<Listener>,
    on_type: HashMap<String, Vec<Listener>>,
    handlers: HashMap<String, Vec<Arc<dyn InboxHandler>>>,
    on_handled: Vec<HandledListener>,
    on_type_handled: HashMap<String, Vec<HandledListener>>,
}

impl InboxDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_inbox(&mut self, f: impl Fn(&Inbound<'_>) + Send + Sync + 'static) -> &mut Self {
        self.on_inbox.push(Arc::new(f));
        self
    }

    pub fn on_type(&mut self, token: &str, f: impl Fn(&Inbound<'_>) + Send + Sync + 'static) -> &mut Self {
        self.on_type.entry(token.to_string()).or_default().push(Arc::new(f));
        self
    }

    pub fn register(&mut self, token: &str, handler: Arc<dyn InboxHandler>) -> &mut Self {
        self.handlers.entry(token.to_string()).or_default().push(handler);
        self
    }

    pub fn on_handled(&mut self, f: impl Fn(&Inbound<'_>, bool) + Send + Sync + 'static) -> &mut Self {
        self.on_handled.push(Arc::new(f));
        self
    }

    pub fn on_type_handled(
        &mut self,
        token: &str,
        f: impl Fn(&Inbound<'_>, bool) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_type_handled
            .entry(token.to_string())
            .or_default()
            .push(Arc::new(f));
        self
    }

    pub fn has_handler(&self, token: &str) -> bool {
        self.handlers.get(token).is_some_and(|h| !h.is_empty())
    }

    pub async fn dispatch(
        &self,
        activity: &Activity,
        recipients: &[u64],
        activity_type: &str,
        object: Option<&ObjectRef>,
    ) -> bool {
        let inbound = Inbound {
            activity,
            recipients,
            activity_type,
            object,
        };

        for l in &self.on_inbox {
            l(&inbound);
        }
        for l in self.on_type.get(activity_type).into_iter().flatten() {
            l(&inbound);
        }

        let mut handled = false;
        match self.handlers.get(activity_type) {
            Some(handlers) => {
                for h in handlers {
                    match h.handle(&inbound).await {
                        Ok(ok) => handled |= ok,
                        Err(e) => warn!(activity_type, id = ?activity.id, "inbox handler failed: {e:#}"),
                    }
                }
            }
            None => debug!(activity_type, "no handler registered"),
        }

        for l in &self.on_handled {
            l(&inbound, handled);
        }
        for l in self.on_type_handled.get(activity_type).into_iter().flatten() {
            l(&inbound, handled);
        }
        handled
    }
}
