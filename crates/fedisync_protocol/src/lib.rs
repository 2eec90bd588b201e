/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types shared by the inbox pipeline and the collection reconciler.
//!
//! Activities are parsed into structs with explicit optional fields. Every
//! property the structs do not name lands in `extensions` and is written back
//! verbatim on serialization, so unknown vocabulary survives a round trip.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Header carrying FEP-8fcf partial collection digests.
pub const COLLECTION_SYNC_HEADER: &str = "Collection-Synchronization";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(v) => std::slice::from_ref(v).iter(),
            OneOrMany::Many(v) => v.iter(),
        }
    }
}

/// Either a bare IRI or an embedded object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Link(String),
    Object(Box<ApObject>),
}

impl ObjectRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            ObjectRef::Link(s) => Some(s.as_str()),
            ObjectRef::Object(o) => o.id.as_deref(),
        }
    }

    pub fn as_object(&self) -> Option<&ApObject> {
        match self {
            ObjectRef::Link(_) => None,
            ObjectRef::Object(o) => Some(o),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    #[serde(rename = "attributedTo", default, skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<ObjectRef>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl ApObject {
    pub fn type_is(&self, ty: &str) -> bool {
        self.ty.as_deref() == Some(ty)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<OneOrMany<String>>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl Activity {
    pub fn actor_id(&self) -> Option<&str> {
        self.actor.as_ref().and_then(ObjectRef::id)
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object.as_ref().and_then(ObjectRef::id)
    }

    pub fn embedded_object(&self) -> Option<&ApObject> {
        self.object.as_ref().and_then(ObjectRef::as_object)
    }

    /// All `to` and `cc` addressees, in order.
    pub fn audience(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .flat_map(OneOrMany::iter)
            .chain(self.cc.iter().flat_map(OneOrMany::iter))
            .map(String::as_str)
    }
}

/// Parsed `Collection-Synchronization` header.
///
/// `url` stays optional: a job scheduled without it is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSyncParams {
    #[serde(rename = "collectionId")]
    pub collection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub digest: String,
}

impl CollectionSyncParams {
    /// `collectionId="https://..", url="https://..", digest="hex"`
    pub fn parse_header(value: &str) -> Option<Self> {
        let mut collection_id = None;
        let mut url = None;
        let mut digest = None;
        for (k, v) in header_pairs(value) {
            match k.as_str() {
                "collectionId" => collection_id = Some(v),
                "url" => url = Some(v),
                "digest" => digest = Some(v.to_ascii_lowercase()),
                _ => {}
            }
        }
        Some(Self {
            collection_id: collection_id.filter(|s| !s.is_empty())?,
            url: url.filter(|s| !s.is_empty()),
            digest: digest.filter(|s| !s.is_empty())?,
        })
    }
}

// Splits `k="v", k2="v2"` honouring quotes, so commas inside URLs survive.
fn header_pairs(value: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for c in value.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                cur.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    parts.push(cur);

    for part in parts {
        let Some((k, v)) = part.split_once('=') else { continue };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        out.push((k.to_string(), v.trim().trim_matches('"').to_string()));
    }
    out
}
