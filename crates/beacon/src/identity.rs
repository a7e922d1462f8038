// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};
use tokio::sync::OnceCell;
use tracing::warn;

use crate::constants::ANONYMOUS;

/// Envelope fields an attribute may not shadow once flattened next to them.
pub const RESERVED_ATTRIBUTES: [&str; 5] = ["timestamp", "total", "logData", "userid", "optid"];

/// The actor whose telemetry is being reported.
///
/// The `(user_id, operator_id)` pair namespaces durable storage; every field,
/// including the free-form attributes, is copied onto outbound envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "userid")]
    pub user_id: String,
    #[serde(rename = "optid")]
    pub operator_id: String,
    /// Extra fields copied onto envelopes. Names in [`RESERVED_ATTRIBUTES`]
    /// are never serialized.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: impl Into<String>, operator_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            operator_id: operator_id.into(),
            attributes: Map::new(),
        }
    }

    /// Attach an extra field. Reserved names are ignored with a warning.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if is_reserved(&key) {
            warn!("Ignoring identity attribute '{}': name is reserved", key);
            return self;
        }
        self.attributes.insert(key, value.into());
        self
    }

    /// Drop attributes that would collide with envelope fields.
    pub(crate) fn strip_reserved(&mut self) {
        self.attributes.retain(|key, _| !is_reserved(key));
    }

    /// Stable key of the durable slot owned by this actor.
    ///
    /// Ids are joined with `-`; any `%` or `-` inside an id is percent-escaped,
    /// so distinct pairs never share a key while plain ids read as `user-operator`.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}-{}",
            escape_key_part(&self.user_id),
            escape_key_part(&self.operator_id)
        )
    }
}

fn is_reserved(key: &str) -> bool {
    RESERVED_ATTRIBUTES.contains(&key)
}

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '-' => escaped.push_str("%2D"),
            c => escaped.push(c),
        }
    }
    escaped
}

impl Default for Identity {
    fn default() -> Self {
        Identity::new(ANONYMOUS, ANONYMOUS)
    }
}

pub type IdentityResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Identity> + Send>> + Send + Sync>;

#[derive(Clone)]
pub enum IdentityFactory {
    Static(Identity),
    Dynamic {
        resolver_fn: IdentityResolverFn,
        identity: Arc<OnceCell<Identity>>,
    },
}

impl IdentityFactory {
    /// Resolution is deferred until the pipeline first needs the identity, then
    /// cached for the lifetime of the factory.
    pub fn new_from_resolver(resolver_fn: IdentityResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            identity: Arc::new(OnceCell::new()),
        }
    }

    pub fn new_from_static(identity: Identity) -> Self {
        Self::Static(identity)
    }

    pub async fn get_identity(&self) -> &Identity {
        match self {
            Self::Static(identity) => identity,
            Self::Dynamic {
                resolver_fn,
                identity,
            } => {
                identity
                    .get_or_init(|| async { (resolver_fn)().await })
                    .await
            }
        }
    }
}

impl Debug for IdentityFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityFactory")
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn new_from_resolver() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let factory = IdentityFactory::new_from_resolver(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Identity::new("2333333", "42") })
        }));
        assert_eq!(factory.get_identity().await.key(), "2333333-42");
        assert_eq!(factory.get_identity().await.key(), "2333333-42");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_from_static() {
        let factory = IdentityFactory::new_from_static(Identity::new("u", "o"));
        assert_eq!(factory.get_identity().await.key(), "u-o");
    }

    #[test]
    fn identity_serializes_flat() {
        let identity = Identity::new("u1", "o1").with_attribute("token", "ncl20c2ijk");
        let value = serde_json::to_value(&identity).unwrap();
        assert_eq!(value["userid"], "u1");
        assert_eq!(value["optid"], "o1");
        assert_eq!(value["token"], "ncl20c2ijk");
    }

    #[test]
    fn key_keeps_distinct_pairs_apart() {
        let left = Identity::new("a-b", "c");
        let right = Identity::new("a", "b-c");
        assert_ne!(left.key(), right.key());
        assert_eq!(left.key(), "a%2Db-c");
        assert_eq!(right.key(), "a-b%2Dc");
        assert_ne!(Identity::new("a%2Db", "c").key(), left.key());
    }

    #[test]
    fn reserved_attributes_are_ignored() {
        let identity = Identity::new("u1", "o1")
            .with_attribute("total", 99)
            .with_attribute("logData", "spoofed")
            .with_attribute("region", "eu");
        assert_eq!(identity.attributes.len(), 1);
        assert_eq!(identity.attributes["region"], "eu");
    }

    #[test]
    fn default_identity_is_anonymous() {
        assert_eq!(Identity::default().key(), "anonymous-anonymous");
    }
}
