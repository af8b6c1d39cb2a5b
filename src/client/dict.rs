//! Distributed dict.
//!
//! Symmetric to [`List`](super::List), backed by a server-side hash under
//! `znsocket.Dict:<name>`. Values follow the same encoding, rehydration and
//! self-reference rules; fallback and adapter behavior match the list.

use super::{
    decode_entry, decode_plain, encode_value, Client, FallbackPolicy, ObjectRef, ObjectValue,
    RefreshData, DICT_PREFIX,
};
use crate::error::{Error, Result};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Optional hooks invoked after local mutations.
#[derive(Default)]
pub struct DictCallbacks {
    /// Called after `set` with the field and new value.
    pub set_item: Option<Box<dyn Fn(&str, &Value) + Send + Sync>>,
    /// Called after `del` with the removed field.
    pub del_item: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl std::fmt::Debug for DictCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictCallbacks")
            .field("set_item", &self.set_item.as_ref().map(|_| "<callback>"))
            .field("del_item", &self.del_item.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Configuration for a [`Dict`].
#[allow(missing_debug_implementations)]
pub struct DictBuilder {
    client: Client,
    name: String,
    fallback: Option<String>,
    fallback_policy: Option<FallbackPolicy>,
    callbacks: DictCallbacks,
}

impl DictBuilder {
    /// Key of a dict to read from while this one is empty. Defaults to the
    /// frozen policy unless [`fallback_policy`](Self::fallback_policy) says
    /// otherwise.
    pub fn fallback(mut self, name: impl Into<String>) -> Self {
        self.fallback = Some(name.into());
        self
    }

    /// What the fallback does: read-through forever or copy-once.
    pub fn fallback_policy(mut self, policy: FallbackPolicy) -> Self {
        self.fallback_policy = Some(policy);
        self
    }

    /// Hooks invoked after local mutations.
    pub fn callbacks(mut self, callbacks: DictCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Resolve the adapter state and materialise a copy-policy fallback.
    pub async fn build(self) -> Result<Dict> {
        let policy = self
            .fallback_policy
            .or(self.fallback.as_ref().map(|_| FallbackPolicy::Frozen));
        let dict = Dict {
            client: self.client,
            key: format!("{DICT_PREFIX}{}", self.name),
            name: self.name,
            fallback: self.fallback,
            fallback_policy: policy,
            adapter_available: Arc::new(tokio::sync::OnceCell::new()),
            callbacks: Arc::new(self.callbacks),
        };
        let adapter = dict.adapter_available().await?;
        if let (Some(fallback), Some(FallbackPolicy::Copy), false) =
            (&dict.fallback, dict.fallback_policy, adapter)
        {
            if dict.raw_len().await? == 0 {
                let source = Dict::attach(dict.client.clone(), fallback.clone());
                if source.len().await? > 0 {
                    source.copy(&dict.name).await?;
                }
            }
        }
        Ok(dict)
    }
}

/// Distributed mutable mapping backed by the server.
///
/// # Examples
///
/// ```rust,no_run
/// use znsocket::{Client, Dict};
///
/// # async fn example() -> znsocket::Result<()> {
/// let client = Client::connect("znsocket://127.0.0.1:5000").await?;
/// let dict = Dict::new(client, "config").await?;
/// dict.set("threshold", serde_json::json!(0.5)).await?;
/// assert!(dict.contains("threshold").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Dict {
    client: Client,
    key: String,
    name: String,
    fallback: Option<String>,
    fallback_policy: Option<FallbackPolicy>,
    adapter_available: Arc<tokio::sync::OnceCell<bool>>,
    callbacks: Arc<DictCallbacks>,
}

impl Dict {
    /// Create a handle, resolving adapter state eagerly.
    pub async fn new(client: Client, name: impl Into<String>) -> Result<Dict> {
        Self::builder(client, name).build().await
    }

    /// Start configuring a handle.
    pub fn builder(client: Client, name: impl Into<String>) -> DictBuilder {
        DictBuilder {
            client,
            name: name.into(),
            fallback: None,
            fallback_policy: None,
            callbacks: DictCallbacks::default(),
        }
    }

    /// Cheap handle used when rehydrating cross-references.
    pub(crate) fn attach(client: Client, name: impl Into<String>) -> Dict {
        let name = name.into();
        Dict {
            client,
            key: format!("{DICT_PREFIX}{name}"),
            name,
            fallback: None,
            fallback_policy: None,
            adapter_available: Arc::new(tokio::sync::OnceCell::new()),
            callbacks: Arc::new(DictCallbacks::default()),
        }
    }

    /// The prefixed storage key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The unprefixed name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The client this handle talks through.
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn adapter_available(&self) -> Result<bool> {
        self.adapter_available
            .get_or_try_init(|| async {
                let value = self
                    .client
                    .call("check_adapter", json!({ "key": self.key }))
                    .await?;
                Ok(value.as_bool().unwrap_or(false))
            })
            .await
            .copied()
    }

    async fn adapter_get(&self, method: &str, mut extra: Map<String, Value>) -> Result<Value> {
        extra.insert("key".into(), json!(self.key));
        extra.insert("method".into(), json!(method));
        self.client.call("adapter:get", Value::Object(extra)).await
    }

    fn frozen_fallback(&self) -> bool {
        self.fallback.is_some() && self.fallback_policy == Some(FallbackPolicy::Frozen)
    }

    fn fallback_dict(&self) -> Option<Dict> {
        self.fallback
            .as_ref()
            .map(|name| Dict::attach(self.client.clone(), name.clone()))
    }

    async fn ensure_writable(&self) -> Result<()> {
        if self.adapter_available().await? || self.frozen_fallback() {
            return Err(Error::FrozenStorage {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    async fn raw_len(&self) -> Result<i64> {
        let value = self.client.call("hlen", json!({ "name": self.key })).await?;
        Ok(value.as_i64().unwrap_or(0))
    }

    /// Number of entries, consulting the adapter or fallback when empty.
    pub async fn len(&self) -> Result<usize> {
        let mut len = self.raw_len().await?;
        if len == 0 && self.adapter_available().await? {
            let value = self.adapter_get("len", Map::new()).await?;
            len = value.as_i64().unwrap_or(0);
        }
        if len == 0 && self.frozen_fallback() {
            if let Some(fallback) = self.fallback_dict() {
                return Box::pin(fallback.len()).await;
            }
        }
        Ok(len as usize)
    }

    /// Whether the dict has no entries.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Value of a field; `KeyError` when absent everywhere.
    pub async fn get(&self, key: &str) -> Result<ObjectValue> {
        let raw = self
            .client
            .call("hget", json!({ "name": self.key, "key": key }))
            .await?;
        match raw {
            Value::String(raw) => decode_entry(&self.client, &raw),
            _ => {
                if self.adapter_available().await? {
                    let mut args = Map::new();
                    args.insert("dict_key".into(), json!(key));
                    let value = self.adapter_get("get", args).await?;
                    if let Value::String(raw) = value {
                        return decode_entry(&self.client, &raw);
                    }
                    return Err(Error::KeyError {
                        key: key.to_string(),
                    });
                }
                if self.frozen_fallback() {
                    if let Some(fallback) = self.fallback_dict() {
                        return Box::pin(fallback.get(key)).await;
                    }
                }
                Err(Error::KeyError {
                    key: key.to_string(),
                })
            },
        }
    }

    /// Value of a field, or `default` when absent.
    pub async fn get_or(&self, key: &str, default: Value) -> Result<ObjectValue> {
        match self.get(key).await {
            Ok(value) => Ok(value),
            Err(Error::KeyError { .. }) => Ok(ObjectValue::Value(default)),
            Err(other) => Err(other),
        }
    }

    /// Whether a field exists.
    pub async fn contains(&self, key: &str) -> Result<bool> {
        let exists = self
            .client
            .call("hexists", json!({ "name": self.key, "key": key }))
            .await?;
        if exists.as_i64() == Some(1) {
            return Ok(true);
        }
        if self.adapter_available().await? {
            let mut args = Map::new();
            args.insert("dict_key".into(), json!(key));
            let value = self.adapter_get("contains", args).await?;
            return Ok(value.as_bool().unwrap_or(false));
        }
        if self.frozen_fallback() {
            if let Some(fallback) = self.fallback_dict() {
                return Box::pin(fallback.contains(key)).await;
            }
        }
        Ok(false)
    }

    /// All field names.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let raw = self.client.call("hkeys", json!({ "name": self.key })).await?;
        let mut keys: Vec<String> = serde_json::from_value(raw)
            .map_err(|e| Error::Protocol(format!("hkeys reply malformed: {e}")))?;
        if keys.is_empty() && self.adapter_available().await? {
            let value = self.adapter_get("keys", Map::new()).await?;
            keys = serde_json::from_value(value)
                .map_err(|e| Error::Protocol(format!("adapter keys reply malformed: {e}")))?;
        }
        if keys.is_empty() && self.frozen_fallback() {
            if let Some(fallback) = self.fallback_dict() {
                return Box::pin(fallback.keys()).await;
            }
        }
        Ok(keys)
    }

    /// All values, rehydrating references.
    pub async fn values(&self) -> Result<Vec<ObjectValue>> {
        let raw = self.client.call("hvals", json!({ "name": self.key })).await?;
        let raws: Vec<String> = serde_json::from_value(raw)
            .map_err(|e| Error::Protocol(format!("hvals reply malformed: {e}")))?;
        if raws.is_empty() {
            if self.adapter_available().await? {
                let value = self.adapter_get("values", Map::new()).await?;
                let encoded: Vec<String> = serde_json::from_value(value)
                    .map_err(|e| Error::Protocol(format!("adapter values reply malformed: {e}")))?;
                return encoded
                    .iter()
                    .map(|raw| decode_entry(&self.client, raw))
                    .collect();
            }
            if self.frozen_fallback() {
                if let Some(fallback) = self.fallback_dict() {
                    return Box::pin(fallback.values()).await;
                }
            }
        }
        raws.iter()
            .map(|raw| decode_entry(&self.client, raw))
            .collect()
    }

    /// All entries, rehydrating references.
    pub async fn items(&self) -> Result<Vec<(String, ObjectValue)>> {
        let raw = self
            .client
            .call("hgetall", json!({ "name": self.key }))
            .await?;
        let Value::Object(map) = raw else {
            return Err(Error::Protocol("hgetall reply is not an object".into()));
        };
        if map.is_empty() {
            if self.adapter_available().await? {
                let value = self.adapter_get("items", Map::new()).await?;
                let entries: Vec<(String, String)> = serde_json::from_value(value)
                    .map_err(|e| Error::Protocol(format!("adapter items reply malformed: {e}")))?;
                return entries
                    .into_iter()
                    .map(|(k, raw)| Ok((k, decode_entry(&self.client, &raw)?)))
                    .collect();
            }
            if self.frozen_fallback() {
                if let Some(fallback) = self.fallback_dict() {
                    return Box::pin(fallback.items()).await;
                }
            }
        }
        map.into_iter()
            .map(|(k, raw)| match raw {
                Value::String(raw) => Ok((k, decode_entry(&self.client, &raw)?)),
                other => Ok((k, ObjectValue::Value(other))),
            })
            .collect()
    }

    /// The full content as plain JSON, without rehydration.
    pub async fn to_map(&self) -> Result<Map<String, Value>> {
        let items = self.items().await?;
        let mut map = Map::new();
        for (key, value) in items {
            map.insert(key, value.into_plain());
        }
        Ok(map)
    }

    /// Structural equality against another dict.
    pub async fn eq_dict(&self, other: &Dict) -> Result<bool> {
        Ok(self.to_map().await? == other.to_map().await?)
    }

    /// Structural equality against a native map.
    pub async fn eq_map(&self, other: &Map<String, Value>) -> Result<bool> {
        Ok(&self.to_map().await? == other)
    }

    /// Set one field.
    pub async fn set<'a>(&self, key: &str, value: impl Into<ObjectRef<'a>>) -> Result<()> {
        self.ensure_writable().await?;
        let resolved = value.into().resolve(&self.key)?;
        self.client
            .call(
                "hset",
                json!({ "name": self.key, "key": key, "value": encode_value(&resolved)? }),
            )
            .await?;
        if let Some(callback) = &self.callbacks.set_item {
            callback(key, &resolved);
        }
        Ok(())
    }

    /// Remove one field; `KeyError` when absent.
    pub async fn del(&self, key: &str) -> Result<()> {
        self.ensure_writable().await?;
        let exists = self
            .client
            .call("hexists", json!({ "name": self.key, "key": key }))
            .await?;
        if exists.as_i64() != Some(1) {
            return Err(Error::KeyError {
                key: key.to_string(),
            });
        }
        self.client
            .call("hdel", json!({ "name": self.key, "key": key }))
            .await?;
        if let Some(callback) = &self.callbacks.del_item {
            callback(key);
        }
        Ok(())
    }

    /// Set several fields in one batch.
    pub async fn update(&self, entries: Vec<(String, ObjectRef<'_>)>) -> Result<()> {
        self.ensure_writable().await?;
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipeline = self.client.pipeline();
        for (key, value) in entries {
            let resolved = value.resolve(&self.key)?;
            pipeline.add(
                "hset",
                json!({ "name": self.key, "key": key, "value": encode_value(&resolved)? }),
            );
        }
        pipeline.execute().await?;
        Ok(())
    }

    /// Union with a native map: this dict's entries, overridden by `other`.
    pub async fn union(&self, other: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut map = self.to_map().await?;
        for (key, value) in other {
            map.insert(key.clone(), value.clone());
        }
        Ok(map)
    }

    /// Copy the content to a new key; fails when the target already exists.
    pub async fn copy(&self, new_name: &str) -> Result<Dict> {
        if self.adapter_available().await? {
            let mut args = Map::new();
            args.insert("target".into(), json!(new_name));
            self.adapter_get("copy", args).await?;
        } else {
            let copied = self
                .client
                .call(
                    "copy",
                    json!({ "src": self.key, "dst": format!("{DICT_PREFIX}{new_name}") }),
                )
                .await?;
            if copied != Value::Bool(true) {
                return Err(Error::response("Could not copy dict"));
            }
        }
        Ok(Dict::attach(self.client.clone(), new_name))
    }

    /// Subscribe to refresh events for this dict.
    pub fn on_refresh(&self, callback: impl Fn(&RefreshData) + Send + Sync + 'static) {
        self.client.on_refresh(self.key.clone(), callback);
    }

    /// Plain values without rehydration, used by equality checks.
    pub async fn plain_get(&self, key: &str) -> Result<Option<Value>> {
        let raw = self
            .client
            .call("hget", json!({ "name": self.key, "key": key }))
            .await?;
        match raw {
            Value::String(raw) => Ok(Some(decode_plain(&raw)?)),
            _ => Ok(None),
        }
    }
}

impl std::fmt::Debug for Dict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dict").field("key", &self.key).finish()
    }
}
