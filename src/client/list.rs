//! Distributed list.
//!
//! A [`List`] is a mutable sequence whose content lives on the server under
//! `znsocket.List:<name>`; the handle itself holds no data. Reads rehydrate
//! cross-references to other collections, writes reject self-references, and
//! a list can either fall back to another key while empty or be served
//! entirely by a client-owned adapter (in which case it is read-only).

use super::{
    decode_entry, decode_plain, encode_value, Client, FallbackPolicy, ObjectRef, ObjectValue,
    RefreshData, LIST_PREFIX,
};
use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::sync::Arc;

/// Marker value used to delete by position: the slot is overwritten, then
/// every marker is removed in one pass.
const DELETED_SENTINEL: &str = "__DELETED__";

/// Optional hooks invoked after local mutations.
#[derive(Default)]
pub struct ListCallbacks {
    /// Called after `set`/`set_many` with the indices and new values.
    pub set_item: Option<Box<dyn Fn(&[i64], &[Value]) + Send + Sync>>,
    /// Called after `del`/`del_many` with the removed indices.
    pub del_item: Option<Box<dyn Fn(&[i64]) + Send + Sync>>,
    /// Called after `insert` with the position and value.
    pub insert: Option<Box<dyn Fn(i64, &Value) + Send + Sync>>,
    /// Called after `push` with the value.
    pub append: Option<Box<dyn Fn(&Value) + Send + Sync>>,
}

impl std::fmt::Debug for ListCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListCallbacks")
            .field("set_item", &self.set_item.as_ref().map(|_| "<callback>"))
            .field("del_item", &self.del_item.as_ref().map(|_| "<callback>"))
            .field("insert", &self.insert.as_ref().map(|_| "<callback>"))
            .field("append", &self.append.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Configuration for a [`List`].
#[allow(missing_debug_implementations)]
pub struct ListBuilder {
    client: Client,
    name: String,
    fallback: Option<String>,
    fallback_policy: Option<FallbackPolicy>,
    callbacks: ListCallbacks,
}

impl ListBuilder {
    /// Key of a list to read from while this one is empty.
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
    pub fn callbacks(mut self, callbacks: ListCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Resolve the adapter state and materialise a copy-policy fallback.
    pub async fn build(self) -> Result<List> {
        let list = List {
            client: self.client,
            key: format!("{LIST_PREFIX}{}", self.name),
            name: self.name,
            fallback: self.fallback,
            fallback_policy: self.fallback_policy,
            adapter_available: Arc::new(tokio::sync::OnceCell::new()),
            callbacks: Arc::new(self.callbacks),
        };
        let adapter = list.adapter_available().await?;
        if let (Some(fallback), Some(FallbackPolicy::Copy), false) =
            (&list.fallback, list.fallback_policy, adapter)
        {
            if list.raw_len().await? == 0 {
                let source = List::attach(list.client.clone(), fallback.clone());
                if source.len().await? > 0 {
                    source.copy(&list.name).await?;
                }
            }
        }
        Ok(list)
    }
}

/// Distributed mutable sequence backed by the server.
///
/// # Examples
///
/// ```rust,no_run
/// use znsocket::{Client, List};
///
/// # async fn example() -> znsocket::Result<()> {
/// let client = Client::connect("znsocket://127.0.0.1:5000").await?;
/// let list = List::new(client, "measurements").await?;
/// list.push(serde_json::json!(1.5)).await?;
/// assert_eq!(list.len().await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct List {
    client: Client,
    key: String,
    name: String,
    fallback: Option<String>,
    fallback_policy: Option<FallbackPolicy>,
    adapter_available: Arc<tokio::sync::OnceCell<bool>>,
    callbacks: Arc<ListCallbacks>,
}

impl List {
    /// Create a handle, resolving adapter state eagerly.
    pub async fn new(client: Client, name: impl Into<String>) -> Result<List> {
        Self::builder(client, name).build().await
    }

    /// Start configuring a handle.
    pub fn builder(client: Client, name: impl Into<String>) -> ListBuilder {
        ListBuilder {
            client,
            name: name.into(),
            fallback: None,
            fallback_policy: None,
            callbacks: ListCallbacks::default(),
        }
    }

    /// Cheap handle without fallback handling; the adapter state is resolved
    /// lazily on first use. Used when rehydrating cross-references.
    pub(crate) fn attach(client: Client, name: impl Into<String>) -> List {
        let name = name.into();
        List {
            client,
            key: format!("{LIST_PREFIX}{name}"),
            name,
            fallback: None,
            fallback_policy: None,
            adapter_available: Arc::new(tokio::sync::OnceCell::new()),
            callbacks: Arc::new(ListCallbacks::default()),
        }
    }

    /// Handle from an already-prefixed key.
    pub(crate) fn from_key(client: Client, key: &str) -> List {
        match key.strip_prefix(LIST_PREFIX) {
            Some(name) => Self::attach(client, name),
            None => Self::attach(client, key),
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

    async fn adapter_get(&self, method: &str, mut extra: serde_json::Map<String, Value>) -> Result<Value> {
        extra.insert("key".into(), json!(self.key));
        extra.insert("method".into(), json!(method));
        self.client.call("adapter:get", Value::Object(extra)).await
    }

    fn frozen_fallback(&self) -> bool {
        self.fallback.is_some() && self.fallback_policy == Some(FallbackPolicy::Frozen)
    }

    fn fallback_list(&self) -> Option<List> {
        self.fallback
            .as_ref()
            .map(|name| List::attach(self.client.clone(), name.clone()))
    }

    /// Adapter-backed and frozen-fallback lists reject writes.
    async fn ensure_writable(&self) -> Result<()> {
        if self.adapter_available().await? || self.frozen_fallback() {
            return Err(Error::FrozenStorage {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    async fn raw_len(&self) -> Result<i64> {
        let value = self.client.call("llen", json!({ "name": self.key })).await?;
        Ok(value.as_i64().unwrap_or(0))
    }

    /// Length of the list, consulting the adapter or fallback when empty.
    pub async fn len(&self) -> Result<usize> {
        let mut len = self.raw_len().await?;
        if len == 0 && self.adapter_available().await? {
            let value = self.adapter_get("len", serde_json::Map::new()).await?;
            len = value.as_i64().unwrap_or(0);
        }
        if len == 0 && self.frozen_fallback() {
            if let Some(fallback) = self.fallback_list() {
                return Box::pin(fallback.len()).await;
            }
        }
        Ok(len as usize)
    }

    /// Whether the list has no elements.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Element at a signed index.
    pub async fn get(&self, index: i64) -> Result<ObjectValue> {
        let raw = self
            .client
            .call("lindex", json!({ "name": self.key, "index": index }))
            .await?;
        match raw {
            Value::String(raw) => decode_entry(&self.client, &raw),
            _ => {
                if self.adapter_available().await? {
                    let mut args = serde_json::Map::new();
                    args.insert("index".into(), json!(index));
                    let value = self.adapter_get("get", args).await?;
                    if let Value::String(raw) = value {
                        return decode_entry(&self.client, &raw);
                    }
                    return Err(Error::IndexOutOfRange);
                }
                if self.frozen_fallback() {
                    if let Some(fallback) = self.fallback_list() {
                        return Box::pin(fallback.get(index)).await;
                    }
                }
                Err(Error::IndexOutOfRange)
            },
        }
    }

    /// Elements at several signed indices.
    pub async fn get_many(&self, indices: &[i64]) -> Result<Vec<ObjectValue>> {
        let raws = self.raw_at(indices).await?;
        raws.iter()
            .map(|raw| decode_entry(&self.client, raw))
            .collect()
    }

    /// Elements selected by a slice with signed bounds and step, half-open
    /// like the client-side convention.
    pub async fn slice(
        &self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<Vec<ObjectValue>> {
        let len = self.len().await?;
        let indices = slice_indices(len, start, stop, step)?;
        if self.adapter_available().await? {
            // The adapter serves contiguous slices natively.
            let mut args = serde_json::Map::new();
            args.insert("start".into(), json!(start.unwrap_or(0)));
            args.insert("stop".into(), json!(stop.unwrap_or(len as i64)));
            args.insert("step".into(), json!(step.unwrap_or(1)));
            let values = self.adapter_get("slice", args).await?;
            let Value::Array(values) = values else {
                return Err(Error::Protocol("adapter slice reply is not an array".into()));
            };
            return values
                .iter()
                .map(|v| match v {
                    Value::String(raw) => decode_entry(&self.client, raw),
                    other => Ok(ObjectValue::Value(other.clone())),
                })
                .collect();
        }
        self.get_many(&indices).await
    }

    /// Every element, in order.
    pub async fn to_vec(&self) -> Result<Vec<ObjectValue>> {
        self.slice(None, None, None).await
    }

    /// Every element as plain JSON, without rehydrating references.
    pub async fn plain_values(&self) -> Result<Vec<Value>> {
        let len = self.len().await?;
        if self.adapter_available().await? || self.frozen_fallback() {
            return self
                .slice(None, None, None)
                .await
                .map(|items| items.into_iter().map(ObjectValue::into_plain).collect());
        }
        let raws = self
            .client
            .call("lrange", json!({ "name": self.key, "start": 0, "end": -1 }))
            .await?;
        let Value::Array(raws) = raws else {
            return Err(Error::Protocol("lrange reply is not an array".into()));
        };
        debug_assert_eq!(raws.len(), len);
        raws.iter()
            .map(|raw| match raw {
                Value::String(raw) => decode_plain(raw),
                other => Ok(other.clone()),
            })
            .collect()
    }

    /// Structural equality against another list.
    pub async fn eq_list(&self, other: &List) -> Result<bool> {
        Ok(self.plain_values().await? == other.plain_values().await?)
    }

    /// Structural equality against a native sequence.
    pub async fn eq_values(&self, other: &[Value]) -> Result<bool> {
        Ok(self.plain_values().await? == other)
    }

    /// Overwrite the element at a signed index.
    pub async fn set<'a>(&self, index: i64, value: impl Into<ObjectRef<'a>>) -> Result<()> {
        self.set_many(&[index], vec![value.into()]).await
    }

    /// Overwrite several elements at once.
    pub async fn set_many(&self, indices: &[i64], values: Vec<ObjectRef<'_>>) -> Result<()> {
        self.ensure_writable().await?;
        if indices.len() != values.len() {
            return Err(Error::data(format!(
                "attempt to assign sequence of size {} to extended slice of size {}",
                values.len(),
                indices.len()
            )));
        }
        let len = self.len().await? as i64;
        let mut resolved = Vec::with_capacity(values.len());
        for (index, value) in indices.iter().zip(values) {
            if *index >= len || *index < -len {
                return Err(Error::IndexOutOfRange);
            }
            resolved.push(value.resolve(&self.key)?);
        }
        let mut pipeline = self.client.pipeline();
        for (index, value) in indices.iter().zip(&resolved) {
            pipeline.add(
                "lset",
                json!({ "name": self.key, "index": index, "value": encode_value(value)? }),
            );
        }
        pipeline.execute().await?;
        if let Some(callback) = &self.callbacks.set_item {
            callback(indices, &resolved);
        }
        Ok(())
    }

    /// Remove the element at a signed index.
    pub async fn del(&self, index: i64) -> Result<()> {
        self.del_many(&[index]).await
    }

    /// Remove several elements at once.
    pub async fn del_many(&self, indices: &[i64]) -> Result<()> {
        self.ensure_writable().await?;
        if indices.is_empty() {
            return Ok(());
        }
        let mut pipeline = self.client.pipeline();
        for index in indices {
            pipeline.add(
                "lset",
                json!({ "name": self.key, "index": index, "value": DELETED_SENTINEL }),
            );
        }
        pipeline.add(
            "lrem",
            json!({ "name": self.key, "count": 0, "value": DELETED_SENTINEL }),
        );
        pipeline.execute().await.map_err(|err| match err {
            Error::Response(_) => Error::IndexOutOfRange,
            other => other,
        })?;
        if let Some(callback) = &self.callbacks.del_item {
            callback(indices);
        }
        Ok(())
    }

    /// Insert a value before the element at a signed index; indices past the
    /// end append, indices before the head prepend.
    pub async fn insert<'a>(&self, index: i64, value: impl Into<ObjectRef<'a>>) -> Result<()> {
        self.ensure_writable().await?;
        let resolved = value.into().resolve(&self.key)?;
        let encoded = encode_value(&resolved)?;
        let len = self.len().await? as i64;
        let index = if index < 0 { (len + index).max(0) } else { index };
        if index >= len {
            self.client
                .call("rpush", json!({ "name": self.key, "value": encoded }))
                .await?;
        } else if index == 0 {
            self.client
                .call("lpush", json!({ "name": self.key, "value": encoded }))
                .await?;
        } else {
            let pivot = self
                .client
                .call("lindex", json!({ "name": self.key, "index": index }))
                .await?;
            self.client
                .call(
                    "linsert",
                    json!({ "name": self.key, "where": "BEFORE", "pivot": pivot, "value": encoded }),
                )
                .await?;
        }
        if let Some(callback) = &self.callbacks.insert {
            callback(index, &resolved);
        }
        Ok(())
    }

    /// Append a value.
    pub async fn push<'a>(&self, value: impl Into<ObjectRef<'a>>) -> Result<()> {
        self.ensure_writable().await?;
        let resolved = value.into().resolve(&self.key)?;
        if let Some(callback) = &self.callbacks.append {
            callback(&resolved);
        }
        self.client
            .call(
                "rpush",
                json!({ "name": self.key, "value": encode_value(&resolved)? }),
            )
            .await?;
        Ok(())
    }

    /// Append several values in one batch.
    pub async fn extend(&self, values: Vec<ObjectRef<'_>>) -> Result<()> {
        self.ensure_writable().await?;
        if values.is_empty() {
            return Ok(());
        }
        let mut pipeline = self.client.pipeline();
        for value in values {
            let resolved = value.resolve(&self.key)?;
            pipeline.add(
                "rpush",
                json!({ "name": self.key, "value": encode_value(&resolved)? }),
            );
        }
        pipeline.execute().await?;
        Ok(())
    }

    /// Remove and return the element at a signed index (default last).
    pub async fn pop(&self, index: i64) -> Result<ObjectValue> {
        self.ensure_writable().await?;
        let len = self.len().await? as i64;
        let index = if index < 0 { len + index } else { index };
        let raw = self
            .client
            .call("lindex", json!({ "name": self.key, "index": index }))
            .await?;
        let Value::String(raw) = raw else {
            return Err(Error::IndexOutOfRange);
        };
        let mut pipeline = self.client.pipeline();
        pipeline.add(
            "lset",
            json!({ "name": self.key, "index": index, "value": DELETED_SENTINEL }),
        );
        pipeline.add(
            "lrem",
            json!({ "name": self.key, "count": 0, "value": DELETED_SENTINEL }),
        );
        pipeline.execute().await.map_err(|err| match err {
            Error::Response(_) => Error::IndexOutOfRange,
            other => other,
        })?;
        decode_entry(&self.client, &raw)
    }

    /// Copy the content to a new key; fails when the target already exists.
    pub async fn copy(&self, new_name: &str) -> Result<List> {
        if self.adapter_available().await? {
            let mut args = serde_json::Map::new();
            args.insert("target".into(), json!(new_name));
            self.adapter_get("copy", args).await?;
        } else {
            let copied = self
                .client
                .call(
                    "copy",
                    json!({ "src": self.key, "dst": format!("{LIST_PREFIX}{new_name}") }),
                )
                .await?;
            if copied != Value::Bool(true) {
                return Err(Error::response("Could not copy list"));
            }
        }
        Ok(List::attach(self.client.clone(), new_name))
    }

    /// Subscribe to refresh events for this list.
    pub fn on_refresh(&self, callback: impl Fn(&RefreshData) + Send + Sync + 'static) {
        self.client.on_refresh(self.key.clone(), callback);
    }

    /// Raw stored strings at the given indices, erroring on any hole.
    async fn raw_at(&self, indices: &[i64]) -> Result<Vec<String>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipeline = self.client.pipeline();
        for index in indices {
            pipeline.add("lindex", json!({ "name": self.key, "index": index }));
        }
        let results = pipeline.execute().await?;
        results
            .into_iter()
            .map(|value| match value {
                Value::String(raw) => Ok(raw),
                _ => Err(Error::IndexOutOfRange),
            })
            .collect()
    }
}

impl std::fmt::Debug for List {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("List").field("key", &self.key).finish()
    }
}

/// Resolve a signed, optional-bounds slice into concrete indices, following
/// the half-open client-side convention.
pub(crate) fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<i64>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Error::data("slice step cannot be zero"));
    }
    let len = len as i64;
    let clamp = |value: i64| -> i64 {
        let value = if value < 0 { value + len } else { value };
        if step > 0 {
            value.clamp(0, len)
        } else {
            value.clamp(-1, len - 1)
        }
    };
    let start = match start {
        Some(s) => clamp(s),
        None if step > 0 => 0,
        None => len - 1,
    };
    let stop = match stop {
        Some(s) => clamp(s),
        None if step > 0 => len,
        None => -1,
    };
    let mut indices = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        indices.push(i);
        i += step;
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_defaults_cover_everything() {
        assert_eq!(slice_indices(5, None, None, None).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(0, None, None, None).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn slice_reverse() {
        assert_eq!(
            slice_indices(5, None, None, Some(-1)).unwrap(),
            vec![4, 3, 2, 1, 0]
        );
    }

    #[test]
    fn slice_with_start_and_step() {
        assert_eq!(slice_indices(5, Some(1), None, Some(2)).unwrap(), vec![1, 3]);
        assert_eq!(slice_indices(5, None, None, Some(2)).unwrap(), vec![0, 2, 4]);
    }

    #[test]
    fn slice_negative_bounds() {
        assert_eq!(slice_indices(5, Some(-2), None, None).unwrap(), vec![3, 4]);
        assert_eq!(slice_indices(5, None, Some(-1), None).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(
            slice_indices(5, Some(-1), Some(-4), Some(-1)).unwrap(),
            vec![4, 3, 2]
        );
    }

    #[test]
    fn slice_out_of_range_clamps() {
        assert_eq!(slice_indices(3, Some(-10), Some(10), None).unwrap(), vec![0, 1, 2]);
        assert_eq!(slice_indices(3, Some(5), Some(10), None).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn slice_zero_step_is_rejected() {
        assert!(slice_indices(3, None, None, Some(0)).is_err());
    }
}
