//! Client-owned adapters.
//!
//! An adapter registers an in-process object as the authoritative source for
//! a key: other clients read the key as a regular [`List`](super::List) or
//! [`Dict`](super::Dict), and the server routes every read back to the
//! owning client. Ownership lives and dies with the connection.

use super::list::slice_indices;
use super::{encode_value, Client, List, DICT_PREFIX, LIST_PREFIX};
use crate::error::{Error, Result};
use crate::types::AdapterGetParams;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A sequence exposed through a [`ListAdapter`].
pub trait SequenceSource: Send + Sync + 'static {
    /// Number of elements.
    fn len(&self) -> usize;
    /// Element at an index already resolved to `0..len`.
    fn get(&self, index: usize) -> Option<Value>;
    /// Whether the sequence is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SequenceSource for Vec<Value> {
    fn len(&self) -> usize {
        self.len()
    }

    fn get(&self, index: usize) -> Option<Value> {
        self.as_slice().get(index).cloned()
    }
}

/// A mapping exposed through a [`DictAdapter`].
pub trait MappingSource: Send + Sync + 'static {
    /// Number of entries.
    fn len(&self) -> usize;
    /// All keys.
    fn keys(&self) -> Vec<String>;
    /// Value of a key.
    fn get(&self, key: &str) -> Option<Value>;
    /// Whether the mapping is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MappingSource for HashMap<String, Value> {
    fn len(&self) -> usize {
        self.len()
    }

    fn keys(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn get(&self, key: &str) -> Option<Value> {
        HashMap::get(self, key).cloned()
    }
}

impl MappingSource for Map<String, Value> {
    fn len(&self) -> usize {
        self.len()
    }

    fn keys(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn get(&self, key: &str) -> Option<Value> {
        Map::get(self, key).cloned()
    }
}

/// Result of an item transform: a raw value, or the prefixed key of an
/// adapter the transform created for the item.
#[derive(Debug, Clone)]
pub enum Transformed {
    /// Encode this value directly.
    Value(Value),
    /// Reference an adapter (or collection) by its prefixed key.
    Ref(String),
}

/// Per-element transform invoked when a [`ListAdapter`] item is accessed.
///
/// Receives the raw item, a suggested child key (`<parent>:<index>` — other
/// keys will collide), and the owning client. Typically creates a child
/// adapter for the item and returns its key.
pub type ItemTransform =
    Arc<dyn Fn(Value, String, Client) -> BoxFuture<'static, Result<Transformed>> + Send + Sync>;

/// Serves a sequence as the authoritative source for a list key.
///
/// # Examples
///
/// ```rust,no_run
/// use znsocket::{Client, ListAdapter};
/// use serde_json::json;
///
/// # async fn example() -> znsocket::Result<()> {
/// let client = Client::connect("znsocket://127.0.0.1:5000").await?;
/// let data = vec![json!(1), json!(2), json!(3)];
/// let _adapter = ListAdapter::new(&client, "readings", data).await?;
/// // Other clients now read `List(client, "readings")` from this process.
/// # Ok(())
/// # }
/// ```
pub struct ListAdapter {
    key: String,
    client: Client,
}

impl ListAdapter {
    /// Register a sequence under `znsocket.List:<name>`.
    pub async fn new(
        client: &Client,
        name: &str,
        source: impl SequenceSource,
    ) -> Result<ListAdapter> {
        Self::register(client, name, Arc::new(source), None).await
    }

    /// Register a sequence whose items are transformed on access; the
    /// transform usually creates nested adapters keyed `<parent>:<index>`.
    pub async fn with_transform(
        client: &Client,
        name: &str,
        source: impl SequenceSource,
        transform: ItemTransform,
    ) -> Result<ListAdapter> {
        Self::register(client, name, Arc::new(source), Some(transform)).await
    }

    async fn register(
        client: &Client,
        name: &str,
        source: Arc<dyn SequenceSource>,
        transform: Option<ItemTransform>,
    ) -> Result<ListAdapter> {
        let key = format!("{LIST_PREFIX}{name}");
        let callback = list_callback(source, transform, client.clone(), key.clone());
        client.register_adapter(&key, callback).await?;
        debug!(key, "list adapter registered");
        Ok(ListAdapter {
            key,
            client: client.clone(),
        })
    }

    /// The prefixed key this adapter serves.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Give up ownership of the key.
    pub async fn unregister(&self) -> Result<()> {
        self.client
            .call("unregister_adapter", json!({ "key": self.key }))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for ListAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListAdapter").field("key", &self.key).finish()
    }
}

/// Serves a mapping as the authoritative source for a dict key.
pub struct DictAdapter {
    key: String,
    client: Client,
}

impl DictAdapter {
    /// Register a mapping under `znsocket.Dict:<name>`.
    pub async fn new(
        client: &Client,
        name: &str,
        source: impl MappingSource,
    ) -> Result<DictAdapter> {
        let key = format!("{DICT_PREFIX}{name}");
        let callback = dict_callback(Arc::new(source), client.clone());
        client.register_adapter(&key, callback).await?;
        debug!(key, "dict adapter registered");
        Ok(DictAdapter {
            key,
            client: client.clone(),
        })
    }

    /// The prefixed key this adapter serves.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Give up ownership of the key.
    pub async fn unregister(&self) -> Result<()> {
        self.client
            .call("unregister_adapter", json!({ "key": self.key }))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for DictAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictAdapter").field("key", &self.key).finish()
    }
}

fn arg_i64(args: &Map<String, Value>, name: &str) -> Option<i64> {
    args.get(name).and_then(Value::as_i64)
}

fn arg_str(args: &Map<String, Value>, name: &str) -> Result<String> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol(format!("adapter call missing '{name}'")))
}

fn list_callback(
    source: Arc<dyn SequenceSource>,
    transform: Option<ItemTransform>,
    client: Client,
    key: String,
) -> super::AdapterCallback {
    Arc::new(move |params: AdapterGetParams| {
        let source = source.clone();
        let transform = transform.clone();
        let client = client.clone();
        let key = key.clone();
        Box::pin(async move {
            match params.method.as_str() {
                "len" => Ok(json!(source.len())),
                "get" => {
                    let index = arg_i64(&params.args, "index")
                        .ok_or_else(|| Error::Protocol("adapter call missing 'index'".into()))?;
                    let len = source.len() as i64;
                    let resolved = if index < 0 { len + index } else { index };
                    if !(0..len).contains(&resolved) {
                        return Err(Error::IndexOutOfRange);
                    }
                    let item = source
                        .get(resolved as usize)
                        .ok_or(Error::IndexOutOfRange)?;
                    match &transform {
                        None => Ok(Value::String(encode_value(&item)?)),
                        Some(transform) => {
                            serve_transformed(&client, transform, item, &key, resolved).await
                        },
                    }
                },
                "slice" => {
                    let start = arg_i64(&params.args, "start");
                    let stop = arg_i64(&params.args, "stop");
                    let step = arg_i64(&params.args, "step");
                    let indices = slice_indices(source.len(), start, stop, step)?;
                    let mut values = Vec::with_capacity(indices.len());
                    for index in indices {
                        let item = source
                            .get(index as usize)
                            .ok_or(Error::IndexOutOfRange)?;
                        values.push(Value::String(encode_value(&item)?));
                    }
                    Ok(Value::Array(values))
                },
                "copy" => {
                    let target = arg_str(&params.args, "target")?;
                    copy_guard(&client, &format!("{LIST_PREFIX}{target}")).await?;
                    let list = List::attach(client.clone(), target);
                    let values: Vec<_> = (0..source.len())
                        .filter_map(|i| source.get(i))
                        .map(super::ObjectRef::Value)
                        .collect();
                    list.extend(values).await?;
                    Ok(json!(true))
                },
                other => Err(Error::NotImplemented {
                    method: other.to_string(),
                }),
            }
        })
    })
}

/// Resolve an item through the transform, reusing an existing child adapter
/// when one is already registered for this position.
async fn serve_transformed(
    client: &Client,
    transform: &ItemTransform,
    item: Value,
    parent_key: &str,
    index: i64,
) -> Result<Value> {
    let suggested = format!("{parent_key}:{index}");
    for prefix in [DICT_PREFIX, LIST_PREFIX] {
        let child = format!("{prefix}{suggested}");
        let exists = client
            .call("adapter_exists", json!({ "key": child }))
            .await?;
        if exists.as_bool() == Some(true) {
            return Ok(Value::String(encode_value(&Value::String(child))?));
        }
    }
    match transform(item, suggested, client.clone()).await? {
        Transformed::Value(value) => Ok(Value::String(encode_value(&value)?)),
        Transformed::Ref(key) => Ok(Value::String(encode_value(&Value::String(key))?)),
    }
}

fn dict_callback(source: Arc<dyn MappingSource>, client: Client) -> super::AdapterCallback {
    Arc::new(move |params: AdapterGetParams| {
        let source = source.clone();
        let client = client.clone();
        Box::pin(async move {
            match params.method.as_str() {
                "len" => Ok(json!(source.len())),
                "get" => {
                    let dict_key = arg_str(&params.args, "dict_key")?;
                    match source.get(&dict_key) {
                        Some(value) => Ok(Value::String(encode_value(&value)?)),
                        None => Err(Error::KeyError { key: dict_key }),
                    }
                },
                "contains" => {
                    let dict_key = arg_str(&params.args, "dict_key")?;
                    Ok(json!(source.get(&dict_key).is_some()))
                },
                "keys" => Ok(json!(source.keys())),
                "values" => {
                    let mut values = Vec::with_capacity(source.len());
                    for key in source.keys() {
                        if let Some(value) = source.get(&key) {
                            values.push(Value::String(encode_value(&value)?));
                        }
                    }
                    Ok(Value::Array(values))
                },
                "items" => {
                    let mut items = Vec::with_capacity(source.len());
                    for key in source.keys() {
                        if let Some(value) = source.get(&key) {
                            items.push(json!([key, encode_value(&value)?]));
                        }
                    }
                    Ok(Value::Array(items))
                },
                "copy" => {
                    let target = arg_str(&params.args, "target")?;
                    copy_guard(&client, &format!("{DICT_PREFIX}{target}")).await?;
                    let dict = super::Dict::attach(client.clone(), target);
                    let entries: Vec<_> = source
                        .keys()
                        .into_iter()
                        .filter_map(|k| source.get(&k).map(|v| (k, super::ObjectRef::Value(v))))
                        .collect();
                    dict.update(entries).await?;
                    Ok(json!(true))
                },
                other => Err(Error::NotImplemented {
                    method: other.to_string(),
                }),
            }
        })
    })
}

/// A copy target must not itself be adapter-backed.
async fn copy_guard(client: &Client, target_key: &str) -> Result<()> {
    let exists = client
        .call("adapter_exists", json!({ "key": target_key }))
        .await?;
    if exists.as_bool() == Some(true) {
        return Err(Error::KeyError {
            key: format!("Adapter already registered for key '{target_key}'"),
        });
    }
    Ok(())
}
