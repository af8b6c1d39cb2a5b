//! Storage backend capability.
//!
//! The dispatcher executes every storage command against this trait, so
//! alternative backends (persistent stores) can replace the in-memory one
//! without touching the protocol layer. The trait is synchronous: the server
//! wraps the backend in a read/write lock and holds it only for the duration
//! of a single command.

mod memory;

pub use memory::MemoryStorage;

use crate::error::{Error, Result};
use crate::types::InsertWhere;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Options of the `set` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Expire the key after this duration.
    pub ex: Option<Duration>,
    /// Only set when the key does not exist.
    pub nx: bool,
    /// Only set when the key already exists.
    pub xx: bool,
}

/// Redis-subset storage operations over an opaque key space.
///
/// Wrong-type operations fail with `WRONGTYPE`; removing the last element of
/// a collection removes the key, so empty collections are indistinguishable
/// from missing ones. Collection reads return owned copies.
pub trait StorageBackend: Send + Sync {
    // String operations

    /// Set a string key. Returns `false` when an `nx`/`xx` guard failed.
    fn set(&mut self, name: &str, value: String, opts: SetOptions) -> Result<bool>;
    /// Get a string key.
    fn get(&self, name: &str) -> Result<Option<String>>;
    /// Add `amount` to an integer key (negative to decrement); returns the
    /// new value. A missing key counts as 0.
    fn incr_by(&mut self, name: &str, amount: i64) -> Result<i64>;
    /// 1 when the key exists, 0 otherwise.
    fn exists(&self, name: &str) -> i64;
    /// Remove a key; 1 when it existed.
    fn delete(&mut self, name: &str) -> i64;
    /// Deep-copy `src` to `dst`; `false` when `src` is missing, `dst`
    /// already exists, or the two are the same key.
    fn copy(&mut self, src: &str, dst: &str) -> bool;

    // Hash operations

    /// Set fields on a hash; returns the number of newly created fields.
    fn hset(&mut self, name: &str, pairs: Vec<(String, String)>) -> Result<i64>;
    /// Get a hash field.
    fn hget(&self, name: &str, key: &str) -> Result<Option<String>>;
    /// Get several hash fields, `None` for each missing one.
    fn hmget(&self, name: &str, keys: &[String]) -> Result<Vec<Option<String>>>;
    /// All field names.
    fn hkeys(&self, name: &str) -> Result<Vec<String>>;
    /// All field values.
    fn hvals(&self, name: &str) -> Result<Vec<String>>;
    /// A copy of the full hash.
    fn hgetall(&self, name: &str) -> Result<HashMap<String, String>>;
    /// 1 when the field exists, 0 otherwise.
    fn hexists(&self, name: &str, key: &str) -> Result<i64>;
    /// Remove a field; 1 when it existed.
    fn hdel(&mut self, name: &str, key: &str) -> Result<i64>;
    /// Number of fields.
    fn hlen(&self, name: &str) -> Result<i64>;

    // List operations

    /// Length of a list (0 for a missing key).
    fn llen(&self, name: &str) -> Result<i64>;
    /// Append to the tail; returns the new length.
    fn rpush(&mut self, name: &str, value: String) -> Result<i64>;
    /// Prepend to the head; returns the new length.
    fn lpush(&mut self, name: &str, value: String) -> Result<i64>;
    /// Element at a signed index, `None` when out of range.
    fn lindex(&self, name: &str, index: i64) -> Result<Option<String>>;
    /// Inclusive signed range; `end == -1` addresses the last element.
    fn lrange(&self, name: &str, start: i64, end: i64) -> Result<Vec<String>>;
    /// Overwrite the element at `index`.
    fn lset(&mut self, name: &str, index: i64, value: String) -> Result<()>;
    /// Remove occurrences of `value` (count 0 = all, positive head-to-tail,
    /// negative tail-to-head); returns the number removed.
    fn lrem(&mut self, name: &str, count: i64, value: &str) -> Result<i64>;
    /// Insert `value` before/after the first occurrence of `pivot`; returns
    /// the new length, -1 when the pivot is missing, 0 when the key is.
    fn linsert(
        &mut self,
        name: &str,
        where_: InsertWhere,
        pivot: &str,
        value: String,
    ) -> Result<i64>;
    /// Pop the head element.
    fn lpop(&mut self, name: &str) -> Result<Option<String>>;

    // Set operations

    /// Add a member; returns 1 when it was new.
    fn sadd(&mut self, name: &str, value: String) -> Result<i64>;
    /// Remove a member; returns 1 when it existed.
    fn srem(&mut self, name: &str, value: &str) -> Result<i64>;
    /// A copy of all members.
    fn smembers(&self, name: &str) -> Result<Vec<String>>;
    /// Number of members.
    fn scard(&self, name: &str) -> Result<i64>;

    // Bulk operations

    /// Drop every key.
    fn flushall(&mut self);
}

/// Open a backend from a DSN. `memory` is the only built-in scheme.
pub fn open(dsn: &str) -> Result<Box<dyn StorageBackend>> {
    match dsn {
        "memory" => Ok(Box::new(MemoryStorage::new())),
        other => Err(Error::Protocol(format!(
            "unsupported storage DSN '{other}'"
        ))),
    }
}

/// Coerce a JSON value into the stored string form.
///
/// Only scalars are accepted on writes: strings pass through, numbers are
/// stored in their textual form, and everything else is rejected with a
/// `DataError` naming the offending type.
pub fn coerce_scalar(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Err(Error::data("Invalid input of type None")),
        Value::Bool(_) => Err(Error::data("Invalid input of type: 'bool'")),
        Value::Array(_) => Err(Error::data("Invalid input of type: 'list'")),
        Value::Object(_) => Err(Error::data("Invalid input of type: 'dict'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_accepts_scalars() {
        assert_eq!(coerce_scalar(&json!("abc")).unwrap(), "abc");
        assert_eq!(coerce_scalar(&json!(42)).unwrap(), "42");
        assert_eq!(coerce_scalar(&json!(2.5)).unwrap(), "2.5");
    }

    #[test]
    fn coerce_rejects_compounds() {
        for (value, needle) in [
            (json!(true), "'bool'"),
            (json!([1]), "'list'"),
            (json!({"a": 1}), "'dict'"),
            (json!(null), "None"),
        ] {
            let err = coerce_scalar(&value).unwrap_err();
            assert!(err.to_string().contains(needle), "{err} missing {needle}");
        }
    }

    #[test]
    fn open_memory_dsn() {
        assert!(open("memory").is_ok());
        assert!(open("redis://localhost/0").is_err());
    }
}
