//! In-memory storage backend.
//!
//! Values live in a single map behind a tagged union, so a key holds at most
//! one value type and wrong-type operations can be rejected uniformly.
//! Expiry uses a monotonic clock and is applied lazily: reads treat expired
//! keys as missing, writes physically remove them first.

use super::{SetOptions, StorageBackend};
use crate::error::{Error, Result};
use crate::types::InsertWhere;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    String(String),
    Hash(HashMap<String, String>),
    List(Vec<String>),
    Set(HashSet<String>),
}

/// In-memory [`StorageBackend`].
///
/// # Examples
///
/// ```rust
/// use znsocket::server::storage::{MemoryStorage, SetOptions, StorageBackend};
///
/// let mut storage = MemoryStorage::new();
/// storage.set("greeting", "hello".into(), SetOptions::default()).unwrap();
/// assert_eq!(storage.get("greeting").unwrap().as_deref(), Some("hello"));
/// ```
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: HashMap<String, Entry>,
    expiries: HashMap<String, Instant>,
}

/// Resolve a signed index against a length; `None` when out of range.
fn resolve_index(len: usize, index: i64) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn is_expired(&self, name: &str) -> bool {
        self.expiries
            .get(name)
            .is_some_and(|deadline| Instant::now() >= *deadline)
    }

    /// Live entry for reads; expired keys read as missing.
    fn entry(&self, name: &str) -> Option<&Entry> {
        if self.is_expired(name) {
            return None;
        }
        self.entries.get(name)
    }

    /// Remove an expired key before a write touches it.
    fn purge_expired(&mut self, name: &str) {
        if self.is_expired(name) {
            self.entries.remove(name);
            self.expiries.remove(name);
        }
    }

    fn drop_if_empty(&mut self, name: &str) {
        let empty = match self.entries.get(name) {
            Some(Entry::Hash(h)) => h.is_empty(),
            Some(Entry::List(l)) => l.is_empty(),
            Some(Entry::Set(s)) => s.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(name);
            self.expiries.remove(name);
        }
    }

    fn hash(&self, name: &str) -> Result<Option<&HashMap<String, String>>> {
        match self.entry(name) {
            None => Ok(None),
            Some(Entry::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(Error::wrong_type()),
        }
    }

    fn hash_mut(&mut self, name: &str) -> Result<&mut HashMap<String, String>> {
        self.purge_expired(name);
        match self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()))
        {
            Entry::Hash(h) => Ok(h),
            _ => Err(Error::wrong_type()),
        }
    }

    fn list(&self, name: &str) -> Result<Option<&Vec<String>>> {
        match self.entry(name) {
            None => Ok(None),
            Some(Entry::List(l)) => Ok(Some(l)),
            Some(_) => Err(Error::wrong_type()),
        }
    }

    fn list_mut(&mut self, name: &str) -> Result<&mut Vec<String>> {
        self.purge_expired(name);
        match self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Entry::List(Vec::new()))
        {
            Entry::List(l) => Ok(l),
            _ => Err(Error::wrong_type()),
        }
    }

    fn set_entry(&self, name: &str) -> Result<Option<&HashSet<String>>> {
        match self.entry(name) {
            None => Ok(None),
            Some(Entry::Set(s)) => Ok(Some(s)),
            Some(_) => Err(Error::wrong_type()),
        }
    }

    fn set_entry_mut(&mut self, name: &str) -> Result<&mut HashSet<String>> {
        self.purge_expired(name);
        match self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Entry::Set(HashSet::new()))
        {
            Entry::Set(s) => Ok(s),
            _ => Err(Error::wrong_type()),
        }
    }
}

impl StorageBackend for MemoryStorage {
    fn set(&mut self, name: &str, value: String, opts: SetOptions) -> Result<bool> {
        self.purge_expired(name);
        let exists = self.entries.contains_key(name);
        if (opts.nx && exists) || (opts.xx && !exists) {
            return Ok(false);
        }
        self.entries.insert(name.to_string(), Entry::String(value));
        match opts.ex {
            Some(ttl) => {
                self.expiries.insert(name.to_string(), Instant::now() + ttl);
            },
            None => {
                self.expiries.remove(name);
            },
        }
        Ok(true)
    }

    fn get(&self, name: &str) -> Result<Option<String>> {
        match self.entry(name) {
            None => Ok(None),
            Some(Entry::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(Error::wrong_type()),
        }
    }

    fn incr_by(&mut self, name: &str, amount: i64) -> Result<i64> {
        self.purge_expired(name);
        let current = match self.entries.get(name) {
            None => 0,
            Some(Entry::String(s)) => s
                .parse::<i64>()
                .map_err(|_| Error::response("value is not an integer or out of range"))?,
            Some(_) => return Err(Error::wrong_type()),
        };
        let next = current
            .checked_add(amount)
            .ok_or_else(|| Error::response("value is not an integer or out of range"))?;
        self.entries
            .insert(name.to_string(), Entry::String(next.to_string()));
        Ok(next)
    }

    fn exists(&self, name: &str) -> i64 {
        i64::from(self.entry(name).is_some())
    }

    fn delete(&mut self, name: &str) -> i64 {
        self.purge_expired(name);
        self.expiries.remove(name);
        i64::from(self.entries.remove(name).is_some())
    }

    fn copy(&mut self, src: &str, dst: &str) -> bool {
        if src == dst {
            return false;
        }
        self.purge_expired(src);
        self.purge_expired(dst);
        if self.entries.contains_key(dst) {
            return false;
        }
        match self.entries.get(src).cloned() {
            Some(entry) => {
                self.entries.insert(dst.to_string(), entry);
                true
            },
            None => false,
        }
    }

    fn hset(&mut self, name: &str, pairs: Vec<(String, String)>) -> Result<i64> {
        let hash = self.hash_mut(name)?;
        let mut added = 0;
        for (field, value) in pairs {
            if hash.insert(field, value).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    fn hget(&self, name: &str, key: &str) -> Result<Option<String>> {
        Ok(self.hash(name)?.and_then(|h| h.get(key).cloned()))
    }

    fn hmget(&self, name: &str, keys: &[String]) -> Result<Vec<Option<String>>> {
        let hash = self.hash(name)?;
        Ok(keys
            .iter()
            .map(|key| hash.and_then(|h| h.get(key).cloned()))
            .collect())
    }

    fn hkeys(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .hash(name)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn hvals(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .hash(name)?
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default())
    }

    fn hgetall(&self, name: &str) -> Result<HashMap<String, String>> {
        Ok(self.hash(name)?.cloned().unwrap_or_default())
    }

    fn hexists(&self, name: &str, key: &str) -> Result<i64> {
        Ok(i64::from(
            self.hash(name)?.is_some_and(|h| h.contains_key(key)),
        ))
    }

    fn hdel(&mut self, name: &str, key: &str) -> Result<i64> {
        if self.hash(name)?.is_none() {
            return Ok(0);
        }
        let removed = i64::from(self.hash_mut(name)?.remove(key).is_some());
        self.drop_if_empty(name);
        Ok(removed)
    }

    fn hlen(&self, name: &str) -> Result<i64> {
        Ok(self.hash(name)?.map_or(0, |h| h.len() as i64))
    }

    fn llen(&self, name: &str) -> Result<i64> {
        Ok(self.list(name)?.map_or(0, |l| l.len() as i64))
    }

    fn rpush(&mut self, name: &str, value: String) -> Result<i64> {
        let list = self.list_mut(name)?;
        list.push(value);
        Ok(list.len() as i64)
    }

    fn lpush(&mut self, name: &str, value: String) -> Result<i64> {
        let list = self.list_mut(name)?;
        list.insert(0, value);
        Ok(list.len() as i64)
    }

    fn lindex(&self, name: &str, index: i64) -> Result<Option<String>> {
        Ok(self
            .list(name)?
            .and_then(|l| resolve_index(l.len(), index).map(|i| l[i].clone())))
    }

    fn lrange(&self, name: &str, start: i64, end: i64) -> Result<Vec<String>> {
        let Some(list) = self.list(name)? else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let start = (if start < 0 { len + start } else { start }).max(0);
        let end = if end < 0 { len + end } else { end }.min(len - 1);
        if start > end {
            return Ok(Vec::new());
        }
        Ok(list[start as usize..=end as usize].to_vec())
    }

    fn lset(&mut self, name: &str, index: i64, value: String) -> Result<()> {
        if self.list(name)?.is_none() {
            return Err(Error::response("no such key"));
        }
        let list = self.list_mut(name)?;
        match resolve_index(list.len(), index) {
            Some(i) => {
                list[i] = value;
                Ok(())
            },
            None => Err(Error::response("index out of range")),
        }
    }

    fn lrem(&mut self, name: &str, count: i64, value: &str) -> Result<i64> {
        if self.list(name)?.is_none() {
            return Ok(0);
        }
        let list = self.list_mut(name)?;
        let before = list.len();
        if count == 0 {
            list.retain(|v| v != value);
        } else if count > 0 {
            let mut remaining = count as usize;
            list.retain(|v| {
                if remaining > 0 && v == value {
                    remaining -= 1;
                    false
                } else {
                    true
                }
            });
        } else {
            let mut remaining = count.unsigned_abs() as usize;
            for i in (0..list.len()).rev() {
                if remaining == 0 {
                    break;
                }
                if list[i] == value {
                    list.remove(i);
                    remaining -= 1;
                }
            }
        }
        let removed = (before - list.len()) as i64;
        self.drop_if_empty(name);
        Ok(removed)
    }

    fn linsert(
        &mut self,
        name: &str,
        where_: InsertWhere,
        pivot: &str,
        value: String,
    ) -> Result<i64> {
        if self.list(name)?.is_none() {
            return Ok(0);
        }
        let list = self.list_mut(name)?;
        match list.iter().position(|v| v == pivot) {
            Some(pos) => {
                let at = match where_ {
                    InsertWhere::Before => pos,
                    InsertWhere::After => pos + 1,
                };
                list.insert(at, value);
                Ok(list.len() as i64)
            },
            None => Ok(-1),
        }
    }

    fn lpop(&mut self, name: &str) -> Result<Option<String>> {
        if self.list(name)?.is_none() {
            return Ok(None);
        }
        let list = self.list_mut(name)?;
        let popped = if list.is_empty() {
            None
        } else {
            Some(list.remove(0))
        };
        self.drop_if_empty(name);
        Ok(popped)
    }

    fn sadd(&mut self, name: &str, value: String) -> Result<i64> {
        Ok(i64::from(self.set_entry_mut(name)?.insert(value)))
    }

    fn srem(&mut self, name: &str, value: &str) -> Result<i64> {
        if self.set_entry(name)?.is_none() {
            return Ok(0);
        }
        let removed = i64::from(self.set_entry_mut(name)?.remove(value));
        self.drop_if_empty(name);
        Ok(removed)
    }

    fn smembers(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .set_entry(name)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn scard(&self, name: &str) -> Result<i64> {
        Ok(self.set_entry(name)?.map_or(0, |s| s.len() as i64))
    }

    fn flushall(&mut self) {
        self.entries.clear();
        self.expiries.clear();
    }
}
