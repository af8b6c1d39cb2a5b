//! Copy-on-write list view backed by a piece table.
//!
//! A [`Segments`] presents a mutable sequence without ever touching its
//! origin list. The piece table lives at `znsocket.Segments:<name>` as a list
//! of `(start, stop, target_key)` tuples meaning "take indices
//! `[start, stop)` from the list stored under `target_key`"; values written
//! through the view land in an own store at `znsocket.List:<name>`. Creating
//! the view is O(1) in the origin's size, and edits splice at most one
//! segment into three.

use super::list::List;
use super::{encode_value, Client, ObjectRef, ObjectValue, SEGMENTS_PREFIX};
use crate::error::{Error, Result};
use serde_json::{json, Value};

/// Marker segment used during a splice: the slot being replaced is
/// overwritten, the new segments are inserted before it, then every marker
/// is removed.
const SPLICE_SENTINEL: &str = "__SPLICE_MARKER__";

/// One piece of the table: `[start, stop)` of the list under `target`.
type Segment = (i64, i64, String);

/// Copy-on-write view over an origin list.
///
/// # Examples
///
/// ```rust,no_run
/// use znsocket::{Client, List, Segments};
///
/// # async fn example() -> znsocket::Result<()> {
/// # let client = Client::connect("znsocket://127.0.0.1:5000").await?;
/// let origin = List::new(client.clone(), "frames").await?;
/// let view = Segments::from_list(&origin, "edited").await?;
/// view.set(0, serde_json::json!("replaced")).await?;
/// // The origin is untouched; only the view sees the new value.
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Segments {
    client: Client,
    name: String,
    table_key: String,
    own_key: String,
}

impl Segments {
    /// Create a view of `origin` under a new name.
    ///
    /// Seeds the piece table with a single segment covering the whole
    /// origin; any stale table under the same name is replaced.
    pub async fn from_list(origin: &List, name: impl Into<String>) -> Result<Segments> {
        let name = name.into();
        let client = origin.client().clone();
        let segments = Segments {
            table_key: format!("{SEGMENTS_PREFIX}{name}"),
            own_key: List::attach(client.clone(), name.clone()).key().to_string(),
            client,
            name,
        };
        let origin_len = origin.len().await? as i64;
        segments
            .client
            .call("delete", json!({ "name": segments.table_key }))
            .await?;
        segments
            .push_segment((0, origin_len, origin.key().to_string()))
            .await?;
        Ok(segments)
    }

    /// The view's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key the piece table is stored under.
    pub fn key(&self) -> &str {
        &self.table_key
    }

    /// The raw piece table, in order.
    pub async fn raw_segments(&self) -> Result<Vec<Segment>> {
        let raw = self
            .client
            .call("lrange", json!({ "name": self.table_key, "start": 0, "end": -1 }))
            .await?;
        let raws: Vec<String> = serde_json::from_value(raw)
            .map_err(|e| Error::Protocol(format!("piece table malformed: {e}")))?;
        raws.iter()
            .map(|raw| {
                serde_json::from_str(raw)
                    .map_err(|e| Error::Protocol(format!("segment malformed: {e}")))
            })
            .collect()
    }

    /// Logical length: the sum of all segment spans.
    pub async fn len(&self) -> Result<usize> {
        let segments = self.raw_segments().await?;
        Ok(segments.iter().map(|(s, e, _)| (e - s).max(0)).sum::<i64>() as usize)
    }

    /// Whether the view is empty.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Element at a signed logical index.
    pub async fn get(&self, index: i64) -> Result<ObjectValue> {
        let segments = self.raw_segments().await?;
        let (_, segment, local) = locate(&segments, normalize(index, total(&segments))?)?;
        let target = List::from_key(self.client.clone(), &segment.2);
        target.get(segment.0 + local).await
    }

    /// Every element, in order, fetched one segment at a time.
    pub async fn to_vec(&self) -> Result<Vec<ObjectValue>> {
        let segments = self.raw_segments().await?;
        let mut items = Vec::new();
        for (start, stop, target_key) in &segments {
            if stop <= start {
                continue;
            }
            let target = List::from_key(self.client.clone(), target_key);
            items.extend(
                target
                    .slice(Some(*start), Some(*stop), Some(1))
                    .await?,
            );
        }
        Ok(items)
    }

    /// Every element as plain JSON.
    pub async fn plain_values(&self) -> Result<Vec<Value>> {
        Ok(self
            .to_vec()
            .await?
            .into_iter()
            .map(ObjectValue::into_plain)
            .collect())
    }

    /// Structural equality against a native sequence.
    pub async fn eq_values(&self, other: &[Value]) -> Result<bool> {
        Ok(self.plain_values().await? == other)
    }

    /// Overwrite the element at a signed logical index, copy-on-write.
    pub async fn set<'a>(&self, index: i64, value: impl Into<ObjectRef<'a>>) -> Result<()> {
        let segments = self.raw_segments().await?;
        let index = normalize(index, total(&segments))?;
        let own_position = self.push_own(value.into()).await?;
        let (slot, (start, stop, target), local) = locate(&segments, index)?;
        let absolute = start + local;
        let mut pieces = Vec::new();
        if start < absolute {
            pieces.push((start, absolute, target.clone()));
        }
        pieces.push((own_position, own_position + 1, self.own_key.clone()));
        if absolute + 1 < stop {
            pieces.push((absolute + 1, stop, target));
        }
        self.splice(slot, &pieces).await
    }

    /// Remove the element at a signed logical index.
    pub async fn delete(&self, index: i64) -> Result<()> {
        let segments = self.raw_segments().await?;
        let index = normalize(index, total(&segments))?;
        let (slot, (start, stop, target), local) = locate(&segments, index)?;
        let absolute = start + local;
        let mut pieces = Vec::new();
        if start < absolute {
            pieces.push((start, absolute, target.clone()));
        }
        if absolute + 1 < stop {
            pieces.push((absolute + 1, stop, target));
        }
        self.splice(slot, &pieces).await
    }

    /// Insert a value before the element at a signed logical index; indices
    /// past the end append, indices before the head prepend.
    pub async fn insert<'a>(&self, index: i64, value: impl Into<ObjectRef<'a>>) -> Result<()> {
        let segments = self.raw_segments().await?;
        let len = total(&segments);
        let index = if index < 0 { (len + index).max(0) } else { index };
        if index >= len {
            return self.push(value).await;
        }
        let own_position = self.push_own(value.into()).await?;
        let (slot, (start, stop, target), local) = locate(&segments, index)?;
        let absolute = start + local;
        let mut pieces = Vec::new();
        if start < absolute {
            pieces.push((start, absolute, target.clone()));
        }
        pieces.push((own_position, own_position + 1, self.own_key.clone()));
        pieces.push((absolute, stop, target));
        self.splice(slot, &pieces).await
    }

    /// Append a value at the logical end.
    pub async fn push<'a>(&self, value: impl Into<ObjectRef<'a>>) -> Result<()> {
        let own_position = self.push_own(value.into()).await?;
        self.push_segment((own_position, own_position + 1, self.own_key.clone()))
            .await
    }

    /// Append several values.
    pub async fn extend<'a>(&self, values: Vec<ObjectRef<'a>>) -> Result<()> {
        for value in values {
            self.push(value).await?;
        }
        Ok(())
    }

    /// Store a value in the own store; returns its position there.
    async fn push_own(&self, value: ObjectRef<'_>) -> Result<i64> {
        let resolved = value.resolve(&self.own_key)?;
        let len = self
            .client
            .call(
                "rpush",
                json!({ "name": self.own_key, "value": encode_value(&resolved)? }),
            )
            .await?;
        Ok(len.as_i64().unwrap_or(1) - 1)
    }

    async fn push_segment(&self, segment: Segment) -> Result<()> {
        self.client
            .call(
                "rpush",
                json!({ "name": self.table_key, "value": serde_json::to_string(&segment)? }),
            )
            .await?;
        Ok(())
    }

    /// Replace the segment at `slot` with `pieces`, atomically with respect
    /// to other table edits: the slot is marked with a sentinel, the pieces
    /// are inserted before the mark, then the mark is removed.
    async fn splice(&self, slot: usize, pieces: &[Segment]) -> Result<()> {
        self.client
            .call(
                "lset",
                json!({ "name": self.table_key, "index": slot as i64, "value": SPLICE_SENTINEL }),
            )
            .await?;
        for piece in pieces {
            self.client
                .call(
                    "linsert",
                    json!({
                        "name": self.table_key,
                        "where": "BEFORE",
                        "pivot": SPLICE_SENTINEL,
                        "value": serde_json::to_string(piece)?,
                    }),
                )
                .await?;
        }
        self.client
            .call(
                "lrem",
                json!({ "name": self.table_key, "count": 0, "value": SPLICE_SENTINEL }),
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Segments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segments")
            .field("key", &self.table_key)
            .finish()
    }
}

fn total(segments: &[Segment]) -> i64 {
    segments.iter().map(|(s, e, _)| (e - s).max(0)).sum()
}

/// Resolve a signed logical index against the current length.
fn normalize(index: i64, len: i64) -> Result<i64> {
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        Ok(resolved)
    } else {
        Err(Error::IndexOutOfRange)
    }
}

/// Find the segment covering a logical index; returns the table slot, the
/// segment, and the offset within it.
fn locate(segments: &[Segment], index: i64) -> Result<(usize, Segment, i64)> {
    let mut covered = 0;
    for (slot, segment) in segments.iter().enumerate() {
        let span = (segment.1 - segment.0).max(0);
        if index < covered + span {
            return Ok((slot, segment.clone(), index - covered));
        }
        covered += span;
    }
    Err(Error::IndexOutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: i64, stop: i64, target: &str) -> Segment {
        (start, stop, target.to_string())
    }

    #[test]
    fn locate_walks_cumulative_spans() {
        let table = vec![seg(0, 2, "a"), seg(3, 5, "b")];
        let (slot, segment, local) = locate(&table, 0).unwrap();
        assert_eq!((slot, local), (0, 0));
        assert_eq!(segment.2, "a");

        let (slot, segment, local) = locate(&table, 2).unwrap();
        assert_eq!((slot, local), (1, 0));
        assert_eq!(segment.2, "b");

        let (slot, _, local) = locate(&table, 3).unwrap();
        assert_eq!((slot, local), (1, 1));
        assert!(locate(&table, 4).is_err());
    }

    #[test]
    fn locate_skips_empty_segments() {
        let table = vec![seg(2, 2, "a"), seg(0, 1, "b")];
        let (slot, segment, local) = locate(&table, 0).unwrap();
        assert_eq!((slot, local), (1, 0));
        assert_eq!(segment.2, "b");
    }

    #[test]
    fn normalize_signed_indices() {
        assert_eq!(normalize(0, 5).unwrap(), 0);
        assert_eq!(normalize(-1, 5).unwrap(), 4);
        assert_eq!(normalize(-5, 5).unwrap(), 0);
        assert!(normalize(5, 5).is_err());
        assert!(normalize(-6, 5).is_err());
    }

    #[test]
    fn total_ignores_negative_spans() {
        assert_eq!(total(&[seg(0, 3, "a"), seg(5, 5, "b"), seg(7, 9, "c")]), 5);
    }
}
