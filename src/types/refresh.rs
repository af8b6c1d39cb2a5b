//! Refresh notification payloads.
//!
//! A refresh tells observers of a key which part of it changed. The payload
//! carries exactly one of: changed hash fields (`keys`), changed list
//! positions (`indices`), or an open-ended range (`start`/`stop`) when
//! elements shifted.

use serde::{Deserialize, Serialize};

/// A refresh event: `{target, data}` broadcast to the emitting socket's room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshData {
    /// The prefixed key that changed.
    pub target: String,
    /// Which part of the target changed.
    pub data: RefreshPayload,
}

/// The shape of a change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefreshPayload {
    /// Named hash fields changed.
    Keys {
        /// The changed field names.
        keys: Vec<String>,
    },
    /// Individual list positions changed in place.
    Indices {
        /// The changed positions.
        indices: Vec<i64>,
    },
    /// Everything from `start` (to `stop`, when bounded) may have shifted.
    Range {
        /// First affected position.
        start: i64,
        /// One past the last affected position; `None` means "to the end".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop: Option<i64>,
    },
}

impl RefreshData {
    /// Refresh naming changed hash fields.
    pub fn keys(target: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            target: target.into(),
            data: RefreshPayload::Keys { keys },
        }
    }

    /// Refresh naming changed list positions.
    pub fn indices(target: impl Into<String>, indices: Vec<i64>) -> Self {
        Self {
            target: target.into(),
            data: RefreshPayload::Indices { indices },
        }
    }

    /// Refresh covering an open-ended tail starting at `start`.
    pub fn from_start(target: impl Into<String>, start: i64) -> Self {
        Self {
            target: target.into(),
            data: RefreshPayload::Range { start, stop: None },
        }
    }

    /// The first position this refresh could affect, used when coalescing
    /// several refreshes for the same target into one.
    pub fn min_position(&self) -> i64 {
        match &self.data {
            RefreshPayload::Keys { .. } => 0,
            RefreshPayload::Indices { indices } => indices.iter().copied().min().unwrap_or(0),
            RefreshPayload::Range { start, .. } => *start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_payload_shape() {
        let refresh = RefreshData::keys("znsocket.Dict:conf", vec!["a".into(), "b".into()]);
        let value = serde_json::to_value(&refresh).unwrap();
        assert_eq!(value, json!({"target": "znsocket.Dict:conf", "data": {"keys": ["a", "b"]}}));
    }

    #[test]
    fn range_payload_omits_missing_stop() {
        let refresh = RefreshData::from_start("znsocket.List:l", 4);
        let value = serde_json::to_value(&refresh).unwrap();
        assert_eq!(value, json!({"target": "znsocket.List:l", "data": {"start": 4}}));
    }

    #[test]
    fn untagged_round_trip() {
        for refresh in [
            RefreshData::keys("t", vec!["x".into()]),
            RefreshData::indices("t", vec![1, 2]),
            RefreshData::from_start("t", 0),
        ] {
            let value = serde_json::to_value(&refresh).unwrap();
            let back: RefreshData = serde_json::from_value(value).unwrap();
            assert_eq!(back, refresh);
        }
    }

    #[test]
    fn min_position_for_coalescing() {
        assert_eq!(RefreshData::indices("t", vec![7, 2, 9]).min_position(), 2);
        assert_eq!(RefreshData::from_start("t", 5).min_position(), 5);
        assert_eq!(RefreshData::keys("t", vec!["k".into()]).min_position(), 0);
    }
}
