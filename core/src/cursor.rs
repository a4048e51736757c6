//! Sync cursors: the per-(type, direction) watermark of applied changes.

use crate::{Error, RecordId, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A keyset position in a store's change feed: strictly after
/// `(updated_at, id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorToken {
    /// Highest `updated_at` successfully applied on the peer side.
    pub updated_at: Timestamp,
    /// Id of the last record applied at that stamp, for keyset pagination
    /// among records sharing a timestamp.
    pub last_id: RecordId,
}

impl CursorToken {
    /// The position before any change.
    pub fn origin() -> Self {
        Self::default()
    }

    /// Encode as `"{updated_at}_{id}"`.
    pub fn encode(&self) -> String {
        format!("{}_{}", self.updated_at, self.last_id)
    }

    /// Parse a token previously produced by [`CursorToken::encode`]. Ids may
    /// contain underscores, so only the first one separates.
    pub fn parse(token: &str) -> Result<Self> {
        if token.is_empty() {
            return Ok(Self::origin());
        }
        let (ts, id) = token
            .split_once('_')
            .ok_or_else(|| Error::InvalidCursor(token.to_string()))?;
        let updated_at = ts
            .parse()
            .map_err(|_| Error::InvalidCursor(token.to_string()))?;
        Ok(Self {
            updated_at,
            last_id: id.to_string(),
        })
    }

    /// Advance past a processed record.
    pub fn advance(&mut self, updated_at: Timestamp, id: &str) {
        self.updated_at = updated_at;
        self.last_id = id.to_string();
    }
}

/// Cursor state for one worker: the watermark plus the in-flight set used to
/// deduplicate retries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub token: CursorToken,
    /// Record ids currently being applied; a retried batch skips these.
    pub in_flight: BTreeSet<RecordId>,
}

impl SyncCursor {
    pub fn new(token: CursorToken) -> Self {
        Self {
            token,
            in_flight: BTreeSet::new(),
        }
    }

    /// Age of the watermark relative to `now`, in milliseconds.
    pub fn age_millis(&self, now: Timestamp) -> Timestamp {
        now.saturating_sub(self.token.updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_token_is_zero() {
        let token = CursorToken::origin();
        assert_eq!(token.updated_at, 0);
        assert!(token.last_id.is_empty());
    }

    #[test]
    fn encode_parse_round_trip() {
        let mut token = CursorToken::origin();
        token.advance(1234, "proj_alpha_7");

        let encoded = token.encode();
        assert_eq!(encoded, "1234_proj_alpha_7");

        let parsed = CursorToken::parse(&encoded).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn empty_token_parses_as_origin() {
        assert_eq!(CursorToken::parse("").unwrap(), CursorToken::origin());
    }

    #[test]
    fn malformed_token_rejected() {
        assert!(matches!(
            CursorToken::parse("notanumber"),
            Err(Error::InvalidCursor(_))
        ));
        assert!(matches!(
            CursorToken::parse("abc_id"),
            Err(Error::InvalidCursor(_))
        ));
    }

    #[test]
    fn cursor_age() {
        let cursor = SyncCursor::new(CursorToken {
            updated_at: 1000,
            last_id: "a".into(),
        });
        assert_eq!(cursor.age_millis(1500), 500);
        assert_eq!(cursor.age_millis(500), 0); // saturates
    }
}
