//! Cache Entry Types
//!
//! Immutable cached responses and the binary envelope networked layers use
//! to carry them.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Envelope format version
const ENVELOPE_VERSION: u8 = 1;

/// version (1) + stored_at (8) + content-type length (2)
const ENVELOPE_HEADER_LEN: usize = 1 + 8 + 2;

/// Longest content type the envelope can carry
pub const MAX_CONTENT_TYPE_LEN: usize = u16::MAX as usize;

/// A cached response. Replacing an entry means building a new one.
#[derive(Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Response body
    payload: Bytes,
    /// MIME type of the body
    content_type: String,
    /// Moment of write
    stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create a new cache entry
    pub fn new(
        payload: impl Into<Bytes>,
        content_type: impl Into<String>,
        stored_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payload: payload.into(),
            content_type: content_type.into(),
            stored_at,
        }
    }

    /// Copy of this entry's payload and content type, stamped at `stored_at`
    pub fn restamped(&self, stored_at: DateTime<Utc>) -> Self {
        Self {
            payload: self.payload.clone(),
            content_type: self.content_type.clone(),
            stored_at,
        }
    }

    /// Get payload (zero-copy)
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[inline]
    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    /// Payload size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Age relative to `now`. Negative when the writer's clock ran ahead.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::TimeDelta {
        now - self.stored_at
    }

    /// An entry is expired once its age is strictly greater than `ttl`
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.age(now).num_milliseconds() > ttl_ms
    }

    /// Encode into the networked-layer envelope.
    ///
    /// Fails when the content type does not fit the 16-bit length field.
    pub fn encode(&self) -> Result<Bytes> {
        let ct = self.content_type.as_bytes();
        let ct_len = u16::try_from(ct.len()).map_err(|_| {
            Error::Codec(format!(
                "content type of {} bytes exceeds {} byte limit",
                ct.len(),
                MAX_CONTENT_TYPE_LEN
            ))
        })?;
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + ct.len() + self.payload.len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_i64(self.stored_at.timestamp_millis());
        buf.put_u16(ct_len);
        buf.put_slice(ct);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode an envelope produced by [`CacheEntry::encode`]
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < ENVELOPE_HEADER_LEN {
            return Err(Error::Codec(format!(
                "envelope too short: {} bytes",
                raw.len()
            )));
        }

        let mut buf = raw;
        let version = buf.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(Error::Codec(format!("unknown envelope version {version}")));
        }

        let millis = buf.get_i64();
        let stored_at = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| Error::Codec(format!("timestamp out of range: {millis}")))?;

        let ct_len = buf.get_u16() as usize;
        if buf.remaining() < ct_len {
            return Err(Error::Codec(format!(
                "content type truncated: need {ct_len}, have {}",
                buf.remaining()
            )));
        }
        let content_type = std::str::from_utf8(&buf[..ct_len])
            .map_err(|e| Error::Codec(format!("content type is not UTF-8: {e}")))?
            .to_string();
        buf.advance(ct_len);

        Ok(Self {
            payload: Bytes::copy_from_slice(buf),
            content_type,
            stored_at,
        })
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("size", &self.size())
            .field("content_type", &self.content_type)
            .field("stored_at", &self.stored_at)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
