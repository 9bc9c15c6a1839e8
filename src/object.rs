//! `BusinessObject` and the JSON+NUL wire codec (§3, §4.1).

use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time;

use crate::{Error, MAX_METADATA_BYTES, METADATA_IDLE_TIMEOUT, METADATA_TOTAL_TIMEOUT};

/// A parsed `type/subtype[; charset=...]` media type (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub main: String,
    pub subtype: String,
    pub charset: Option<String>,
}

impl ContentType {
    /// Parses `type/subtype` with an optional `; charset=...` suffix.
    /// A malformed string yields `None` (§4.1): "no content_type" rather
    /// than an error, matching the original's regex-miss behavior.
    pub fn parse(s: &str) -> Option<Self> {
        let (type_part, charset) = match s.split_once(';') {
            Some((t, rest)) => {
                let charset = rest
                    .trim()
                    .strip_prefix("charset=")
                    .map(|c| c.trim().to_owned());
                (t.trim(), charset)
            }
            None => (s.trim(), None),
        };
        let (main, subtype) = type_part.split_once('/')?;
        if main.is_empty() || subtype.is_empty() {
            return None;
        }
        Some(ContentType {
            main: main.to_owned(),
            subtype: subtype.to_owned(),
            charset,
        })
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.main, self.subtype)?;
        if let Some(charset) = &self.charset {
            write!(f, "; charset={}", charset)?;
        }
        Ok(())
    }
}

/// The unit of communication: JSON metadata plus an opaque payload (§3).
#[derive(Debug, Clone)]
pub struct BusinessObject {
    pub metadata: Map<String, Value>,
    pub payload: Vec<u8>,
    pub id: String,
    pub size: usize,
    pub content_type: Option<ContentType>,
    pub event: Option<String>,
}

impl BusinessObject {
    /// Builds an object from metadata and payload, filling in `id`
    /// (generated if absent) and `size` from the payload length, and
    /// parsing `type`/`event` out of the metadata (§3 invariants).
    pub fn new(mut metadata: Map<String, Value>, payload: Vec<u8>) -> Self {
        let id = match metadata.get("id").and_then(Value::as_str) {
            Some(id) => id.to_owned(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        metadata.insert("id".to_owned(), Value::String(id.clone()));

        let size = payload.len();
        metadata.insert("size".to_owned(), Value::from(size));

        let content_type = metadata
            .get("type")
            .and_then(Value::as_str)
            .and_then(ContentType::parse);

        let event = metadata
            .get("event")
            .and_then(Value::as_str)
            .map(str::to_owned);

        BusinessObject {
            metadata,
            payload,
            id,
            size,
            content_type,
            event,
        }
    }

    /// Convenience constructor for metadata-only objects (replies,
    /// notifications, announcements) that never carry a payload.
    pub fn event_only(event: &str, fields: Vec<(&str, Value)>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("event".to_owned(), Value::String(event.to_owned()));
        for (k, v) in fields {
            metadata.insert(k.to_owned(), v);
        }
        BusinessObject::new(metadata, Vec::new())
    }

    pub fn of_content_type(&self, main: &str) -> bool {
        self.content_type
            .as_ref()
            .map(|ct| ct.main == main)
            .unwrap_or(false)
    }

    /// `metadata["route"]` as a vector, empty if absent (§3 route vector).
    pub fn route(&self) -> Vec<String> {
        self.metadata
            .get("route")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
            .unwrap_or_default()
    }

    pub fn set_route(&mut self, route: Vec<String>) {
        self.metadata.insert(
            "route".to_owned(),
            Value::Array(route.into_iter().map(Value::String).collect()),
        );
    }

    /// `metadata["routing-ids"]`, tolerating a (rejected, logged) scalar
    /// in place of the expected list (§4.5 `extra_routing_ids`).
    pub fn routing_ids_field(&self) -> Vec<String> {
        match self.metadata.get("routing-ids") {
            Some(Value::Array(list)) => list
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            Some(other) => {
                log::error!("got {other} as routing-ids, expected a list");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Serializes to the wire form: `<json-metadata><NUL><payload>`.
    /// `type` and `event` in `metadata` are kept in sync with
    /// `content_type`/`event` before encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut metadata = self.metadata.clone();
        metadata.insert("id".to_owned(), Value::String(self.id.clone()));
        metadata.insert("size".to_owned(), Value::from(self.size));
        if let Some(ct) = &self.content_type {
            metadata.insert("type".to_owned(), Value::String(ct.to_string()));
        }
        let json = Value::Object(metadata).to_string();
        let mut buf = Vec::with_capacity(json.len() + 1 + self.payload.len());
        buf.extend_from_slice(json.as_bytes());
        buf.push(0x00);
        if self.size > 0 {
            buf.extend_from_slice(&self.payload);
        }
        buf
    }

    /// Writes the encoded frame to `writer`, looping until every byte is
    /// sent (a zero-length write is treated as a broken connection, per
    /// the original's `_to_socket`).
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), Error>
    where
        W: AsyncWriteExt + Unpin,
    {
        let buf = self.encode();
        let mut sent = 0;
        while sent < buf.len() {
            let n = writer.write(&buf[sent..]).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "socket connection broken",
                )));
            }
            sent += n;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Reads one frame from `reader`: metadata up to a NUL terminator,
    /// then exactly `size` payload bytes if `size > 0` (§4.1).
    ///
    /// Enforces the 2048-byte metadata cap, the 5s idle timeout and the
    /// 120s total timeout; any violation (and any JSON parse failure)
    /// yields `Error::Decode`, which callers must treat as fatal to the
    /// session (§7).
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, Error>
    where
        R: AsyncReadExt + Unpin,
    {
        let deadline = time::Instant::now() + METADATA_TOTAL_TIMEOUT;
        let mut metadata_buf = Vec::new();
        loop {
            if metadata_buf.len() > MAX_METADATA_BYTES {
                return Err(Error::decode("metadata exceeds maximum size"));
            }
            if time::Instant::now() >= deadline {
                return Err(Error::decode("timed out reading metadata"));
            }
            let mut byte = [0u8; 1];
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            let wait = remaining.min(METADATA_IDLE_TIMEOUT);
            let n = time::timeout(wait, reader.read(&mut byte)).await??;
            if n == 0 {
                return Err(Error::decode("connection closed while reading metadata"));
            }
            if byte[0] == 0x00 {
                break;
            }
            metadata_buf.push(byte[0]);
        }

        let metadata_str = std::str::from_utf8(&metadata_buf)
            .map_err(|e| Error::decode(format!("invalid utf-8 in metadata: {e}")))?;
        let value: Value = serde_json::from_str(metadata_str)
            .map_err(|e| Error::decode(format!("invalid json metadata: {e}")))?;
        let metadata = value
            .as_object()
            .ok_or_else(|| Error::decode("metadata is not a json object"))?
            .clone();

        let declared_size = metadata.get("size").and_then(Value::as_u64).unwrap_or(0) as usize;
        let mut payload = Vec::new();
        if declared_size > 0 {
            payload.resize(declared_size, 0);
            let mut read = 0;
            while read < declared_size {
                if time::Instant::now() >= deadline {
                    return Err(Error::decode("timed out reading payload"));
                }
                let remaining = deadline.saturating_duration_since(time::Instant::now());
                let wait = remaining.min(METADATA_IDLE_TIMEOUT);
                let n = time::timeout(wait, reader.read(&mut payload[read..])).await??;
                if n == 0 {
                    return Err(Error::decode("connection closed while reading payload"));
                }
                read += n;
            }
        }

        Ok(BusinessObject::new(metadata, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_parses_charset() {
        let ct = ContentType::parse("text/plain; charset=UTF-8").unwrap();
        assert_eq!(ct.main, "text");
        assert_eq!(ct.subtype, "plain");
        assert_eq!(ct.charset.as_deref(), Some("UTF-8"));
    }

    #[test]
    fn content_type_without_charset() {
        let ct = ContentType::parse("application/json").unwrap();
        assert_eq!(ct.main, "application");
        assert_eq!(ct.subtype, "json");
        assert!(ct.charset.is_none());
    }

    #[test]
    fn content_type_malformed_is_none() {
        assert!(ContentType::parse("not-a-type").is_none());
        assert!(ContentType::parse("/missing-main").is_none());
    }

    #[test]
    fn new_generates_id_when_absent() {
        let obj = BusinessObject::new(Map::new(), Vec::new());
        assert!(!obj.id.is_empty());
        assert_eq!(obj.size, 0);
    }

    #[test]
    fn new_keeps_caller_supplied_id() {
        let mut meta = Map::new();
        meta.insert("id".to_owned(), Value::String("M1".to_owned()));
        let obj = BusinessObject::new(meta, Vec::new());
        assert_eq!(obj.id, "M1");
    }

    #[tokio::test]
    async fn encode_decode_round_trip() {
        let mut meta = Map::new();
        meta.insert("type".to_owned(), Value::String("text/plain".to_owned()));
        meta.insert("event".to_owned(), Value::String("greeting".to_owned()));
        let obj = BusinessObject::new(meta, b"hello".to_vec());
        let encoded = obj.encode();

        let mut cursor = std::io::Cursor::new(encoded);
        let decoded = BusinessObject::read_from(&mut cursor).await.unwrap();

        assert_eq!(decoded.id, obj.id);
        assert_eq!(decoded.size, 5);
        assert_eq!(decoded.payload, b"hello");
        assert_eq!(decoded.event.as_deref(), Some("greeting"));
        assert!(decoded.of_content_type("text"));
    }

    #[tokio::test]
    async fn decode_rejects_oversize_metadata() {
        let mut json = String::from("{\"filler\":\"");
        json.push_str(&"x".repeat(MAX_METADATA_BYTES + 100));
        json.push_str("\"}");
        let mut buf = json.into_bytes();
        buf.push(0x00);
        let mut cursor = std::io::Cursor::new(buf);
        let err = BusinessObject::read_from(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Decode);
    }

    #[tokio::test]
    async fn decode_rejects_invalid_json() {
        let mut buf = b"not json".to_vec();
        buf.push(0x00);
        let mut cursor = std::io::Cursor::new(buf);
        let err = BusinessObject::read_from(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Decode);
    }

    #[tokio::test]
    async fn decode_with_no_payload() {
        let mut buf = b"{}".to_vec();
        buf.push(0x00);
        let mut cursor = std::io::Cursor::new(buf);
        let obj = BusinessObject::read_from(&mut cursor).await.unwrap();
        assert_eq!(obj.size, 0);
        assert!(obj.payload.is_empty());
    }
}
