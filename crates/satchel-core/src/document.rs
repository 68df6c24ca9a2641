use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SatchelError};
use crate::revision::{Revision, Seq};

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// Transfer encoding of an attachment body as stored and shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Plain,
    Gzip,
}

impl Encoding {
    pub fn from_i64(v: i64) -> Encoding {
        if v == 1 { Encoding::Gzip } else { Encoding::Plain }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Encoding::Plain => 0,
            Encoding::Gzip => 1,
        }
    }
}

/// Metadata for one named attachment of a revision.
///
/// `digest` is the hex SHA-1 of the plain bytes and doubles as the blob
/// store key. `revpos` is the generation that introduced this content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    pub digest: String,
    pub length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_length: Option<u64>,
    pub revpos: u64,
    #[serde(default, skip_serializing_if = "is_plain")]
    pub encoding: Encoding,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stub: bool,
    /// Inline body, base64 on the wire. Absent for stubs and multipart
    /// (`follows`) transfers.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub follows: bool,
}

fn is_plain(e: &Encoding) -> bool {
    *e == Encoding::Plain
}

/// Base64 codec for the optional inline attachment body.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(d)?;
        opt.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// DocumentRevision
// ---------------------------------------------------------------------------

/// One stored revision of a document.
///
/// `body` holds only user fields; `_id`, `_rev`, `_deleted` and
/// `_attachments` are metadata and live in the struct itself.
#[derive(Debug, Clone)]
pub struct DocumentRevision {
    pub doc_id: String,
    pub rev: Revision,
    pub sequence: u64,
    pub deleted: bool,
    /// True for revisions that are leaves of the revision tree.
    pub current: bool,
    /// False for history stubs spliced in by replication; their bodies are
    /// not stored locally.
    pub available: bool,
    pub body: serde_json::Value,
    pub attachments: HashMap<String, Attachment>,
}

impl DocumentRevision {
    /// Render with the underscore metadata fields, the shape both the wire
    /// protocol and callers see.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = match &self.body {
            serde_json::Value::Object(m) => m.clone(),
            _ => serde_json::Map::new(),
        };

        obj.insert(
            "_id".into(),
            serde_json::Value::String(self.doc_id.clone()),
        );
        obj.insert(
            "_rev".into(),
            serde_json::Value::String(self.rev.to_string()),
        );
        if self.deleted {
            obj.insert("_deleted".into(), serde_json::Value::Bool(true));
        }
        if !self.attachments.is_empty() {
            if let Ok(atts) = serde_json::to_value(&self.attachments) {
                obj.insert("_attachments".into(), atts);
            }
        }

        serde_json::Value::Object(obj)
    }

    /// Strip underscore metadata out of a JSON object, returning
    /// `(body, rev, deleted, attachments)`.
    pub fn split_json(
        mut value: serde_json::Value,
    ) -> Result<(
        serde_json::Value,
        Option<Revision>,
        bool,
        HashMap<String, Attachment>,
    )> {
        let obj = value
            .as_object_mut()
            .ok_or_else(|| SatchelError::BadRequest("document must be a JSON object".into()))?;

        obj.remove("_id");
        let rev = obj
            .remove("_rev")
            .and_then(|v| v.as_str().map(String::from))
            .map(|s| s.parse::<Revision>())
            .transpose()?;
        let deleted = obj
            .remove("_deleted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let attachments: HashMap<String, Attachment> = obj
            .remove("_attachments")
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        obj.remove("_revisions");

        Ok((value, rev, deleted, attachments))
    }
}

// ---------------------------------------------------------------------------
// Revision history (`_revisions`)
// ---------------------------------------------------------------------------

/// The `_revisions` member of a replicated document: hash suffixes ordered
/// newest first, starting at generation `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Build from a root-first ancestor path.
    pub fn from_path(path: &[Revision]) -> Self {
        let start = path.last().map(|r| r.pos).unwrap_or(0);
        let ids = path.iter().rev().map(|r| r.hash.clone()).collect();
        RevisionHistory { start, ids }
    }

    /// Expand back into full revision ids, oldest first.
    pub fn to_revisions(&self) -> Vec<Revision> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, hash)| Revision::new(self.start - i as u64, hash.clone()))
            .rev()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Changes types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: Revision,
}

/// One entry of a change feed: the document at the sequence where it last
/// changed, with its leaf revisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: Seq,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesPage {
    pub results: Vec<ChangeEvent>,
    pub last_seq: Seq,
}

// ---------------------------------------------------------------------------
// Protocol response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    pub missing: Vec<Revision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<Revision>,
}

/// Per-document outcome of a `bulk_docs` write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocResult {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default)]
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One revision branch returned by `open_revs`, with its ancestor path and
/// any attachment bodies that travelled with it.
#[derive(Debug, Clone)]
pub struct FetchedRevision {
    pub doc_id: String,
    pub rev: Revision,
    pub deleted: bool,
    pub body: serde_json::Value,
    /// Full ancestor path, oldest first, ending at `rev`.
    pub history: Vec<Revision>,
    pub attachments: HashMap<String, Attachment>,
    /// Attachment bodies keyed by digest, from multipart parts or decoded
    /// inline base64.
    pub attachment_bodies: HashMap<String, Vec<u8>>,
}

impl FetchedRevision {
    /// Parse an `open_revs` document: a JSON doc with `_revisions`.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let doc_id = value
            .get("_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SatchelError::Protocol("open_revs doc missing _id".into()))?
            .to_string();
        let rev: Revision = value
            .get("_rev")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SatchelError::Protocol("open_revs doc missing _rev".into()))?
            .parse()?;
        let history = match value.get("_revisions") {
            Some(revisions) => {
                let history: RevisionHistory = serde_json::from_value(revisions.clone())?;
                history.to_revisions()
            }
            None => vec![rev.clone()],
        };
        if history.last() != Some(&rev) {
            return Err(SatchelError::Protocol(format!(
                "_revisions does not end at {rev}"
            )));
        }

        let (body, _, deleted, mut attachments) = DocumentRevision::split_json(value)?;
        let mut attachment_bodies = HashMap::new();
        for att in attachments.values_mut() {
            if let Some(data) = att.data.take() {
                attachment_bodies.insert(att.digest.clone(), data);
            }
        }

        Ok(FetchedRevision {
            doc_id,
            rev,
            deleted,
            body,
            history,
            attachments,
            attachment_bodies,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_to_json_has_metadata() {
        let doc = DocumentRevision {
            doc_id: "doc1".into(),
            rev: Revision::new(1, "abc"),
            sequence: 1,
            deleted: false,
            current: true,
            available: true,
            body: serde_json::json!({"name": "Alice"}),
            attachments: HashMap::new(),
        };

        let json = doc.to_json();
        assert_eq!(json["_id"], "doc1");
        assert_eq!(json["_rev"], "1-abc");
        assert_eq!(json["name"], "Alice");
        assert!(json.get("_deleted").is_none());
    }

    #[test]
    fn split_json_strips_metadata() {
        let value = serde_json::json!({
            "_id": "d",
            "_rev": "2-ff",
            "_deleted": true,
            "v": 9
        });
        let (body, rev, deleted, atts) = DocumentRevision::split_json(value).unwrap();
        assert_eq!(body, serde_json::json!({"v": 9}));
        assert_eq!(rev.unwrap().to_string(), "2-ff");
        assert!(deleted);
        assert!(atts.is_empty());
    }

    #[test]
    fn revision_history_round_trip() {
        let path = vec![
            Revision::new(1, "a"),
            Revision::new(2, "b"),
            Revision::new(3, "c"),
        ];
        let history = RevisionHistory::from_path(&path);
        assert_eq!(history.start, 3);
        assert_eq!(history.ids, vec!["c", "b", "a"]);
        assert_eq!(history.to_revisions(), path);
    }

    #[test]
    fn attachment_inline_data_is_base64() {
        let att = Attachment {
            content_type: "text/plain".into(),
            digest: "deadbeef".into(),
            length: 5,
            encoded_length: None,
            revpos: 1,
            encoding: Encoding::Plain,
            stub: false,
            data: Some(b"hello".to_vec()),
            follows: false,
        };
        let json = serde_json::to_value(&att).unwrap();
        assert_eq!(json["data"], "aGVsbG8=");

        let back: Attachment = serde_json::from_value(json).unwrap();
        assert_eq!(back.data.unwrap(), b"hello");
    }

    #[test]
    fn fetched_revision_from_open_revs_json() {
        let value = serde_json::json!({
            "_id": "doc1",
            "_rev": "3-ccc",
            "_revisions": {"start": 3, "ids": ["ccc", "bbb", "aaa"]},
            "v": 3
        });
        let fetched = FetchedRevision::from_json(value).unwrap();
        assert_eq!(fetched.doc_id, "doc1");
        assert_eq!(fetched.rev.to_string(), "3-ccc");
        assert_eq!(fetched.history.len(), 3);
        assert_eq!(fetched.history[0].to_string(), "1-aaa");
        assert_eq!(fetched.body, serde_json::json!({"v": 3}));
    }

    #[test]
    fn fetched_revision_rejects_mismatched_history() {
        let value = serde_json::json!({
            "_id": "doc1",
            "_rev": "3-ccc",
            "_revisions": {"start": 2, "ids": ["bbb", "aaa"]},
        });
        assert!(FetchedRevision::from_json(value).is_err());
    }
}
