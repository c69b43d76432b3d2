//! The change event type and its constituent pieces.

use bson::{Bson, Document, Timestamp};
use serde::{Deserialize, Serialize};

/// An opaque token used for resuming an interrupted
/// [`ChangeStream`](crate::ChangeStream).
///
/// When starting a new change stream, [`resume_after`](crate::options::ChangeStreamOptions::resume_after)
/// and [`start_after`](crate::options::ChangeStreamOptions::start_after) can be set to an instance
/// of `ResumeToken` retrieved from [`ChangeStream::resume_token`](crate::ChangeStream::resume_token)
/// or from a prior event's [`id`](ChangeEvent::id) field.
///
/// Equality and ordering over resume tokens are not meaningful to the client: the token is only
/// ever stored and replayed back to the server.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResumeToken(pub(crate) Bson);

impl ResumeToken {
    /// Wraps a raw BSON value as a resume token. Intended for advanced use (e.g. reconstructing a
    /// token persisted by the caller across process restarts); prefer values obtained from
    /// [`ChangeStream::resume_token`](crate::ChangeStream::resume_token) where possible.
    pub fn from_raw(value: Bson) -> Self {
        Self(value)
    }

    /// Returns the underlying BSON value.
    pub fn as_bson(&self) -> &Bson {
        &self.0
    }

    pub(crate) fn into_bson(self) -> Bson {
        self.0
    }
}

/// A server timestamp consisting of seconds-since-epoch and an ordinal within that second. Only
/// meaningful to the client as the anchor for `startAtOperationTime`, and only when no resume
/// token has yet been observed.
pub type OperationTime = Timestamp;

/// Identifies which collection or database a change occurred in.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ChangeStreamEventSource {
    /// A database and collection pair, present for collection-level events.
    Namespace(Namespace),

    /// A database name alone, present for `dropDatabase` events.
    Database {
        /// The database name.
        db: String,
    },
}

/// A database/collection pair.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Namespace {
    /// The database name.
    pub db: String,

    /// The collection name.
    pub coll: String,
}

impl Namespace {
    /// Constructs a namespace from a database and collection name.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

/// Describes which fields were updated or removed in an `update` event.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateDescription {
    /// Field name/new-value pairs for fields that were changed or added.
    pub updated_fields: Document,

    /// Names of the fields that were removed.
    #[serde(default)]
    pub removed_fields: Vec<String>,

    /// Information about arrays that were truncated rather than fully replayed, when the server
    /// supports pre/post-image truncation reporting.
    pub truncated_arrays: Option<Vec<Document>>,
}

/// The kind of operation a [`ChangeEvent`] describes.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted.
    Insert,
    /// A document was updated.
    Update,
    /// A document was replaced wholesale.
    Replace,
    /// A document was deleted.
    Delete,
    /// A collection was dropped.
    Drop,
    /// A collection was renamed.
    Rename,
    /// A database was dropped.
    DropDatabase,
    /// The stream can no longer continue and must be closed (e.g. its watched collection was
    /// dropped).
    Invalidate,
}

/// A single change notification delivered by a change stream.
///
/// Consumers must match on [`operation_type`](ChangeEvent::operation_type) before relying on any
/// operation-specific field; fields that don't apply to the observed operation are `None`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeEvent<T = Document> {
    /// An opaque token for use when resuming an interrupted change stream.
    #[serde(rename = "_id")]
    pub id: ResumeToken,

    /// The kind of operation this event describes.
    pub operation_type: OperationType,

    /// The timestamp of the oplog entry associated with this event. Present on all event kinds
    /// except ones the server synthesizes locally.
    pub cluster_time: Option<Timestamp>,

    /// The transaction number, present only for events that occurred inside a multi-document
    /// transaction.
    pub txn_number: Option<i64>,

    /// The logical session id of the session the triggering operation ran under, present only
    /// alongside `txn_number`.
    pub lsid: Option<Document>,

    /// The namespace the change occurred in. Absent only for `invalidate` events.
    pub ns: Option<ChangeStreamEventSource>,

    /// The namespace the collection was renamed to. Only present for `rename` events.
    pub to: Option<Namespace>,

    /// Identifies the document that changed. For unsharded collections this is just `{_id}`; for
    /// sharded collections it additionally contains the shard key components. Present for
    /// `insert`, `update`, `replace`, and `delete` events.
    pub document_key: Option<Document>,

    /// A description of which fields were updated or removed. Always present for `update` events.
    pub update_description: Option<UpdateDescription>,

    /// The document as it looks after the change was applied. Always present for `insert` and
    /// `replace`; present for `update` only when full-document lookup is enabled.
    pub full_document: Option<T>,

    /// The document as it looked before the change was applied, when pre-images are enabled.
    pub full_document_before_change: Option<T>,
}

impl<T> ChangeEvent<T> {
    /// Returns the namespace of the collection this event concerns, if any.
    pub fn namespace(&self) -> Option<&Namespace> {
        match &self.ns {
            Some(ChangeStreamEventSource::Namespace(ns)) => Some(ns),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn deserializes_insert_event() {
        let raw = doc! {
            "_id": { "token": "abc" },
            "operationType": "insert",
            "clusterTime": Timestamp { time: 1, increment: 2 },
            "ns": { "db": "d", "coll": "c" },
            "documentKey": { "_id": 3 },
            "fullDocument": { "_id": 3, "x": 1 },
        };
        let event: ChangeEvent = bson::from_document(raw).unwrap();
        assert_eq!(event.operation_type, OperationType::Insert);
        assert_eq!(event.namespace().unwrap().coll, "c");
        assert_eq!(event.document_key.unwrap().get_i32("_id").unwrap(), 3);
    }

    #[test]
    fn deserializes_drop_event() {
        let raw = doc! {
            "_id": { "token": "abc" },
            "operationType": "drop",
            "ns": { "db": "d", "coll": "c" },
        };
        let event: ChangeEvent = bson::from_document(raw).unwrap();
        assert_eq!(event.operation_type, OperationType::Drop);
        assert_eq!(event.namespace().unwrap().coll, "c");
    }

    #[test]
    fn deserializes_transactional_insert_event() {
        let raw = doc! {
            "_id": { "token": "abc" },
            "operationType": "insert",
            "ns": { "db": "d", "coll": "c" },
            "documentKey": { "_id": 3 },
            "fullDocument": { "_id": 3, "x": 1 },
            "txnNumber": 7i64,
            "lsid": { "id": { "$binary": { "base64": "AAAAAAAAAAAAAAAAAAAAAA==", "subType": "04" } } },
        };
        let event: ChangeEvent = bson::from_document(raw).unwrap();
        assert_eq!(event.operation_type, OperationType::Insert);
        assert_eq!(event.txn_number, Some(7));
        assert!(event.lsid.is_some());
        assert_eq!(event.document_key.unwrap().get_i32("_id").unwrap(), 3);
        assert!(event.full_document.is_some());
    }

    #[test]
    fn deserializes_rename_event() {
        let raw = doc! {
            "_id": { "token": "abc" },
            "operationType": "rename",
            "ns": { "db": "d", "coll": "old" },
            "to": { "db": "d", "coll": "new" },
        };
        let event: ChangeEvent = bson::from_document(raw).unwrap();
        assert_eq!(event.operation_type, OperationType::Rename);
        assert_eq!(event.to.unwrap().coll, "new");
    }

    #[test]
    fn deserializes_drop_database_event() {
        let raw = doc! {
            "_id": { "token": "abc" },
            "operationType": "dropDatabase",
            "ns": { "db": "d" },
        };
        let event: ChangeEvent = bson::from_document(raw).unwrap();
        assert_eq!(event.operation_type, OperationType::DropDatabase);
        assert!(matches!(
            event.ns,
            Some(ChangeStreamEventSource::Database { .. })
        ));
    }

    #[test]
    fn deserializes_invalidate_event_without_ns() {
        let raw = doc! {
            "_id": { "token": "abc" },
            "operationType": "invalidate",
        };
        let event: ChangeEvent = bson::from_document(raw).unwrap();
        assert_eq!(event.operation_type, OperationType::Invalidate);
        assert!(event.ns.is_none());
        assert!(event.namespace().is_none());
    }
}
