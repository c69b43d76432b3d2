//! User-facing configuration for opening a change stream.

use std::time::Duration;

use bson::{Bson, Document};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, ErrorKind, Result},
    event::{OperationTime, ResumeToken},
};

/// The options a caller may pass to [`ChangeStream::open`](crate::ChangeStream::open).
///
/// `resume_after`, `start_after`, and `start_at_operation_time` are mutually exclusive per
/// invariant 1 (spec.md §3); [`ChangeStreamOptions::validate`] enforces this once, at
/// construction, rather than leaving three optional fields for every downstream consumer to
/// reconcile.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct ChangeStreamOptions {
    /// Configures how [`ChangeEvent::full_document`](crate::event::ChangeEvent::full_document) is
    /// populated. Forwarded to the server untouched; never validated against a fixed enum, so
    /// future server-defined values pass through (spec.md §4.2).
    pub full_document: Option<String>,

    /// Configures how
    /// [`ChangeEvent::full_document_before_change`](crate::event::ChangeEvent::full_document_before_change)
    /// is populated. Forwarded untouched, as with `full_document`.
    pub full_document_before_change: Option<String>,

    /// Resume after the given token (exclusive with `start_after`/`start_at_operation_time`).
    #[builder(setter(strip_option))]
    pub resume_after: Option<ResumeToken>,

    /// Start after the given token, tolerating a dropped-and-recreated or renamed collection
    /// (exclusive with `resume_after`/`start_at_operation_time`, server 4.2+).
    #[builder(setter(strip_option))]
    pub start_after: Option<ResumeToken>,

    /// Start at the given server operation time (exclusive with `resume_after`/`start_after`).
    #[builder(setter(strip_option))]
    pub start_at_operation_time: Option<OperationTime>,

    /// Enables the server's expanded change event set, when supported.
    pub show_expanded_events: Option<bool>,

    /// The maximum amount of time the server should wait on new documents to satisfy a `getMore`.
    pub max_await_time: Option<Duration>,

    /// The number of documents to return per batch.
    pub batch_size: Option<u32>,

    /// An opaque collation document, passed through to the aggregate command as-is.
    pub collation: Option<Document>,

    /// An opaque read-preference document, passed through to the aggregate command as-is.
    pub read_preference: Option<Document>,

    /// Tags the aggregate and subsequent getMore commands with an arbitrary BSON value to help
    /// trace the operation through logs. Forwarded unchanged, per spec.md §6.
    pub comment: Option<Bson>,
}

impl ChangeStreamOptions {
    /// Checks invariant 1 (spec.md §3): at most one of `resume_after`, `start_after`, and
    /// `start_at_operation_time` may be set. A client-side check ahead of what the server would
    /// otherwise reject, in the same spirit as `SessionOptions::validate`'s causal-consistency/
    /// snapshot exclusivity check.
    pub fn validate(&self) -> Result<()> {
        let anchors_set = [
            self.resume_after.is_some(),
            self.start_after.is_some(),
            self.start_at_operation_time.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if anchors_set > 1 {
            return Err(Error::new(ErrorKind::InvalidArgument {
                message: "resume_after, start_after, and start_at_operation_time are mutually \
                          exclusive"
                    .to_string(),
            }));
        }
        Ok(())
    }
}

/// The scope a change stream observes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchTarget {
    /// Events for a single collection.
    Collection {
        /// The database the collection belongs to.
        db: String,
        /// The collection name.
        coll: String,
    },
    /// Events for every collection in a database.
    Database {
        /// The database name.
        db: String,
    },
    /// Events for every database in the cluster (`allChangesForCluster=true`).
    Cluster,
}

impl WatchTarget {
    /// Constructs a collection-scoped target, validating that neither name is empty (spec.md §7's
    /// `InvalidParentError`: a collection/database target this crate's type system otherwise can't
    /// reject at compile time, e.g. one assembled from caller-supplied strings).
    pub fn collection(db: impl Into<String>, coll: impl Into<String>) -> Result<Self> {
        let (db, coll) = (db.into(), coll.into());
        if db.is_empty() || coll.is_empty() {
            return Err(Error::new(ErrorKind::InvalidParent {
                message: "collection change stream target requires a non-empty db and collection \
                          name"
                    .to_string(),
            }));
        }
        Ok(Self::Collection { db, coll })
    }

    /// Constructs a database-scoped target, validating the name is non-empty.
    pub fn database(db: impl Into<String>) -> Result<Self> {
        let db = db.into();
        if db.is_empty() {
            return Err(Error::new(ErrorKind::InvalidParent {
                message: "database change stream target requires a non-empty name".to_string(),
            }));
        }
        Ok(Self::Database { db })
    }

    /// Whether this target implies `allChangesForCluster=true` in the rendered stage.
    pub fn all_changes_for_cluster(&self) -> bool {
        matches!(self, Self::Cluster)
    }
}

/// Controls the bounded polling loop used while waiting for topology recovery during a resume
/// (spec.md §4.5). The spec's own defaults (500ms / 30s) are used unless overridden; tests
/// override both to keep runtimes in the milliseconds, since there is no fail-point harness here
/// to shrink real server timing.
#[derive(Clone, Copy, Debug)]
pub struct ResumeWaitOptions {
    /// How often to poll `Topology::is_connected`.
    pub poll_interval: Duration,
    /// How long to poll before giving up with a [`TopologyTimeout`](crate::error::ErrorKind::TopologyTimeout).
    pub deadline: Duration,
}

impl Default for ResumeWaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            deadline: Duration::from_secs(30),
        }
    }
}

/// Returns whether `comment` should be sent on a command given the server's wire version, per
/// spec.md §6's note on the `listIndexes`-and-siblings gate (servers ≥ 4.4 accept it, ≤ 4.3 must
/// omit it). Kept for completeness of the wire surface the spec describes; change streams
/// themselves always send `comment` unconditionally; this function is not called from any
/// change-stream code path.
pub fn should_send_comment(wire_version: i32) -> bool {
    const WIRE_VERSION_4_4: i32 = 9;
    wire_version >= WIRE_VERSION_4_4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_conflicting_anchors() {
        let opts = ChangeStreamOptions::builder()
            .resume_after(ResumeToken::from_raw(Bson::Null))
            .start_after(ResumeToken::from_raw(Bson::Null))
            .build();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn accepts_single_anchor() {
        let opts = ChangeStreamOptions::builder()
            .resume_after(ResumeToken::from_raw(Bson::Null))
            .build();
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn collection_target_rejects_empty_names() {
        assert!(WatchTarget::collection("", "c").is_err());
        assert!(WatchTarget::collection("d", "").is_err());
        assert!(WatchTarget::collection("d", "c").is_ok());
    }

    #[test]
    fn cluster_target_implies_all_changes_for_cluster() {
        assert!(WatchTarget::Cluster.all_changes_for_cluster());
        assert!(!WatchTarget::database("d").unwrap().all_changes_for_cluster());
    }

    #[test]
    fn comment_gate_matches_wire_version_4_4() {
        assert!(!should_send_comment(8));
        assert!(should_send_comment(9));
    }
}
