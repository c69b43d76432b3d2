//! `ChangeStreamCursor`: the boundary between this crate's resumability logic and the external
//! aggregation cursor / wire protocol.

use std::{
    marker::PhantomData,
    task::{Context, Poll},
};

use bson::Document;
use derive_where::derive_where;
use futures_core::future::BoxFuture;
use serde::de::DeserializeOwned;
use tracing::{instrument, trace};

use crate::{
    error::{Error, ErrorKind, Result},
    event::ResumeToken,
    options::{ChangeStreamOptions, WatchTarget},
    resume::{render_change_stream_stage, ResumeState},
};

/// A single outcome of polling a [`WireCursor`] once.
///
/// Mirrors the reference driver's `BatchValue`: a three-way split that lets both the blocking
/// `next()` path and the at-most-one-request `try_next()` path share one poll function (spec.md
/// §4.4, `tryNext`).
#[derive(Debug)]
pub enum Batch {
    /// A document was available. `is_last` is true when this is the final document of the batch
    /// currently buffered, which [`ResumeState::advance_for_event`] needs to decide whether to
    /// prefer the post-batch resume token over the document's own `_id`.
    Doc {
        /// The raw event document, not yet deserialized into a [`ChangeEvent`](crate::event::ChangeEvent).
        doc: Document,
        /// Whether this is the last document currently buffered.
        is_last: bool,
    },
    /// A `getMore` completed but returned no documents.
    EmptyBatch,
    /// The cursor has no more batches to retrieve; the stream ends (implicit close, spec.md §4.4).
    Exhausted,
}

/// The external collaborator this crate depends on in place of a full `AbstractCursor`/`getMore`
/// loop: the wire protocol, aggregation dispatch, BSON codecs, session management, and connection
/// pooling are all out of scope (spec.md §1) and live behind this trait.
pub trait WireCursor: Send {
    /// Polls for the next batch outcome. Must not block; `getMore` dispatch happens internally and
    /// this returns `Poll::Pending` until a response arrives.
    fn poll_next_batch(&mut self, cx: &mut Context<'_>) -> Poll<Result<Batch>>;

    /// The most recent post-batch resume token the server has advertised, if any.
    fn post_batch_resume_token(&self) -> Option<ResumeToken>;

    /// The wire version of the server this cursor is talking to.
    fn wire_version(&self) -> i32;

    /// The `operationTime` from the initial aggregate response, if the server reported one.
    fn operation_time(&self) -> Option<bson::Timestamp>;

    /// Whether the cursor has been exhausted (no more `getMore`s will be issued).
    fn is_exhausted(&self) -> bool;

    /// Closes the cursor server-side. Errors are intentionally not surfaced — the caller is always
    /// discarding this cursor already (spec.md §4.4: "call close on the old cursor, ignoring
    /// errors").
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Opens a fresh [`WireCursor`] for a rendered `$changeStream` stage, standing in for aggregation
/// operation dispatch and server selection (spec.md §1: both out of scope, specified only by this
/// interface).
pub trait CursorOpener: Send + Sync {
    /// Opens a cursor whose pipeline is `stage` followed by `extra_pipeline`, against `target`,
    /// using the pass-through cursor options in `options`.
    fn open(
        &self,
        stage: Document,
        extra_pipeline: Vec<Document>,
        target: WatchTarget,
        options: ChangeStreamOptions,
    ) -> BoxFuture<'static, Result<Box<dyn WireCursor>>>;
}

/// The arguments a change stream was opened with, retained so an equivalent cursor can be opened
/// again on resume (spec.md §4.3 point 3, "clone-for-resume").
#[derive(Clone, Debug)]
pub(crate) struct WatchArgs {
    pub(crate) target: WatchTarget,
    pub(crate) extra_pipeline: Vec<Document>,
    pub(crate) options: ChangeStreamOptions,
}

/// Wraps a [`WireCursor`] with the three additions spec.md §4.3 calls for: batch interception that
/// extracts resume tokens, start-time capture from the initial aggregate response, and the ability
/// to open an equivalent replacement cursor for resumption.
#[derive_where(Debug)]
pub struct ChangeStreamCursor<T> {
    #[derive_where(skip)]
    inner: Box<dyn WireCursor>,
    args: WatchArgs,
    resume: ResumeState,
    wire_version: i32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ChangeStreamCursor<T>
where
    T: DeserializeOwned,
{
    /// Wraps a freshly opened [`WireCursor`], performing start-time capture (spec.md §4.3 point 2)
    /// immediately.
    pub(crate) fn new(inner: Box<dyn WireCursor>, args: WatchArgs, mut resume: ResumeState) -> Self {
        let wire_version = inner.wire_version();
        if let Some(time) = inner.operation_time() {
            resume.on_initial_operation_time(time, wire_version);
        }
        Self {
            inner,
            args,
            resume,
            wire_version,
            _marker: PhantomData,
        }
    }

    pub(crate) fn resume_state(&self) -> &ResumeState {
        &self.resume
    }

    /// The wire version captured when this cursor was opened.
    pub(crate) fn wire_version(&self) -> i32 {
        self.wire_version
    }

    pub(crate) fn close(self) -> BoxFuture<'static, ()> {
        self.inner.close()
    }

    /// Renders the `$changeStream` stage this cursor's current resume state would produce, for use
    /// when reopening on resume.
    fn render_stage(&self) -> Document {
        render_change_stream_stage(
            &self.resume,
            self.wire_version,
            self.args.options.full_document.as_deref(),
            self.args.options.full_document_before_change.as_deref(),
            self.args.target.all_changes_for_cluster(),
            self.args.options.show_expanded_events,
        )
    }

    /// Opens an equivalent replacement cursor via `opener`, using this cursor's current resume
    /// state to render the stage (spec.md §4.3 point 3, §4.4 step 3: "create a replacement cursor
    /// from the same controller using the old cursor's resumeOptions").
    #[instrument(skip(self, opener))]
    pub(crate) fn reopen(
        &self,
        opener: &dyn CursorOpener,
    ) -> BoxFuture<'static, Result<ChangeStreamCursor<T>>> {
        let stage = self.render_stage();
        let args = self.args.clone();
        let resume = self.resume.clone();
        let fut = opener.open(
            stage,
            args.extra_pipeline.clone(),
            args.target.clone(),
            args.options.clone(),
        );
        Box::pin(async move {
            let cursor = fut.await?;
            Ok(ChangeStreamCursor::new(cursor, args, resume))
        })
    }

    /// Polls the underlying cursor once and, on a successful result, updates resume state per
    /// invariant 3 (spec.md §3): an empty batch promotes the post-batch token immediately; a
    /// non-empty batch's resume token instead advances once the event is actually surfaced (the
    /// caller does this via [`ChangeStreamCursor::note_event_surfaced`], since the controller is
    /// the one that decides an event counts as "surfaced").
    pub(crate) fn poll_next_batch(&mut self, cx: &mut Context<'_>) -> Poll<Result<Batch>> {
        trace!(target: "change_stream::more", "polling for next batch");
        let out = self.inner.poll_next_batch(cx);
        if let Poll::Ready(Ok(batch)) = &out {
            let pb_token = self.inner.post_batch_resume_token();
            match batch {
                Batch::EmptyBatch => {
                    trace!(target: "change_stream::response", "empty batch, post_batch_token={}", pb_token.is_some());
                    self.resume.on_post_batch_token(pb_token, true);
                }
                Batch::Doc { is_last, .. } => {
                    trace!(target: "change_stream::response", is_last, post_batch_token = pb_token.is_some(), "batch document available");
                    self.resume.on_post_batch_token(pb_token, false);
                }
                Batch::Exhausted => {
                    trace!(target: "change_stream::response", "cursor exhausted");
                }
            }
        }
        out
    }

    /// Records that the document most recently returned by [`ChangeStreamCursor::poll_next_batch`]
    /// has been parsed and is about to be surfaced to the consumer, advancing the resume token per
    /// the `cacheResumeToken` preference in spec.md §4.4.
    pub(crate) fn note_event_surfaced(&mut self, id: ResumeToken, is_last_in_batch: bool) {
        self.resume.advance_for_event(id, is_last_in_batch);
    }
}

/// Parses `_id` out of a raw event document, returning [`ErrorKind::MissingResumeToken`] if it is
/// absent — a protocol violation per spec.md §4.1.
pub(crate) fn extract_resume_token(doc: &Document) -> Result<ResumeToken> {
    match doc.get("_id") {
        Some(id) => Ok(ResumeToken::from_raw(id.clone())),
        None => Err(Error::new(ErrorKind::MissingResumeToken)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::ResumeState;
    use bson::doc;
    use std::sync::{Arc, Mutex};

    struct FixedCursor {
        batches: Arc<Mutex<Vec<Result<Batch>>>>,
        pbrt: Option<ResumeToken>,
        wire_version: i32,
        operation_time: Option<bson::Timestamp>,
        exhausted: bool,
    }

    impl WireCursor for FixedCursor {
        fn poll_next_batch(&mut self, _cx: &mut Context<'_>) -> Poll<Result<Batch>> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Poll::Ready(Ok(Batch::Exhausted))
            } else {
                Poll::Ready(batches.remove(0))
            }
        }

        fn post_batch_resume_token(&self) -> Option<ResumeToken> {
            self.pbrt.clone()
        }

        fn wire_version(&self) -> i32 {
            self.wire_version
        }

        fn operation_time(&self) -> Option<bson::Timestamp> {
            self.operation_time
        }

        fn is_exhausted(&self) -> bool {
            self.exhausted
        }

        fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    fn noop_waker_cx() -> Context<'static> {
        use std::task::{RawWaker, RawWakerVTable, Waker};
        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        let waker = unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) };
        Context::from_waker(Box::leak(Box::new(waker)))
    }

    #[test]
    fn empty_batch_promotes_post_batch_token() {
        let inner = FixedCursor {
            batches: Arc::new(Mutex::new(vec![Ok(Batch::EmptyBatch)])),
            pbrt: Some(ResumeToken::from_raw(bson::Bson::String("pbrt".into()))),
            wire_version: 17,
            operation_time: None,
            exhausted: false,
        };
        let args = WatchArgs {
            target: WatchTarget::database("d").unwrap(),
            extra_pipeline: vec![],
            options: ChangeStreamOptions::default(),
        };
        let mut cursor: ChangeStreamCursor<Document> =
            ChangeStreamCursor::new(Box::new(inner), args, ResumeState::from_options(None, None, None));
        let mut cx = noop_waker_cx();
        let poll = cursor.poll_next_batch(&mut cx);
        assert!(matches!(poll, Poll::Ready(Ok(Batch::EmptyBatch))));
        assert_eq!(
            cursor.resume_state().resume_token().unwrap().as_bson(),
            &bson::Bson::String("pbrt".into())
        );
    }

    #[test]
    fn missing_id_is_rejected() {
        let doc = doc! { "operationType": "insert" };
        assert!(extract_resume_token(&doc).is_err());
    }

    #[test]
    fn start_time_captured_on_construction_without_user_anchor() {
        let inner = FixedCursor {
            batches: Arc::new(Mutex::new(vec![])),
            pbrt: None,
            wire_version: 8,
            operation_time: Some(bson::Timestamp { time: 9, increment: 0 }),
            exhausted: false,
        };
        let args = WatchArgs {
            target: WatchTarget::database("d").unwrap(),
            extra_pipeline: vec![],
            options: ChangeStreamOptions::default(),
        };
        let cursor: ChangeStreamCursor<Document> =
            ChangeStreamCursor::new(Box::new(inner), args, ResumeState::from_options(None, None, None));
        let stage = cursor.render_stage();
        let inner_stage = stage.get_document("$changeStream").unwrap();
        assert!(inner_stage.contains_key("startAtOperationTime"));
    }
}
