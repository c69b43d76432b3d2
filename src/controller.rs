//! The public `ChangeStream` surface: mode invariant, lifecycle, resume handling, and event
//! fan-out (spec.md §4.4).

use std::{
    future::poll_fn,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bson::Document;
use derive_where::derive_where;
use futures_core::{future::BoxFuture, Stream};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::{
    cursor::{extract_resume_token, Batch, ChangeStreamCursor, CursorOpener, WatchArgs},
    error::{Error, ErrorKind, Result, ResumableErrorClassifier},
    event::ResumeToken,
    options::{ChangeStreamOptions, ResumeWaitOptions, WatchTarget},
    resume::{render_change_stream_stage, ResumeState},
    topology::{wait_for_connectivity, Topology},
};

/// The consumption mode a [`ChangeStream`] has committed to. Mode is monotone: `Unset` may move to
/// either `Iterator` or `Emitter`, but never between the latter two (spec.md §3, invariant 5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Mode {
    /// Neither `next`/`has_next`/`try_next`/`Stream::poll_next` nor `into_emitter` has been called
    /// yet.
    #[display("unset")]
    Unset,
    /// Committed to pull consumption (`next`, `has_next`, `try_next`, or the `Stream` impl).
    #[display("iterator")]
    Iterator,
    /// Committed to push consumption via [`ChangeStream::into_emitter`].
    #[display("emitter")]
    Emitter,
}

/// One outcome of a single internal poll attempt against the current cursor (or buffered
/// document), used to share logic between the blocking [`ChangeStream::next`] and the
/// at-most-one-request [`ChangeStream::try_next`]/[`ChangeStream::has_next`].
enum BatchOutcome {
    Event(Document),
    EmptyBatch,
    End,
}

#[derive_where(Debug)]
enum CursorState<T> {
    Running(ChangeStreamCursor<T>),
    Resuming(#[derive_where(skip)] BoxFuture<'static, Result<ChangeStreamCursor<T>>>),
    Closed,
    /// The cursor was moved into a [`ChangeStreamEmitter`](crate::bridge::ChangeStreamEmitter) by
    /// [`ChangeStream::into_emitter`]; this shell remains only to report `ModeConflict` on further
    /// iterator calls.
    Emitted,
}

/// A resumable, ordered stream of change events scoped to a collection, database, or cluster.
///
/// `ChangeStream` is the single canonical lazy sequence the spec's dual pull/push API collapses
/// to (spec.md §9): it implements [`Stream`] directly, also exposes `next`/`has_next`/`try_next`
/// for callers that prefer request/response style, and [`ChangeStream::into_emitter`] attaches a
/// thin push adapter at most once. Resumption (spec.md §4.4) happens transparently inside every
/// one of these entry points.
#[derive_where(Debug)]
pub struct ChangeStream<T> {
    state: CursorState<T>,
    mode: Mode,
    last_token: Option<ResumeToken>,
    pending_doc: Option<Document>,
    #[derive_where(skip)]
    topology: Arc<dyn Topology>,
    #[derive_where(skip)]
    opener: Arc<dyn CursorOpener>,
    #[derive_where(skip)]
    classifier: Arc<dyn ResumableErrorClassifier>,
    resume_wait: ResumeWaitOptions,
}

impl<T> ChangeStream<T>
where
    T: DeserializeOwned,
{
    pub(crate) fn from_cursor(
        cursor: ChangeStreamCursor<T>,
        topology: Arc<dyn Topology>,
        opener: Arc<dyn CursorOpener>,
        classifier: Arc<dyn ResumableErrorClassifier>,
        resume_wait: ResumeWaitOptions,
    ) -> Self {
        let last_token = cursor.resume_state().resume_token().cloned();
        Self {
            state: CursorState::Running(cursor),
            mode: Mode::Unset,
            last_token,
            pending_doc: None,
            topology,
            opener,
            classifier,
            resume_wait,
        }
    }

    /// Returns the cached resume token that can be used to resume after the most recently
    /// returned change, even once the stream has closed.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.last_token.clone()
    }

    /// Returns whether the stream will continue to receive events (has not closed).
    pub fn is_alive(&self) -> bool {
        !matches!(self.state, CursorState::Closed | CursorState::Emitted)
    }

    /// The mode this stream has committed to.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn commit_iterator_mode(&mut self) -> Result<()> {
        match self.mode {
            Mode::Unset => {
                self.mode = Mode::Iterator;
                Ok(())
            }
            Mode::Iterator => Ok(()),
            Mode::Emitter => Err(Error::new(ErrorKind::ModeConflict {
                current: Mode::Emitter,
                attempted: Mode::Iterator,
            })),
        }
    }

    /// Retrieves the next event, blocking (suspending) until one is available or the stream
    /// closes.
    pub async fn next(&mut self) -> Result<Option<T>> {
        self.commit_iterator_mode()?;
        loop {
            match poll_fn(|cx| self.poll_event(cx)).await? {
                BatchOutcome::Event(doc) => {
                    self.pending_doc = None;
                    return Ok(Some(bson::from_document(doc)?));
                }
                BatchOutcome::EmptyBatch => continue,
                BatchOutcome::End => return Ok(None),
            }
        }
    }

    /// Makes at most one request and returns the event it produced, or `None` if the batch it
    /// returned was empty. Unlike [`ChangeStream::next`], this never loops waiting for a
    /// non-empty batch — use it when the caller wants to observe
    /// [`ChangeStream::resume_token`] promptly after every server round trip (spec.md §4.4).
    pub async fn try_next(&mut self) -> Result<Option<T>> {
        self.commit_iterator_mode()?;
        match poll_fn(|cx| self.poll_event(cx)).await? {
            BatchOutcome::Event(doc) => {
                self.pending_doc = None;
                Ok(Some(bson::from_document(doc)?))
            }
            BatchOutcome::EmptyBatch | BatchOutcome::End => Ok(None),
        }
    }

    /// Returns whether a buffered or future event is available, without consuming it — a
    /// subsequent `next`/`try_next` call returns the same event. Blocks until an event is
    /// available or the stream closes without error, in which case it returns `false`.
    pub async fn has_next(&mut self) -> Result<bool> {
        self.commit_iterator_mode()?;
        if self.pending_doc.is_some() {
            return Ok(true);
        }
        loop {
            match poll_fn(|cx| self.poll_event(cx)).await? {
                BatchOutcome::Event(_) => return Ok(true),
                BatchOutcome::EmptyBatch => continue,
                BatchOutcome::End => return Ok(false),
            }
        }
    }

    /// Closes the stream. Sets the closed flag synchronously; the underlying cursor's teardown (a
    /// `killCursors`-equivalent call) is dispatched in the background and its result ignored, per
    /// spec.md §4.4's "call close on the old cursor, ignoring errors."
    pub fn close(&mut self) {
        let old = std::mem::replace(&mut self.state, CursorState::Closed);
        if let CursorState::Running(cursor) = old {
            let fut = cursor.close();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(fut);
            }
            // Outside a runtime there is nowhere to drive the close future; it is simply dropped.
            // This can only happen if the caller drops a `ChangeStream` without ever entering an
            // async context, which is not a supported configuration.
        }
        // A `Resuming` future in flight is dropped along with its captured old cursor and
        // in-progress reopen attempt; there is nothing further to tear down.
    }

    /// Attaches a push adapter to this stream, switching it into emitter mode. May only be called
    /// once, and only before any iterator method has been called (spec.md §3, invariant 5).
    pub fn into_emitter(
        &mut self,
    ) -> Result<crate::bridge::ChangeStreamEmitter<T>>
    where
        T: Send + 'static,
    {
        match self.mode {
            Mode::Iterator => {
                return Err(Error::new(ErrorKind::ModeConflict {
                    current: Mode::Iterator,
                    attempted: Mode::Emitter,
                }))
            }
            Mode::Emitter => return Err(Error::new(ErrorKind::NoCursor)),
            Mode::Unset => {}
        }
        if matches!(self.state, CursorState::Closed) {
            return Err(Error::new(ErrorKind::NoCursor));
        }
        self.mode = Mode::Emitter;
        let extracted = ChangeStream {
            state: std::mem::replace(&mut self.state, CursorState::Emitted),
            mode: Mode::Emitter,
            last_token: self.last_token.clone(),
            pending_doc: self.pending_doc.take(),
            topology: self.topology.clone(),
            opener: self.opener.clone(),
            classifier: self.classifier.clone(),
            resume_wait: self.resume_wait,
        };
        Ok(crate::bridge::ChangeStreamEmitter::spawn(extracted))
    }

    /// The heart of spec.md §4.4: drives the cursor, intercepts resumable errors to swap in a
    /// freshly reopened cursor, and surfaces everything else. Returns as soon as a concrete batch
    /// outcome (an event, an empty batch, or exhaustion) is available from whatever cursor is
    /// current at that moment — looping internally only through `Resuming` transitions, never
    /// through more than one real batch fetch per call.
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Result<BatchOutcome>> {
        if let Some(doc) = &self.pending_doc {
            return Poll::Ready(Ok(BatchOutcome::Event(doc.clone())));
        }
        loop {
            match std::mem::replace(&mut self.state, CursorState::Closed) {
                CursorState::Closed => {
                    return Poll::Ready(Err(Error::new(ErrorKind::ClosedStream)));
                }
                CursorState::Emitted => {
                    self.state = CursorState::Emitted;
                    return Poll::Ready(Err(Error::new(ErrorKind::ModeConflict {
                        current: Mode::Emitter,
                        attempted: Mode::Iterator,
                    })));
                }
                CursorState::Resuming(mut fut) => match Pin::new(&mut fut).poll(cx) {
                    Poll::Pending => {
                        self.state = CursorState::Resuming(fut);
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(new_cursor)) => {
                        debug!(target: "change_stream::resume", "resume succeeded, resuming delivery");
                        self.last_token = new_cursor.resume_state().resume_token().cloned();
                        self.state = CursorState::Running(new_cursor);
                        continue;
                    }
                    Poll::Ready(Err(e)) => {
                        debug!(target: "change_stream::resume", error = %e, "resume failed, closing");
                        self.state = CursorState::Closed;
                        return Poll::Ready(Err(e));
                    }
                },
                CursorState::Running(mut cursor) => match cursor.poll_next_batch(cx) {
                    Poll::Pending => {
                        self.state = CursorState::Running(cursor);
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(Batch::Exhausted)) => {
                        self.state = CursorState::Closed;
                        return Poll::Ready(Ok(BatchOutcome::End));
                    }
                    Poll::Ready(Ok(Batch::EmptyBatch)) => {
                        self.last_token = cursor.resume_state().resume_token().cloned();
                        self.state = CursorState::Running(cursor);
                        return Poll::Ready(Ok(BatchOutcome::EmptyBatch));
                    }
                    Poll::Ready(Ok(Batch::Doc { doc, is_last })) => {
                        match extract_resume_token(&doc) {
                            Ok(id) => {
                                cursor.note_event_surfaced(id.clone(), is_last);
                                self.last_token = Some(id);
                                self.pending_doc = Some(doc.clone());
                                self.state = CursorState::Running(cursor);
                                debug!(target: "change_stream::event", "delivering change event");
                                return Poll::Ready(Ok(BatchOutcome::Event(doc)));
                            }
                            Err(e) => {
                                self.state = CursorState::Closed;
                                return Poll::Ready(Err(e));
                            }
                        }
                    }
                    Poll::Ready(Err(e)) => {
                        let wire_version = cursor.wire_version();
                        if self.classifier.is_resumable(&e, Some(wire_version)) {
                            debug!(target: "change_stream::resume", error = %e, "resumable error, reopening cursor");
                            let fut = begin_resume(
                                cursor,
                                self.topology.clone(),
                                self.opener.clone(),
                                self.resume_wait,
                            );
                            self.state = CursorState::Resuming(fut);
                            continue;
                        } else {
                            debug!(target: "change_stream::resume", error = %e, "not resumable, closing");
                            self.state = CursorState::Closed;
                            return Poll::Ready(Err(Error::new(ErrorKind::Unresumable {
                                message: e.to_string(),
                            })));
                        }
                    }
                },
            }
        }
    }
}

impl<T> Drop for ChangeStream<T> {
    fn drop(&mut self) {
        if self.is_alive() {
            self.close();
        }
    }
}

impl<T> Stream for ChangeStream<T>
where
    T: DeserializeOwned,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Err(e) = this.commit_iterator_mode() {
            return Poll::Ready(Some(Err(e)));
        }
        loop {
            match this.poll_event(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(BatchOutcome::Event(doc))) => {
                    this.pending_doc = None;
                    return Poll::Ready(Some(bson::from_document(doc).map_err(Error::from)));
                }
                Poll::Ready(Ok(BatchOutcome::EmptyBatch)) => continue,
                Poll::Ready(Ok(BatchOutcome::End)) => return Poll::Ready(None),
                Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
            }
        }
    }
}

/// Spec.md §4.4 step 3, in order: close the old cursor (ignoring errors), wait for topology
/// connectivity, then reopen using the old cursor's resume state. The reopen call itself is
/// constructed before the old cursor is closed (it only needs a shared reference to read
/// resume state out of it), but — being a lazily-polled future — does not actually dispatch
/// anything until awaited here, after the topology wait has succeeded.
#[instrument(skip(cursor, topology, opener))]
fn begin_resume<T>(
    cursor: ChangeStreamCursor<T>,
    topology: Arc<dyn Topology>,
    opener: Arc<dyn CursorOpener>,
    resume_wait: ResumeWaitOptions,
) -> BoxFuture<'static, Result<ChangeStreamCursor<T>>>
where
    T: DeserializeOwned + Send + 'static,
{
    Box::pin(async move {
        let reopen = cursor.reopen(opener.as_ref());
        cursor.close().await;
        wait_for_connectivity(topology.as_ref(), resume_wait).await?;
        reopen.await
    })
}

/// Builder for opening a new [`ChangeStream`], grounded on the reference driver's `Watch` action
/// type (`src/action/watch.rs`): a small value type accumulating options before the actual
/// aggregation dispatch.
#[must_use]
pub struct Watch {
    target: WatchTarget,
    extra_pipeline: Vec<Document>,
    options: ChangeStreamOptions,
    resume_wait: ResumeWaitOptions,
    classifier: Arc<dyn ResumableErrorClassifier>,
}

impl Watch {
    /// Starts building a change stream over the given target.
    pub fn new(target: WatchTarget) -> Self {
        Self {
            target,
            extra_pipeline: Vec::new(),
            options: ChangeStreamOptions::default(),
            resume_wait: ResumeWaitOptions::default(),
            classifier: Arc::new(crate::error::DefaultClassifier),
        }
    }

    /// Appends additional aggregation stages after the synthetic `$changeStream` stage.
    pub fn pipeline(mut self, stages: impl IntoIterator<Item = Document>) -> Self {
        self.extra_pipeline = stages.into_iter().collect();
        self
    }

    /// Sets the stage and cursor options (spec.md §4.2/§6).
    pub fn options(mut self, options: ChangeStreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the topology-wait poll interval and deadline (spec.md §4.5). Defaults to 500ms /
    /// 30s.
    pub fn resume_wait(mut self, options: ResumeWaitOptions) -> Self {
        self.resume_wait = options;
        self
    }

    /// Overrides the resumable-error classifier. Defaults to
    /// [`DefaultClassifier`](crate::error::DefaultClassifier).
    pub fn classifier(mut self, classifier: Arc<dyn ResumableErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Opens the change stream: validates the options, renders the initial `$changeStream` stage,
    /// and dispatches it via `opener` (spec.md §4.2, §4.3 point 2).
    ///
    /// The initial stage is rendered with an effectively unbounded wire version, so a
    /// caller-supplied `start_at_operation_time` is always sent regardless of the server's actual
    /// wire version — the §4.2 wire-version gate matters only for the anchor this crate captures
    /// automatically post-connection, which by construction cannot be set before the first cursor
    /// exists. On resume, the real captured wire version is used (see
    /// [`ChangeStreamCursor::reopen`](crate::cursor::ChangeStreamCursor)).
    pub async fn open<T>(
        self,
        topology: Arc<dyn Topology>,
        opener: Arc<dyn CursorOpener>,
    ) -> Result<ChangeStream<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.options.validate()?;
        let resume = ResumeState::from_options(
            self.options.resume_after.clone(),
            self.options.start_after.clone(),
            self.options.start_at_operation_time,
        );
        let stage = render_change_stream_stage(
            &resume,
            i32::MAX,
            self.options.full_document.as_deref(),
            self.options.full_document_before_change.as_deref(),
            self.target.all_changes_for_cluster(),
            self.options.show_expanded_events,
        );
        let wire_cursor = opener
            .open(
                stage,
                self.extra_pipeline.clone(),
                self.target.clone(),
                self.options.clone(),
            )
            .await?;
        let args = WatchArgs {
            target: self.target,
            extra_pipeline: self.extra_pipeline,
            options: self.options,
        };
        let cursor = ChangeStreamCursor::new(wire_cursor, args, resume);
        Ok(ChangeStream::from_cursor(
            cursor,
            topology,
            opener,
            self.classifier,
            self.resume_wait,
        ))
    }
}
