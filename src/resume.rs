//! Per-stream resume state and `$changeStream` stage rendering.

use bson::{doc, Bson, Document};

use crate::event::{OperationTime, ResumeToken};

/// The minimum wire version a server must advertise for `startAtOperationTime` to be usable
/// ([spec.md §3, invariant discussion in §4.2]).
pub const MIN_WIRE_VERSION_FOR_START_AT_OPERATION_TIME: i32 = 7;

/// The anchor a caller supplied when constructing a change stream, before any events have been
/// observed. At most one of these may be set; [`ChangeStreamOptions`](crate::options::ChangeStreamOptions)
/// enforces this at construction.
#[derive(Clone, Debug, Default)]
pub(crate) enum UserAnchor {
    #[default]
    None,
    ResumeAfter(ResumeToken),
    StartAfter(ResumeToken),
    StartAtOperationTime(OperationTime),
}

/// Per-stream record of resume state: the last cached token, the most recent post-batch token,
/// the user's original anchor, and whether any event has ever been surfaced.
///
/// Invariant 1 (spec.md §3): exactly one of `resume_after`/`start_after`/`start_at_operation_time`
/// is ever rendered into a stage; this type's own fields never hold more than one anchor
/// simultaneously by construction — see [`ResumeState::render_stage`].
#[derive(Clone, Debug, Default)]
pub struct ResumeState {
    /// The user-supplied anchor this stream was originally constructed with. Needed even after a
    /// token has been cached, because `startAfter` semantics apply only until the first event is
    /// received (invariant 5 in spec.md §8).
    user_anchor: UserAnchor,

    /// Last cached resume token, from an event's `_id` or a post-batch resume token.
    resume_token: Option<ResumeToken>,

    /// Most recent post-batch resume token advertised by the server, independent of whether it has
    /// been promoted into `resume_token` yet.
    post_batch_resume_token: Option<ResumeToken>,

    /// Set once from the initial aggregate response's `operationTime`, if the user supplied no
    /// anchor and the server's wire version supports it. Cleared the moment any event is
    /// delivered (spec.md §4.4: "clear options.startAtOperationTime to prevent future resume-stage
    /// conflict").
    start_at_operation_time: Option<OperationTime>,

    /// Whether any event has ever been surfaced to a consumer.
    has_received: bool,
}

impl ResumeState {
    /// Constructs the initial resume state from the options a caller supplied when opening the
    /// stream for the first time.
    pub fn from_options(
        resume_after: Option<ResumeToken>,
        start_after: Option<ResumeToken>,
        start_at_operation_time: Option<OperationTime>,
    ) -> Self {
        let user_anchor = match (resume_after, start_after, start_at_operation_time) {
            (Some(t), None, None) => UserAnchor::ResumeAfter(t),
            (None, Some(t), None) => UserAnchor::StartAfter(t),
            (None, None, Some(ts)) => UserAnchor::StartAtOperationTime(ts),
            (None, None, None) => UserAnchor::None,
            // ChangeStreamOptions validates mutual exclusivity before this is ever reached; any
            // other combination indicates a bug in that validation.
            _ => unreachable!("ChangeStreamOptions must enforce anchor exclusivity"),
        };
        let resume_token = match &user_anchor {
            UserAnchor::ResumeAfter(t) | UserAnchor::StartAfter(t) => Some(t.clone()),
            _ => None,
        };
        let start_at_operation_time = match &user_anchor {
            UserAnchor::StartAtOperationTime(ts) => Some(*ts),
            _ => None,
        };
        Self {
            user_anchor,
            resume_token,
            post_batch_resume_token: None,
            start_at_operation_time,
            has_received: false,
        }
    }

    /// Whether any event has ever been surfaced.
    pub fn has_received(&self) -> bool {
        self.has_received
    }

    /// The cached resume token, if any.
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume_token.as_ref()
    }

    /// The most recent post-batch resume token, if any.
    pub fn post_batch_resume_token(&self) -> Option<&ResumeToken> {
        self.post_batch_resume_token.as_ref()
    }

    /// Records a post-batch resume token from a batch response. Per invariant 3 (spec.md §3), if
    /// the batch this token accompanied was empty, the resume token advances to it immediately;
    /// non-empty batches instead advance `resume_token` via [`ResumeState::on_event`] once each
    /// event's own `_id` is known.
    pub fn on_post_batch_token(&mut self, token: Option<ResumeToken>, batch_was_empty: bool) {
        if let Some(token) = token {
            if batch_was_empty {
                self.resume_token = Some(token.clone());
            }
            self.post_batch_resume_token = Some(token);
        }
    }

    /// Records the `operationTime` from the initial aggregate response, per §4.3 point 2. A no-op
    /// once any event has been delivered, or if the user supplied their own anchor.
    pub fn on_initial_operation_time(&mut self, time: OperationTime, wire_version: i32) {
        if self.has_received || self.resume_token.is_some() {
            return;
        }
        if !matches!(self.user_anchor, UserAnchor::None) {
            return;
        }
        if wire_version >= MIN_WIRE_VERSION_FOR_START_AT_OPERATION_TIME {
            self.start_at_operation_time = Some(time);
        }
    }

    /// Advances resume state after a single event has been surfaced to the consumer: caches its
    /// `_id` as the resume token (unless a post-batch token for the batch's last element should be
    /// preferred — see [`ResumeState::advance_for_event`]), marks that an event has now been
    /// received, and clears `start_at_operation_time` per §4.4 step (ii).
    pub fn on_event(&mut self, event_id: ResumeToken) {
        self.resume_token = Some(event_id);
        self.has_received = true;
        self.start_at_operation_time = None;
    }

    /// Implements the cursor's `cacheResumeToken` preference from §4.4's "on new change"
    /// algorithm: prefer the post-batch token over the event's own `_id` when `is_last` is true and
    /// a post-batch token is available, else use the event's `_id`.
    pub fn advance_for_event(&mut self, event_id: ResumeToken, is_last_in_batch: bool) {
        let token = if is_last_in_batch {
            self.post_batch_resume_token.clone().unwrap_or(event_id)
        } else {
            event_id
        };
        self.on_event(token);
    }

    /// Renders the current state into a `$changeStream` stage body per §4.2's precedence:
    /// `resumeToken` (as `startAfter` or `resumeAfter`) first, else `startAtOperationTime`, else no
    /// anchor at all.
    pub fn render_anchor(&self, server_wire_version: i32) -> Document {
        let mut doc = Document::new();
        if let Some(token) = &self.resume_token {
            let use_start_after =
                matches!(self.user_anchor, UserAnchor::StartAfter(_)) && !self.has_received;
            let key = if use_start_after {
                "startAfter"
            } else {
                "resumeAfter"
            };
            doc.insert(key, token.as_bson().clone());
        } else if let Some(ts) = self.start_at_operation_time {
            if server_wire_version >= MIN_WIRE_VERSION_FOR_START_AT_OPERATION_TIME {
                doc.insert("startAtOperationTime", Bson::Timestamp(ts));
            }
        }
        doc
    }
}

/// Renders a full `$changeStream` stage document, combining the resume anchor with the remaining
/// user-specified stage options (§4.2: `fullDocument` opaque passthrough, `allChangesForCluster`
/// for cluster domain).
pub fn render_change_stream_stage(
    resume: &ResumeState,
    server_wire_version: i32,
    full_document: Option<&str>,
    full_document_before_change: Option<&str>,
    all_changes_for_cluster: bool,
    show_expanded_events: Option<bool>,
) -> Document {
    let mut stage = resume.render_anchor(server_wire_version);
    if let Some(fd) = full_document {
        stage.insert("fullDocument", fd);
    }
    if let Some(fd) = full_document_before_change {
        stage.insert("fullDocumentBeforeChange", fd);
    }
    if all_changes_for_cluster {
        stage.insert("allChangesForCluster", true);
    }
    if let Some(show) = show_expanded_events {
        stage.insert("showExpandedEvents", show);
    }
    doc! { "$changeStream": stage }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn token(s: &str) -> ResumeToken {
        ResumeToken::from_raw(Bson::String(s.to_string()))
    }

    #[test]
    fn no_anchor_renders_empty_stage() {
        let state = ResumeState::from_options(None, None, None);
        assert_eq!(state.render_anchor(17), Document::new());
    }

    #[test]
    fn resume_after_option_renders_resume_after() {
        let state = ResumeState::from_options(Some(token("a")), None, None);
        let rendered = state.render_anchor(17);
        assert_eq!(rendered.get_str("resumeAfter").unwrap(), "a");
    }

    #[test]
    fn start_after_renders_start_after_until_first_event() {
        let mut state = ResumeState::from_options(None, Some(token("a")), None);
        assert_eq!(state.render_anchor(17).get_str("startAfter").unwrap(), "a");

        state.on_event(token("b"));
        // After the first event, subsequent resumes use resumeAfter even though the user
        // originally specified startAfter (spec.md §8, scenario 5).
        assert_eq!(state.render_anchor(17).get_str("resumeAfter").unwrap(), "b");
    }

    #[test]
    fn start_at_operation_time_used_only_without_a_token_and_sufficient_wire_version() {
        let mut state = ResumeState::from_options(None, None, None);
        state.on_initial_operation_time(bson::Timestamp { time: 5, increment: 0 }, 7);
        let rendered = state.render_anchor(7);
        assert_eq!(
            rendered.get_timestamp("startAtOperationTime").unwrap(),
            bson::Timestamp { time: 5, increment: 0 }
        );

        let mut old_server = ResumeState::from_options(None, None, None);
        old_server.on_initial_operation_time(bson::Timestamp { time: 5, increment: 0 }, 6);
        assert_eq!(old_server.render_anchor(6), Document::new());
    }

    #[test]
    fn start_at_operation_time_cleared_once_an_event_is_seen() {
        let mut state = ResumeState::from_options(None, None, None);
        state.on_initial_operation_time(bson::Timestamp { time: 5, increment: 0 }, 7);
        state.on_event(token("a"));
        // once a token is known it always wins over any stale start_at_operation_time.
        assert_eq!(state.render_anchor(7).get_str("resumeAfter").unwrap(), "a");
    }

    #[test]
    fn empty_batch_advances_resume_token_to_post_batch_token() {
        let mut state = ResumeState::from_options(None, None, None);
        state.on_post_batch_token(Some(token("pbrt")), true);
        assert_eq!(state.resume_token().unwrap().as_bson(), &Bson::String("pbrt".into()));
    }

    #[test]
    fn non_empty_batch_does_not_advance_resume_token_from_post_batch_alone() {
        let mut state = ResumeState::from_options(None, None, None);
        state.on_post_batch_token(Some(token("pbrt")), false);
        assert!(state.resume_token().is_none());
    }

    #[test]
    fn advance_for_event_prefers_post_batch_token_on_last_in_batch() {
        let mut state = ResumeState::from_options(None, None, None);
        state.on_post_batch_token(Some(token("pbrt")), false);
        state.advance_for_event(token("event-id"), true);
        assert_eq!(state.resume_token().unwrap().as_bson(), &Bson::String("pbrt".into()));
    }

    #[test]
    fn advance_for_event_uses_event_id_when_not_last() {
        let mut state = ResumeState::from_options(None, None, None);
        state.on_post_batch_token(Some(token("pbrt")), false);
        state.advance_for_event(token("event-id"), false);
        assert_eq!(state.resume_token().unwrap().as_bson(), &Bson::String("event-id".into()));
    }

    #[test]
    fn full_stage_rendering_includes_passthrough_options() {
        let state = ResumeState::from_options(None, None, None);
        let stage = render_change_stream_stage(&state, 17, Some("updateLookup"), None, true, None);
        let inner = stage.get_document("$changeStream").unwrap();
        assert_eq!(inner.get_str("fullDocument").unwrap(), "updateLookup");
        assert_eq!(inner.get_bool("allChangesForCluster").unwrap(), true);
    }
}
