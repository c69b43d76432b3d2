//! A resumable, ordered stream of change events scoped to a collection, database, or cluster.
//!
//! This crate implements the core of a change-stream client: resume-token bookkeeping, the
//! `$changeStream` aggregation stage, automatic resumption across transient errors, and a mode
//! invariant between pull (`Stream`/`next`) and push (`into_emitter`) consumption. The wire
//! protocol, aggregation dispatch, server selection, and BSON codecs it sits on top of are
//! external collaborators, represented here as the [`cursor::WireCursor`], [`cursor::CursorOpener`],
//! [`topology::Topology`], and [`error::ResumableErrorClassifier`] traits.
//!
//! ```no_run
//! use std::sync::Arc;
//! use changestream::{controller::Watch, event::ChangeEvent, options::WatchTarget};
//! use futures_util::StreamExt;
//!
//! # async fn run(
//! #     topology: Arc<dyn changestream::topology::Topology>,
//! #     opener: Arc<dyn changestream::cursor::CursorOpener>,
//! # ) -> changestream::error::Result<()> {
//! let target = WatchTarget::collection("mydb", "mycoll")?;
//! let mut stream = Watch::new(target).open::<ChangeEvent>(topology, opener).await?;
//! while let Some(event) = stream.next().await.transpose()? {
//!     println!("{:?}", event.operation_type);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bridge;
pub mod controller;
pub mod cursor;
pub mod error;
pub mod event;
pub mod options;
pub mod resume;
pub mod topology;

pub use bridge::ChangeStreamEmitter;
pub use controller::{ChangeStream, Mode, Watch};
pub use error::{Error, ErrorKind, Result};
pub use event::ChangeEvent;
pub use options::{ChangeStreamOptions, ResumeWaitOptions, WatchTarget};
