//! Bounded polling of topology health before resuming a cursor (spec.md §4.5).

use std::time::Duration;

use tracing::{debug, instrument};

use crate::{
    error::{Error, ErrorKind, Result},
    options::ResumeWaitOptions,
};

/// The external SDAM / server-selection collaborator, reduced to the one operation the resume path
/// needs. Server selection and the rest of topology monitoring are out of scope (spec.md §1).
pub trait Topology: Send + Sync {
    /// Returns whether the topology currently considers itself able to select a server.
    fn is_connected(&self) -> bool;
}

/// Waits until `topology.is_connected()` returns true, polling at `options.poll_interval` and
/// giving up with [`ErrorKind::TopologyTimeout`] once `options.deadline` has elapsed since this
/// call began. The deadline is anchored at the first attempt, not reset per poll (spec.md §4.5: "no
/// jitter; the polling interval is deliberately coarse").
#[instrument(skip(topology, options))]
pub async fn wait_for_connectivity(
    topology: &dyn Topology,
    options: ResumeWaitOptions,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    loop {
        if topology.is_connected() {
            return Ok(());
        }
        let elapsed = start.elapsed();
        if elapsed >= options.deadline {
            return Err(Error::new(ErrorKind::TopologyTimeout {
                waited_ms: elapsed.as_millis() as u64,
            }));
        }
        let remaining = options.deadline - elapsed;
        let sleep_for = options.poll_interval.min(remaining);
        debug!(target: "change_stream::topology_wait", waited_ms = elapsed.as_millis() as u64, "topology not yet connected, retrying");
        tokio::time::sleep(sleep_for).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyTopology {
        connected_after: usize,
        polls: AtomicUsize,
    }

    impl Topology for FlakyTopology {
        fn is_connected(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) >= self.connected_after
        }
    }

    struct NeverConnected;
    impl Topology for NeverConnected {
        fn is_connected(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_connected() {
        let topology = FlakyTopology {
            connected_after: 3,
            polls: AtomicUsize::new(0),
        };
        let options = ResumeWaitOptions {
            poll_interval: Duration::from_millis(10),
            deadline: Duration::from_secs(1),
        };
        wait_for_connectivity(&topology, options).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_if_never_connected() {
        let options = ResumeWaitOptions {
            poll_interval: Duration::from_millis(10),
            deadline: Duration::from_millis(50),
        };
        let err = wait_for_connectivity(&NeverConnected, options)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::TopologyTimeout { .. }));
    }
}
