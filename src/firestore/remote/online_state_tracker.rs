use std::time::Duration;

use crate::firestore::core::{DelayedOperation, OnlineState, TimerId};
use crate::firestore::error::FirestoreError;
use crate::firestore::remote::scheduler::{RemoteStoreEvent, RemoteStoreScheduler};

/// Derives the client's [`OnlineState`] from watch stream health.
///
/// Every method returns the new state when it changed, so the caller can
/// broadcast it.
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    max_watch_stream_failures: u32,
    online_state_timeout: Duration,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

impl OnlineStateTracker {
    pub fn new(max_watch_stream_failures: u32, online_state_timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            max_watch_stream_failures,
            online_state_timeout,
            online_state_timer: None,
            should_warn_client_is_offline: true,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// A watch stream connection attempt began. If nothing conclusive happens
    /// before the timeout the client is considered offline.
    pub fn handle_watch_stream_start(
        &mut self,
        scheduler: &dyn RemoteStoreScheduler,
    ) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_and_broadcast(OnlineState::Unknown);
        self.clear_online_state_timer();
        self.online_state_timer = Some(scheduler.deliver_after(
            TimerId::OnlineStateTimeout,
            self.online_state_timeout,
            RemoteStoreEvent::OnlineStateTimeout,
        ));
        changed
    }

    pub fn handle_online_state_timeout(&mut self) -> Option<OnlineState> {
        if self.online_state_timer.take().is_none() {
            return None;
        }
        self.log_client_offline_warning(&format!(
            "backend didn't respond within {} seconds",
            self.online_state_timeout.as_secs()
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    /// The watch stream failed. Online clients drop to unknown; otherwise
    /// enough consecutive failures mean offline.
    pub fn handle_watch_stream_failure(&mut self, error: &FirestoreError) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            return self.set_and_broadcast(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= self.max_watch_stream_failures {
            self.clear_online_state_timer();
            self.log_client_offline_warning(&format!(
                "connection failed {} times. Most recent error: {error}",
                self.max_watch_stream_failures
            ));
            return self.set_and_broadcast(OnlineState::Offline);
        }
        None
    }

    /// Explicit transition, which also resets the failure count.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_online_state_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            // Reached the backend once; later outages only log at debug level.
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(state)
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        self.state = state;
        Some(state)
    }

    fn log_client_offline_warning(&mut self, details: &str) {
        let message = format!(
            "Could not reach the backend: {details}. The client will operate in offline mode until it can reach the backend."
        );
        if self.should_warn_client_is_offline {
            log::warn!("{message}");
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }

    fn clear_online_state_timer(&mut self) {
        if let Some(timer) = self.online_state_timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::firestore::error::unavailable;

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<(TimerId, DelayedOperation)>>,
    }

    impl RemoteStoreScheduler for RecordingScheduler {
        fn deliver(&self, _event: RemoteStoreEvent) {}

        fn deliver_after(&self, timer_id: TimerId, _delay: Duration, _event: RemoteStoreEvent) -> DelayedOperation {
            let operation = DelayedOperation::new(timer_id);
            self.scheduled.lock().unwrap().push((timer_id, operation.clone()));
            operation
        }
    }

    fn tracker() -> OnlineStateTracker {
        OnlineStateTracker::new(1, Duration::from_secs(10))
    }

    #[test]
    fn timeout_moves_unknown_client_offline() {
        let scheduler = RecordingScheduler::default();
        let mut tracker = tracker();
        assert_eq!(tracker.handle_watch_stream_start(&scheduler), None);
        assert_eq!(scheduler.scheduled.lock().unwrap()[0].0, TimerId::OnlineStateTimeout);
        assert_eq!(tracker.handle_online_state_timeout(), Some(OnlineState::Offline));
    }

    #[test]
    fn going_online_cancels_the_timer() {
        let scheduler = RecordingScheduler::default();
        let mut tracker = tracker();
        tracker.handle_watch_stream_start(&scheduler);
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert!(scheduler.scheduled.lock().unwrap()[0].1.is_cancelled());
        assert_eq!(tracker.handle_online_state_timeout(), None);
        assert_eq!(tracker.state(), OnlineState::Online);
    }

    #[test]
    fn failures_while_online_first_drop_to_unknown() {
        let mut tracker = tracker();
        tracker.set(OnlineState::Online);
        let error = unavailable("gone");
        assert_eq!(tracker.handle_watch_stream_failure(&error), Some(OnlineState::Unknown));
        assert_eq!(tracker.handle_watch_stream_failure(&error), Some(OnlineState::Offline));
    }

    #[test]
    fn failure_threshold_is_configurable() {
        let mut tracker = OnlineStateTracker::new(3, Duration::from_secs(10));
        let error = unavailable("gone");
        assert_eq!(tracker.handle_watch_stream_failure(&error), None);
        assert_eq!(tracker.handle_watch_stream_failure(&error), None);
        assert_eq!(tracker.handle_watch_stream_failure(&error), Some(OnlineState::Offline));
    }
}
