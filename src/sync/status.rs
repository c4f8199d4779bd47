//! Aggregate refresh status shared by the scheduler and consumers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::error::RefreshError;

/// Where a key currently is in its refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
  Idle,
  Fetching,
  Backoff,
}

/// Point-in-time view of the sync layer, safe to poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshStatus {
  pub is_refreshing: bool,
  pub last_refresh: Option<DateTime<Utc>>,
  pub next_refresh: Option<DateTime<Utc>>,
  /// Completed share of the current (or last) cycle, 0-100
  pub progress: u8,
  pub online: bool,
  pub errors: Vec<RefreshError>,
  pub phases: BTreeMap<String, Phase>,
}

#[derive(Debug)]
struct StatusState {
  in_flight: usize,
  cycle_total: usize,
  cycle_completed: usize,
  last_refresh: Option<DateTime<Utc>>,
  next_refresh: Option<DateTime<Utc>>,
  online: bool,
  errors: VecDeque<RefreshError>,
  max_errors: usize,
  phases: BTreeMap<String, Phase>,
}

/// Serialized owner of [`RefreshStatus`]. Callers only ever get copies.
#[derive(Debug)]
pub struct StatusTracker {
  state: Mutex<StatusState>,
}

impl StatusTracker {
  pub fn new(keys: impl IntoIterator<Item = String>, max_errors: usize) -> Self {
    Self {
      state: Mutex::new(StatusState {
        in_flight: 0,
        cycle_total: 0,
        cycle_completed: 0,
        last_refresh: None,
        next_refresh: None,
        online: true,
        errors: VecDeque::new(),
        max_errors,
        phases: keys.into_iter().map(|k| (k, Phase::Idle)).collect(),
      }),
    }
  }

  /// A fetch for `key` started. The first one opens a new cycle.
  pub fn begin(&self, key: &str) {
    let mut state = self.state.lock();
    if state.in_flight == 0 {
      state.cycle_total = 0;
      state.cycle_completed = 0;
    }
    state.in_flight += 1;
    state.cycle_total += 1;
    state.phases.insert(key.to_string(), Phase::Fetching);
  }

  /// A fetch for `key` settled. The last one closes the cycle.
  pub fn finish(&self, key: &str) {
    let mut state = self.state.lock();
    state.in_flight = state.in_flight.saturating_sub(1);
    state.cycle_completed = (state.cycle_completed + 1).min(state.cycle_total);
    state.phases.insert(key.to_string(), Phase::Idle);
    if state.in_flight == 0 {
      state.last_refresh = Some(Utc::now());
    }
  }

  pub fn set_phase(&self, key: &str, phase: Phase) {
    self.state.lock().phases.insert(key.to_string(), phase);
  }

  /// Forget any error recorded for `(source, key)`.
  pub fn record_success(&self, source: &str, key: &str) {
    self
      .state
      .lock()
      .errors
      .retain(|e| !(e.source == source && e.key == key));
  }

  /// Record a terminal failure, replacing an older one for the same key.
  pub fn record_error(&self, error: RefreshError) {
    let mut state = self.state.lock();
    state
      .errors
      .retain(|e| !(e.source == error.source && e.key == error.key));
    state.errors.push_back(error);
    Self::enforce_cap(&mut state);
  }

  pub fn clear_errors(&self) {
    self.state.lock().errors.clear();
  }

  pub fn set_max_errors(&self, max_errors: usize) {
    let mut state = self.state.lock();
    state.max_errors = max_errors;
    Self::enforce_cap(&mut state);
  }

  fn enforce_cap(state: &mut StatusState) {
    while state.errors.len() > state.max_errors {
      state.errors.pop_front();
    }
  }

  pub fn set_next_refresh(&self, at: Option<DateTime<Utc>>) {
    self.state.lock().next_refresh = at;
  }

  /// Returns `true` if the connectivity state changed.
  pub fn set_online(&self, online: bool) -> bool {
    let mut state = self.state.lock();
    let changed = state.online != online;
    state.online = online;
    changed
  }

  pub fn is_online(&self) -> bool {
    self.state.lock().online
  }

  pub fn is_refreshing(&self) -> bool {
    self.state.lock().in_flight > 0
  }

  pub fn snapshot(&self) -> RefreshStatus {
    let state = self.state.lock();
    let progress = if state.cycle_total == 0 {
      0
    } else {
      (state.cycle_completed * 100 / state.cycle_total) as u8
    };

    RefreshStatus {
      is_refreshing: state.in_flight > 0,
      last_refresh: state.last_refresh,
      next_refresh: state.next_refresh,
      progress,
      online: state.online,
      errors: state.errors.iter().cloned().collect(),
      phases: state.phases.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::FetchError;

  fn error(source: &str, key: &str) -> RefreshError {
    RefreshError::new(source, key, &FetchError::Network("down".into()), 3)
  }

  #[test]
  fn test_cycle_progress() {
    let tracker = StatusTracker::new(vec!["a".to_string(), "b".to_string()], 20);
    assert_eq!(tracker.snapshot().progress, 0);
    assert!(!tracker.is_refreshing());

    tracker.begin("a");
    tracker.begin("b");
    let status = tracker.snapshot();
    assert!(status.is_refreshing);
    assert_eq!(status.progress, 0);
    assert_eq!(status.phases["a"], Phase::Fetching);

    tracker.finish("a");
    assert_eq!(tracker.snapshot().progress, 50);

    tracker.finish("b");
    let status = tracker.snapshot();
    assert!(!status.is_refreshing);
    assert_eq!(status.progress, 100);
    assert!(status.last_refresh.is_some());
    assert_eq!(status.phases["b"], Phase::Idle);
  }

  #[test]
  fn test_new_cycle_resets_progress() {
    let tracker = StatusTracker::new(Vec::new(), 20);
    tracker.begin("a");
    tracker.finish("a");
    tracker.begin("b");
    assert_eq!(tracker.snapshot().progress, 0);
  }

  #[test]
  fn test_error_replaced_per_key() {
    let tracker = StatusTracker::new(Vec::new(), 20);
    tracker.record_error(error("a", "k"));
    tracker.record_error(error("a", "k"));
    tracker.record_error(error("b", "k2"));
    assert_eq!(tracker.snapshot().errors.len(), 2);

    tracker.record_success("a", "k");
    let errors = tracker.snapshot().errors;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source, "b");
  }

  #[test]
  fn test_error_cap_evicts_oldest() {
    let tracker = StatusTracker::new(Vec::new(), 2);
    tracker.record_error(error("a", "1"));
    tracker.record_error(error("a", "2"));
    tracker.record_error(error("a", "3"));

    let keys: Vec<_> = tracker.snapshot().errors.into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec!["2", "3"]);

    tracker.set_max_errors(1);
    assert_eq!(tracker.snapshot().errors.len(), 1);
  }

  #[test]
  fn test_clear_errors_is_idempotent() {
    let tracker = StatusTracker::new(Vec::new(), 20);
    tracker.record_error(error("a", "k"));
    tracker.clear_errors();
    assert!(tracker.snapshot().errors.is_empty());
    tracker.clear_errors();
    assert!(tracker.snapshot().errors.is_empty());
  }

  #[test]
  fn test_online_transitions() {
    let tracker = StatusTracker::new(Vec::new(), 20);
    assert!(tracker.is_online());
    assert!(tracker.set_online(false));
    assert!(!tracker.set_online(false));
    assert!(tracker.set_online(true));
  }
}
