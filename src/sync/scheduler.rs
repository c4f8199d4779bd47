//! Periodic refresh loop and external trigger handling.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::service::SyncService;
use crate::event::{ConnectivityEvent, Event, EventHandler, WakeReason};

/// Running scheduler task. Stop it with [`SyncService::dispose`].
pub struct SchedulerHandle {
  task: JoinHandle<()>,
  shutdown: CancellationToken,
}

impl SchedulerHandle {
  /// Wait for the scheduler loop to exit.
  pub async fn join(self) {
    let _ = self.task.await;
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }

  /// Stop the loop and wait for it. Equivalent to disposing the service.
  pub async fn shutdown(self) {
    self.shutdown.cancel();
    self.join().await;
  }
}

fn ticker(period: Duration, start: Instant) -> Interval {
  let mut interval = time::interval_at(start, period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
  interval
}

pub(super) fn spawn(service: SyncService, mut events: EventHandler) -> SchedulerHandle {
  let shutdown = service.shutdown_token();
  let mut config_rx = service.watch_config();

  let token = shutdown.clone();
  let task = tokio::spawn(async move {
    let mut period = config_rx.borrow().refresh_interval();
    // First tick fires right away so missing data loads on start
    let mut interval = ticker(period, Instant::now());

    loop {
      tokio::select! {
        _ = token.cancelled() => {
          break;
        }
        _ = interval.tick() => {
          if service.tracker().is_online() {
            service.refresh_due();
          } else {
            debug!("Offline, skipping refresh tick");
          }
          service.tracker().set_next_refresh(Some(next_refresh_at(period)));
        }
        Some(event) = events.next() => {
          handle_event(&service, event);
        }
        Ok(()) = config_rx.changed() => {
          let updated = config_rx.borrow_and_update().refresh_interval();
          if updated != period {
            info!(?updated, "Refresh interval changed");
            period = updated;
            interval = ticker(period, Instant::now() + period);
            service.tracker().set_next_refresh(Some(next_refresh_at(period)));
          }
        }
      }
    }

    service.tracker().set_next_refresh(None);
    info!("Refresh scheduler stopped");
  });

  SchedulerHandle { task, shutdown }
}

fn handle_event(service: &SyncService, event: Event) {
  match event {
    Event::Wake(reason) => service.wake(reason),
    Event::Connectivity(ConnectivityEvent::Online) => {
      if service.tracker().set_online(true) {
        info!("Back online");
        service.wake(WakeReason::Reconnect);
      }
    }
    Event::Connectivity(ConnectivityEvent::Offline) => {
      if service.tracker().set_online(false) {
        info!("Offline, pausing periodic refresh");
      }
    }
  }
}

fn next_refresh_at(period: Duration) -> chrono::DateTime<Utc> {
  let period = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::MAX);
  Utc::now()
    .checked_add_signed(period)
    .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}
