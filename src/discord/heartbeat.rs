use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn, Instrument};

use super::gateway::Outbound;
use super::payload::Payload;
use super::session::Session;

/// Periodic keep-alive for one gateway connection.
///
/// Can be started once. After [`stop`](Heartbeat::stop) it stays stopped.
#[derive(Debug)]
pub struct Heartbeat {
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Heartbeat {
            stop: watch::Sender::new(false),
            task: Mutex::new(None),
        }
    }

    /// Spawns the heartbeat loop. Returns `false` without spawning anything if
    /// the loop was already started, has been stopped, or `period` is zero.
    pub fn start(&self, outbound: Outbound, session: Arc<Session>, period: Duration) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || *self.stop.borrow() || period.is_zero() {
            return false;
        }
        let stop = self.stop.subscribe();
        *task = Some(tokio::spawn(
            run(outbound, session, period, stop).in_current_span(),
        ));
        debug!(period_ms = period.as_millis() as u64, "heartbeat started");
        true
    }

    /// Stops the loop. Safe to call repeatedly and from any task.
    pub fn stop(&self) {
        self.stop.send_replace(true);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = task.as_ref() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        !*self.stop.borrow() && task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    outbound: Outbound,
    session: Arc<Session>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop.borrow() {
            break;
        }

        let sequence = session.last_sequence().await;
        match outbound.send(&Payload::heartbeat(sequence)).await {
            Ok(()) => trace!(?sequence, "heartbeat sent"),
            Err(e) => warn!(error = %e, ?sequence, "heartbeat send failed"),
        }
    }
    debug!("heartbeat stopped");
}
