use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trail_core::signals::PipelineSignal;
use trail_core::PipelineError;
use trail_settings::SchedulerSettings;

use crate::manager::{ManagerOutcome, TransmissionManager};

/// Something the scheduler can ask to drain the queues.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self) -> Result<ManagerOutcome, PipelineError>;
}

#[async_trait]
impl Dispatch for TransmissionManager {
    async fn dispatch(&self) -> Result<ManagerOutcome, PipelineError> {
        self.execute().await
    }
}

/// Decides when transmission runs.
///
/// Triggers (new data, network regained, background wake-ups, timer ticks)
/// are debounced on the leading edge: the first one runs at once, later ones
/// inside the window collapse into a single run at the end of it. The
/// periodic timer runs only while the queues still hold data that could be
/// sent.
pub struct DispatchScheduler {
    dispatcher: Arc<dyn Dispatch>,
    debounce: Duration,
    tick: Duration,
}

struct LoopState {
    last_run: Option<Instant>,
    deferred: Option<Instant>,
    timer_active: bool,
    interval: Interval,
}

impl DispatchScheduler {
    pub fn new(dispatcher: Arc<dyn Dispatch>, settings: &SchedulerSettings) -> Self {
        Self {
            dispatcher,
            debounce: Duration::from_millis(settings.debounce_ms),
            tick: Duration::from_millis(settings.tick_ms.max(1)),
        }
    }

    pub fn spawn(
        self,
        signals: broadcast::Receiver<PipelineSignal>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(signals, cancel))
    }

    async fn run(self, mut signals: broadcast::Receiver<PipelineSignal>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.tick, self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = LoopState {
            last_run: None,
            deferred: None,
            timer_active: false,
            interval,
        };

        info!(
            debounce_ms = self.debounce.as_millis() as u64,
            tick_ms = self.tick.as_millis() as u64,
            "dispatch scheduler started"
        );

        loop {
            let deferred = state.deferred;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = signals.recv() => match received {
                    Ok(signal) => self.on_signal(&mut state, signal).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "scheduler lagged behind signals");
                        self.trigger(&mut state).await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = state.interval.tick(), if state.timer_active => {
                    debug!("timer tick");
                    self.trigger(&mut state).await;
                }
                _ = sleep_until(deferred), if deferred.is_some() => {
                    state.deferred = None;
                    self.run_now(&mut state).await;
                }
            }
        }

        info!("dispatch scheduler stopped");
    }

    async fn on_signal(&self, state: &mut LoopState, signal: PipelineSignal) {
        match signal {
            PipelineSignal::DataAvailable { .. }
            | PipelineSignal::BackgroundTask
            | PipelineSignal::ReachabilityChanged { reachable: true } => {
                self.trigger(state).await;
            }
            PipelineSignal::ReachabilityChanged { reachable: false } => {
                self.set_timer(state, false);
            }
            PipelineSignal::AuthInactive { reason } => {
                debug!(?reason, "auth inactive, stopping timer");
                self.set_timer(state, false);
                state.deferred = None;
            }
            PipelineSignal::DataSent { .. } | PipelineSignal::CollectionPaused { .. } => {}
        }
    }

    /// Run now, or defer to the end of the debounce window.
    async fn trigger(&self, state: &mut LoopState) {
        let now = Instant::now();
        match state.last_run {
            Some(last) if now.duration_since(last) < self.debounce => {
                if state.deferred.is_none() {
                    state.deferred = Some(last + self.debounce);
                }
            }
            _ => self.run_now(state).await,
        }
    }

    async fn run_now(&self, state: &mut LoopState) {
        state.last_run = Some(Instant::now());
        match self.dispatcher.dispatch().await {
            Ok(ManagerOutcome::AlreadyRunning) => {}
            Ok(outcome) => self.set_timer(state, !outcome.drained()),
            Err(e) if e.is_unrestorable() || e == PipelineError::NetworkDisconnected => {
                self.set_timer(state, false);
            }
            Err(e) => {
                debug!(error = %e, "dispatch failed, timer keeps running");
                self.set_timer(state, true);
            }
        }
    }

    fn set_timer(&self, state: &mut LoopState, active: bool) {
        if active && !state.timer_active {
            state.interval.reset();
            debug!("timer started");
        } else if !active && state.timer_active {
            debug!("timer stopped");
        }
        state.timer_active = active;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
