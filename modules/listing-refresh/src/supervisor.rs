use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use listing_common::{Config, Outcome, OutcomeKind, ScrapeRequest};

use crate::channel::{ChannelError, Delivery, MessageChannel, Redelivery};
use crate::inflight::{InFlightGuard, InFlightSet};
use crate::notify::NotifyBackend;
use crate::reconciler::Reconciler;
use crate::retry::RetryPolicy;
use crate::types::{FailureKind, FailureRecord, RefreshCounters, SupervisorStats};

/// Pause before a slot asks a failing channel again.
const CHANNEL_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Delay before a deferred message comes back.
    pub defer_delay: Duration,
    /// Deferrals per message before its slot waits for the property instead.
    pub defer_max: u32,
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            defer_delay: Duration::from_millis(500),
            defer_max: 20,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            retry: RetryPolicy::from_config(config),
            defer_delay: config.defer_delay,
            defer_max: config.defer_max,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// Owns the consumption loop: a fixed number of slots share one channel,
/// each handling one message at a time.
pub struct Supervisor {
    ctx: Arc<SlotContext>,
}

struct SlotContext {
    channel: Arc<dyn MessageChannel>,
    reconciler: Arc<Reconciler>,
    notifier: Arc<dyn NotifyBackend>,
    settings: SupervisorSettings,
    in_flight: InFlightSet,
    counters: RefreshCounters,
}

/// What to do with a delivery once its reconciliation finished.
enum Settle {
    Ack,
    AckWithFailure(FailureKind, String),
    Retry(Duration),
    Requeue,
}

impl Supervisor {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        reconciler: Arc<Reconciler>,
        notifier: Arc<dyn NotifyBackend>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(SlotContext {
                channel,
                reconciler,
                notifier,
                settings,
                in_flight: InFlightSet::new(),
                counters: RefreshCounters::default(),
            }),
        }
    }

    /// Counters so far; final once [`run`](Self::run) returned.
    pub fn stats(&self) -> SupervisorStats {
        self.ctx.counters.snapshot()
    }

    /// Consume until `shutdown` is cancelled or the channel closes.
    ///
    /// On shutdown, slots stop taking messages and in-flight work gets
    /// `shutdown_grace` to finish. Whatever is still running after that is
    /// cancelled and handed back to the channel without using an attempt.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<SupervisorStats> {
        let settings = &self.ctx.settings;
        let stop = shutdown.child_token();
        let work = CancellationToken::new();

        info!(
            slots = settings.max_concurrency,
            max_attempts = settings.retry.max_attempts,
            "Supervisor started"
        );

        let mut slots = JoinSet::new();
        for slot in 0..settings.max_concurrency.max(1) {
            let ctx = Arc::clone(&self.ctx);
            let stop = stop.clone();
            let work = work.clone();
            slots.spawn(async move { ctx.slot_loop(slot, stop, work).await });
        }

        let mut errors: Vec<anyhow::Error> = Vec::new();
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = join_all(&mut slots, &mut errors) => {}
        }
        stop.cancel();

        if !slots.is_empty() {
            info!(
                in_flight = self.ctx.in_flight.len(),
                grace_secs = settings.shutdown_grace.as_secs(),
                "Draining in-flight reconciliations"
            );
        }
        let drained = tokio::time::timeout(
            settings.shutdown_grace,
            join_all(&mut slots, &mut errors),
        )
        .await;
        if drained.is_err() {
            warn!(
                in_flight = self.ctx.in_flight.len(),
                "Grace period elapsed, cancelling remaining work"
            );
            work.cancel();
            join_all(&mut slots, &mut errors).await;
        }

        if let Err(e) = self.ctx.channel.close().await {
            warn!(error = %e, "Failed to close message channel");
        }

        let stats = self.ctx.counters.snapshot();
        if let Err(e) = self.ctx.notifier.send_digest(&stats).await {
            warn!(error = %e, "Failed to send run digest");
        }

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

async fn join_all(slots: &mut JoinSet<Result<(), ChannelError>>, errors: &mut Vec<anyhow::Error>) {
    while let Some(joined) = slots.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e.into()),
            Err(e) => errors.push(anyhow::anyhow!("consumer slot panicked: {e}")),
        }
    }
}

impl SlotContext {
    async fn slot_loop(
        &self,
        slot: usize,
        stop: CancellationToken,
        work: CancellationToken,
    ) -> Result<(), ChannelError> {
        debug!(slot, "Consumer slot started");
        let mut consecutive_errors = 0u32;

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = self.channel.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    consecutive_errors = 0;
                    self.handle(delivery, &work).await;
                }
                Ok(None) => {
                    debug!(slot, "Channel closed");
                    break;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(slot, error = %e, consecutive_errors, "Failed to receive message");
                    if consecutive_errors >= 3 {
                        // Let the process restart with a fresh connection.
                        stop.cancel();
                        return Err(e);
                    }
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(CHANNEL_ERROR_PAUSE) => {}
                    }
                }
            }
        }

        debug!(slot, "Consumer slot stopped");
        Ok(())
    }

    async fn handle(&self, delivery: Box<dyn Delivery>, work: &CancellationToken) {
        let attempt = delivery.attempt();

        let request = match ScrapeRequest::from_slice(delivery.payload()) {
            Ok(request) => request,
            Err(e) => {
                warn!(attempt, error = %e, "Dropping malformed scrape request");
                self.counters.record_malformed();
                self.counters.record_outcome(OutcomeKind::PermanentFailure);
                settle_ack(delivery).await;
                self.notify(FailureRecord::new(
                    None,
                    None,
                    FailureKind::Rejected,
                    e.to_string(),
                    attempt,
                ))
                .await;
                return;
            }
        };
        let id = request.property_id;

        let Some(guard) = self.claim(&request, delivery.deferrals(), work).await else {
            let redelivery = if work.is_cancelled() {
                self.counters.record_requeue();
                Redelivery::Requeue
            } else {
                self.counters.record_deferral();
                debug!(
                    property_id = %id,
                    deferrals = delivery.deferrals() + 1,
                    "Property already in flight, deferring"
                );
                Redelivery::Defer {
                    delay: self.settings.defer_delay,
                }
            };
            settle_nack(delivery, redelivery).await;
            return;
        };

        debug!(property_id = %id, attempt, "Dispatching reconciliation");
        let outcome = self.reconciler.reconcile(&request, work).await;
        let kind = outcome.kind();

        let settle = match outcome.result {
            Outcome::Updated(_) | Outcome::Unchanged(_) => {
                self.counters.record_outcome(kind);
                Settle::Ack
            }
            Outcome::NotFound => {
                self.counters.record_outcome(OutcomeKind::NotFound);
                Settle::AckWithFailure(
                    FailureKind::AddressNotFound,
                    format!("no property found at {}", request.address),
                )
            }
            Outcome::PermanentFailure(detail) => {
                self.counters.record_outcome(OutcomeKind::PermanentFailure);
                Settle::AckWithFailure(FailureKind::Rejected, detail)
            }
            Outcome::TransientFailure(_) if work.is_cancelled() => {
                self.counters.record_requeue();
                Settle::Requeue
            }
            Outcome::TransientFailure(detail) if self.settings.retry.allows_retry(attempt) => {
                self.counters.record_outcome(OutcomeKind::TransientFailure);
                self.counters.record_retry();
                let delay = self.settings.retry.delay_for(attempt);
                info!(
                    property_id = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    detail = detail.as_str(),
                    "Scheduling retry"
                );
                Settle::Retry(delay)
            }
            Outcome::TransientFailure(detail) => {
                self.counters.record_outcome(OutcomeKind::PermanentFailure);
                self.counters.record_exhausted();
                Settle::AckWithFailure(
                    FailureKind::ExhaustedRetries,
                    format!("gave up after {attempt} attempts, last error: {detail}"),
                )
            }
        };

        match settle {
            Settle::Ack => settle_ack(delivery).await,
            Settle::AckWithFailure(kind, detail) => {
                settle_ack(delivery).await;
                self.notify(FailureRecord::new(
                    Some(id),
                    Some(&request.address),
                    kind,
                    detail,
                    attempt,
                ))
                .await;
            }
            Settle::Retry(delay) => settle_nack(delivery, Redelivery::Retry { delay }).await,
            Settle::Requeue => settle_nack(delivery, Redelivery::Requeue).await,
        }
        drop(guard);
    }

    /// Claim the property for this slot. `None` means defer: the property is
    /// busy and the message may still be deferred, or shutdown began while
    /// waiting.
    async fn claim(
        &self,
        request: &ScrapeRequest,
        deferrals: u32,
        work: &CancellationToken,
    ) -> Option<InFlightGuard> {
        let id = request.property_id;
        if let Some(guard) = self.in_flight.try_acquire(id) {
            return Some(guard);
        }
        if deferrals < self.settings.defer_max {
            return None;
        }

        debug!(property_id = %id, deferrals, "Deferral limit reached, waiting for property");
        tokio::select! {
            guard = self.in_flight.acquire(id) => Some(guard),
            _ = work.cancelled() => None,
        }
    }

    async fn notify(&self, failure: FailureRecord) {
        if let Err(e) = self.notifier.send(&failure).await {
            warn!(error = %e, kind = %failure.kind, "Failed to report refresh failure");
        }
    }
}

async fn settle_ack(delivery: Box<dyn Delivery>) {
    if let Err(e) = delivery.ack().await {
        warn!(error = %e, "Failed to acknowledge message");
    }
}

async fn settle_nack(delivery: Box<dyn Delivery>, redelivery: Redelivery) {
    if let Err(e) = delivery.nack(redelivery).await {
        warn!(error = %e, ?redelivery, "Failed to return message to queue");
    }
}
