//! One notification delivery cycle across all email-enabled subscribers.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use ipor_core::{IpoStatus, Subscriber};
use ipor_storage::{IpoStore, StoreError, SubscriberStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::digest::DigestBuilder;
use crate::notify::{evaluate, Decision, DigestContent};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    Disabled,
    NoRecipient,
    Throttled,
    NoContent,
    /// Another cycle holds this subscriber's delivery claim.
    Claimed,
    /// The subscriber was removed mid-cycle.
    Vanished,
    DeliveryFailed,
    Aborted,
}

impl From<&Decision> for DeliveryOutcome {
    fn from(decision: &Decision) -> Self {
        match decision {
            Decision::Disabled => DeliveryOutcome::Disabled,
            Decision::NoRecipient => DeliveryOutcome::NoRecipient,
            Decision::Throttled { .. } => DeliveryOutcome::Throttled,
            Decision::NoContent => DeliveryOutcome::NoContent,
            Decision::Send { .. } => DeliveryOutcome::Sent,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub subscribers: usize,
    pub sent: usize,
    pub throttled: usize,
    pub no_content: usize,
    pub skipped: usize,
    pub delivery_failures: usize,
}

impl CycleSummary {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::Throttled => self.throttled += 1,
            DeliveryOutcome::NoContent => self.no_content += 1,
            DeliveryOutcome::DeliveryFailed => self.delivery_failures += 1,
            _ => self.skipped += 1,
        }
    }
}

pub struct NotificationCycle {
    builder: DigestBuilder,
    concurrency: usize,
}

impl NotificationCycle {
    pub fn new(builder: DigestBuilder, concurrency: usize) -> Self {
        Self {
            builder,
            concurrency: concurrency.max(1),
        }
    }

    /// Fails only when the store cannot be read or becomes unavailable; a
    /// subscriber whose delivery fails keeps its old stamp and stays due.
    pub async fn run(
        &self,
        subscribers: &dyn SubscriberStore,
        ipos: &dyn IpoStore,
        transport: &dyn Transport,
        now: DateTime<Utc>,
    ) -> Result<CycleSummary, StoreError> {
        let span = info_span!("notification_cycle", at = %now);
        async move {
            let candidates = subscribers.list_email_enabled().await?;
            let content = DigestContent {
                open: ipos.list_by_status(IpoStatus::Open).await?,
                upcoming: ipos.list_by_status(IpoStatus::Upcoming).await?,
            };
            info!(
                subscribers = candidates.len(),
                open = content.open.len(),
                upcoming = content.upcoming.len(),
                "starting notification cycle"
            );

            let aborted = AtomicBool::new(false);
            // Deliveries are built up front; async fns do nothing until
            // polled, so at most `concurrency` of them run at once.
            let deliveries = candidates
                .iter()
                .map(|subscriber| {
                    self.deliver_one(subscriber, subscribers, transport, &content, &aborted, now)
                })
                .collect::<Vec<_>>();
            let results = stream::iter(deliveries)
                .buffer_unordered(self.concurrency)
                .collect::<Vec<_>>()
                .await;

            let mut summary = CycleSummary {
                subscribers: candidates.len(),
                ..CycleSummary::default()
            };
            let mut fatal = None;
            for result in results {
                match result {
                    Ok(outcome) => summary.record(outcome),
                    Err(err) => {
                        fatal.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = fatal {
                warn!(error = %err, "notification cycle aborted");
                return Err(err);
            }
            info!(
                sent = summary.sent,
                throttled = summary.throttled,
                no_content = summary.no_content,
                delivery_failures = summary.delivery_failures,
                "notification cycle finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn deliver_one(
        &self,
        listed: &Subscriber,
        store: &dyn SubscriberStore,
        transport: &dyn Transport,
        content: &DigestContent,
        aborted: &AtomicBool,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome, StoreError> {
        if aborted.load(Ordering::Relaxed) {
            return Ok(DeliveryOutcome::Aborted);
        }
        let decision = evaluate(listed, now, content);
        if !matches!(decision, Decision::Send { .. }) {
            return Ok(DeliveryOutcome::from(&decision));
        }

        let fresh = match store.claim_delivery(listed.id, now).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => return Ok(DeliveryOutcome::Claimed),
            Err(StoreError::NotFound(_)) => return Ok(DeliveryOutcome::Vanished),
            Err(err) => return Err(abort(aborted, err)),
        };

        // The listed copy may be stale; decide again on the claimed record.
        let (recipient, sections) = match evaluate(&fresh, now, content) {
            Decision::Send { recipient, sections } => (recipient, sections),
            other => {
                release(store, fresh.id, None, aborted).await?;
                return Ok(DeliveryOutcome::from(&other));
            }
        };

        let delivered = match self.builder.build(&recipient, &sections, content, now) {
            Ok(message) => match transport.deliver(&message).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(subscriber = %fresh.id, error = %err, "delivery failed; stamp left unchanged");
                    false
                }
            },
            Err(err) => {
                warn!(subscriber = %fresh.id, error = %err, "digest could not be rendered");
                false
            }
        };

        release(store, fresh.id, delivered.then_some(now), aborted).await?;
        Ok(if delivered {
            DeliveryOutcome::Sent
        } else {
            DeliveryOutcome::DeliveryFailed
        })
    }
}

async fn release(
    store: &dyn SubscriberStore,
    id: Uuid,
    sent_at: Option<DateTime<Utc>>,
    aborted: &AtomicBool,
) -> Result<(), StoreError> {
    match store.release_delivery(id, sent_at).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_unavailable() => Err(abort(aborted, err)),
        Err(err) => {
            warn!(subscriber = %id, error = %err, "could not release delivery claim");
            Ok(())
        }
    }
}

fn abort(aborted: &AtomicBool, err: StoreError) -> StoreError {
    aborted.store(true, Ordering::Relaxed);
    err
}
