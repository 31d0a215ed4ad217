//! Relay worker loop
//!
//! Each worker repeatedly takes the best ready item, sends it over a pooled
//! connection and either resolves it or puts it back for a retry.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use smtpy_common::{AuditRecord, Domain, internal};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, error, warn};

use super::{Shared, queue::QueueItem};
use crate::{
    error::DeliveryError,
    rate_limiter::GLOBAL_KEY,
    smtp_transaction::{TransmitReport, transmit},
    types::{AttemptStatus, DeliveryAttempt, DeliveryPath, DeliveryStatus},
};

/// Reason recorded for items still queued when a stop times out.
pub const SHUTDOWN_REASON: &str = "Relay service stopped before delivery";

/// Run until the queue is closed and empty, or until `hard_stop` fires.
pub async fn run(shared: Arc<Shared>, id: usize, mut hard_stop: watch::Receiver<bool>) {
    debug!(worker = id, "Relay worker started");

    loop {
        let next = tokio::select! {
            item = shared.queue.next_ready() => item,
            _ = hard_stop.wait_for(|stop| *stop) => None,
        };
        let Some(item) = next else { break };

        let mut in_flight = Some(item);
        tokio::select! {
            () = process(&shared, &mut in_flight) => {}
            _ = hard_stop.wait_for(|stop| *stop) => {
                if let Some(item) = in_flight.take() {
                    fail_all(&shared, item, SHUTDOWN_REASON);
                }
                break;
            }
        }
    }

    debug!(worker = id, "Relay worker stopped");
}

/// Resolve every pending recipient of `item` as failed.
pub fn fail_all(shared: &Shared, mut item: QueueItem, reason: &str) {
    for recipient in item.pending.clone() {
        let attempt = attempt_record(
            shared,
            &recipient,
            AttemptStatus::Deferred,
            None,
            reason,
            item.attempts.max(1),
        );
        item.record(&recipient, attempt);
        item.finish(&recipient, DeliveryStatus::Failed);
        shared.counters.failed.incr();
    }
    item.resolve();
}

fn attempt_record(
    shared: &Shared,
    recipient: &str,
    status: AttemptStatus,
    code: Option<u16>,
    message: &str,
    attempt: u32,
) -> DeliveryAttempt {
    DeliveryAttempt {
        domain: Domain::new(recipient.rsplit_once('@').map_or("", |(_, d)| d)),
        mx_host: Some(shared.config.host.clone()),
        status,
        code,
        message: message.to_string(),
        timestamp: Utc::now(),
        attempt,
        path: DeliveryPath::Relay,
    }
}

fn audit_record<'a>(
    shared: &'a Shared,
    item: &'a QueueItem,
    recipient: &'a str,
    attempt: u32,
) -> AuditRecord<'a> {
    AuditRecord {
        message_id: item.message.id().as_str(),
        sender: &item.mail_from,
        recipient,
        subject: item.message.subject(),
        action: DeliveryPath::Relay.as_str(),
        mx_host: Some(&shared.config.host),
        attempt,
    }
}

/// Work one item. Leaves `slot` empty once the item is resolved or
/// requeued.
async fn process(shared: &Shared, slot: &mut Option<QueueItem>) {
    let Some(item) = slot.as_mut() else { return };

    let max_age = Duration::from_secs(shared.config.max_age_secs);
    if item.enqueued_at.elapsed() > max_age {
        warn!(message_id = %item.message.id(), "Relay item expired in queue");
        if let Some(item) = slot.take() {
            let reason = format!("Message expired after {max_age:?} in the relay queue");
            for recipient in &item.pending {
                shared.audit.delivery_failure(
                    &audit_record(shared, &item, recipient, item.attempts.max(1)),
                    &reason,
                    DeliveryStatus::Failed.as_str(),
                );
            }
            fail_all(shared, item, &reason);
        }
        return;
    }

    if !shared.rate_limiter.try_acquire(GLOBAL_KEY) {
        let wait = shared.rate_limiter.time_until_available(GLOBAL_KEY);
        let wait = if wait.is_zero() {
            Duration::from_millis(shared.config.throttle_delay_ms)
        } else {
            wait
        };
        internal!(level = DEBUG, "Relay rate limit reached, requeueing for {wait:?}");
        if let Some(mut item) = slot.take() {
            item.next_attempt_at = Instant::now() + wait;
            shared.queue.requeue(item);
        }
        return;
    }

    let attempt = item.attempts + 1;
    for recipient in &item.pending {
        shared
            .audit
            .delivery_attempt(&audit_record(shared, item, recipient, attempt));
    }

    let started = Instant::now();
    let result = send(shared, item).await;

    let Some(mut item) = slot.take() else { return };
    item.attempts = attempt;

    match result {
        Ok(report) => {
            let (code, text) = report
                .reply
                .as_ref()
                .map_or((None, String::new()), |r| (Some(r.code), r.message()));

            for recipient in &report.accepted {
                shared.audit.delivery_success(
                    &audit_record(shared, &item, recipient, attempt),
                    started.elapsed().as_millis(),
                );
                let record =
                    attempt_record(shared, recipient, AttemptStatus::Delivered, code, &text, attempt);
                item.record(recipient, record);
                item.finish(recipient, DeliveryStatus::Delivered);
                shared.counters.sent.incr();
            }

            for (recipient, e) in &report.rejected {
                shared.audit.delivery_failure(
                    &audit_record(shared, &item, recipient, attempt),
                    &e.to_string(),
                    DeliveryStatus::Bounced.as_str(),
                );
                let record = attempt_record(
                    shared,
                    recipient,
                    AttemptStatus::Bounced,
                    e.reply_code(),
                    &e.to_string(),
                    attempt,
                );
                item.record(recipient, record);
                item.finish(recipient, DeliveryStatus::Bounced);
                shared.counters.failed.incr();
            }

            debug!(
                message_id = %item.message.id(),
                accepted = report.accepted.len(),
                rejected = report.rejected.len(),
                "Relay transaction complete"
            );
            item.resolve();
        }
        Err(e) if e.is_permanent() => {
            warn!(message_id = %item.message.id(), error = %e, "Relay rejected message");
            for recipient in item.pending.clone() {
                shared.audit.delivery_failure(
                    &audit_record(shared, &item, &recipient, attempt),
                    &e.to_string(),
                    DeliveryStatus::Bounced.as_str(),
                );
                let record = attempt_record(
                    shared,
                    &recipient,
                    AttemptStatus::Bounced,
                    e.reply_code(),
                    &e.to_string(),
                    attempt,
                );
                item.record(&recipient, record);
                item.finish(&recipient, DeliveryStatus::Bounced);
                shared.counters.failed.incr();
            }
            item.resolve();
        }
        Err(e) => {
            if e.is_system() {
                error!(message_id = %item.message.id(), error = %e, "System error during relay delivery");
            }

            for recipient in item.pending.clone() {
                let record = attempt_record(
                    shared,
                    &recipient,
                    AttemptStatus::Deferred,
                    e.reply_code(),
                    &e.to_string(),
                    attempt,
                );
                item.record(&recipient, record);
            }

            if shared.retry.should_retry(attempt) {
                let delay = shared.retry.delay_for(attempt);
                for recipient in &item.pending {
                    shared.audit.delivery_deferred(
                        &audit_record(shared, &item, recipient, attempt),
                        &e.to_string(),
                    );
                }
                internal!(
                    level = DEBUG,
                    "Relay attempt {attempt} for {} deferred, retrying in {delay:?}: {e}",
                    item.message.id()
                );
                item.next_attempt_at = Instant::now() + delay;
                shared.counters.retried.incr();
                shared.queue.requeue(item);
                return;
            }

            warn!(message_id = %item.message.id(), attempts = attempt, error = %e, "Relay retries exhausted");
            for recipient in item.pending.clone() {
                shared.audit.delivery_failure(
                    &audit_record(shared, &item, &recipient, attempt),
                    &e.to_string(),
                    DeliveryStatus::Failed.as_str(),
                );
                item.finish(&recipient, DeliveryStatus::Failed);
                shared.counters.failed.incr();
            }
            item.resolve();
        }
    }
}

/// One transaction over a pooled connection. Connections that hit a
/// transport error or could not be reset are discarded; ones that got an
/// SMTP reply are kept.
async fn send(shared: &Shared, item: &QueueItem) -> Result<TransmitReport, DeliveryError> {
    let mut connection = shared.pool.checkout().await?;

    let result = transmit(
        connection.client()?,
        &shared.pool.endpoint().timeouts,
        &item.mail_from,
        &item.pending,
        &item.data,
    )
    .await;

    match &result {
        Ok(report) if report.reusable => connection.release(),
        Ok(_) => drop(connection),
        Err(e) if e.reply_code().is_some() => connection.release(),
        Err(_) => drop(connection),
    }
    result
}
