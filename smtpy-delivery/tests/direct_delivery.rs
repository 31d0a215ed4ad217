//! Integration tests for direct MX delivery against a mock SMTP server

mod support;

use std::{sync::Arc, time::Duration};

use smtpy_common::{Message, MessageBuilder};
use smtpy_delivery::{
    AttemptStatus, DeliveryPath, DeliveryStatus, DirectConfig, DirectDeliveryService, DnsConfig,
    MailServer, MxLookup, MxResolver, RateLimiter, SmtpTimeouts, StaticMxLookup, policy::RetryPolicy,
};
use support::mock_server::{MockSmtpServer, SmtpCommand};
use tokio::{net::TcpListener, time::Instant};

const MAIL_FROM: &str = "sender@origin.example";

fn message() -> Message {
    MessageBuilder::new()
        .from(MAIL_FROM)
        .to("user@dest.example")
        .subject("Integration")
        .body("Hello from the delivery tests\r\n")
        .build()
        .unwrap()
}

fn local(port: u16, priority: u16) -> MailServer {
    MailServer::new("127.0.0.1", priority, port)
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn service(
    lookup: &Arc<StaticMxLookup>,
    attempts: u32,
    base_delay: Duration,
) -> DirectDeliveryService {
    let shared: Arc<dyn MxLookup> = lookup.clone();
    let resolver = Arc::new(MxResolver::new(shared, DnsConfig::default()));
    DirectDeliveryService::new("mta.origin.example", DirectConfig::default(), resolver)
        .with_retry_policy(RetryPolicy::with_base_delay(attempts, base_delay))
        .with_timeouts(SmtpTimeouts::uniform(Duration::from_secs(5)))
}

#[tokio::test]
async fn test_delivers_and_caches_mx() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let lookup = Arc::new(
        StaticMxLookup::new().with_servers("dest.example", vec![local(server.port(), 10)]),
    );
    let service = service(&lookup, 3, Duration::from_millis(10));

    let first = service
        .send_one(&message(), "user@dest.example", MAIL_FROM)
        .await;
    let second = service
        .send_one(&message(), "other@dest.example", MAIL_FROM)
        .await;

    assert_eq!(first.status, DeliveryStatus::Delivered);
    assert_eq!(second.status, DeliveryStatus::Delivered);
    assert_eq!(first.code, Some(250));
    assert_eq!(first.attempts.len(), 1);
    assert_eq!(first.attempts[0].path, DeliveryPath::Direct);

    // Second domain resolution served from cache
    assert_eq!(lookup.queries(), 1);
    let stats = service.resolver().cache_stats();
    assert_eq!(stats.mx_lookups, 2);
    assert_eq!(stats.mx_cache_hits, 1);
    assert_eq!(service.stats().sent, 2);

    let commands = server.commands().await;
    assert!(commands.contains(&SmtpCommand::RcptTo("TO:<user@dest.example>".to_string())));
    assert_eq!(server.message_count(), 2);

    server.shutdown();
}

#[tokio::test]
async fn test_permanent_rejection_bounces_without_retry() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(550, "User unknown")
        .build()
        .await
        .unwrap();
    let lookup = Arc::new(
        StaticMxLookup::new().with_servers("dest.example", vec![local(server.port(), 10)]),
    );
    let service = service(&lookup, 3, Duration::from_millis(10));

    let outcome = service
        .send_one(&message(), "nobody@dest.example", MAIL_FROM)
        .await;

    assert_eq!(outcome.status, DeliveryStatus::Bounced);
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(outcome.code, Some(550));
    assert_eq!(outcome.attempts[0].status, AttemptStatus::Bounced);
    assert_eq!(server.message_count(), 0);
    assert!(!server.commands().await.contains(&SmtpCommand::Data));
    assert_eq!(service.stats().bounced, 1);

    server.shutdown();
}

#[tokio::test]
async fn test_unreachable_host_retries_with_backoff() {
    let port = closed_port().await;
    let lookup =
        Arc::new(StaticMxLookup::new().with_servers("dest.example", vec![local(port, 10)]));
    let service = service(&lookup, 3, Duration::from_millis(50));

    let started = Instant::now();
    let outcome = service
        .send_one(&message(), "user@dest.example", MAIL_FROM)
        .await;

    assert_eq!(outcome.status, DeliveryStatus::Failed);
    assert_eq!(outcome.attempts.len(), 3);
    assert!(
        outcome
            .attempts
            .iter()
            .all(|a| a.status == AttemptStatus::Deferred)
    );
    // 50ms after the first attempt, 100ms after the second
    assert!(started.elapsed() >= Duration::from_millis(150));

    // Unreachable hosts are dropped from the cache and resolved again
    assert_eq!(lookup.queries(), 3);
    let stats = service.stats();
    assert_eq!(stats.deferred, 3);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_temporary_reply_then_success() {
    let server = MockSmtpServer::builder()
        .with_data_end_sequence(&[(451, "Try again later"), (250, "OK: queued")])
        .build()
        .await
        .unwrap();
    let lookup = Arc::new(
        StaticMxLookup::new().with_servers("dest.example", vec![local(server.port(), 10)]),
    );
    let service = service(&lookup, 3, Duration::from_millis(10));

    let outcome = service
        .send_one(&message(), "user@dest.example", MAIL_FROM)
        .await;

    assert_eq!(outcome.status, DeliveryStatus::Delivered);
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(outcome.attempts[0].status, AttemptStatus::Deferred);
    assert_eq!(outcome.attempts[0].code, Some(451));
    assert_eq!(outcome.attempts[1].attempt, 2);

    server.shutdown();
}

#[tokio::test]
async fn test_next_mx_tried_when_first_unreachable() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let dead = closed_port().await;
    let lookup = Arc::new(StaticMxLookup::new().with_servers(
        "dest.example",
        vec![local(dead, 10), local(server.port(), 20)],
    ));
    let service = service(&lookup, 1, Duration::from_millis(10));

    let outcome = service
        .send_one(&message(), "user@dest.example", MAIL_FROM)
        .await;

    assert_eq!(outcome.status, DeliveryStatus::Delivered);
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(server.message_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_stalled_server_times_out() {
    let server = MockSmtpServer::builder()
        .with_timeout_on_command(0)
        .build()
        .await
        .unwrap();
    let lookup = Arc::new(
        StaticMxLookup::new().with_servers("dest.example", vec![local(server.port(), 10)]),
    );
    let service = service(&lookup, 1, Duration::from_millis(10))
        .with_timeouts(SmtpTimeouts::uniform(Duration::from_millis(200)));

    let started = Instant::now();
    let outcome = service
        .send_one(&message(), "user@dest.example", MAIL_FROM)
        .await;

    assert_eq!(outcome.status, DeliveryStatus::Failed);
    assert!(started.elapsed() < Duration::from_secs(5));

    server.shutdown();
}

#[tokio::test]
async fn test_bulk_mixed_domains() {
    let good = MockSmtpServer::builder().build().await.unwrap();
    let bad = MockSmtpServer::builder()
        .with_rcpt_to_response(550, "No such user")
        .build()
        .await
        .unwrap();
    let lookup = Arc::new(
        StaticMxLookup::new()
            .with_servers("good.example", vec![local(good.port(), 10)])
            .with_servers("bad.example", vec![local(bad.port(), 10)]),
    );
    let service = service(&lookup, 3, Duration::from_millis(10));

    let recipients = vec![
        "a@good.example".to_string(),
        "b@bad.example".to_string(),
        "a@good.example".to_string(),
    ];
    let outcomes = service
        .send_bulk(&message(), &recipients, MAIL_FROM)
        .await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes["a@good.example"].status, DeliveryStatus::Delivered);
    assert_eq!(outcomes["b@bad.example"].status, DeliveryStatus::Bounced);
    assert_eq!(good.message_count(), 1);

    good.shutdown();
    bad.shutdown();
}

#[tokio::test]
async fn test_domain_rate_limit_blocks_connection() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let lookup = Arc::new(
        StaticMxLookup::new().with_servers("dest.example", vec![local(server.port(), 10)]),
    );
    let service = service(&lookup, 1, Duration::from_millis(10))
        .with_rate_limiter(RateLimiter::new(1, Duration::from_secs(60)));

    let first = service
        .send_one(&message(), "one@dest.example", MAIL_FROM)
        .await;
    let second = service
        .send_one(&message(), "two@dest.example", MAIL_FROM)
        .await;

    assert_eq!(first.status, DeliveryStatus::Delivered);
    assert_eq!(second.status, DeliveryStatus::Failed);
    assert!(second.message.contains("limit"));
    assert_eq!(server.connection_count(), 1);

    server.shutdown();
}
