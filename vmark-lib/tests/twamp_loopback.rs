use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::sync::watch;
use vmark_lib::twamp::{
    bind_udp, Responder, Sender, SenderConfig, SessionReport, SocketOptions,
};

async fn spawn_responder(padding: usize) -> (SocketAddr, watch::Sender<bool>) {
    let socket = bind_udp(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        &SocketOptions::default(),
    )
    .expect("bind responder socket");
    let responder = Responder::from_socket(socket, padding);
    let addr = responder.local_addr().expect("responder addr");
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = responder.run(&mut shutdown_rx).await;
    });
    (addr, shutdown_tx)
}

fn sender_config(target: SocketAddr, count: u32, interval_ms: u64) -> SenderConfig {
    SenderConfig {
        destination: target.ip(),
        port: target.port(),
        count,
        interval: Duration::from_millis(interval_ms),
        padding: 0,
        socket: SocketOptions::default(),
    }
}

fn assert_finite(report: &SessionReport) {
    for stats in [&report.outbound, &report.inbound, &report.roundtrip] {
        let stats = stats.as_ref().expect("stats present");
        assert!(stats.min_ns <= stats.avg_ns && stats.avg_ns <= stats.max_ns);
    }
}

#[tokio::test]
async fn s5_loopback_session_matches_all_packets() {
    let (addr, _shutdown) = spawn_responder(0).await;
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);

    let report = Sender::new(sender_config(addr, 10, 100))
        .expect("valid config")
        .run(&mut cancel_rx)
        .await
        .expect("session runs");

    assert_eq!(report.sent, 10);
    assert_eq!(report.matched, 10);
    assert_eq!(report.lost, 0);
    assert_eq!(report.loss_pct, 0.0);
    assert_eq!(report.matched + report.lost, report.count);
    assert!(!report.canceled);
    assert_finite(&report);

    // Same host, same clock: one-way means stay well under 10 ms.
    assert!(report.outbound.unwrap().avg_ms().abs() < 10.0);
    assert!(report.inbound.unwrap().avg_ms().abs() < 10.0);
}

#[tokio::test]
async fn s6_absent_responder_reports_full_loss_without_error() {
    // Grab an ephemeral port and release it so nothing listens there.
    let port = {
        let socket = bind_udp(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            &SocketOptions::default(),
        )
        .expect("bind probe socket");
        socket.local_addr().expect("probe addr").port()
    };
    let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);

    let report = Sender::new(sender_config(target, 5, 10))
        .expect("valid config")
        .run(&mut cancel_rx)
        .await
        .expect("run returns a report, not a network error");

    assert_eq!(report.matched, 0);
    assert_eq!(report.lost, 5);
    assert_eq!(report.loss_pct, 100.0);
    assert_eq!(report.matched + report.lost, report.count);
    assert!(report.outbound.is_none());
}

#[tokio::test]
async fn cancellation_returns_partial_statistics() {
    let (addr, _shutdown) = spawn_responder(0).await;
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let session = tokio::spawn(async move {
        Sender::new(sender_config(addr, 100, 50))
            .expect("valid config")
            .run(&mut cancel_rx)
            .await
    });
    tokio::time::sleep(Duration::from_millis(250)).await;
    cancel_tx.send(true).expect("cancel");

    let report = session.await.expect("join").expect("partial report");
    assert!(report.canceled);
    assert!(report.sent < 100, "pacer should stop early, sent {}", report.sent);
    assert!(report.matched >= 1);
    assert_eq!(report.matched + report.lost, report.count);
}

#[tokio::test]
async fn responder_echoes_padding_configuration() {
    let (addr, _shutdown) = spawn_responder(64).await;
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);

    let report = Sender::new(sender_config(addr, 2, 10))
        .expect("valid config")
        .run(&mut cancel_rx)
        .await
        .expect("session runs");
    assert_eq!(report.matched, 2);
}

#[test]
fn sender_config_ranges_are_enforced() {
    let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000);
    for (count, interval_ms, padding) in
        [(0, 100, 0), (10_000, 100, 0), (10, 5, 0), (10, 2000, 0), (10, 100, 9001)]
    {
        let mut config = sender_config(target, count, interval_ms);
        config.padding = padding;
        assert!(
            Sender::new(config).is_err(),
            "count={count} interval={interval_ms} padding={padding} should be rejected"
        );
    }
}
