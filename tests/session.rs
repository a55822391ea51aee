mod common;

use common::{loopback_config, wait_for_event, wait_for_status, MemorySignaling};
use contact_rtc::config::NegotiationConfig;
use contact_rtc::peer::{ConnectionStatus, PeerEvent, SurfaceKind};
use contact_rtc::{Error, NegotiationOutcome, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const CONNECT_WITHIN: Duration = Duration::from_secs(30);

fn session(signaling: &Arc<MemorySignaling>, user: &str, contact: &str) -> Session {
    Session::new(
        &loopback_config(),
        SurfaceKind::Chat,
        user,
        contact,
        signaling.clone(),
    )
    .unwrap()
}

fn quick_session(signaling: &Arc<MemorySignaling>, max_attempts: u32) -> Session {
    let mut config = loopback_config();
    config.peer.gather_timeout = Duration::from_millis(500);
    config.negotiation = NegotiationConfig {
        max_attempts,
        retry_delay: Duration::from_millis(50),
    };
    Session::new(&config, SurfaceKind::Chat, "alice", "nobody", signaling.clone()).unwrap()
}

#[tokio::test]
async fn two_contacts_find_each_other() {
    let signaling = Arc::new(MemorySignaling::default());
    let alice = session(&signaling, "alice", "bob");
    let bob = session(&signaling, "bob", "alice");
    let mut bob_events = bob.events();

    let (alice_pending, bob_pending) = tokio::join!(alice.connect(), bob.connect());
    let (alice_report, bob_report) = timeout(CONNECT_WITHIN, async {
        tokio::join!(alice_pending.unwrap().wait(), bob_pending.unwrap().wait())
    })
    .await
    .expect("negotiation finished");

    let alice_report = alice_report.unwrap();
    let bob_report = bob_report.unwrap();
    assert!(alice_report.outcome.is_established(), "{:?}", alice_report.outcome);
    assert!(bob_report.outcome.is_established(), "{:?}", bob_report.outcome);
    assert_eq!(signaling.accepted_for("alice"), 1);
    assert_eq!(signaling.accepted_for("bob"), 1);

    assert!(wait_for_status(alice.status(), ConnectionStatus::Connected, CONNECT_WITHIN).await);
    assert!(wait_for_status(bob.status(), ConnectionStatus::Connected, CONNECT_WITHIN).await);

    let mut delivered = false;
    for _ in 0..100 {
        if alice.send("hi bob").await.unwrap() {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(delivered);
    let message = wait_for_event(&mut bob_events, CONNECT_WITHIN, |e| {
        matches!(e, PeerEvent::Message(_))
    })
    .await;
    assert_eq!(message, Some(PeerEvent::Message("hi bob".into())));

    alice.close().await;
    bob.close().await;
    assert_eq!(alice.current_status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn exhausted_negotiation_releases_the_connection() {
    let signaling = Arc::new(MemorySignaling::default());
    let alice = quick_session(&signaling, 2);

    let report = alice.connect().await.unwrap().wait().await.unwrap();

    assert!(matches!(report.outcome, NegotiationOutcome::Exhausted));
    assert_eq!(report.state.attempt, 2);
    assert!(report.state.offer_created);
    assert_eq!(signaling.all().len(), 1);
    assert!(alice.manager().handle().is_none());
    assert_eq!(alice.current_status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn close_stops_polling() {
    let signaling = Arc::new(MemorySignaling::default());
    let alice = quick_session(&signaling, 1000);

    let pending = alice.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    alice.close().await;
    alice.close().await;

    let report = pending.wait().await.unwrap();
    assert!(matches!(report.outcome, NegotiationOutcome::Cancelled));

    let calls = signaling.list_calls();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(signaling.list_calls(), calls);
    assert!(alice.manager().handle().is_none());
    assert!(alice.is_closed());
    assert!(matches!(alice.connect().await, Err(Error::Closed)));
    assert!(!alice.send("anyone?").await.unwrap());
}

#[tokio::test]
async fn reconnect_cancels_the_running_loop() {
    let signaling = Arc::new(MemorySignaling::default());
    let alice = quick_session(&signaling, 1000);

    let first = alice.connect().await.unwrap();
    let first_handle = alice.manager().handle().unwrap();
    let second = alice.connect().await.unwrap();

    let report = first.wait().await.unwrap();
    assert!(matches!(report.outcome, NegotiationOutcome::Cancelled));
    let second_handle = alice.manager().handle().unwrap();
    assert!(second_handle.generation > first_handle.generation);

    alice.close().await;
    let report = second.wait().await.unwrap();
    assert!(matches!(report.outcome, NegotiationOutcome::Cancelled));
}

#[tokio::test]
async fn overlapping_connects_leave_one_loop() {
    let signaling = Arc::new(MemorySignaling::default());
    let alice = quick_session(&signaling, 1000);

    let (first, second) = tokio::join!(alice.connect(), alice.connect());
    let (first, second) = (first.unwrap(), second.unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;
    alice.close().await;

    let reports = timeout(Duration::from_secs(5), async {
        tokio::join!(first.wait(), second.wait())
    })
    .await
    .expect("both loops ended");
    assert!(matches!(reports.0.unwrap().outcome, NegotiationOutcome::Cancelled));
    assert!(matches!(reports.1.unwrap().outcome, NegotiationOutcome::Cancelled));

    let calls = signaling.list_calls();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(signaling.list_calls(), calls);
}

#[tokio::test]
async fn dropping_a_session_stops_its_loop() {
    let signaling = Arc::new(MemorySignaling::default());
    let alice = quick_session(&signaling, 1000);

    let pending = alice.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(alice);

    assert!(timeout(Duration::from_secs(5), pending.wait()).await.is_ok());
    let calls = signaling.list_calls();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(signaling.list_calls(), calls);
}
