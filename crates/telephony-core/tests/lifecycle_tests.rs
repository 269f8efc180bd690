//! Number lifecycle: connect, disconnect, routing and reconciliation

mod common;

use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::harness;
use dialtone_telephony_core::carrier::CarrierLineState;
use dialtone_telephony_core::catalog::RegisterAssistantRequest;
use dialtone_telephony_core::lifecycle::{ConnectStatus, DisconnectOutcome};
use dialtone_telephony_core::store::NumberStore;
use dialtone_telephony_core::types::{
    ChannelTarget, ChatProvider, CreateChannelRequest, NumberStatus, RoutingConfig,
};
use dialtone_telephony_core::TelephonyError;

const NUMBER: &str = "+70001112233";

#[tokio::test]
async fn test_connect_then_connect_again_reports_already_connected() {
    let h = harness().await;
    let lifecycle = &h.service.lifecycle;

    let report = lifecycle.connect(5, &[NUMBER.to_string()]).await.unwrap();
    assert_eq!(report.status_of(NUMBER), Some(&ConnectStatus::Connected));
    assert_eq!(report.summary(), "done: 1 connected");

    let report = lifecycle.connect(5, &[NUMBER.to_string()]).await.unwrap();
    assert_eq!(report.status_of(NUMBER), Some(&ConnectStatus::AlreadyConnected));
    assert_eq!(report.summary(), "already connected");
    // The second request never reached the carrier
    assert_eq!(h.carrier.connect_calls.load(Ordering::SeqCst), 1);

    let row = lifecycle.get_number(5, NUMBER).await.unwrap();
    assert_eq!(row.status, NumberStatus::Connected);
    assert_eq!(row.tenant_id, Some(5));
}

#[tokio::test]
async fn test_connect_batch_reports_partial_results() {
    let h = harness().await;
    let lifecycle = &h.service.lifecycle;
    h.connect(6, "+70001112244").await;
    h.connect(5, NUMBER).await;

    let requested = vec![
        NUMBER.to_string(),
        "+70001112244".to_string(),
        "+70001112255".to_string(),
        "not-a-number".to_string(),
    ];
    let report = lifecycle.connect(5, &requested).await.unwrap();

    assert_eq!(report.results.len(), 4);
    assert_eq!(report.status_of(NUMBER), Some(&ConnectStatus::AlreadyConnected));
    assert_eq!(report.status_of("+70001112244"), Some(&ConnectStatus::Conflict));
    assert_eq!(report.status_of("+70001112255"), Some(&ConnectStatus::Connected));
    assert!(matches!(
        report.status_of("not-a-number"),
        Some(ConnectStatus::Invalid { .. })
    ));
    assert!(report.is_partial());
    assert!(report.summary().starts_with("partially done: "));

    // The other tenant keeps its number
    let other = lifecycle.get_number(6, "+70001112244").await.unwrap();
    assert_eq!(other.status, NumberStatus::Connected);
}

#[tokio::test]
async fn test_overlapping_batches_from_two_tenants_leave_one_owner_per_number() {
    let h = harness().await;
    let lifecycle = &h.service.lifecycle;
    let a = NUMBER.to_string();
    let b = "+70001112244".to_string();

    let batch_a = [a.clone(), b.clone()];
    let batch_b = [b.clone(), a.clone()];
    let (five, six) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(lifecycle.connect(5, &batch_a), lifecycle.connect(6, &batch_b))
    })
    .await
    .expect("overlapping batches never finished");
    let (five, six) = (five.unwrap(), six.unwrap());

    for number in [&a, &b] {
        let row = h.service.store.get_number(number).await.unwrap().unwrap();
        assert_eq!(row.status, NumberStatus::Connected);
        let (won, lost) = match row.tenant_id {
            Some(5) => (&five, &six),
            Some(6) => (&six, &five),
            other => panic!("unexpected owner {:?}", other),
        };
        assert_eq!(won.status_of(number), Some(&ConnectStatus::Connected));
        assert_eq!(lost.status_of(number), Some(&ConnectStatus::Conflict));
    }
}

#[tokio::test]
async fn test_racing_tenants_get_exactly_one_connect() {
    let h = harness().await;
    let lifecycle = &h.service.lifecycle;
    let requested = [NUMBER.to_string()];

    let reports = tokio::time::timeout(
        Duration::from_secs(5),
        join_all((1..=8).map(|tenant_id| lifecycle.connect(tenant_id, &requested))),
    )
    .await
    .expect("racing connects never finished");

    let mut winners = Vec::new();
    for (tenant_id, report) in (1..=8).zip(reports) {
        match report.unwrap().status_of(NUMBER) {
            Some(ConnectStatus::Connected) => winners.push(tenant_id),
            Some(ConnectStatus::Conflict) => {}
            other => panic!("tenant {} got {:?}", tenant_id, other),
        }
    }
    assert_eq!(winners.len(), 1);
    let row = h.service.store.get_number(NUMBER).await.unwrap().unwrap();
    assert_eq!(row.tenant_id, Some(winners[0]));
    assert_eq!(h.carrier.connect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_normalizes_and_deduplicates_numbers() {
    let h = harness().await;
    let report = h
        .service
        .lifecycle
        .connect(5, &["+7 (000) 111-22-33".to_string(), NUMBER.to_string()])
        .await
        .unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].number, NUMBER);
}

#[tokio::test]
async fn test_carrier_refusal_rolls_back_number() {
    let h = harness().await;
    h.carrier.refuse(NUMBER, "number blocked");

    let report = h.service.lifecycle.connect(5, &[NUMBER.to_string()]).await.unwrap();
    assert_eq!(
        report.status_of(NUMBER),
        Some(&ConnectStatus::Failed { reason: "number blocked".into() })
    );
    assert_eq!(report.summary(), "not done: 1 failed");
    assert!(h.service.lifecycle.list_numbers(5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disconnect_twice_reports_already_disconnected() {
    let h = harness().await;
    let lifecycle = &h.service.lifecycle;
    h.connect(5, NUMBER).await;

    let first = lifecycle.disconnect(5, NUMBER).await.unwrap();
    assert_eq!(first, DisconnectOutcome::Disconnected);

    let second = lifecycle.disconnect(5, NUMBER).await.unwrap();
    assert_eq!(second, DisconnectOutcome::AlreadyDisconnected);
    assert_eq!(second.message(), "already disconnected");
    assert_eq!(h.carrier.disconnect_calls.load(Ordering::SeqCst), 1);

    let row = lifecycle.get_number(5, NUMBER).await.unwrap();
    assert_eq!(row.status, NumberStatus::Disconnected);
    assert!(row.routing.is_none());
}

#[tokio::test]
async fn test_disconnect_checks_ownership() {
    let h = harness().await;
    let lifecycle = &h.service.lifecycle;
    h.connect(5, NUMBER).await;

    let err = lifecycle.disconnect(6, NUMBER).await.unwrap_err();
    assert!(matches!(err, TelephonyError::Unauthorized { .. }));

    let err = lifecycle.disconnect(5, "+70009998877").await.unwrap_err();
    assert!(matches!(err, TelephonyError::NotFound { .. }));
}

#[tokio::test]
async fn test_disconnected_number_can_be_taken_by_another_tenant() {
    let h = harness().await;
    h.connect(5, NUMBER).await;
    h.service.lifecycle.disconnect(5, NUMBER).await.unwrap();

    let report = h.service.lifecycle.connect(6, &[NUMBER.to_string()]).await.unwrap();
    assert_eq!(report.status_of(NUMBER), Some(&ConnectStatus::Connected));
}

#[tokio::test]
async fn test_carrier_timeout_leaves_pending_until_reconciled() {
    let h = harness().await;
    let lifecycle = &h.service.lifecycle;
    h.carrier.set_hang(true);

    let report = lifecycle.connect(5, &[NUMBER.to_string()]).await.unwrap();
    assert_eq!(report.status_of(NUMBER), Some(&ConnectStatus::Pending));
    h.carrier.set_hang(false);

    // Carrier has not settled yet: nothing changes
    assert_eq!(lifecycle.reconcile_pending().await.unwrap(), 0);

    h.carrier.set_line_state(NUMBER, CarrierLineState::Connected);
    assert_eq!(lifecycle.reconcile_pending().await.unwrap(), 1);

    let row = lifecycle.get_number(5, NUMBER).await.unwrap();
    assert_eq!(row.status, NumberStatus::Connected);
}

#[tokio::test]
async fn test_list_numbers_settles_transient_rows() {
    let h = harness().await;
    let lifecycle = &h.service.lifecycle;
    h.carrier.set_hang(true);
    lifecycle.connect(5, &[NUMBER.to_string()]).await.unwrap();
    h.carrier.set_hang(false);
    h.carrier.set_line_state(NUMBER, CarrierLineState::Disconnected);

    // Carrier never provisioned it: the number is released
    let numbers = lifecycle.list_numbers(5).await.unwrap();
    assert!(numbers.is_empty());
}

#[tokio::test]
async fn test_disconnect_timeout_is_pending() {
    let h = harness().await;
    h.connect(5, NUMBER).await;
    h.carrier.set_hang(true);

    let outcome = h.service.lifecycle.disconnect(5, NUMBER).await.unwrap();
    assert_eq!(outcome, DisconnectOutcome::Pending);

    let row = h.service.lifecycle.get_number(5, NUMBER).await.unwrap();
    assert_eq!(row.status, NumberStatus::Disconnecting);
}

#[tokio::test]
async fn test_set_routing_validates_references() {
    let h = harness().await;
    let lifecycle = &h.service.lifecycle;
    let catalog = &h.service.catalog;
    h.connect(5, NUMBER).await;

    let channel = catalog
        .create_channel(
            5,
            CreateChannelRequest {
                name: "Front desk".into(),
                target: ChannelTarget::ChatBot {
                    provider: ChatProvider::Telegram,
                    chat_id: "42".into(),
                    bot_token: "bot-token".into(),
                },
            },
        )
        .await
        .unwrap();
    let foreign = catalog
        .create_channel(
            6,
            CreateChannelRequest {
                name: "Elsewhere".into(),
                target: ChannelTarget::Sms { number: "+79990001122".into() },
            },
        )
        .await
        .unwrap();
    catalog
        .register_assistant(5, RegisterAssistantRequest { id: "asst-1".into(), name: "Receptionist".into() })
        .await
        .unwrap();

    let unknown = RoutingConfig {
        channel_ids: vec!["missing".into()],
        ..Default::default()
    };
    let err = lifecycle.set_routing(5, NUMBER, unknown).await.unwrap_err();
    assert!(matches!(err, TelephonyError::NotFound { .. }));

    let stolen = RoutingConfig {
        channel_ids: vec![foreign.id.clone()],
        ..Default::default()
    };
    let err = lifecycle.set_routing(5, NUMBER, stolen).await.unwrap_err();
    assert!(matches!(err, TelephonyError::Unauthorized { .. }));

    let long_prompt = RoutingConfig {
        prompt: Some("x".repeat(4001)),
        ..Default::default()
    };
    let err = lifecycle.set_routing(5, NUMBER, long_prompt).await.unwrap_err();
    assert!(matches!(err, TelephonyError::Validation { .. }));

    let routing = RoutingConfig {
        assistant_id: Some("asst-1".into()),
        channel_ids: vec![channel.id.clone(), channel.id.clone()],
        function_ids: vec![],
        prompt: Some("Greet callers and take bookings".into()),
    };
    let row = lifecycle.set_routing(5, NUMBER, routing).await.unwrap();
    let stored = row.routing.unwrap();
    assert_eq!(stored.channel_ids, vec![channel.id]);
    assert_eq!(stored.assistant_id.as_deref(), Some("asst-1"));
}

#[tokio::test]
async fn test_set_routing_requires_connected_number() {
    let h = harness().await;
    h.connect(5, NUMBER).await;
    h.service.lifecycle.disconnect(5, NUMBER).await.unwrap();

    let err = h
        .service
        .lifecycle
        .set_routing(5, NUMBER, RoutingConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TelephonyError::InvalidTransition { .. }));
}
