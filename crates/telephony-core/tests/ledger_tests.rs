//! Balance ledger behaviour against a real SQLite store

mod common;

use common::{harness, harness_with, test_config};
use dialtone_telephony_core::config::BalanceScope;
use dialtone_telephony_core::ledger::{AccountKey, Delta, EntryKind};
use dialtone_telephony_core::TelephonyError;

#[tokio::test]
async fn test_unopened_account_shows_free_minute_grant() {
    let h = harness().await;
    let balance = h.service.ledger.balance(&AccountKey::tenant(5)).await.unwrap();

    assert_eq!(balance.funds, 0);
    assert_eq!(balance.free_minutes, 10);
    assert_eq!(balance.available_minutes, 10);
}

#[tokio::test]
async fn test_same_idempotency_key_applies_once() {
    let h = harness().await;
    let ledger = &h.service.ledger;
    let account = AccountKey::tenant(5);

    let first = ledger
        .apply_delta(&account, Delta::Adjustment { amount: 1000 }, "top-up", "topup-1")
        .await
        .unwrap();
    let second = ledger
        .apply_delta(&account, Delta::Adjustment { amount: 1000 }, "top-up", "topup-1")
        .await
        .unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.entry.id, second.entry.id);
    assert_eq!(ledger.balance(&account).await.unwrap().funds, 1000);
}

#[tokio::test]
async fn test_concurrent_deltas_on_one_account_all_land() {
    let h = harness().await;
    let account = AccountKey::tenant(5);

    let mut handles = Vec::new();
    for i in 0..20 {
        let ledger = h.service.ledger.clone();
        let account = account.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .apply_delta(&account, Delta::Adjustment { amount: 100 }, "top-up", &format!("topup-{}", i))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let balance = h.service.ledger.balance(&account).await.unwrap();
    assert_eq!(balance.funds, 2000);

    let audit = h.service.ledger.audit(&account).await.unwrap();
    assert!(audit.consistent);
    // open entry plus 20 top-ups
    assert_eq!(audit.entries, 21);
}

#[tokio::test]
async fn test_concurrent_retries_of_one_key_charge_once() {
    let h = harness().await;
    let account = AccountKey::tenant(5);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = h.service.ledger.clone();
        let account = account.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .apply_delta(&account, Delta::Usage { minutes: 12, rate: 500 }, "call c-1", "call:c-1")
                .await
        }));
    }
    let mut fresh = 0;
    for handle in handles {
        if !handle.await.unwrap().unwrap().duplicate {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);

    let balance = h.service.ledger.balance(&account).await.unwrap();
    assert_eq!(balance.free_minutes, 0);
    assert_eq!(balance.funds, -1000);
}

#[tokio::test]
async fn test_usage_consumes_free_minutes_before_funds() {
    let h = harness().await;
    let ledger = &h.service.ledger;
    let account = AccountKey::tenant(5);

    let outcome = ledger
        .apply_delta(&account, Delta::Usage { minutes: 3, rate: 500 }, "call a", "call:a")
        .await
        .unwrap();
    assert_eq!(outcome.entry.kind, EntryKind::Usage);
    assert_eq!(outcome.entry.free_minutes_used(), 3);
    assert_eq!(outcome.entry.charged(), 0);
    assert_eq!(ledger.available_minutes(&account).await.unwrap(), 7);

    let outcome = ledger
        .apply_delta(&account, Delta::Usage { minutes: 15, rate: 500 }, "call b", "call:b")
        .await
        .unwrap();
    assert_eq!(outcome.entry.free_minutes_used(), 7);
    assert_eq!(outcome.entry.charged(), 4000);
    assert_eq!(outcome.entry.funds_after, -4000);
    assert_eq!(ledger.available_minutes(&account).await.unwrap(), 0);
}

#[tokio::test]
async fn test_debit_beyond_balance_is_insufficient_funds() {
    let h = harness().await;
    let ledger = &h.service.ledger;
    let account = AccountKey::tenant(5);

    ledger
        .apply_delta(&account, Delta::Adjustment { amount: 300 }, "top-up", "topup-1")
        .await
        .unwrap();
    let err = ledger
        .apply_delta(&account, Delta::Debit { amount: 500 }, "number fee", "fee-1")
        .await
        .unwrap_err();

    match err {
        TelephonyError::InsufficientFunds { requested, available } => {
            assert_eq!(requested, 500);
            assert_eq!(available, 300);
        }
        other => panic!("Expected InsufficientFunds, got {:?}", other),
    }
    assert_eq!(ledger.balance(&account).await.unwrap().funds, 300);
}

#[tokio::test]
async fn test_authorize_minutes_checks_available_minutes() {
    let h = harness().await;
    let ledger = &h.service.ledger;
    let account = AccountKey::tenant(5);

    ledger.authorize_minutes(&account, 10).await.unwrap();
    let err = ledger.authorize_minutes(&account, 11).await.unwrap_err();
    assert!(matches!(err, TelephonyError::InsufficientFunds { .. }));
}

#[tokio::test]
async fn test_overage_disabled_records_uncollected_usage() {
    let mut config = test_config();
    config.billing.allow_overage = false;
    config.billing.free_minutes = 0;
    let h = harness_with(config).await;
    let ledger = &h.service.ledger;
    let account = AccountKey::tenant(5);

    ledger
        .apply_delta(&account, Delta::Adjustment { amount: 1000 }, "top-up", "topup-1")
        .await
        .unwrap();
    let outcome = ledger
        .apply_delta(&account, Delta::Usage { minutes: 3, rate: 500 }, "call a", "call:a")
        .await
        .unwrap();

    assert_eq!(outcome.entry.funds_after, 0);
    assert_eq!(outcome.entry.uncollected, 500);
    assert_eq!(outcome.entry.charged(), 1500);

    let audit = ledger.audit(&account).await.unwrap();
    assert!(audit.consistent);
    assert_eq!(audit.total_uncollected, 500);
}

#[tokio::test]
async fn test_number_scope_keeps_separate_accounts() {
    let mut config = test_config();
    config.billing.scope = BalanceScope::Number;
    let h = harness_with(config).await;
    let ledger = &h.service.ledger;

    let first = ledger.account_for(5, "+70001112233");
    let second = ledger.account_for(5, "+70001112244");
    assert_ne!(first, second);

    ledger
        .apply_delta(&first, Delta::Usage { minutes: 4, rate: 500 }, "call a", "call:a")
        .await
        .unwrap();

    assert_eq!(ledger.available_minutes(&first).await.unwrap(), 6);
    assert_eq!(ledger.available_minutes(&second).await.unwrap(), 10);
}

#[tokio::test]
async fn test_free_minute_revoke_below_zero_is_rejected() {
    let h = harness().await;
    let ledger = &h.service.ledger;
    let account = AccountKey::tenant(5);

    let err = ledger
        .apply_delta(&account, Delta::FreeMinutes { minutes: -11 }, "revoke", "revoke-1")
        .await
        .unwrap_err();
    assert!(matches!(err, TelephonyError::Validation { .. }));

    ledger
        .apply_delta(&account, Delta::FreeMinutes { minutes: 5 }, "promo", "promo-1")
        .await
        .unwrap();
    assert_eq!(ledger.balance(&account).await.unwrap().free_minutes, 15);
}
