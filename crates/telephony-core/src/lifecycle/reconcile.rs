//! Settling of transient number states against the carrier

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::carrier::CarrierLineState;
use crate::types::{NumberStatus, PhoneNumber};

use super::NumberLifecycleManager;

/// Apply carrier truth to a transient row in place
pub(crate) fn settle(row: &mut PhoneNumber, state: CarrierLineState) {
    match (row.status, state) {
        (NumberStatus::Connecting, CarrierLineState::Connected) => {
            row.status = NumberStatus::Connected;
        }
        (NumberStatus::Connecting, CarrierLineState::Disconnected) => {
            row.status = NumberStatus::Available;
            row.tenant_id = None;
            row.routing = None;
        }
        (NumberStatus::Disconnecting, CarrierLineState::Disconnected) => {
            row.status = NumberStatus::Disconnected;
            row.routing = None;
        }
        // Disconnect never reached the carrier; the tenant keeps the line
        (NumberStatus::Disconnecting, CarrierLineState::Connected) => {
            row.status = NumberStatus::Connected;
        }
        _ => {}
    }
}

/// Periodic sweep over all transient numbers
pub struct Reconciler;

impl Reconciler {
    /// Run [`NumberLifecycleManager::reconcile_pending`] every `interval`
    /// until `shutdown` flips to `true`.
    pub fn spawn(
        manager: Arc<NumberLifecycleManager>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Reconciler started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match manager.reconcile_pending().await {
                            Ok(0) => {}
                            Ok(settled) => debug!(settled, "Reconcile sweep settled numbers"),
                            Err(e) => warn!(error = %e, "Reconcile sweep failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Reconciler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RoutingConfig, E164};

    fn row(status: NumberStatus) -> PhoneNumber {
        let mut row = PhoneNumber::new(E164::parse("+70001112233").unwrap());
        row.tenant_id = Some(5);
        row.status = status;
        row.routing = Some(RoutingConfig::default());
        row
    }

    #[test]
    fn connecting_settles_both_ways() {
        let mut confirmed = row(NumberStatus::Connecting);
        settle(&mut confirmed, CarrierLineState::Connected);
        assert_eq!(confirmed.status, NumberStatus::Connected);
        assert_eq!(confirmed.tenant_id, Some(5));

        let mut refused = row(NumberStatus::Connecting);
        settle(&mut refused, CarrierLineState::Disconnected);
        assert_eq!(refused.status, NumberStatus::Available);
        assert_eq!(refused.tenant_id, None);
    }

    #[test]
    fn disconnecting_keeps_last_owner() {
        let mut row = row(NumberStatus::Disconnecting);
        settle(&mut row, CarrierLineState::Disconnected);
        assert_eq!(row.status, NumberStatus::Disconnected);
        assert_eq!(row.tenant_id, Some(5));
        assert!(row.routing.is_none());
    }

    #[test]
    fn unknown_state_changes_nothing() {
        let mut row = row(NumberStatus::Connecting);
        settle(&mut row, CarrierLineState::Unknown);
        assert_eq!(row.status, NumberStatus::Connecting);
    }
}
