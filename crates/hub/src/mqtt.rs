use irrigation_planner::{ChannelId, ReloadOutcome};
use tracing::{error, info, warn};

use crate::scheduler::Planner;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Incoming irrigation documents (JSON).
pub(crate) const CONFIG_TOPIC: &str = "irrigation/config/set";

pub(crate) fn is_config_topic(topic: &str) -> bool {
    topic == CONFIG_TOPIC
}

/// Outgoing channel state, "irrigation/channel/<n>/state".
pub(crate) fn channel_state_topic(channel: ChannelId) -> String {
    format!("irrigation/channel/{}/state", channel.0)
}

pub(crate) fn state_payload(on: bool) -> &'static [u8] {
    if on {
        b"ON"
    } else {
        b"OFF"
    }
}

// ---------------------------------------------------------------------------
// Config intake
// ---------------------------------------------------------------------------

/// Store a received irrigation document and notify the planner. Rejected
/// documents leave the active configuration untouched.
pub(crate) async fn handle_config_message(planner: &Planner, shared: &SharedState, payload: &[u8]) {
    if let Err(e) = planner.source().update_irrigation_config(payload) {
        warn!("rejected irrigation config: {e:#}");
        shared
            .write()
            .await
            .record_error(format!("rejected irrigation config: {e:#}"));
        return;
    }

    match planner.on_config_updated().await {
        Ok(ReloadOutcome::Applied) => {
            shared
                .write()
                .await
                .record_config("irrigation config applied".to_string());
        }
        Ok(ReloadOutcome::Postponed) => {
            info!("irrigation config stored, waiting for running events to finish");
            shared
                .write()
                .await
                .record_config("irrigation config postponed until watering ends".to_string());
        }
        Err(e) => {
            error!("irrigation config not applied: {e}");
            shared
                .write()
                .await
                .record_error(format!("irrigation config not applied: {e}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingsManager;
    use crate::state::{ActivityKind, SystemState};
    use chrono_tz::Tz;
    use irrigation_planner::IrrigationPlanner;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    const DOCUMENT: &str = r#"{
        "zones": [{"name": "Lawn", "channels": [{"channel": 0, "start": true, "stop": false}]}],
        "events": [{"zone": 0, "duration": 600, "schedule": {"type": "daily", "time": "06:00:00"}}]
    }"#;

    fn planner() -> Planner {
        IrrigationPlanner::new(SettingsManager::new(), Tz::UTC)
    }

    fn shared() -> SharedState {
        Arc::new(RwLock::new(SystemState::new(&[])))
    }

    // -- Topic helpers ------------------------------------------------------

    #[test]
    fn config_topic_matches_exactly() {
        assert!(is_config_topic("irrigation/config/set"));
        assert!(!is_config_topic("irrigation/config/get"));
        assert!(!is_config_topic("irrigation/config/set/extra"));
        assert!(!is_config_topic(""));
    }

    #[test]
    fn channel_state_topic_uses_numeric_id() {
        assert_eq!(
            channel_state_topic(ChannelId(3)),
            "irrigation/channel/3/state"
        );
    }

    #[test]
    fn state_payload_on_off() {
        assert_eq!(state_payload(true), b"ON");
        assert_eq!(state_payload(false), b"OFF");
    }

    // -- Config intake ------------------------------------------------------

    #[tokio::test]
    async fn valid_document_is_applied() {
        let planner = planner();
        let shared = shared();

        handle_config_message(&planner, &shared, DOCUMENT.as_bytes()).await;

        let plan = planner.lock_plan().await.unwrap();
        assert_eq!(plan.live_start_events(), 1);
        assert_eq!(plan.zone_config(0).unwrap().name(), "Lawn");
        let st = shared.read().await;
        assert_eq!(st.activity.back().unwrap().kind, ActivityKind::Config);
    }

    #[tokio::test]
    async fn invalid_document_is_recorded_and_ignored() {
        let planner = planner();
        let shared = shared();

        handle_config_message(&planner, &shared, b"{\"zones\": 5}").await;

        assert_eq!(planner.lock_plan().await.unwrap().live_start_events(), 0);
        let st = shared.read().await;
        let last = st.activity.back().unwrap();
        assert_eq!(last.kind, ActivityKind::Error);
        assert!(last.detail.starts_with("rejected irrigation config"));
    }

    #[tokio::test]
    async fn document_is_postponed_while_locked() {
        let planner = planner();
        let shared = shared();
        planner.set_lock(true).await.unwrap();

        handle_config_message(&planner, &shared, DOCUMENT.as_bytes()).await;
        assert_eq!(planner.lock_plan().await.unwrap().live_start_events(), 0);
        assert!(shared
            .read()
            .await
            .activity
            .back()
            .unwrap()
            .detail
            .contains("postponed"));

        planner.set_lock(false).await.unwrap();
        assert_eq!(planner.lock_plan().await.unwrap().live_start_events(), 1);
    }
}
