//! Property-based store invariants (proptest).

use chrono::{Duration, Utc};
use proptest::prelude::*;
use tempfile::TempDir;
use trafficrl::config::DurabilityMode;
use trafficrl::statistics::{convergence, moving_average};
use trafficrl::{
    CloseOutcome, ConfigSnapshot, EpisodeMetrics, SessionResult, SessionStatus, TelemetryStore,
};

fn open_store(temp: &TempDir) -> TelemetryStore {
    TelemetryStore::open_at(temp.path(), DurabilityMode::Batched, 0).unwrap()
}

fn terminal_result() -> impl Strategy<Value = SessionResult> {
    prop_oneof![
        Just(SessionResult::completed()),
        Just(SessionResult::stopped()),
        Just(SessionResult::failed("boom")),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Best score is the maximum reward seen and the count is the number of episodes
    #[test]
    fn prop_best_score_is_max_reward(rewards in prop::collection::vec(-10.0f64..10.0, 1..60)) {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.start_session("s", ConfigSnapshot::new()).unwrap();

        for (i, reward) in rewards.iter().enumerate() {
            store
                .record_progress("s", EpisodeMetrics::new(i as u64 + 1, *reward, 0.5, 0.5))
                .unwrap();
        }

        let session = store.get_session("s").unwrap();
        let max = rewards.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        prop_assert_eq!(session.best_score, Some(max));
        prop_assert_eq!(session.episode_count, rewards.len() as u64);
    }

    /// Only the first close changes anything
    #[test]
    fn prop_close_is_idempotent(results in prop::collection::vec(terminal_result(), 1..6)) {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.start_session("s", ConfigSnapshot::new()).unwrap();

        let first_status = results[0].status;
        let mut outcomes = Vec::new();
        for result in results {
            outcomes.push(store.end_session("s", result).unwrap());
        }

        prop_assert_eq!(outcomes[0], CloseOutcome::Closed);
        prop_assert!(outcomes[1..].iter().all(|o| *o == CloseOutcome::AlreadyClosed));
        prop_assert_eq!(store.get_session("s").unwrap().status, first_status);
    }

    /// Purge never removes a running session, whatever its age
    #[test]
    fn prop_purge_keeps_running_sessions(
        ages in prop::collection::vec((0i64..400, any::<bool>()), 1..20),
        days in 0u32..365,
    ) {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let now = Utc::now();

        for (i, (age, closed)) in ages.iter().enumerate() {
            let id = format!("s{i}");
            let at = now - Duration::days(*age);
            store.start_session_at(&id, ConfigSnapshot::new(), at).unwrap();
            if *closed {
                store.end_session_at(&id, SessionResult::completed(), at).unwrap();
            }
        }

        store.purge_older_than_at(days, now).unwrap();

        let cutoff = now - Duration::days(i64::from(days));
        for (i, (age, closed)) in ages.iter().enumerate() {
            let id = format!("s{i}");
            let present = store.get_session(&id);
            if !closed {
                prop_assert_eq!(present.map(|s| s.status), Some(SessionStatus::Running));
            } else if now - Duration::days(*age) >= cutoff {
                prop_assert!(present.is_some());
            } else {
                prop_assert!(present.is_none());
            }
        }
    }

    /// Moving average stays within the range of its input
    #[test]
    fn prop_moving_average_bounded(
        values in prop::collection::vec(-100.0f64..100.0, 1..80),
        window in 1usize..20,
    ) {
        let averaged = moving_average(&values, window);
        prop_assert_eq!(averaged.len(), values.len());
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        for v in averaged {
            prop_assert!(v >= min - 1e-9 && v <= max + 1e-9);
        }
    }

    /// A constant reward series always converges once two windows exist
    #[test]
    fn prop_constant_series_converges(value in -5.0f64..5.0, window in 1usize..10, extra in 0usize..10) {
        let rewards = vec![value; window * 2 + extra];
        let c = convergence(&rewards, window, 0.01).unwrap();
        prop_assert!(c.converged);
        prop_assert!(c.delta.abs() < 1e-9);
    }
}
