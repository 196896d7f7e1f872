//! Two-press delete confirmation.
//!
//! The first press arms the target until `expires_at`; a second press before
//! then confirms. Expiry is a timestamp compared against the caller's clock,
//! so there is no timer to cancel.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteConfirmation {
    #[default]
    Unarmed,
    Armed { expires_at: DateTime<Utc> },
}

/// Result of pressing delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressOutcome {
    /// Waiting for a second press before `expires_at`.
    Armed { expires_at: DateTime<Utc> },
    /// Second press arrived in time; the delete should run.
    Confirmed,
}

impl DeleteConfirmation {
    pub fn is_armed(&self, now: DateTime<Utc>) -> bool {
        matches!(self, DeleteConfirmation::Armed { expires_at } if now < *expires_at)
    }

    pub fn press(&mut self, now: DateTime<Utc>, window: chrono::Duration) -> PressOutcome {
        if self.is_armed(now) {
            *self = DeleteConfirmation::Unarmed;
            PressOutcome::Confirmed
        } else {
            // An unrepresentable expiry arms for as long as the clock allows.
            let expires_at = now
                .checked_add_signed(window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            *self = DeleteConfirmation::Armed { expires_at };
            PressOutcome::Armed { expires_at }
        }
    }
}

/// Kind of record a delete targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteTarget {
    Collection,
    Product,
}

/// Delete confirmations for every record, shared across requests.
pub struct DeleteGuard {
    window: chrono::Duration,
    states: Mutex<HashMap<(DeleteTarget, String), DeleteConfirmation>>,
}

impl DeleteGuard {
    pub fn new(window: Duration) -> Self {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        Self {
            window,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn press(&self, target: DeleteTarget, id: &str, now: DateTime<Utc>) -> PressOutcome {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());

        // Forget confirmations nobody came back for.
        states.retain(|_, state| state.is_armed(now));

        let key = (target, id.to_string());
        let outcome = states.entry(key.clone()).or_default().press(now, self.window);
        if outcome == PressOutcome::Confirmed {
            states.remove(&key);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_800_000_000_000 + ms).unwrap()
    }

    #[test]
    fn test_second_press_within_window_confirms() {
        let mut state = DeleteConfirmation::default();
        let window = chrono::Duration::milliseconds(3000);

        assert_eq!(
            state.press(at(0), window),
            PressOutcome::Armed { expires_at: at(3000) }
        );
        assert!(state.is_armed(at(2999)));
        assert_eq!(state.press(at(2999), window), PressOutcome::Confirmed);
        assert_eq!(state, DeleteConfirmation::Unarmed);
    }

    #[test]
    fn test_expired_press_rearms() {
        let mut state = DeleteConfirmation::default();
        let window = chrono::Duration::milliseconds(3000);

        state.press(at(0), window);
        assert!(!state.is_armed(at(3000)));
        assert_eq!(
            state.press(at(3000), window),
            PressOutcome::Armed { expires_at: at(6000) }
        );
    }

    #[test]
    fn test_guard_tracks_targets_independently() {
        let guard = DeleteGuard::new(Duration::from_millis(3000));

        assert!(matches!(
            guard.press(DeleteTarget::Collection, "x", at(0)),
            PressOutcome::Armed { .. }
        ));
        assert!(matches!(
            guard.press(DeleteTarget::Product, "x", at(10)),
            PressOutcome::Armed { .. }
        ));
        assert_eq!(
            guard.press(DeleteTarget::Collection, "x", at(20)),
            PressOutcome::Confirmed
        );
        // Confirmed entries reset: the next press arms again.
        assert!(matches!(
            guard.press(DeleteTarget::Collection, "x", at(30)),
            PressOutcome::Armed { .. }
        ));
        assert_eq!(
            guard.press(DeleteTarget::Product, "x", at(40)),
            PressOutcome::Confirmed
        );
    }

    #[test]
    fn test_oversized_window_arms_without_overflow() {
        let guard = DeleteGuard::new(Duration::from_millis(10_000_000_000_000_000));

        assert_eq!(
            guard.press(DeleteTarget::Collection, "x", at(0)),
            PressOutcome::Armed {
                expires_at: DateTime::<Utc>::MAX_UTC
            }
        );
        assert_eq!(
            guard.press(DeleteTarget::Collection, "x", at(1)),
            PressOutcome::Confirmed
        );

        let guard = DeleteGuard::new(Duration::MAX);
        assert!(matches!(
            guard.press(DeleteTarget::Product, "y", at(0)),
            PressOutcome::Armed { .. }
        ));
    }
}
