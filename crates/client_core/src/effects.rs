use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::projector::TripSignal;

/// One-shot instruction for the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UiAction {
    NavigateToRating,
    ShowArrivedAlert,
    HideArrivedAlert,
    ShowDriverCancelled,
}

impl From<TripSignal> for UiAction {
    fn from(signal: TripSignal) -> Self {
        match signal {
            TripSignal::NavigateToRating => UiAction::NavigateToRating,
            TripSignal::ShowArrivedAlert => UiAction::ShowArrivedAlert,
            TripSignal::HideArrivedAlert => UiAction::HideArrivedAlert,
            TripSignal::DriverCancelled => UiAction::ShowDriverCancelled,
        }
    }
}

/// Turns projector signals into UI actions, at most once per `(epoch, signal)`.
#[derive(Debug, Default)]
pub struct SideEffectDispatcher {
    delivered: HashSet<(u64, TripSignal)>,
}

impl SideEffectDispatcher {
    pub fn dispatch(&mut self, epoch: u64, signal: TripSignal) -> Option<UiAction> {
        if !self.delivered.insert((epoch, signal)) {
            debug!(epoch, ?signal, "effects: signal already delivered");
            return None;
        }
        Some(UiAction::from(signal))
    }

    pub fn was_delivered(&self, epoch: u64, signal: TripSignal) -> bool {
        self.delivered.contains(&(epoch, signal))
    }

    pub fn can_dismiss(action: UiAction) -> bool {
        match action {
            UiAction::ShowDriverCancelled => true,
            UiAction::ShowArrivedAlert => {
                warn!("effects: arrived alert is cleared by payment, not dismissal");
                false
            }
            UiAction::NavigateToRating | UiAction::HideArrivedAlert => false,
        }
    }

    /// Drops history for epochs older than `epoch`.
    pub fn forget_before(&mut self, epoch: u64) {
        self.delivered.retain(|(seen, _)| *seen >= epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_signal_is_delivered_once_per_epoch() {
        let mut dispatcher = SideEffectDispatcher::default();
        assert_eq!(
            dispatcher.dispatch(1, TripSignal::NavigateToRating),
            Some(UiAction::NavigateToRating)
        );
        assert_eq!(dispatcher.dispatch(1, TripSignal::NavigateToRating), None);
        assert_eq!(
            dispatcher.dispatch(2, TripSignal::NavigateToRating),
            Some(UiAction::NavigateToRating)
        );
        assert_eq!(
            dispatcher.dispatch(2, TripSignal::DriverCancelled),
            Some(UiAction::ShowDriverCancelled)
        );
    }

    #[test]
    fn only_driver_cancellation_is_dismissible() {
        assert!(SideEffectDispatcher::can_dismiss(UiAction::ShowDriverCancelled));
        assert!(!SideEffectDispatcher::can_dismiss(UiAction::ShowArrivedAlert));
        assert!(!SideEffectDispatcher::can_dismiss(UiAction::NavigateToRating));
    }

    #[test]
    fn forgetting_old_epochs_keeps_current_history() {
        let mut dispatcher = SideEffectDispatcher::default();
        dispatcher.dispatch(1, TripSignal::ShowArrivedAlert);
        dispatcher.dispatch(3, TripSignal::ShowArrivedAlert);
        dispatcher.forget_before(3);
        assert!(!dispatcher.was_delivered(1, TripSignal::ShowArrivedAlert));
        assert!(dispatcher.was_delivered(3, TripSignal::ShowArrivedAlert));
    }
}
