//! Folds trip snapshots into UI-facing state.
//!
//! The projector is synchronous and owns no tasks. It tells the caller which background
//! lookups to start ([`FetchRequest`]), which one-shot signals fired ([`TripSignal`]) and
//! where the driver is heading ([`RouteInput`]); results come back through
//! [`DerivedViewProjector::apply_fetch`]. Every request carries the projection epoch so
//! results for an earlier trip or an earlier subscription are dropped on arrival.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use serde::Serialize;
use shared::{
    domain::{
        Actor, ChatRoomId, DriverStats, GeoPoint, PaymentStatus, Place, ProfileSummary, TripId,
        TripStatus, UserId, VehicleInfo,
    },
    trip::TripRecord,
};
use tracing::{debug, info, warn};

use crate::{feed::FeedItem, lifecycle::TripStateMachine, route::RouteInput};

pub const DEFAULT_DRIVER_PLACEHOLDER: &str = "Student driver";
pub const DEFAULT_CUSTOMER_PLACEHOLDER: &str = "Student rider";

/// Edge-trigger state for a one-shot UI signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Latch {
    #[default]
    Unsignaled,
    Signaled,
    Consumed,
}

impl Latch {
    /// Rising edge. Returns `true` only for the first raise.
    pub fn raise(&mut self) -> bool {
        if *self == Latch::Unsignaled {
            *self = Latch::Signaled;
            return true;
        }
        false
    }

    pub fn consume(&mut self) -> bool {
        if *self == Latch::Signaled {
            *self = Latch::Consumed;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripSignal {
    NavigateToRating,
    ShowArrivedAlert,
    HideArrivedAlert,
    DriverCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKey {
    DriverStats(UserId),
    ChatRoom(TripId),
    Profile(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Pending,
    Done,
}

/// Check-and-set registry of background lookups.
#[derive(Debug, Default)]
pub struct InflightSet {
    keys: HashMap<FetchKey, FetchState>,
}

impl InflightSet {
    /// Marks `key` pending. Returns `false` if it is already pending or done.
    pub fn try_begin(&mut self, key: FetchKey) -> bool {
        match self.keys.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(FetchState::Pending);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn resolve(&mut self, key: FetchKey) {
        self.keys.insert(key, FetchState::Done);
    }

    /// Forgets `key` so the next trigger retries it.
    pub fn release(&mut self, key: FetchKey) {
        self.keys.remove(&key);
    }

    /// Drops every pending key, keeping completed ones.
    pub fn abandon_pending(&mut self) {
        self.keys.retain(|_, state| *state == FetchState::Done);
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn contains(&self, key: &FetchKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn is_pending(&self, key: &FetchKey) -> bool {
        self.keys.get(key) == Some(&FetchState::Pending)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub epoch: u64,
    pub key: FetchKey,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    DriverStats(DriverStats),
    ChatRoom(Option<ChatRoomId>),
    Profile(ProfileSummary),
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub epoch: u64,
    pub key: FetchKey,
    pub outcome: Result<FetchOutcome, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedTripView {
    pub trip_id: Option<TripId>,
    pub viewer: Option<Actor>,
    pub loading: bool,
    pub status: Option<TripStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub customer_id: Option<UserId>,
    pub driver_id: Option<UserId>,
    pub offered_by: Option<UserId>,
    pub pickup: Option<Place>,
    pub dropoff: Option<Place>,
    pub offered_fare: Option<f64>,
    pub driver_location: Option<GeoPoint>,
    pub driver_arrived_pickup: bool,
    pub driver_arrived_dropoff: bool,
    pub customer_name: Option<String>,
    pub driver_name: Option<String>,
    pub vehicle: Option<VehicleInfo>,
    pub driver_stats: Option<DriverStats>,
    pub chat_room_id: Option<ChatRoomId>,
    pub arrived_alert_visible: bool,
    pub driver_cancelled_visible: bool,
    /// Completed and paid; the rider-facing trip is over.
    pub settled: bool,
}

/// Everything one snapshot produced.
#[derive(Debug, Default)]
pub struct ProjectionOutcome {
    /// `(last applied, incoming)` when the snapshot was discarded as stale.
    pub stale: Option<(TripStatus, TripStatus)>,
    pub view_changed: bool,
    pub signals: Vec<TripSignal>,
    pub fetches: Vec<FetchRequest>,
    pub route_input: Option<RouteInput>,
}

#[derive(Debug, Default)]
struct Latches {
    navigate_to_rating: Latch,
    arrived_alert: Latch,
    driver_cancelled: Latch,
}

pub struct DerivedViewProjector {
    driver_placeholder: String,
    customer_placeholder: String,
    epoch: u64,
    trip_id: Option<TripId>,
    view: DerivedTripView,
    inflight: InflightSet,
    latches: Latches,
    profiles: HashMap<UserId, ProfileSummary>,
    failed_profiles: HashSet<UserId>,
}

impl Default for DerivedViewProjector {
    fn default() -> Self {
        Self::new(DEFAULT_DRIVER_PLACEHOLDER, DEFAULT_CUSTOMER_PLACEHOLDER)
    }
}

impl DerivedViewProjector {
    pub fn new(driver_placeholder: impl Into<String>, customer_placeholder: impl Into<String>) -> Self {
        Self {
            driver_placeholder: driver_placeholder.into(),
            customer_placeholder: customer_placeholder.into(),
            epoch: 0,
            trip_id: None,
            view: DerivedTripView::default(),
            inflight: InflightSet::default(),
            latches: Latches::default(),
            profiles: HashMap::new(),
            failed_profiles: HashSet::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn trip_id(&self) -> Option<TripId> {
        self.trip_id
    }

    pub fn view(&self) -> &DerivedTripView {
        &self.view
    }

    pub fn inflight(&self) -> &InflightSet {
        &self.inflight
    }

    /// Points the projector at `trip_id`. Switching to a different trip drops all trip-scoped
    /// state and bumps the epoch; re-initializing the same trip keeps it. Returns whether a
    /// reset happened.
    pub fn initialize(&mut self, trip_id: TripId, viewer: Actor) -> bool {
        if self.trip_id == Some(trip_id) {
            self.view.viewer = Some(viewer);
            return false;
        }
        self.epoch += 1;
        self.trip_id = Some(trip_id);
        self.inflight.clear();
        self.latches = Latches::default();
        self.profiles.clear();
        self.failed_profiles.clear();
        self.view = DerivedTripView {
            trip_id: Some(trip_id),
            viewer: Some(viewer),
            loading: true,
            ..DerivedTripView::default()
        };
        info!(%trip_id, epoch = self.epoch, "projector: initialized");
        true
    }

    /// Detaches from the feed. Results of lookups still running are dropped when they land,
    /// and their keys are released so a later subscription reissues them.
    pub fn suspend(&mut self) {
        self.epoch += 1;
        self.inflight.abandon_pending();
        debug!(trip_id = ?self.trip_id, epoch = self.epoch, "projector: suspended");
    }

    pub fn apply_feed_item(&mut self, item: FeedItem) -> ProjectionOutcome {
        let mut outcome = ProjectionOutcome::default();
        let Some(trip_id) = self.trip_id else {
            warn!("projector: feed item before initialize");
            return outcome;
        };

        let record = match item {
            FeedItem::Loading => {
                if self.view.status.is_some() {
                    debug!(%trip_id, "projector: document vanished, keeping last view");
                    return outcome;
                }
                outcome.view_changed = !self.view.loading;
                self.view.loading = true;
                return outcome;
            }
            FeedItem::Snapshot(record) => record,
        };

        if record.trip_id != trip_id {
            warn!(%trip_id, other = %record.trip_id, "projector: snapshot for another trip");
            return outcome;
        }
        if let Some(applied) = self.view.status {
            if TripStateMachine::is_stale(applied, record.status) {
                warn!(
                    %trip_id,
                    applied = %applied,
                    incoming = %record.status,
                    "projector: discarding stale snapshot"
                );
                outcome.stale = Some((applied, record.status));
                return outcome;
            }
        }

        let before = self.view.clone();
        self.merge(&record);
        self.raise_signals(&mut outcome.signals);
        self.plan_fetches(&record, &mut outcome.fetches);
        self.refresh_names();

        if matches!(record.status, TripStatus::Accepted | TripStatus::InProgress) {
            outcome.route_input = self.view.driver_location.map(|driver| RouteInput {
                driver,
                target: if self.view.driver_arrived_pickup {
                    record.dropoff.point
                } else {
                    record.pickup.point
                },
            });
        }

        outcome.view_changed = self.view != before;
        outcome
    }

    fn merge(&mut self, record: &TripRecord) {
        let view = &mut self.view;
        view.loading = false;
        view.status = Some(record.status);
        view.payment_status = Some(match view.payment_status {
            Some(known) => known.max(record.payment_status),
            None => record.payment_status,
        });
        view.driver_arrived_pickup |= record.driver_arrived_pickup;
        view.driver_arrived_dropoff |= record.driver_arrived_dropoff;
        view.customer_id = Some(record.customer_id);
        view.driver_id = record.driver_id.or(view.driver_id);
        view.offered_by = record.offered_by.or(view.offered_by);
        view.pickup = Some(record.pickup.clone());
        view.dropoff = Some(record.dropoff.clone());
        view.offered_fare = record.offered_fare.or(view.offered_fare);
        view.driver_location = record.driver_location.or(view.driver_location);
        view.settled = record.status == TripStatus::Completed
            && view.payment_status.is_some_and(PaymentStatus::is_paid);
    }

    fn raise_signals(&mut self, signals: &mut Vec<TripSignal>) {
        let paid = self
            .view
            .payment_status
            .is_some_and(PaymentStatus::is_paid);

        if self.view.settled && self.latches.navigate_to_rating.raise() {
            signals.push(TripSignal::NavigateToRating);
        }

        if self.view.driver_arrived_dropoff && !paid && self.latches.arrived_alert.raise() {
            self.view.arrived_alert_visible = true;
            signals.push(TripSignal::ShowArrivedAlert);
        }
        if paid && self.latches.arrived_alert.consume() {
            self.view.arrived_alert_visible = false;
            signals.push(TripSignal::HideArrivedAlert);
        }

        if self.view.status == Some(TripStatus::CancelledByDriver)
            && self.latches.driver_cancelled.raise()
        {
            self.view.driver_cancelled_visible = true;
            signals.push(TripSignal::DriverCancelled);
        }
    }

    fn plan_fetches(&mut self, record: &TripRecord, fetches: &mut Vec<FetchRequest>) {
        let mut keys = Vec::with_capacity(5);
        if let Some(driver_id) = record.driver_id {
            keys.push(FetchKey::DriverStats(driver_id));
            keys.push(FetchKey::ChatRoom(record.trip_id));
            keys.push(FetchKey::Profile(driver_id));
        }
        if let Some(offered_by) = record.offered_by {
            keys.push(FetchKey::Profile(offered_by));
        }
        keys.push(FetchKey::Profile(record.customer_id));

        for key in keys {
            if self.inflight.try_begin(key) {
                debug!(trip_id = %record.trip_id, ?key, epoch = self.epoch, "projector: fetch started");
                fetches.push(FetchRequest {
                    epoch: self.epoch,
                    key,
                });
            }
        }
    }

    /// Folds a lookup result into the view. Returns whether the view changed.
    pub fn apply_fetch(&mut self, result: FetchResult) -> bool {
        if result.epoch != self.epoch {
            debug!(
                key = ?result.key,
                result_epoch = result.epoch,
                epoch = self.epoch,
                "projector: dropping result from an earlier epoch"
            );
            return false;
        }

        let before = self.view.clone();
        match result.outcome {
            Ok(FetchOutcome::ChatRoom(None)) => {
                debug!(key = ?result.key, "projector: no chat room yet, will look again on next snapshot");
                self.inflight.release(result.key);
            }
            Ok(outcome) => {
                self.inflight.resolve(result.key);
                match outcome {
                    FetchOutcome::DriverStats(stats) => self.view.driver_stats = Some(stats),
                    FetchOutcome::ChatRoom(room) => self.view.chat_room_id = room,
                    FetchOutcome::Profile(profile) => {
                        self.failed_profiles.remove(&profile.user_id);
                        self.profiles.insert(profile.user_id, profile);
                    }
                }
            }
            Err(err) => {
                warn!(key = ?result.key, error = %err, "projector: fetch failed, will retry on next snapshot");
                self.inflight.release(result.key);
                if let FetchKey::Profile(user_id) = result.key {
                    if !self.profiles.contains_key(&user_id) {
                        self.failed_profiles.insert(user_id);
                    }
                }
            }
        }
        self.refresh_names();
        self.view != before
    }

    fn refresh_names(&mut self) {
        let driver = self.view.driver_id.or(self.view.offered_by);
        self.view.driver_name = driver.and_then(|id| self.display_name(id, &self.driver_placeholder));
        self.view.customer_name = self
            .view
            .customer_id
            .and_then(|id| self.display_name(id, &self.customer_placeholder));
        self.view.vehicle = driver
            .and_then(|id| self.profiles.get(&id))
            .and_then(|profile| profile.vehicle.clone());
    }

    fn display_name(&self, user_id: UserId, placeholder: &str) -> Option<String> {
        if let Some(profile) = self.profiles.get(&user_id) {
            return Some(profile.name.clone());
        }
        self.failed_profiles
            .contains(&user_id)
            .then(|| placeholder.to_string())
    }

    /// Records delivery of a signal. Only navigation is consumed this way; the other latches
    /// are consumed by payment or dismissal.
    pub fn mark_delivered(&mut self, signal: TripSignal) {
        if signal == TripSignal::NavigateToRating {
            self.latches.navigate_to_rating.consume();
        }
    }

    pub fn dismiss_driver_cancelled(&mut self) -> bool {
        if self.latches.driver_cancelled.consume() {
            self.view.driver_cancelled_visible = false;
            return true;
        }
        false
    }

    /// Stores a room the user just opened. Returns whether the view changed.
    pub fn record_chat_room(&mut self, trip_id: TripId, room_id: ChatRoomId) -> bool {
        if self.trip_id != Some(trip_id) || self.view.chat_room_id == Some(room_id) {
            return false;
        }
        self.view.chat_room_id = Some(room_id);
        self.inflight.resolve(FetchKey::ChatRoom(trip_id));
        true
    }
}

#[cfg(test)]
#[path = "tests/projector_tests.rs"]
mod tests;
