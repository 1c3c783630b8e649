use super::*;
use shared::domain::Role;

const CUSTOMER: UserId = UserId(10);
const DRIVER: UserId = UserId(20);

fn viewer() -> Actor {
    Actor::customer(CUSTOMER)
}

fn requested(trip_id: TripId) -> TripRecord {
    TripRecord::requested(
        trip_id,
        CUSTOMER,
        Place::new("Library", GeoPoint::new(40.1020, -88.2272)),
        Place::new("Dorm C", GeoPoint::new(40.1105, -88.2210)),
    )
}

fn with_status(trip_id: TripId, status: TripStatus) -> TripRecord {
    let mut record = requested(trip_id);
    record.status = status;
    if status != TripStatus::Requested {
        record.offered_by = Some(DRIVER);
        record.offered_fare = Some(6.0);
    }
    if status.has_assigned_driver() {
        record.driver_id = Some(DRIVER);
    }
    record
}

fn projector_for(trip_id: TripId) -> DerivedViewProjector {
    let mut projector = DerivedViewProjector::default();
    assert!(projector.initialize(trip_id, viewer()));
    projector
}

fn snapshot(record: &TripRecord) -> FeedItem {
    FeedItem::Snapshot(record.clone())
}

#[test]
fn stale_snapshot_is_discarded() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);

    projector.apply_feed_item(snapshot(&with_status(trip_id, TripStatus::Accepted)));
    let outcome = projector.apply_feed_item(snapshot(&with_status(trip_id, TripStatus::Requested)));

    assert_eq!(
        outcome.stale,
        Some((TripStatus::Accepted, TripStatus::Requested))
    );
    assert!(!outcome.view_changed);
    assert_eq!(projector.view().status, Some(TripStatus::Accepted));
    assert_eq!(projector.view().driver_id, Some(DRIVER));
}

#[test]
fn different_terminal_state_is_stale() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    projector.apply_feed_item(snapshot(&with_status(trip_id, TripStatus::Completed)));
    let outcome = projector.apply_feed_item(snapshot(&with_status(
        trip_id,
        TripStatus::CancelledByCustomer,
    )));
    assert!(outcome.stale.is_some());
    assert_eq!(projector.view().status, Some(TripStatus::Completed));
}

#[test]
fn deep_fetch_is_issued_once_across_repeated_snapshots() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    let accepted = with_status(trip_id, TripStatus::Accepted);

    let mut fetches = Vec::new();
    for _ in 0..100 {
        fetches.extend(projector.apply_feed_item(snapshot(&accepted)).fetches);
    }

    let count = |key: FetchKey| fetches.iter().filter(|f| f.key == key).count();
    assert_eq!(count(FetchKey::DriverStats(DRIVER)), 1);
    assert_eq!(count(FetchKey::ChatRoom(trip_id)), 1);
    assert_eq!(count(FetchKey::Profile(DRIVER)), 1);
    assert_eq!(count(FetchKey::Profile(CUSTOMER)), 1);
    assert!(fetches.iter().all(|f| f.epoch == projector.epoch()));
    assert!(projector.inflight().is_pending(&FetchKey::DriverStats(DRIVER)));
}

#[test]
fn no_deep_fetch_before_a_driver_is_assigned() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    let outcome = projector.apply_feed_item(snapshot(&with_status(trip_id, TripStatus::Offered)));
    let keys: Vec<_> = outcome.fetches.iter().map(|f| f.key).collect();
    assert!(!keys.contains(&FetchKey::DriverStats(DRIVER)));
    assert!(!keys.contains(&FetchKey::ChatRoom(trip_id)));
    assert!(keys.contains(&FetchKey::Profile(DRIVER)), "offering driver's name");
}

#[test]
fn navigate_to_rating_fires_exactly_once() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    let in_progress = with_status(trip_id, TripStatus::InProgress);
    let completed = with_status(trip_id, TripStatus::Completed);
    let mut paid = completed.clone();
    paid.payment_status = PaymentStatus::Paid;

    let mut fired = 0;
    for record in [&in_progress, &completed, &paid, &paid] {
        let outcome = projector.apply_feed_item(snapshot(record));
        fired += outcome
            .signals
            .iter()
            .filter(|s| **s == TripSignal::NavigateToRating)
            .count();
        if record.status == TripStatus::Completed && !record.payment_status.is_paid() {
            assert!(!projector.view().settled, "unpaid completion is not settled");
        }
    }
    assert_eq!(fired, 1);
    assert!(projector.view().settled);

    projector.mark_delivered(TripSignal::NavigateToRating);
    assert_eq!(projector.latches.navigate_to_rating, Latch::Consumed);
    assert!(projector.apply_feed_item(snapshot(&paid)).signals.is_empty());
}

#[test]
fn arrived_alert_stays_until_payment_clears() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    let mut arrived = with_status(trip_id, TripStatus::InProgress);
    arrived.driver_arrived_pickup = true;
    arrived.driver_arrived_dropoff = true;

    let outcome = projector.apply_feed_item(snapshot(&arrived));
    assert_eq!(outcome.signals, vec![TripSignal::ShowArrivedAlert]);
    assert!(projector.view().arrived_alert_visible);

    let mut completed = arrived.clone();
    completed.status = TripStatus::Completed;
    projector.apply_feed_item(snapshot(&completed));
    assert!(projector.view().arrived_alert_visible, "completion alone does not clear");

    // A late duplicate of the pre-arrival snapshot cannot lower the flag.
    let mut early = completed.clone();
    early.driver_arrived_dropoff = false;
    projector.apply_feed_item(snapshot(&early));
    assert!(projector.view().driver_arrived_dropoff);

    let mut paid = completed.clone();
    paid.payment_status = PaymentStatus::Paid;
    let outcome = projector.apply_feed_item(snapshot(&paid));
    assert!(outcome.signals.contains(&TripSignal::HideArrivedAlert));
    assert!(outcome.signals.contains(&TripSignal::NavigateToRating));
    assert!(!projector.view().arrived_alert_visible);

    // Payment never reverts in the derived view.
    projector.apply_feed_item(snapshot(&completed));
    assert_eq!(projector.view().payment_status, Some(PaymentStatus::Paid));
    assert!(!projector.view().arrived_alert_visible);
}

#[test]
fn driver_cancellation_is_signalled_once_and_dismissible() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    let cancelled = with_status(trip_id, TripStatus::CancelledByDriver);

    let outcome = projector.apply_feed_item(snapshot(&cancelled));
    assert_eq!(outcome.signals, vec![TripSignal::DriverCancelled]);
    assert!(projector.view().driver_cancelled_visible);
    assert!(projector.apply_feed_item(snapshot(&cancelled)).signals.is_empty());

    assert!(projector.dismiss_driver_cancelled());
    assert!(!projector.view().driver_cancelled_visible);
    assert!(!projector.dismiss_driver_cancelled());
}

#[test]
fn reinitializing_for_another_trip_resets_keys_and_latches() {
    let first = TripId::new();
    let mut projector = projector_for(first);
    let mut paid = with_status(first, TripStatus::Completed);
    paid.payment_status = PaymentStatus::Paid;
    paid.driver_arrived_pickup = true;
    paid.driver_arrived_dropoff = true;
    projector.apply_feed_item(snapshot(&paid));
    let old_epoch = projector.epoch();
    assert!(!projector.inflight().is_empty());

    assert!(!projector.initialize(first, viewer()), "same trip keeps state");
    assert_eq!(projector.epoch(), old_epoch);

    let second = TripId::new();
    assert!(projector.initialize(second, viewer()));
    assert!(projector.epoch() > old_epoch);
    assert!(projector.inflight().is_empty());
    assert_eq!(projector.latches.navigate_to_rating, Latch::Unsignaled);
    assert_eq!(projector.latches.arrived_alert, Latch::Unsignaled);
    assert!(projector.view().loading);
    assert_eq!(projector.view().status, None);

    let mut again = paid.clone();
    again.trip_id = second;
    let outcome = projector.apply_feed_item(snapshot(&again));
    assert!(outcome.signals.contains(&TripSignal::NavigateToRating));
    assert!(outcome
        .fetches
        .iter()
        .any(|f| f.key == FetchKey::DriverStats(DRIVER)));
}

#[test]
fn results_from_an_earlier_epoch_are_dropped() {
    let first = TripId::new();
    let mut projector = projector_for(first);
    let outcome = projector.apply_feed_item(snapshot(&with_status(first, TripStatus::Accepted)));
    let stats_request = outcome
        .fetches
        .iter()
        .find(|f| f.key == FetchKey::DriverStats(DRIVER))
        .copied()
        .expect("stats fetch");

    projector.initialize(TripId::new(), viewer());
    let changed = projector.apply_fetch(FetchResult {
        epoch: stats_request.epoch,
        key: stats_request.key,
        outcome: Ok(FetchOutcome::DriverStats(DriverStats {
            average_rating: 4.8,
            review_count: 12,
        })),
    });
    assert!(!changed);
    assert!(projector.view().driver_stats.is_none());
}

#[test]
fn suspend_drops_pending_results_and_allows_reissue() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    let accepted = with_status(trip_id, TripStatus::Accepted);
    let first = projector.apply_feed_item(snapshot(&accepted));
    assert!(!first.fetches.is_empty());

    projector.suspend();
    assert!(!projector.initialize(trip_id, viewer()));
    let late = projector.apply_fetch(FetchResult {
        epoch: first.fetches[0].epoch,
        key: first.fetches[0].key,
        outcome: Ok(FetchOutcome::ChatRoom(Some(ChatRoomId(1)))),
    });
    assert!(!late);

    let reissued = projector.apply_feed_item(snapshot(&accepted));
    assert_eq!(reissued.fetches.len(), first.fetches.len());
    assert!(reissued.fetches.iter().all(|f| f.epoch == projector.epoch()));
}

#[test]
fn fetch_results_fill_the_view_and_failures_release_keys() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    let accepted = with_status(trip_id, TripStatus::Accepted);
    projector.apply_feed_item(snapshot(&accepted));
    let epoch = projector.epoch();

    assert!(projector.apply_fetch(FetchResult {
        epoch,
        key: FetchKey::Profile(DRIVER),
        outcome: Ok(FetchOutcome::Profile(ProfileSummary {
            user_id: DRIVER,
            name: "Jordan".into(),
            role: Role::Driver,
            vehicle: Some(VehicleInfo {
                model: "Civic".into(),
                plate: "UIUC 42".into(),
                color: None,
            }),
        })),
    }));
    assert_eq!(projector.view().driver_name.as_deref(), Some("Jordan"));
    assert_eq!(
        projector.view().vehicle.as_ref().map(|v| v.model.as_str()),
        Some("Civic")
    );

    assert!(projector.apply_fetch(FetchResult {
        epoch,
        key: FetchKey::Profile(CUSTOMER),
        outcome: Err("directory down".into()),
    }));
    assert_eq!(
        projector.view().customer_name.as_deref(),
        Some(DEFAULT_CUSTOMER_PLACEHOLDER)
    );
    assert!(!projector.inflight().contains(&FetchKey::Profile(CUSTOMER)));

    projector.apply_fetch(FetchResult {
        epoch,
        key: FetchKey::DriverStats(DRIVER),
        outcome: Err("ratings down".into()),
    });
    assert!(projector.view().driver_stats.is_none());

    let retry = projector.apply_feed_item(snapshot(&accepted));
    let keys: Vec<_> = retry.fetches.iter().map(|f| f.key).collect();
    assert!(keys.contains(&FetchKey::DriverStats(DRIVER)));
    assert!(keys.contains(&FetchKey::Profile(CUSTOMER)));
    assert!(!keys.contains(&FetchKey::Profile(DRIVER)));
}

#[test]
fn missing_chat_room_is_looked_up_again() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    let accepted = with_status(trip_id, TripStatus::Accepted);
    projector.apply_feed_item(snapshot(&accepted));
    let epoch = projector.epoch();

    assert!(!projector.apply_fetch(FetchResult {
        epoch,
        key: FetchKey::ChatRoom(trip_id),
        outcome: Ok(FetchOutcome::ChatRoom(None)),
    }));
    assert!(!projector.inflight().contains(&FetchKey::ChatRoom(trip_id)));

    let mut moved = accepted.clone();
    moved.driver_location = Some(GeoPoint::new(40.1030, -88.2260));
    let retry = projector.apply_feed_item(snapshot(&moved));
    assert!(retry
        .fetches
        .iter()
        .any(|f| f.key == FetchKey::ChatRoom(trip_id)));

    assert!(projector.apply_fetch(FetchResult {
        epoch,
        key: FetchKey::ChatRoom(trip_id),
        outcome: Ok(FetchOutcome::ChatRoom(Some(ChatRoomId(7)))),
    }));
    assert_eq!(projector.view().chat_room_id, Some(ChatRoomId(7)));
    let settled = projector.apply_feed_item(snapshot(&accepted));
    assert!(settled
        .fetches
        .iter()
        .all(|f| f.key != FetchKey::ChatRoom(trip_id)));
}

#[test]
fn payment_after_a_cancelled_dropoff_hides_the_arrived_alert() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    let mut cancelled = with_status(trip_id, TripStatus::CancelledByCustomer);
    cancelled.driver_id = Some(DRIVER);
    cancelled.driver_arrived_pickup = true;
    cancelled.driver_arrived_dropoff = true;

    let outcome = projector.apply_feed_item(snapshot(&cancelled));
    assert_eq!(outcome.signals, vec![TripSignal::ShowArrivedAlert]);

    let mut paid = cancelled.clone();
    paid.payment_status = PaymentStatus::Paid;
    let outcome = projector.apply_feed_item(snapshot(&paid));
    assert!(outcome.stale.is_none());
    assert_eq!(outcome.signals, vec![TripSignal::HideArrivedAlert]);
    assert!(!projector.view().arrived_alert_visible);
    assert!(!projector.view().settled);
}

#[test]
fn route_input_targets_pickup_then_dropoff() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    let mut accepted = with_status(trip_id, TripStatus::Accepted);
    assert!(projector
        .apply_feed_item(snapshot(&accepted))
        .route_input
        .is_none());

    let driver = GeoPoint::new(40.1000, -88.2300);
    accepted.driver_location = Some(driver);
    let input = projector
        .apply_feed_item(snapshot(&accepted))
        .route_input
        .expect("route input");
    assert_eq!(input.driver, driver);
    assert_eq!(input.target, accepted.pickup.point);

    accepted.driver_arrived_pickup = true;
    let input = projector
        .apply_feed_item(snapshot(&accepted))
        .route_input
        .expect("route input");
    assert_eq!(input.target, accepted.dropoff.point);

    let mut completed = accepted.clone();
    completed.status = TripStatus::Completed;
    assert!(projector
        .apply_feed_item(snapshot(&completed))
        .route_input
        .is_none());
}

#[test]
fn loading_only_before_first_snapshot() {
    let trip_id = TripId::new();
    let mut projector = projector_for(trip_id);
    assert!(!projector.apply_feed_item(FeedItem::Loading).view_changed);
    assert!(projector.view().loading);

    projector.apply_feed_item(snapshot(&requested(trip_id)));
    assert!(!projector.view().loading);
    projector.apply_feed_item(FeedItem::Loading);
    assert!(!projector.view().loading);
    assert_eq!(projector.view().status, Some(TripStatus::Requested));
}
