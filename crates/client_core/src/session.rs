//! Per-actor trip session: the write path through the state machine and the read path from
//! the change feed into the derived view, routes and UI actions.

use std::{sync::Arc, time::Duration};

use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{Actor, ChatRoomId, GeoPoint, Place, Role, TripId, TripStatus},
    protocol::ReviewResponse,
    trip::TripRecord,
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    collaborators::{
        ChatRoomDirectory, DriverStatsSource, HttpDirectory, MissingChatRoomDirectory,
        MissingDriverStatsSource, MissingProfileDirectory, MissingReviewService,
        MissingRoutingService, ProfileDirectory, ReviewService, RoutingService,
    },
    effects::{SideEffectDispatcher, UiAction},
    error::TripSessionError,
    feed::{ChangeFeedSubscription, FeedItem},
    lifecycle::{TripCommand, TripStateMachine},
    projector::{
        DerivedTripView, DerivedViewProjector, FetchKey, FetchOutcome, FetchRequest, FetchResult,
        DEFAULT_CUSTOMER_PLACEHOLDER, DEFAULT_DRIVER_PLACEHOLDER,
    },
    route::{Route, RouteRecomputer, RouteResult, RouteTicket, DEFAULT_ROUTE_TIMEOUT},
    store::{HttpTripStore, StoreError, TripStore},
};

const MAX_REVIEW_COMMENT_CHARS: usize = 1000;
const DEFAULT_FEED_RETRY_DELAY: Duration = Duration::from_millis(250);
const MAX_FEED_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub route_timeout: Duration,
    pub event_buffer: usize,
    pub driver_placeholder_name: String,
    pub customer_placeholder_name: String,
    /// First wait before resubscribing after the trip feed ends. Doubles per failed attempt.
    pub feed_retry_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            route_timeout: DEFAULT_ROUTE_TIMEOUT,
            event_buffer: 256,
            driver_placeholder_name: DEFAULT_DRIVER_PLACEHOLDER.to_string(),
            customer_placeholder_name: DEFAULT_CUSTOMER_PLACEHOLDER.to_string(),
            feed_retry_delay: DEFAULT_FEED_RETRY_DELAY,
        }
    }
}

#[derive(Clone)]
pub struct SessionDependencies {
    pub store: Arc<dyn TripStore>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub stats: Arc<dyn DriverStatsSource>,
    pub chat_rooms: Arc<dyn ChatRoomDirectory>,
    pub routing: Arc<dyn RoutingService>,
    pub reviews: Arc<dyn ReviewService>,
}

impl SessionDependencies {
    /// A store with every other collaborator missing.
    pub fn offline(store: Arc<dyn TripStore>) -> Self {
        Self {
            store,
            profiles: Arc::new(MissingProfileDirectory),
            stats: Arc::new(MissingDriverStatsSource),
            chat_rooms: Arc::new(MissingChatRoomDirectory),
            routing: Arc::new(MissingRoutingService),
            reviews: Arc::new(MissingReviewService),
        }
    }

    /// Everything served by one trip service, sharing a connection pool.
    pub fn http(server_url: &str) -> Self {
        let http = Client::new();
        let directory = Arc::new(HttpDirectory::with_client(http.clone(), server_url));
        Self {
            store: Arc::new(HttpTripStore::with_client(http, server_url)),
            profiles: directory.clone(),
            stats: directory.clone(),
            chat_rooms: directory.clone(),
            routing: directory.clone(),
            reviews: directory,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TripEvent {
    ViewUpdated(DerivedTripView),
    RouteUpdated(Route),
    Action(UiAction),
    StaleSnapshot {
        trip_id: TripId,
        last: TripStatus,
        incoming: TripStatus,
    },
    Error(String),
}

enum Work {
    Fetch(FetchResult),
    Route(RouteResult),
}

struct SessionState {
    trip_id: Option<TripId>,
    projector: DerivedViewProjector,
    routes: RouteRecomputer,
    dispatcher: SideEffectDispatcher,
    feed_task: Option<JoinHandle<()>>,
}

pub struct TripSession {
    actor: Actor,
    deps: SessionDependencies,
    feed_retry_delay: Duration,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<TripEvent>,
}

impl TripSession {
    pub fn new(actor: Actor, deps: SessionDependencies, settings: SessionSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Arc::new(Self {
            actor,
            deps,
            feed_retry_delay: settings.feed_retry_delay.max(Duration::from_millis(1)),
            inner: Mutex::new(SessionState {
                trip_id: None,
                projector: DerivedViewProjector::new(
                    settings.driver_placeholder_name,
                    settings.customer_placeholder_name,
                ),
                routes: RouteRecomputer::new(settings.route_timeout),
                dispatcher: SideEffectDispatcher::default(),
                feed_task: None,
            }),
            events,
        })
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TripEvent> {
        self.events.subscribe()
    }

    pub async fn active_trip(&self) -> Option<TripId> {
        self.inner.lock().await.trip_id
    }

    pub async fn current_view(&self) -> Option<DerivedTripView> {
        let state = self.inner.lock().await;
        state.trip_id.map(|_| state.projector.view().clone())
    }

    pub async fn current_route(&self) -> Option<Route> {
        self.inner.lock().await.routes.current().cloned()
    }

    /// Subscribes to `trip_id` and starts folding its feed, replacing any open trip.
    pub async fn open(self: &Arc<Self>, trip_id: TripId) -> Result<(), TripSessionError> {
        let feed = ChangeFeedSubscription::open(self.deps.store.as_ref(), trip_id)
            .await
            .map_err(TripSessionError::Store)?;
        let (work_tx, work_rx) = mpsc::unbounded_channel();

        let mut state = self.inner.lock().await;
        if let Some(task) = state.feed_task.take() {
            task.abort();
            state.projector.suspend();
        }
        if state.projector.initialize(trip_id, self.actor) {
            state.routes.reset();
            let epoch = state.projector.epoch();
            state.dispatcher.forget_before(epoch);
        }
        state.trip_id = Some(trip_id);

        let session = Arc::clone(self);
        state.feed_task = Some(tokio::spawn(async move {
            session.run_feed(feed, work_tx, work_rx).await;
        }));
        info!(%trip_id, role = self.actor.role.as_str(), user_id = %self.actor.user_id, "session: trip opened");
        Ok(())
    }

    /// Unsubscribes. Lookups already running may finish but their results are dropped.
    pub async fn close(&self) {
        let mut state = self.inner.lock().await;
        if let Some(task) = state.feed_task.take() {
            task.abort();
            state.projector.suspend();
            info!(trip_id = ?state.trip_id, "session: trip closed");
        }
    }

    async fn run_feed(
        self: Arc<Self>,
        mut feed: ChangeFeedSubscription,
        work_tx: mpsc::UnboundedSender<Work>,
        mut work_rx: mpsc::UnboundedReceiver<Work>,
    ) {
        let trip_id = feed.trip_id();
        let mut feed_open = true;
        let mut retry_delay = self.feed_retry_delay;
        let resubscribe = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(resubscribe);
        loop {
            tokio::select! {
                item = feed.next(), if feed_open => match item {
                    Some(item) => {
                        retry_delay = self.feed_retry_delay;
                        self.on_feed_item(item, &work_tx).await;
                    }
                    None => {
                        feed_open = false;
                        warn!(
                            %trip_id,
                            retry_in_ms = retry_delay.as_millis() as u64,
                            "session: trip feed ended; resubscribing"
                        );
                        let _ = self
                            .events
                            .send(TripEvent::Error(format!("trip feed for {trip_id} ended")));
                        resubscribe.as_mut().reset(Instant::now() + retry_delay);
                    }
                },
                () = &mut resubscribe, if !feed_open => {
                    match ChangeFeedSubscription::open(self.deps.store.as_ref(), trip_id).await {
                        Ok(reopened) => {
                            feed = reopened;
                            feed_open = true;
                            info!(%trip_id, "session: trip feed resubscribed");
                        }
                        Err(err) => {
                            retry_delay = (retry_delay * 2).min(MAX_FEED_RETRY_DELAY);
                            warn!(
                                %trip_id,
                                error = %err,
                                retry_in_ms = retry_delay.as_millis() as u64,
                                "session: resubscribe failed"
                            );
                            resubscribe.as_mut().reset(Instant::now() + retry_delay);
                        }
                    }
                }
                Some(work) = work_rx.recv() => self.on_work(work).await,
                else => break,
            }
        }
    }

    async fn on_feed_item(&self, item: FeedItem, work_tx: &mpsc::UnboundedSender<Work>) {
        let mut state = self.inner.lock().await;
        let outcome = state.projector.apply_feed_item(item);
        let epoch = state.projector.epoch();

        if let Some((last, incoming)) = outcome.stale {
            if let Some(trip_id) = state.trip_id {
                let _ = self.events.send(TripEvent::StaleSnapshot {
                    trip_id,
                    last,
                    incoming,
                });
            }
        }
        if outcome.view_changed {
            let _ = self
                .events
                .send(TripEvent::ViewUpdated(state.projector.view().clone()));
        }
        for signal in outcome.signals {
            if let Some(action) = state.dispatcher.dispatch(epoch, signal) {
                state.projector.mark_delivered(signal);
                info!(?action, epoch, "session: ui action");
                let _ = self.events.send(TripEvent::Action(action));
            }
        }
        for request in outcome.fetches {
            self.spawn_fetch(request, work_tx.clone());
        }
        if let Some(input) = outcome.route_input {
            if let Some(ticket) = state.routes.request(input) {
                self.spawn_route(ticket, state.routes.timeout(), work_tx.clone());
            }
        }
    }

    async fn on_work(&self, work: Work) {
        let mut state = self.inner.lock().await;
        match work {
            Work::Fetch(result) => {
                if state.projector.apply_fetch(result) {
                    let _ = self
                        .events
                        .send(TripEvent::ViewUpdated(state.projector.view().clone()));
                }
            }
            Work::Route(result) => {
                if let Some(route) = state.routes.apply(result) {
                    let _ = self.events.send(TripEvent::RouteUpdated(route.clone()));
                }
            }
        }
    }

    fn spawn_fetch(&self, request: FetchRequest, work_tx: mpsc::UnboundedSender<Work>) {
        let deps = self.deps.clone();
        tokio::spawn(async move {
            let outcome = fetch(&deps, request.key)
                .await
                .map_err(|err| format!("{err:#}"));
            let _ = work_tx.send(Work::Fetch(FetchResult {
                epoch: request.epoch,
                key: request.key,
                outcome,
            }));
        });
    }

    fn spawn_route(
        &self,
        ticket: RouteTicket,
        timeout: Duration,
        work_tx: mpsc::UnboundedSender<Work>,
    ) {
        let routing = Arc::clone(&self.deps.routing);
        tokio::spawn(async move {
            let result = RouteRecomputer::compute(routing.as_ref(), ticket, timeout).await;
            let _ = work_tx.send(Work::Route(result));
        });
    }

    /// Creates a REQUESTED trip for this customer and returns its id. The trip is not opened.
    pub async fn request_trip(
        &self,
        pickup: Place,
        dropoff: Place,
    ) -> Result<TripId, TripSessionError> {
        let record = TripStateMachine::request(self.actor, TripId::new(), pickup, dropoff)?;
        let trip_id = record.trip_id;
        self.deps.store.create(&record).await.map_err(|err| {
            if matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Conflict(_))) {
                TripSessionError::AlreadyExists(trip_id)
            } else {
                TripSessionError::Store(err)
            }
        })?;
        info!(%trip_id, customer_id = %self.actor.user_id, "session: trip requested");
        Ok(trip_id)
    }

    /// Reads `trip_id`, applies `command` as this session's actor and writes the result.
    /// Returns the record as stored, which may carry fields written concurrently by the
    /// other party.
    pub async fn execute(
        &self,
        trip_id: TripId,
        command: TripCommand,
    ) -> Result<TripRecord, TripSessionError> {
        let record = self.load(trip_id).await?;
        let next = TripStateMachine::apply(&record, self.actor, command).map_err(|err| {
            warn!(%trip_id, %command, error = %err, "session: transition rejected");
            err
        })?;
        let stored = self
            .deps
            .store
            .write(&next)
            .await
            .map_err(TripSessionError::Store)?;
        if stored.status != next.status {
            warn!(
                %trip_id,
                %command,
                wrote = %next.status,
                stored = %stored.status,
                "session: write folded onto a newer trip state"
            );
        } else if matches!(command, TripCommand::UpdateLocation { .. }) {
            debug!(%trip_id, "session: location reported");
        } else {
            info!(%trip_id, %command, status = %stored.status, "session: transition applied");
        }
        Ok(stored)
    }

    async fn execute_on_open_trip(
        &self,
        command: TripCommand,
    ) -> Result<TripRecord, TripSessionError> {
        let trip_id = self
            .active_trip()
            .await
            .ok_or(TripSessionError::NoActiveTrip)?;
        self.execute(trip_id, command).await
    }

    async fn load(&self, trip_id: TripId) -> Result<TripRecord, TripSessionError> {
        self.deps
            .store
            .read(trip_id)
            .await
            .map_err(TripSessionError::Store)?
            .ok_or(TripSessionError::TripNotFound(trip_id))
    }

    pub async fn make_offer(&self, fare: f64) -> Result<TripRecord, TripSessionError> {
        self.execute_on_open_trip(TripCommand::MakeOffer { fare })
            .await
    }

    pub async fn accept_offer(&self) -> Result<TripRecord, TripSessionError> {
        self.execute_on_open_trip(TripCommand::AcceptOffer).await
    }

    pub async fn report_location(&self, point: GeoPoint) -> Result<TripRecord, TripSessionError> {
        self.execute_on_open_trip(TripCommand::UpdateLocation { point })
            .await
    }

    pub async fn arrive_at_pickup(&self) -> Result<TripRecord, TripSessionError> {
        self.execute_on_open_trip(TripCommand::ArriveAtPickup).await
    }

    pub async fn start_trip(&self) -> Result<TripRecord, TripSessionError> {
        self.execute_on_open_trip(TripCommand::StartTrip).await
    }

    pub async fn arrive_at_dropoff(&self) -> Result<TripRecord, TripSessionError> {
        self.execute_on_open_trip(TripCommand::ArriveAtDropoff).await
    }

    pub async fn complete_trip(&self) -> Result<TripRecord, TripSessionError> {
        self.execute_on_open_trip(TripCommand::CompleteTrip).await
    }

    pub async fn pay(&self) -> Result<TripRecord, TripSessionError> {
        self.execute_on_open_trip(TripCommand::Pay).await
    }

    pub async fn cancel(&self) -> Result<TripRecord, TripSessionError> {
        self.execute_on_open_trip(TripCommand::Cancel).await
    }

    /// Rates the driver of the open trip once it is completed and paid.
    pub async fn submit_review(
        &self,
        rating: u8,
        comment: Option<String>,
    ) -> Result<ReviewResponse, TripSessionError> {
        if !(1..=5).contains(&rating) {
            return Err(TripSessionError::InvalidRating(rating));
        }
        if self.actor.role != Role::Customer {
            return Err(TripSessionError::NotAllowed(
                "only the rider can review a trip".into(),
            ));
        }
        let comment = comment
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        if comment
            .as_ref()
            .is_some_and(|text| text.chars().count() > MAX_REVIEW_COMMENT_CHARS)
        {
            return Err(TripSessionError::NotAllowed(format!(
                "review comments are limited to {MAX_REVIEW_COMMENT_CHARS} characters"
            )));
        }

        let trip_id = self
            .active_trip()
            .await
            .ok_or(TripSessionError::NoActiveTrip)?;
        let record = self.load(trip_id).await?;
        if record.customer_id != self.actor.user_id {
            return Err(TripSessionError::NotAllowed(format!(
                "user {} did not ride trip {trip_id}",
                self.actor.user_id
            )));
        }
        if !record.is_settled() {
            return Err(TripSessionError::NotAllowed(
                "trip must be completed and paid before it can be reviewed".into(),
            ));
        }

        let review = self
            .deps
            .reviews
            .submit_review(trip_id, self.actor.user_id, rating, comment)
            .await
            .map_err(TripSessionError::Collaborator)?;
        info!(%trip_id, review_id = %review.review_id, rating, "session: review submitted");
        Ok(review)
    }

    /// Returns the open trip's chat room, creating it if needed.
    pub async fn open_chat_room(&self) -> Result<ChatRoomId, TripSessionError> {
        let trip_id = self
            .active_trip()
            .await
            .ok_or(TripSessionError::NoActiveTrip)?;
        let record = self.load(trip_id).await?;
        let participant = match self.actor.role {
            Role::Customer => record.customer_id == self.actor.user_id,
            Role::Driver => record.driver_id == Some(self.actor.user_id),
        };
        if !participant {
            return Err(TripSessionError::NotAllowed(format!(
                "user {} is not part of trip {trip_id}",
                self.actor.user_id
            )));
        }
        if !record.status.has_assigned_driver() {
            return Err(TripSessionError::NotAllowed(format!(
                "chat opens once a driver is assigned; trip is {}",
                record.status
            )));
        }

        let room_id = self
            .deps
            .chat_rooms
            .open_chat_room(trip_id)
            .await
            .map_err(TripSessionError::Collaborator)?;
        let mut state = self.inner.lock().await;
        if state.projector.record_chat_room(trip_id, room_id) {
            let _ = self
                .events
                .send(TripEvent::ViewUpdated(state.projector.view().clone()));
        }
        Ok(room_id)
    }

    pub async fn dismiss_driver_cancelled(&self) -> bool {
        if !SideEffectDispatcher::can_dismiss(UiAction::ShowDriverCancelled) {
            return false;
        }
        let mut state = self.inner.lock().await;
        let dismissed = state.projector.dismiss_driver_cancelled();
        if dismissed {
            let _ = self
                .events
                .send(TripEvent::ViewUpdated(state.projector.view().clone()));
        }
        dismissed
    }

    /// Always refused: the alert clears when payment does.
    pub fn dismiss_arrived_alert(&self) -> bool {
        SideEffectDispatcher::can_dismiss(UiAction::ShowArrivedAlert)
    }
}

async fn fetch(deps: &SessionDependencies, key: FetchKey) -> anyhow::Result<FetchOutcome> {
    match key {
        FetchKey::DriverStats(driver_id) => deps
            .stats
            .driver_stats(driver_id)
            .await
            .map(FetchOutcome::DriverStats),
        FetchKey::ChatRoom(trip_id) => deps
            .chat_rooms
            .chat_room(trip_id)
            .await
            .map(FetchOutcome::ChatRoom),
        FetchKey::Profile(user_id) => deps
            .profiles
            .profile(user_id)
            .await
            .map(FetchOutcome::Profile),
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
