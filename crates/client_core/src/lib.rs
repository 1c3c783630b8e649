//! Client side of the trip lifecycle: the state machine that guards writes, and the session
//! that keeps a derived view of one trip in sync with the shared store.

pub mod collaborators;
pub mod effects;
pub mod error;
pub mod feed;
pub mod lifecycle;
pub mod projector;
pub mod route;
pub mod session;
pub mod store;

pub use collaborators::{
    ChatRoomDirectory, DriverStatsSource, HttpDirectory, ProfileDirectory, ReviewService,
    RoutingService,
};
pub use effects::{SideEffectDispatcher, UiAction};
pub use error::TripSessionError;
pub use feed::{ChangeFeedSubscription, FeedItem};
pub use lifecycle::{Stop, TransitionError, TripCommand, TripStateMachine};
pub use projector::{DerivedTripView, DerivedViewProjector, TripSignal};
pub use route::{Route, RouteRecomputer};
pub use session::{SessionDependencies, SessionSettings, TripEvent, TripSession};
pub use store::{HttpTripStore, InMemoryTripStore, StoreError, TripStore};
