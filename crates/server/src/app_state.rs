use crate::api::ApiContext;
use shared::trip::TripDocument;
use tokio::sync::broadcast;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    /// Every stored trip write, for all trips. Feed sockets filter by trip id.
    pub(crate) feed: broadcast::Sender<TripDocument>,
}
