use shared::domain::TripId;
use thiserror::Error;

use crate::lifecycle::TransitionError;

#[derive(Debug, Error)]
pub enum TripSessionError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("no trip is open in this session")]
    NoActiveTrip,
    #[error("trip {0} was not found")]
    TripNotFound(TripId),
    #[error("trip {0} already exists")]
    AlreadyExists(TripId),
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),
    #[error("{0}")]
    NotAllowed(String),
    #[error("trip store failed: {0:#}")]
    Store(anyhow::Error),
    #[error("collaborator failed: {0:#}")]
    Collaborator(anyhow::Error),
}
