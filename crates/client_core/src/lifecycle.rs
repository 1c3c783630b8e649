//! Trip lifecycle rules.
//!
//! [`TripStateMachine`] is pure: it takes the current record and an actor's command and either
//! returns the next record or a [`TransitionError`]. The input record is never modified, so a
//! rejected command leaves the trip exactly as it was.

use std::fmt;

use shared::{
    domain::{Actor, GeoPoint, PaymentStatus, Place, Role, TripId, TripStatus, UserId},
    trip::TripRecord,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TripCommand {
    MakeOffer { fare: f64 },
    AcceptOffer,
    UpdateLocation { point: GeoPoint },
    ArriveAtPickup,
    StartTrip,
    ArriveAtDropoff,
    CompleteTrip,
    Pay,
    Cancel,
}

impl TripCommand {
    pub fn name(&self) -> &'static str {
        match self {
            TripCommand::MakeOffer { .. } => "make_offer",
            TripCommand::AcceptOffer => "accept_offer",
            TripCommand::UpdateLocation { .. } => "update_location",
            TripCommand::ArriveAtPickup => "arrive_at_pickup",
            TripCommand::StartTrip => "start_trip",
            TripCommand::ArriveAtDropoff => "arrive_at_dropoff",
            TripCommand::CompleteTrip => "complete_trip",
            TripCommand::Pay => "pay",
            TripCommand::Cancel => "cancel",
        }
    }

    /// Role allowed to issue the command, `None` when either party may.
    fn required_role(&self) -> Option<Role> {
        match self {
            TripCommand::AcceptOffer | TripCommand::Pay => Some(Role::Customer),
            TripCommand::Cancel => None,
            _ => Some(Role::Driver),
        }
    }
}

impl fmt::Display for TripCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Pickup,
    Dropoff,
}

impl fmt::Display for Stop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stop::Pickup => f.write_str("pickup"),
            Stop::Dropoff => f.write_str("dropoff"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("trip is {status} and can no longer change")]
    Terminal { status: TripStatus },
    #[error("{command} requires the {expected:?} role")]
    WrongRole {
        command: &'static str,
        expected: Role,
    },
    #[error("user {user_id} may not {command} this trip")]
    NotParticipant {
        command: &'static str,
        user_id: UserId,
    },
    #[error("{command} is not allowed while the trip is {status}")]
    InvalidStatus {
        command: &'static str,
        status: TripStatus,
    },
    #[error("driver already arrived at {0}")]
    AlreadyArrived(Stop),
    #[error("driver has not arrived at {0}")]
    NotArrived(Stop),
    #[error("trip is already paid")]
    AlreadyPaid,
    #[error("offer has no offering driver")]
    MissingOffer,
    #[error("fare must be a positive amount")]
    InvalidFare,
    #[error("{0} coordinate is out of range")]
    InvalidCoordinate(&'static str),
}

pub struct TripStateMachine;

impl TripStateMachine {
    /// Builds a fresh REQUESTED record for a customer.
    pub fn request(
        actor: Actor,
        trip_id: TripId,
        pickup: Place,
        dropoff: Place,
    ) -> Result<TripRecord, TransitionError> {
        if actor.role != Role::Customer {
            return Err(TransitionError::WrongRole {
                command: "request",
                expected: Role::Customer,
            });
        }
        if !pickup.point.is_valid() {
            return Err(TransitionError::InvalidCoordinate("pickup"));
        }
        if !dropoff.point.is_valid() {
            return Err(TransitionError::InvalidCoordinate("dropoff"));
        }
        Ok(TripRecord::requested(
            trip_id,
            actor.user_id,
            pickup,
            dropoff,
        ))
    }

    pub fn apply(
        record: &TripRecord,
        actor: Actor,
        command: TripCommand,
    ) -> Result<TripRecord, TransitionError> {
        let name = command.name();
        if let Some(expected) = command.required_role() {
            if actor.role != expected {
                return Err(TransitionError::WrongRole {
                    command: name,
                    expected,
                });
            }
        }

        let status = record.status;
        let paying_after_end = command == TripCommand::Pay && is_payable(record);
        if status.is_terminal() && !paying_after_end {
            return Err(TransitionError::Terminal { status });
        }

        let mut next = record.clone();
        match command {
            TripCommand::MakeOffer { fare } => {
                match status {
                    TripStatus::Requested => {}
                    TripStatus::Offered if record.offered_by == Some(actor.user_id) => {}
                    TripStatus::Offered => return Err(not_participant(name, actor)),
                    _ => return Err(invalid_status(name, status)),
                }
                if !fare.is_finite() || fare <= 0.0 {
                    return Err(TransitionError::InvalidFare);
                }
                next.status = TripStatus::Offered;
                next.offered_fare = Some(fare);
                next.offered_by = Some(actor.user_id);
            }
            TripCommand::AcceptOffer => {
                ensure_customer(record, actor, name)?;
                if status != TripStatus::Offered {
                    return Err(invalid_status(name, status));
                }
                let driver = record.offered_by.ok_or(TransitionError::MissingOffer)?;
                next.status = TripStatus::Accepted;
                next.driver_id = Some(driver);
            }
            TripCommand::UpdateLocation { point } => {
                ensure_assigned_driver(record, actor, name)?;
                if !matches!(status, TripStatus::Accepted | TripStatus::InProgress) {
                    return Err(invalid_status(name, status));
                }
                if !point.is_valid() {
                    return Err(TransitionError::InvalidCoordinate("driver_location"));
                }
                next.driver_location = Some(point);
            }
            TripCommand::ArriveAtPickup => {
                ensure_assigned_driver(record, actor, name)?;
                if status != TripStatus::Accepted {
                    return Err(invalid_status(name, status));
                }
                if record.driver_arrived_pickup {
                    return Err(TransitionError::AlreadyArrived(Stop::Pickup));
                }
                next.driver_arrived_pickup = true;
            }
            TripCommand::StartTrip => {
                ensure_assigned_driver(record, actor, name)?;
                if status != TripStatus::Accepted {
                    return Err(invalid_status(name, status));
                }
                if !record.driver_arrived_pickup {
                    return Err(TransitionError::NotArrived(Stop::Pickup));
                }
                next.status = TripStatus::InProgress;
            }
            TripCommand::ArriveAtDropoff => {
                ensure_assigned_driver(record, actor, name)?;
                if status != TripStatus::InProgress {
                    return Err(invalid_status(name, status));
                }
                if !record.driver_arrived_pickup {
                    return Err(TransitionError::NotArrived(Stop::Pickup));
                }
                if record.driver_arrived_dropoff {
                    return Err(TransitionError::AlreadyArrived(Stop::Dropoff));
                }
                next.driver_arrived_dropoff = true;
            }
            TripCommand::CompleteTrip => {
                ensure_assigned_driver(record, actor, name)?;
                if status != TripStatus::InProgress {
                    return Err(invalid_status(name, status));
                }
                if !record.driver_arrived_dropoff {
                    return Err(TransitionError::NotArrived(Stop::Dropoff));
                }
                next.status = TripStatus::Completed;
            }
            TripCommand::Pay => {
                ensure_customer(record, actor, name)?;
                if !is_payable(record) {
                    return Err(invalid_status(name, status));
                }
                if record.payment_status.is_paid() {
                    return Err(TransitionError::AlreadyPaid);
                }
                next.payment_status = PaymentStatus::Paid;
            }
            TripCommand::Cancel => match actor.role {
                Role::Customer => {
                    ensure_customer(record, actor, name)?;
                    next.status = TripStatus::CancelledByCustomer;
                }
                Role::Driver => {
                    let assigned = record.driver_id == Some(actor.user_id);
                    let offering = status == TripStatus::Offered
                        && record.offered_by == Some(actor.user_id);
                    if !assigned && !offering {
                        return Err(not_participant(name, actor));
                    }
                    next.status = TripStatus::CancelledByDriver;
                }
            },
        }
        Ok(next)
    }

    /// Whether a snapshot with `incoming` status must be discarded after `applied` was seen.
    ///
    /// Lower ranks are stale. Two different terminal states share a rank, and the later one
    /// is stale too since terminal states never change.
    pub fn is_stale(applied: TripStatus, incoming: TripStatus) -> bool {
        incoming.rank() < applied.rank()
            || (applied.is_terminal() && incoming.is_terminal() && applied != incoming)
    }
}

/// A driver is on the trip, or the ride reached the dropoff before it was cancelled.
fn is_payable(record: &TripRecord) -> bool {
    record.status.has_assigned_driver()
        || (record.status.is_cancelled() && record.driver_arrived_dropoff)
}

fn ensure_customer(
    record: &TripRecord,
    actor: Actor,
    command: &'static str,
) -> Result<(), TransitionError> {
    if record.customer_id != actor.user_id {
        return Err(not_participant(command, actor));
    }
    Ok(())
}

fn ensure_assigned_driver(
    record: &TripRecord,
    actor: Actor,
    command: &'static str,
) -> Result<(), TransitionError> {
    if record.driver_id != Some(actor.user_id) {
        return Err(not_participant(command, actor));
    }
    Ok(())
}

fn not_participant(command: &'static str, actor: Actor) -> TransitionError {
    TransitionError::NotParticipant {
        command,
        user_id: actor.user_id,
    }
}

fn invalid_status(command: &'static str, status: TripStatus) -> TransitionError {
    TransitionError::InvalidStatus { command, status }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
