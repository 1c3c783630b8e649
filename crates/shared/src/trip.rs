//! The shared trip record and its persisted document form.
//!
//! The document store holds a flat, string-typed map. Business logic only ever sees a
//! [`TripRecord`], produced by [`TripRecord::try_from`] which rejects unknown status values
//! and records that break the record invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{GeoPoint, PaymentStatus, Place, TripId, TripStatus, UserId};

/// Persisted/wire form of a trip. Keys not listed here belong to features outside the trip
/// lifecycle (chat room id, car details) and round-trip through `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripDocument {
    pub trip_id: TripId,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub customer_id: Option<UserId>,
    #[serde(default)]
    pub driver_id: Option<UserId>,
    #[serde(default)]
    pub offered_by: Option<UserId>,
    #[serde(default)]
    pub pickup: Option<Place>,
    #[serde(default)]
    pub dropoff: Option<Place>,
    #[serde(default)]
    pub offered_fare: Option<f64>,
    #[serde(default)]
    pub driver_location: Option<GeoPoint>,
    #[serde(default)]
    pub driver_arrived_pickup: bool,
    #[serde(default)]
    pub driver_arrived_dropoff: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordDecodeError {
    #[error("trip document is missing `{0}`")]
    MissingField(&'static str),
    #[error("unknown trip status `{0}`")]
    UnknownStatus(String),
    #[error("unknown payment status `{0}`")]
    UnknownPaymentStatus(String),
    #[error("driver_id present while trip is {status}")]
    DriverBeforeAcceptance { status: TripStatus },
    #[error("trip is {status} but has no driver_id")]
    MissingAssignedDriver { status: TripStatus },
    #[error("driver_arrived_dropoff set without driver_arrived_pickup")]
    ArrivalOrder,
    #[error("coordinate `{0}` is out of range")]
    InvalidCoordinate(&'static str),
    #[error("offered fare must be a positive finite amount")]
    InvalidFare,
}

/// Canonical, typed state of one trip.
#[derive(Debug, Clone, PartialEq)]
pub struct TripRecord {
    pub trip_id: TripId,
    pub status: TripStatus,
    pub payment_status: PaymentStatus,
    pub customer_id: UserId,
    pub driver_id: Option<UserId>,
    pub offered_by: Option<UserId>,
    pub pickup: Place,
    pub dropoff: Place,
    pub offered_fare: Option<f64>,
    pub driver_location: Option<GeoPoint>,
    pub driver_arrived_pickup: bool,
    pub driver_arrived_dropoff: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub extra: Map<String, Value>,
}

impl TripRecord {
    /// A fresh request with no driver involvement and payment pending.
    pub fn requested(trip_id: TripId, customer_id: UserId, pickup: Place, dropoff: Place) -> Self {
        Self {
            trip_id,
            status: TripStatus::Requested,
            payment_status: PaymentStatus::Pending,
            customer_id,
            driver_id: None,
            offered_by: None,
            pickup,
            dropoff,
            offered_fare: None,
            driver_location: None,
            driver_arrived_pickup: false,
            driver_arrived_dropoff: false,
            updated_at: None,
            extra: Map::new(),
        }
    }

    /// Point the driver is currently heading to.
    pub fn target_point(&self) -> GeoPoint {
        if self.driver_arrived_pickup {
            self.dropoff.point
        } else {
            self.pickup.point
        }
    }

    /// Whether the rider-facing trip is over: completed and paid.
    pub fn is_settled(&self) -> bool {
        self.status == TripStatus::Completed && self.payment_status.is_paid()
    }

    /// Folds a write computed from an earlier read onto the currently stored record.
    ///
    /// Arrival flags only turn on and payment only moves to PAID. A status ranking below the
    /// stored one is not applied, and a terminal trip only takes a payment. Fields fixed at
    /// creation always come from `stored`, and the fare is frozen once a driver is bound.
    pub fn merge_onto(self, stored: &TripRecord) -> TripRecord {
        let payment_status = self.payment_status.max(stored.payment_status);
        if stored.status.is_terminal() {
            return TripRecord {
                payment_status,
                ..stored.clone()
            };
        }

        let advances = self.status.rank() >= stored.status.rank();
        let status = if advances { self.status } else { stored.status };
        let fare_frozen = stored.status.rank() >= TripStatus::Accepted.rank() || !advances;
        let driver_id = if status.has_assigned_driver() || status.is_cancelled() {
            stored.driver_id.or(self.driver_id)
        } else {
            None
        };
        let mut extra = stored.extra.clone();
        extra.extend(self.extra);

        TripRecord {
            trip_id: stored.trip_id,
            status,
            payment_status,
            customer_id: stored.customer_id,
            driver_id,
            offered_by: if fare_frozen {
                stored.offered_by
            } else {
                self.offered_by
            },
            pickup: stored.pickup.clone(),
            dropoff: stored.dropoff.clone(),
            offered_fare: if fare_frozen {
                stored.offered_fare
            } else {
                self.offered_fare
            },
            driver_location: self.driver_location.or(stored.driver_location),
            driver_arrived_pickup: self.driver_arrived_pickup || stored.driver_arrived_pickup,
            driver_arrived_dropoff: self.driver_arrived_dropoff || stored.driver_arrived_dropoff,
            updated_at: stored.updated_at,
            extra,
        }
    }

    pub fn validate(&self) -> Result<(), RecordDecodeError> {
        if self.driver_id.is_some()
            && !(self.status.has_assigned_driver() || self.status.is_cancelled())
        {
            return Err(RecordDecodeError::DriverBeforeAcceptance {
                status: self.status,
            });
        }
        if self.driver_id.is_none() && self.status.has_assigned_driver() {
            return Err(RecordDecodeError::MissingAssignedDriver {
                status: self.status,
            });
        }
        if self.driver_arrived_dropoff && !self.driver_arrived_pickup {
            return Err(RecordDecodeError::ArrivalOrder);
        }
        if !self.pickup.point.is_valid() {
            return Err(RecordDecodeError::InvalidCoordinate("pickup"));
        }
        if !self.dropoff.point.is_valid() {
            return Err(RecordDecodeError::InvalidCoordinate("dropoff"));
        }
        if let Some(location) = self.driver_location {
            if !location.is_valid() {
                return Err(RecordDecodeError::InvalidCoordinate("driver_location"));
            }
        }
        if let Some(fare) = self.offered_fare {
            if !fare.is_finite() || fare <= 0.0 {
                return Err(RecordDecodeError::InvalidFare);
            }
        }
        Ok(())
    }
}

impl TryFrom<TripDocument> for TripRecord {
    type Error = RecordDecodeError;

    fn try_from(doc: TripDocument) -> Result<Self, Self::Error> {
        let raw_status = doc
            .status
            .ok_or(RecordDecodeError::MissingField("status"))?;
        let status = TripStatus::parse(&raw_status)
            .ok_or(RecordDecodeError::UnknownStatus(raw_status))?;
        let payment_status = match doc.payment_status {
            Some(raw) => PaymentStatus::parse(&raw)
                .ok_or(RecordDecodeError::UnknownPaymentStatus(raw))?,
            None => PaymentStatus::Pending,
        };

        let record = TripRecord {
            trip_id: doc.trip_id,
            status,
            payment_status,
            customer_id: doc
                .customer_id
                .ok_or(RecordDecodeError::MissingField("customer_id"))?,
            driver_id: doc.driver_id,
            offered_by: doc.offered_by,
            pickup: doc.pickup.ok_or(RecordDecodeError::MissingField("pickup"))?,
            dropoff: doc
                .dropoff
                .ok_or(RecordDecodeError::MissingField("dropoff"))?,
            offered_fare: doc.offered_fare,
            driver_location: doc.driver_location,
            driver_arrived_pickup: doc.driver_arrived_pickup,
            driver_arrived_dropoff: doc.driver_arrived_dropoff,
            updated_at: doc.updated_at,
            extra: doc.extra,
        };
        record.validate()?;
        Ok(record)
    }
}

impl From<&TripRecord> for TripDocument {
    fn from(record: &TripRecord) -> Self {
        TripDocument {
            trip_id: record.trip_id,
            status: Some(record.status.as_str().to_string()),
            payment_status: Some(record.payment_status.as_str().to_string()),
            customer_id: Some(record.customer_id),
            driver_id: record.driver_id,
            offered_by: record.offered_by,
            pickup: Some(record.pickup.clone()),
            dropoff: Some(record.dropoff.clone()),
            offered_fare: record.offered_fare,
            driver_location: record.driver_location,
            driver_arrived_pickup: record.driver_arrived_pickup,
            driver_arrived_dropoff: record.driver_arrived_dropoff,
            updated_at: record.updated_at,
            extra: record.extra.clone(),
        }
    }
}

impl From<TripRecord> for TripDocument {
    fn from(record: TripRecord) -> Self {
        TripDocument::from(&record)
    }
}
