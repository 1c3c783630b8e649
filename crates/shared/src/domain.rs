use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatRoomId);
id_newtype!(ReviewId);

/// Trip ids are minted by the requesting customer session, so they are UUIDs rather than
/// database sequence values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(pub Uuid);

impl TripId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TripId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TripId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Driver,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Driver => "driver",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customer" | "rider" => Ok(Role::Customer),
            "driver" => Ok(Role::Driver),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// The party performing a write, checked against the transition rights of each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub role: Role,
    pub user_id: UserId,
}

impl Actor {
    pub fn customer(user_id: UserId) -> Self {
        Self {
            role: Role::Customer,
            user_id,
        }
    }

    pub fn driver(user_id: UserId) -> Self {
        Self {
            role: Role::Driver,
            user_id,
        }
    }
}

/// WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6}", self.lat, self.lng)
    }
}

impl std::str::FromStr for GeoPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lng) = s
            .split_once(',')
            .ok_or_else(|| format!("expected `lat,lng`, got `{s}`"))?;
        let lat = lat
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid latitude `{lat}`: {e}"))?;
        let lng = lng
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid longitude `{lng}`: {e}"))?;
        let point = GeoPoint::new(lat, lng);
        if !point.is_valid() {
            return Err(format!("coordinate out of range: {s}"));
        }
        Ok(point)
    }
}

/// A labelled pickup or dropoff location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub label: String,
    pub point: GeoPoint,
}

impl Place {
    pub fn new(label: impl Into<String>, point: GeoPoint) -> Self {
        Self {
            label: label.into(),
            point,
        }
    }
}

/// Trip lifecycle status. The wire form is the upper-case name used by the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    Requested,
    Offered,
    Accepted,
    InProgress,
    Completed,
    CancelledByDriver,
    CancelledByCustomer,
}

impl TripStatus {
    pub const ALL: [TripStatus; 7] = [
        TripStatus::Requested,
        TripStatus::Offered,
        TripStatus::Accepted,
        TripStatus::InProgress,
        TripStatus::Completed,
        TripStatus::CancelledByDriver,
        TripStatus::CancelledByCustomer,
    ];

    /// Position along the lifecycle. Terminal states share the highest rank.
    pub fn rank(self) -> u8 {
        match self {
            TripStatus::Requested => 0,
            TripStatus::Offered => 1,
            TripStatus::Accepted => 2,
            TripStatus::InProgress => 3,
            TripStatus::Completed
            | TripStatus::CancelledByDriver
            | TripStatus::CancelledByCustomer => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TripStatus::Completed
                | TripStatus::CancelledByDriver
                | TripStatus::CancelledByCustomer
        )
    }

    pub fn is_cancelled(self) -> bool {
        matches!(
            self,
            TripStatus::CancelledByDriver | TripStatus::CancelledByCustomer
        )
    }

    /// Whether a driver has been bound to the trip at this status.
    pub fn has_assigned_driver(self) -> bool {
        matches!(
            self,
            TripStatus::Accepted | TripStatus::InProgress | TripStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TripStatus::Requested => "REQUESTED",
            TripStatus::Offered => "OFFERED",
            TripStatus::Accepted => "ACCEPTED",
            TripStatus::InProgress => "IN_PROGRESS",
            TripStatus::Completed => "COMPLETED",
            TripStatus::CancelledByDriver => "CANCELLED_BY_DRIVER",
            TripStatus::CancelledByCustomer => "CANCELLED_BY_CUSTOMER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        TripStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(PaymentStatus::Pending),
            "PAID" => Some(PaymentStatus::Paid),
            _ => None,
        }
    }

    pub fn is_paid(self) -> bool {
        self == PaymentStatus::Paid
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub model: String,
    pub plate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub user_id: UserId,
    pub name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<VehicleInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverStats {
    pub average_rating: f64,
    pub review_count: u32,
}

impl DriverStats {
    pub fn unrated() -> Self {
        Self {
            average_rating: 0.0,
            review_count: 0,
        }
    }
}
