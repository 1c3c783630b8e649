use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatRoomId, GeoPoint, ReviewId, Role, TripId, UserId, VehicleInfo},
    error::ApiError,
    trip::TripDocument,
};

/// Frames pushed over the per-trip feed socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FeedFrame {
    Snapshot { document: TripDocument },
    Absent { trip_id: TripId },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<VehicleInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserResponse {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRoomResponse {
    pub trip_id: TripId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<ChatRoomId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub from: GeoPoint,
    pub to: GeoPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    pub path: Vec<GeoPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub customer_id: UserId,
    pub rating: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResponse {
    pub review_id: ReviewId,
    pub driver_id: UserId,
    pub created_at: DateTime<Utc>,
}
