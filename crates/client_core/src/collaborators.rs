//! External lookups the session relies on: profiles, rating aggregates, chat rooms, routing
//! and reviews. Each has a `Missing*` fallback that always fails, and [`HttpDirectory`]
//! implements all of them against the trip service.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use shared::{
    domain::{ChatRoomId, DriverStats, GeoPoint, ProfileSummary, Role, TripId, UserId, VehicleInfo},
    protocol::{
        ChatRoomResponse, CreateUserRequest, CreateUserResponse, ReviewRequest, ReviewResponse,
        RouteRequest, RouteResponse,
    },
};

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn profile(&self, user_id: UserId) -> Result<ProfileSummary>;
}

#[async_trait]
pub trait DriverStatsSource: Send + Sync {
    async fn driver_stats(&self, driver_id: UserId) -> Result<DriverStats>;
}

#[async_trait]
pub trait ChatRoomDirectory: Send + Sync {
    /// Existing room for the trip, if any.
    async fn chat_room(&self, trip_id: TripId) -> Result<Option<ChatRoomId>>;
    /// Returns the trip's room, creating it when missing.
    async fn open_chat_room(&self, trip_id: TripId) -> Result<ChatRoomId>;
}

#[async_trait]
pub trait RoutingService: Send + Sync {
    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<Vec<GeoPoint>>;
}

#[async_trait]
pub trait ReviewService: Send + Sync {
    async fn submit_review(
        &self,
        trip_id: TripId,
        customer_id: UserId,
        rating: u8,
        comment: Option<String>,
    ) -> Result<ReviewResponse>;
}

pub struct MissingProfileDirectory;

#[async_trait]
impl ProfileDirectory for MissingProfileDirectory {
    async fn profile(&self, user_id: UserId) -> Result<ProfileSummary> {
        Err(anyhow!("profile directory unavailable for user {user_id}"))
    }
}

pub struct MissingDriverStatsSource;

#[async_trait]
impl DriverStatsSource for MissingDriverStatsSource {
    async fn driver_stats(&self, driver_id: UserId) -> Result<DriverStats> {
        Err(anyhow!("rating service unavailable for driver {driver_id}"))
    }
}

pub struct MissingChatRoomDirectory;

#[async_trait]
impl ChatRoomDirectory for MissingChatRoomDirectory {
    async fn chat_room(&self, trip_id: TripId) -> Result<Option<ChatRoomId>> {
        Err(anyhow!("chat rooms unavailable for trip {trip_id}"))
    }

    async fn open_chat_room(&self, trip_id: TripId) -> Result<ChatRoomId> {
        Err(anyhow!("chat rooms unavailable for trip {trip_id}"))
    }
}

pub struct MissingRoutingService;

#[async_trait]
impl RoutingService for MissingRoutingService {
    async fn route(&self, _from: GeoPoint, _to: GeoPoint) -> Result<Vec<GeoPoint>> {
        Err(anyhow!("routing service unavailable"))
    }
}

pub struct MissingReviewService;

#[async_trait]
impl ReviewService for MissingReviewService {
    async fn submit_review(
        &self,
        trip_id: TripId,
        _customer_id: UserId,
        _rating: u8,
        _comment: Option<String>,
    ) -> Result<ReviewResponse> {
        Err(anyhow!("review service unavailable for trip {trip_id}"))
    }
}

/// All collaborator lookups served by the trip service's HTTP API.
#[derive(Clone)]
pub struct HttpDirectory {
    http: Client,
    server_url: String,
}

impl HttpDirectory {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    /// Registers a student profile and returns the new id.
    pub async fn register(
        &self,
        name: &str,
        role: Role,
        vehicle: Option<VehicleInfo>,
    ) -> Result<UserId> {
        let body: CreateUserResponse = self
            .http
            .post(self.url("/users"))
            .json(&CreateUserRequest {
                name: name.to_string(),
                role,
                vehicle,
            })
            .send()
            .await?
            .error_for_status()
            .context("registration rejected")?
            .json()
            .await?;
        Ok(body.user_id)
    }
}

#[async_trait]
impl ProfileDirectory for HttpDirectory {
    async fn profile(&self, user_id: UserId) -> Result<ProfileSummary> {
        self.http
            .get(self.url(&format!("/users/{user_id}/profile")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid profile for user {user_id}"))
    }
}

#[async_trait]
impl DriverStatsSource for HttpDirectory {
    async fn driver_stats(&self, driver_id: UserId) -> Result<DriverStats> {
        self.http
            .get(self.url(&format!("/drivers/{driver_id}/stats")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid stats for driver {driver_id}"))
    }
}

#[async_trait]
impl ChatRoomDirectory for HttpDirectory {
    async fn chat_room(&self, trip_id: TripId) -> Result<Option<ChatRoomId>> {
        let response = self
            .http
            .get(self.url(&format!("/trips/{trip_id}/chat_room")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: ChatRoomResponse = response.error_for_status()?.json().await?;
        Ok(body.room_id)
    }

    async fn open_chat_room(&self, trip_id: TripId) -> Result<ChatRoomId> {
        let body: ChatRoomResponse = self
            .http
            .post(self.url(&format!("/trips/{trip_id}/chat_room")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.room_id
            .ok_or_else(|| anyhow!("server returned no chat room for trip {trip_id}"))
    }
}

#[async_trait]
impl RoutingService for HttpDirectory {
    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<Vec<GeoPoint>> {
        let body: RouteResponse = self
            .http
            .post(self.url("/route"))
            .json(&RouteRequest { from, to })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if body.path.is_empty() {
            return Err(anyhow!("routing returned an empty path"));
        }
        Ok(body.path)
    }
}

#[async_trait]
impl ReviewService for HttpDirectory {
    async fn submit_review(
        &self,
        trip_id: TripId,
        customer_id: UserId,
        rating: u8,
        comment: Option<String>,
    ) -> Result<ReviewResponse> {
        let response = self
            .http
            .post(self.url(&format!("/trips/{trip_id}/reviews")))
            .json(&ReviewRequest {
                customer_id,
                rating,
                comment,
            })
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(anyhow!("trip {trip_id} cannot be reviewed (again)"));
        }
        response
            .error_for_status()?
            .json()
            .await
            .context("invalid review response")
    }
}

#[cfg(test)]
#[path = "tests/collaborators_tests.rs"]
mod tests;
