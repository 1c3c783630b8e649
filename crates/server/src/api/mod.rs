use shared::{
    domain::{DriverStats, GeoPoint, ProfileSummary, TripId, TripStatus, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChatRoomResponse, CreateUserRequest, CreateUserResponse, ReviewRequest, ReviewResponse,
        RouteRequest, RouteResponse,
    },
    trip::{TripDocument, TripRecord},
};
use storage::{NewReview, Storage};
use tracing::warn;

const MAX_NAME_BYTES: usize = 80;
const MAX_COMMENT_BYTES: usize = 1000;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub route_segments: usize,
}

pub async fn read_trip(ctx: &ApiContext, trip_id: TripId) -> Result<TripDocument, ApiError> {
    ctx.storage
        .load_trip(trip_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "trip not found"))
}

/// Stores a record computed from an earlier read. The body must decode into a valid record
/// for the addressed trip and is folded onto the stored one with [`TripRecord::merge_onto`].
pub async fn write_trip(
    ctx: &ApiContext,
    trip_id: TripId,
    document: TripDocument,
) -> Result<TripDocument, ApiError> {
    if document.trip_id != trip_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "trip_id in body does not match path",
        ));
    }
    let incoming = decode(&document)?;
    ctx.storage
        .update_trip(trip_id, move |current| {
            let merged = match current.map(TripRecord::try_from) {
                Some(Ok(stored)) => incoming.merge_onto(&stored),
                Some(Err(err)) => {
                    warn!(%trip_id, %err, "replacing malformed stored trip");
                    incoming
                }
                None => incoming,
            };
            Ok(TripDocument::from(merged))
        })
        .await
        .map_err(internal)
}

pub async fn create_trip(
    ctx: &ApiContext,
    document: TripDocument,
) -> Result<TripDocument, ApiError> {
    let record = decode(&document)?;
    if record.status != TripStatus::Requested {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "new trips must start as REQUESTED",
        ));
    }
    ctx.storage
        .insert_trip_if_absent(&document)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Conflict, "trip already exists"))
}

pub async fn list_trips(
    ctx: &ApiContext,
    status: &str,
    limit: u32,
) -> Result<Vec<TripDocument>, ApiError> {
    let status = TripStatus::parse(status).ok_or_else(|| {
        ApiError::new(ErrorCode::Validation, format!("unknown trip status `{status}`"))
    })?;
    ctx.storage
        .list_trips_by_status(status.as_str(), limit)
        .await
        .map_err(internal)
}

pub async fn create_user(
    ctx: &ApiContext,
    req: CreateUserRequest,
) -> Result<CreateUserResponse, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "name cannot be empty"));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(ApiError::new(ErrorCode::Validation, "name is too long"));
    }
    let user_id = ctx
        .storage
        .create_user(name, req.role, req.vehicle.as_ref())
        .await
        .map_err(internal)?;
    Ok(CreateUserResponse { user_id })
}

pub async fn profile(ctx: &ApiContext, user_id: UserId) -> Result<ProfileSummary, ApiError> {
    ctx.storage
        .load_profile(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))
}

pub async fn driver_stats(ctx: &ApiContext, driver_id: UserId) -> Result<DriverStats, ApiError> {
    ctx.storage.driver_stats(driver_id).await.map_err(internal)
}

pub async fn chat_room(ctx: &ApiContext, trip_id: TripId) -> Result<ChatRoomResponse, ApiError> {
    read_trip(ctx, trip_id).await?;
    let room_id = ctx
        .storage
        .chat_room_for_trip(trip_id)
        .await
        .map_err(internal)?;
    Ok(ChatRoomResponse { trip_id, room_id })
}

pub async fn open_chat_room(
    ctx: &ApiContext,
    trip_id: TripId,
) -> Result<ChatRoomResponse, ApiError> {
    read_trip(ctx, trip_id).await?;
    let room_id = ctx
        .storage
        .ensure_chat_room(trip_id)
        .await
        .map_err(internal)?;
    Ok(ChatRoomResponse {
        trip_id,
        room_id: Some(room_id),
    })
}

/// Reviews are accepted once per trip, from the trip's customer, after completion and payment.
pub async fn submit_review(
    ctx: &ApiContext,
    trip_id: TripId,
    req: ReviewRequest,
) -> Result<ReviewResponse, ApiError> {
    if !(1..=5).contains(&req.rating) {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "rating must be between 1 and 5",
        ));
    }
    let comment = req
        .comment
        .as_deref()
        .map(str::trim)
        .filter(|comment| !comment.is_empty());
    if comment.is_some_and(|comment| comment.len() > MAX_COMMENT_BYTES) {
        return Err(ApiError::new(ErrorCode::Validation, "comment is too long"));
    }

    let record = decode(&read_trip(ctx, trip_id).await?)?;
    if record.customer_id != req.customer_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the trip's customer can review it",
        ));
    }
    if !record.is_settled() {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            "trip must be completed and paid before review",
        ));
    }
    let driver_id = record
        .driver_id
        .ok_or_else(|| ApiError::new(ErrorCode::Validation, "trip has no driver"))?;

    let stored = ctx
        .storage
        .insert_review(NewReview {
            trip_id,
            driver_id,
            customer_id: req.customer_id,
            rating: req.rating,
            comment,
        })
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Conflict, "trip already reviewed"))?;

    Ok(ReviewResponse {
        review_id: stored.review_id,
        driver_id: stored.driver_id,
        created_at: stored.created_at,
    })
}

/// Reference router: evenly spaced points on the straight line between the endpoints.
pub fn plan_route(ctx: &ApiContext, req: RouteRequest) -> Result<RouteResponse, ApiError> {
    if !req.from.is_valid() || !req.to.is_valid() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "route endpoints must be valid coordinates",
        ));
    }
    if req.from == req.to {
        return Ok(RouteResponse {
            path: vec![req.from],
        });
    }

    let segments = ctx.route_segments.max(1);
    let path = (0..=segments)
        .map(|step| {
            let t = step as f64 / segments as f64;
            GeoPoint::new(
                req.from.lat + (req.to.lat - req.from.lat) * t,
                req.from.lng + (req.to.lng - req.from.lng) * t,
            )
        })
        .collect();
    Ok(RouteResponse { path })
}

fn decode(document: &TripDocument) -> Result<TripRecord, ApiError> {
    TripRecord::try_from(document.clone())
        .map_err(|e| ApiError::new(ErrorCode::Validation, e.to_string()))
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
