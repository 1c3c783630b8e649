use std::{collections::HashMap, sync::Arc, time::Duration};

use super::*;
use axum::{
    extract::{ws, Path, State, WebSocketUpgrade},
    http::StatusCode as HttpStatus,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use shared::{
    domain::{GeoPoint, Place, UserId},
    error::{ApiError, ErrorCode},
};
use tokio::net::TcpListener;

fn requested(customer: i64) -> TripRecord {
    TripRecord::requested(
        TripId::new(),
        UserId(customer),
        Place::new("Quad", GeoPoint::new(40.1075, -88.2272)),
        Place::new("Train station", GeoPoint::new(40.1156, -88.2410)),
    )
}

async fn next_item(stream: &mut DocumentStream) -> Option<Result<Option<TripDocument>>> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("feed item in time")
}

#[tokio::test]
async fn in_memory_feed_starts_with_current_value_and_filters_other_trips() {
    let store = InMemoryTripStore::new();
    let trip = requested(1);
    let mut feed = store.subscribe(trip.trip_id).await.expect("subscribe");

    let first = next_item(&mut feed).await.expect("seed").expect("ok");
    assert!(first.is_none(), "trip does not exist yet");

    store.create(&requested(2)).await.expect("other trip");
    store.create(&trip).await.expect("create");

    let seen = next_item(&mut feed)
        .await
        .expect("update")
        .expect("ok")
        .expect("document");
    assert_eq!(seen.trip_id, trip.trip_id);
    assert!(seen.updated_at.is_some());
}

#[tokio::test]
async fn in_memory_create_conflicts_on_existing_id() {
    let store = InMemoryTripStore::new();
    let trip = requested(1);
    store.create(&trip).await.expect("create");

    let err = store.create(&trip).await.expect_err("duplicate create");
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Conflict(id)) if *id == trip.trip_id
    ));

    let mut offered = trip.clone();
    offered.status = shared::domain::TripStatus::Offered;
    offered.offered_by = Some(UserId(5));
    offered.offered_fare = Some(4.0);
    store.write(&offered).await.expect("upsert");
    let read = store
        .read(trip.trip_id)
        .await
        .expect("read")
        .expect("present");
    assert_eq!(read.offered_fare, Some(4.0));
}

#[tokio::test]
async fn in_memory_write_from_an_older_read_keeps_newer_fields() {
    use shared::domain::{PaymentStatus, TripStatus};

    let store = InMemoryTripStore::new();
    let mut trip = requested(1);
    trip.status = TripStatus::InProgress;
    trip.driver_id = Some(UserId(5));
    trip.offered_by = Some(UserId(5));
    trip.offered_fare = Some(4.0);
    trip.driver_arrived_pickup = true;
    store.create(&trip).await.expect("create");
    let read_by_driver = store.read(trip.trip_id).await.expect("read").expect("present");

    let mut paid = read_by_driver.clone();
    paid.payment_status = PaymentStatus::Paid;
    store.write(&paid).await.expect("pay");

    let mut ping = read_by_driver;
    ping.driver_location = Some(GeoPoint::new(40.11, -88.23));
    let stored = store.write(&ping).await.expect("ping");

    assert_eq!(stored.payment_status, PaymentStatus::Paid);
    assert_eq!(stored.driver_location, Some(GeoPoint::new(40.11, -88.23)));
    let read = store.read(trip.trip_id).await.expect("read").expect("present");
    assert_eq!(read, stored);

    // A payment computed before the driver completed the trip keeps the completion.
    let mut at_dropoff = trip.clone();
    at_dropoff.trip_id = TripId::new();
    at_dropoff.driver_arrived_dropoff = true;
    store.create(&at_dropoff).await.expect("second trip");
    let read_by_customer = store
        .read(at_dropoff.trip_id)
        .await
        .expect("read")
        .expect("present");
    let mut completed = read_by_customer.clone();
    completed.status = TripStatus::Completed;
    store.write(&completed).await.expect("complete");
    let mut late_pay = read_by_customer;
    late_pay.payment_status = PaymentStatus::Paid;
    let stored = store.write(&late_pay).await.expect("late pay");
    assert_eq!(stored.status, TripStatus::Completed);
    assert!(stored.is_settled());
}

#[tokio::test]
async fn in_memory_read_rejects_malformed_documents() {
    let store = InMemoryTripStore::new();
    let mut document = TripDocument::from(requested(1));
    document.status = Some("TELEPORTED".into());
    store.put_document(document.clone()).await;

    let err = store
        .read(document.trip_id)
        .await
        .expect_err("unknown status");
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Malformed { .. })
    ));
    assert!(store.read(TripId::new()).await.expect("read").is_none());
}

#[derive(Clone, Default)]
struct MockServer {
    documents: Arc<std::sync::Mutex<HashMap<TripId, TripDocument>>>,
}

async fn mock_read(
    State(state): State<MockServer>,
    Path(trip_id): Path<TripId>,
) -> impl IntoResponse {
    match state.documents.lock().expect("lock").get(&trip_id).cloned() {
        Some(document) => Json(document).into_response(),
        None => HttpStatus::NOT_FOUND.into_response(),
    }
}

async fn mock_write(
    State(state): State<MockServer>,
    Path(trip_id): Path<TripId>,
    Json(document): Json<TripDocument>,
) -> Json<TripDocument> {
    state
        .documents
        .lock()
        .expect("lock")
        .insert(trip_id, document.clone());
    Json(document)
}

async fn mock_create(
    State(state): State<MockServer>,
    Json(document): Json<TripDocument>,
) -> impl IntoResponse {
    let mut documents = state.documents.lock().expect("lock");
    if documents.contains_key(&document.trip_id) {
        let err = ApiError::new(ErrorCode::Conflict, "trip already exists");
        return (HttpStatus::CONFLICT, Json(err)).into_response();
    }
    documents.insert(document.trip_id, document.clone());
    (HttpStatus::CREATED, Json(document)).into_response()
}

#[derive(serde::Deserialize)]
struct ListQuery {
    status: String,
    limit: usize,
}

async fn mock_list(
    State(state): State<MockServer>,
    axum::extract::Query(query): axum::extract::Query<ListQuery>,
) -> Json<Vec<TripDocument>> {
    let documents = state.documents.lock().expect("lock");
    Json(
        documents
            .values()
            .filter(|doc| doc.status.as_deref() == Some(query.status.as_str()))
            .take(query.limit)
            .cloned()
            .collect(),
    )
}

async fn mock_feed(
    ws: WebSocketUpgrade,
    State(state): State<MockServer>,
    Path(trip_id): Path<TripId>,
) -> impl IntoResponse {
    let current = state.documents.lock().expect("lock").get(&trip_id).cloned();
    ws.on_upgrade(move |mut socket| async move {
        let seed = match current {
            Some(document) => FeedFrame::Snapshot { document },
            None => FeedFrame::Absent { trip_id },
        };
        let frames = [
            serde_json::to_string(&seed).expect("seed"),
            "{not a frame".to_string(),
            serde_json::to_string(&FeedFrame::Absent { trip_id }).expect("absent"),
            serde_json::to_string(&FeedFrame::Error(ApiError::new(
                ErrorCode::Internal,
                "storage offline",
            )))
            .expect("error"),
        ];
        for frame in frames {
            if socket.send(ws::Message::Text(frame)).await.is_err() {
                return;
            }
        }
        let _ = socket.send(ws::Message::Close(None)).await;
    })
}

async fn spawn_trip_server() -> anyhow::Result<(String, MockServer)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = MockServer::default();
    let app = Router::new()
        .route("/trips", get(mock_list).post(mock_create))
        .route("/trips/:trip_id", get(mock_read).put(mock_write))
        .route("/trips/:trip_id/feed", get(mock_feed))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

#[tokio::test]
async fn http_store_reads_writes_and_maps_conflicts() {
    let (server_url, server) = spawn_trip_server().await.expect("server");
    let store = HttpTripStore::new(format!("{server_url}/"));
    let trip = requested(3);

    assert!(store.read(trip.trip_id).await.expect("read").is_none());
    store.create(&trip).await.expect("create");
    let err = store.create(&trip).await.expect_err("conflict");
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Conflict(_))
    ));

    let mut cancelled = trip.clone();
    cancelled.status = shared::domain::TripStatus::CancelledByCustomer;
    store.write(&cancelled).await.expect("write");
    let stored = server
        .documents
        .lock()
        .expect("lock")
        .get(&trip.trip_id)
        .cloned()
        .expect("stored");
    assert_eq!(stored.status.as_deref(), Some("CANCELLED_BY_CUSTOMER"));

    let read = store
        .read(trip.trip_id)
        .await
        .expect("read")
        .expect("present");
    assert_eq!(read, cancelled);
}

#[tokio::test]
async fn http_open_requests_skips_malformed_documents() {
    let (server_url, server) = spawn_trip_server().await.expect("server");
    let store = HttpTripStore::new(server_url);
    let open = requested(5);
    store.create(&open).await.expect("create");

    let mut broken = TripDocument::from(requested(6));
    broken.customer_id = None;
    server
        .documents
        .lock()
        .expect("lock")
        .insert(broken.trip_id, broken);

    let listed = store.open_requests(10).await.expect("list");
    assert_eq!(listed, vec![open]);
}

#[tokio::test]
async fn http_feed_maps_frames_and_ends_on_close() {
    let (server_url, _server) = spawn_trip_server().await.expect("server");
    let store = HttpTripStore::new(server_url);
    let trip = requested(4);
    store.create(&trip).await.expect("create");

    let mut feed = store.subscribe(trip.trip_id).await.expect("subscribe");

    let seed = next_item(&mut feed)
        .await
        .expect("seed")
        .expect("ok")
        .expect("snapshot");
    assert_eq!(seed.trip_id, trip.trip_id);

    // The undecodable frame is skipped.
    let absent = next_item(&mut feed).await.expect("absent").expect("ok");
    assert!(absent.is_none());

    let err = next_item(&mut feed)
        .await
        .expect("error frame")
        .expect_err("error");
    assert!(err.to_string().contains("storage offline"));

    assert!(next_item(&mut feed).await.is_none(), "closed after Close frame");
}

#[test]
fn feed_url_switches_scheme_and_path() {
    let trip_id = TripId::new();
    let plain = HttpTripStore::new("http://127.0.0.1:8787");
    assert_eq!(
        plain.feed_url(trip_id).expect("url").as_str(),
        format!("ws://127.0.0.1:8787/trips/{trip_id}/feed")
    );

    let secure = HttpTripStore::new("https://rides.example.edu/");
    assert_eq!(
        secure.feed_url(trip_id).expect("url").as_str(),
        format!("wss://rides.example.edu/trips/{trip_id}/feed")
    );

    assert!(HttpTripStore::new("ftp://example.edu")
        .feed_url(trip_id)
        .is_err());
}
