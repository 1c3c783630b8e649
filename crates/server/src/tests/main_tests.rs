use super::*;
use axum::{
    body::{self, Body},
    http::Request,
};
use futures::StreamExt;
use shared::{
    domain::{GeoPoint, Place, Role},
    trip::TripRecord,
};
use std::time::Duration;
use tower::ServiceExt;

async fn test_app() -> (Router, Storage) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let api = ApiContext {
        storage: storage.clone(),
        route_segments: 2,
    };
    let (feed, _) = broadcast::channel(32);
    let app = build_router(Arc::new(AppState { api, feed }));
    (app, storage)
}

fn new_request(customer: UserId) -> TripDocument {
    TripDocument::from(TripRecord::requested(
        TripId::new(),
        customer,
        Place::new("Engineering Hall", GeoPoint::new(40.1110, -88.2265)),
        Place::new("Grocery", GeoPoint::new(40.1030, -88.2380)),
    ))
}

fn json_request(method: &str, uri: &str, body: &impl serde::Serialize) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).expect("encode")))
        .expect("request")
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _storage) = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn create_read_and_update_trip_routes() {
    let (app, _storage) = test_app().await;
    let doc = new_request(UserId(1));

    let created = app
        .clone()
        .oneshot(json_request("POST", "/trips", &doc))
        .await
        .expect("response");
    assert_eq!(created.status(), StatusCode::CREATED);

    let duplicate = app
        .clone()
        .oneshot(json_request("POST", "/trips", &doc))
        .await
        .expect("response");
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let err: ApiError = read_json(duplicate).await;
    assert_eq!(err.code, ErrorCode::Conflict);

    let mut offered = doc.clone();
    offered.status = Some("OFFERED".into());
    offered.offered_by = Some(UserId(2));
    offered.offered_fare = Some(5.5);
    let updated = app
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!("/trips/{}", doc.trip_id),
            &offered,
        ))
        .await
        .expect("response");
    assert_eq!(updated.status(), StatusCode::OK);

    let read = app
        .oneshot(
            Request::get(format!("/trips/{}", doc.trip_id))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(read.status(), StatusCode::OK);
    let stored: TripDocument = read_json(read).await;
    assert_eq!(stored.status.as_deref(), Some("OFFERED"));
    assert_eq!(stored.offered_fare, Some(5.5));
}

#[tokio::test]
async fn put_with_invalid_record_is_rejected() {
    let (app, _storage) = test_app().await;
    let mut doc = new_request(UserId(1));
    doc.driver_id = Some(UserId(3));

    let response = app
        .oneshot(json_request("PUT", &format!("/trips/{}", doc.trip_id), &doc))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_trip_is_not_found() {
    let (app, _storage) = test_app().await;
    let response = app
        .oneshot(
            Request::get(format!("/trips/{}", TripId::new()))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn lists_open_requests() {
    let (app, storage) = test_app().await;
    let open = new_request(UserId(1));
    storage.upsert_trip(&open).await.expect("seed");

    let response = app
        .oneshot(
            Request::get("/trips?status=REQUESTED&limit=5")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let listed: Vec<TripDocument> = read_json(response).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].trip_id, open.trip_id);
}

#[tokio::test]
async fn user_registration_and_profile_routes() {
    let (app, _storage) = test_app().await;
    let created = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/users",
            &CreateUserRequest {
                name: "Dana".into(),
                role: Role::Driver,
                vehicle: None,
            },
        ))
        .await
        .expect("response");
    assert_eq!(created.status(), StatusCode::OK);
    let created: CreateUserResponse = read_json(created).await;

    let profile = app
        .clone()
        .oneshot(
            Request::get(format!("/users/{}/profile", created.user_id))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(profile.status(), StatusCode::OK);
    let profile: ProfileSummary = read_json(profile).await;
    assert_eq!(profile.name, "Dana");

    let stats = app
        .oneshot(
            Request::get(format!("/drivers/{}/stats", created.user_id))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let stats: DriverStats = read_json(stats).await;
    assert_eq!(stats.review_count, 0);
}

#[tokio::test]
async fn route_endpoint_returns_polyline() {
    let (app, _storage) = test_app().await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/route",
            &RouteRequest {
                from: GeoPoint::new(40.0, -88.0),
                to: GeoPoint::new(40.2, -88.2),
            },
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let route: RouteResponse = read_json(response).await;
    assert_eq!(route.path.len(), 3);
}

async fn next_frame<S>(socket: &mut S) -> FeedFrame
where
    S: futures::Stream<
            Item = Result<
                tokio_tungstenite::tungstenite::Message,
                tokio_tungstenite::tungstenite::Error,
            >,
        > + Unpin,
{
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("frame in time")
        .expect("open socket")
        .expect("message");
    serde_json::from_str(message.to_text().expect("text")).expect("frame")
}

#[tokio::test]
async fn feed_socket_seeds_current_value_then_streams_writes() {
    let (app, _storage) = test_app().await;
    let doc = new_request(UserId(1));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let served = app.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, served).await.expect("serve");
    });

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/trips/{}/feed", doc.trip_id))
            .await
            .expect("connect");

    match next_frame(&mut socket).await {
        FeedFrame::Absent { trip_id } => assert_eq!(trip_id, doc.trip_id),
        other => panic!("expected absent seed, got {other:?}"),
    }

    app.clone()
        .oneshot(json_request("POST", "/trips", &new_request(UserId(9))))
        .await
        .expect("unrelated trip");
    app.oneshot(json_request("POST", "/trips", &doc))
        .await
        .expect("watched trip");

    match next_frame(&mut socket).await {
        FeedFrame::Snapshot { document } => {
            assert_eq!(document.trip_id, doc.trip_id);
            assert_eq!(document.status.as_deref(), Some("REQUESTED"));
        }
        other => panic!("expected snapshot, got {other:?}"),
    }

    server.abort();
}
