//! Access to the shared trip document store.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use shared::{
    domain::TripId,
    protocol::FeedFrame,
    trip::{TripDocument, TripRecord},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Raw change feed for one trip. `None` means the document does not exist (yet).
///
/// Delivery is at-least-once and may be reordered, coalesced, or repeated after reconnects.
pub type DocumentStream = BoxStream<'static, Result<Option<TripDocument>>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("trip {0} already exists")]
    Conflict(TripId),
    #[error("stored trip {trip_id} is malformed: {reason}")]
    Malformed { trip_id: TripId, reason: String },
}

#[async_trait]
pub trait TripStore: Send + Sync {
    async fn read(&self, trip_id: TripId) -> Result<Option<TripRecord>>;
    /// Upserts a record computed from an earlier read. The store folds it onto the current
    /// value with [`TripRecord::merge_onto`] and returns what was stored.
    async fn write(&self, record: &TripRecord) -> Result<TripRecord>;
    /// Inserts a new trip, failing with [`StoreError::Conflict`] when the id is taken.
    async fn create(&self, record: &TripRecord) -> Result<()>;
    async fn subscribe(&self, trip_id: TripId) -> Result<DocumentStream>;
}

fn decode(document: TripDocument) -> Result<TripRecord> {
    let trip_id = document.trip_id;
    TripRecord::try_from(document).map_err(|err| {
        StoreError::Malformed {
            trip_id,
            reason: err.to_string(),
        }
        .into()
    })
}

/// Process-local store: a map of documents plus a broadcast feed of every write.
pub struct InMemoryTripStore {
    documents: Mutex<HashMap<TripId, TripDocument>>,
    feed: broadcast::Sender<TripDocument>,
}

impl InMemoryTripStore {
    pub fn new() -> Arc<Self> {
        let (feed, _) = broadcast::channel(256);
        Arc::new(Self {
            documents: Mutex::new(HashMap::new()),
            feed,
        })
    }

    /// Stores and publishes a raw document without validating it.
    pub async fn put_document(&self, document: TripDocument) {
        self.documents
            .lock()
            .await
            .insert(document.trip_id, document.clone());
        let _ = self.feed.send(document);
    }

    /// Publishes a document on the feed without storing it, as a late or repeated delivery.
    pub fn redeliver(&self, document: TripDocument) {
        let _ = self.feed.send(document);
    }

    pub async fn document(&self, trip_id: TripId) -> Option<TripDocument> {
        self.documents.lock().await.get(&trip_id).cloned()
    }

    async fn store(&self, record: &TripRecord, must_be_new: bool) -> Result<TripRecord> {
        let mut documents = self.documents.lock().await;
        let mut merged = match documents.get(&record.trip_id) {
            Some(_) if must_be_new => return Err(StoreError::Conflict(record.trip_id).into()),
            Some(existing) => match TripRecord::try_from(existing.clone()) {
                Ok(stored) => record.clone().merge_onto(&stored),
                Err(err) => {
                    warn!(trip_id = %record.trip_id, %err, "store: replacing malformed document");
                    record.clone()
                }
            },
            None => record.clone(),
        };
        merged.updated_at = Some(chrono::Utc::now());
        let document = TripDocument::from(&merged);
        documents.insert(record.trip_id, document.clone());
        let _ = self.feed.send(document);
        Ok(merged)
    }
}

#[async_trait]
impl TripStore for InMemoryTripStore {
    async fn read(&self, trip_id: TripId) -> Result<Option<TripRecord>> {
        self.document(trip_id).await.map(decode).transpose()
    }

    async fn write(&self, record: &TripRecord) -> Result<TripRecord> {
        self.store(record, false).await
    }

    async fn create(&self, record: &TripRecord) -> Result<()> {
        self.store(record, true).await.map(|_| ())
    }

    async fn subscribe(&self, trip_id: TripId) -> Result<DocumentStream> {
        let rx = self.feed.subscribe();
        let current = self.document(trip_id).await;
        let updates = BroadcastStream::new(rx).filter_map(move |item| async move {
            match item {
                Ok(document) if document.trip_id == trip_id => Some(Ok(Some(document))),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(%trip_id, skipped, "store: in-memory feed lagged");
                    None
                }
            }
        });
        Ok(futures::stream::once(async move { Ok(current) })
            .chain(updates)
            .boxed())
    }
}

/// Store backed by the trip service over HTTP, with a WebSocket change feed.
pub struct HttpTripStore {
    http: Client,
    server_url: String,
}

impl HttpTripStore {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn feed_url(&self, trip_id: TripId) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url: {}", self.server_url))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => return Err(anyhow!("server_url must be http or https, got {other}")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {}", self.server_url))?;
        url.set_path(&format!("/trips/{trip_id}/feed"));
        Ok(url)
    }

    /// Trips still waiting for an offer, oldest first. Undecodable documents are skipped.
    pub async fn open_requests(&self, limit: u32) -> Result<Vec<TripRecord>> {
        let documents: Vec<TripDocument> = self
            .http
            .get(format!("{}/trips", self.server_url))
            .query(&[("status", "REQUESTED".to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .context("open request listing failed")?
            .error_for_status()?
            .json()
            .await?;
        Ok(documents
            .into_iter()
            .filter_map(|document| {
                let trip_id = document.trip_id;
                TripRecord::try_from(document)
                    .map_err(|err| warn!(%trip_id, %err, "store: skipping malformed open request"))
                    .ok()
            })
            .collect())
    }
}

#[async_trait]
impl TripStore for HttpTripStore {
    async fn read(&self, trip_id: TripId) -> Result<Option<TripRecord>> {
        let response = self
            .http
            .get(format!("{}/trips/{trip_id}", self.server_url))
            .send()
            .await
            .context("trip read request failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let document: TripDocument = response
            .error_for_status()
            .context("trip read rejected")?
            .json()
            .await
            .context("trip read returned an invalid document")?;
        decode(document).map(Some)
    }

    async fn write(&self, record: &TripRecord) -> Result<TripRecord> {
        let stored: TripDocument = self
            .http
            .put(format!("{}/trips/{}", self.server_url, record.trip_id))
            .json(&TripDocument::from(record))
            .send()
            .await
            .context("trip write request failed")?
            .error_for_status()
            .context("trip write rejected")?
            .json()
            .await
            .context("trip write returned an invalid document")?;
        decode(stored)
    }

    async fn create(&self, record: &TripRecord) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/trips", self.server_url))
            .json(&TripDocument::from(record))
            .send()
            .await
            .context("trip create request failed")?;
        if response.status() == StatusCode::CONFLICT {
            return Err(StoreError::Conflict(record.trip_id).into());
        }
        response
            .error_for_status()
            .context("trip create rejected")?;
        Ok(())
    }

    async fn subscribe(&self, trip_id: TripId) -> Result<DocumentStream> {
        let url = self.feed_url(trip_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect trip feed: {url}"))?;
        debug!(%trip_id, "store: feed socket connected");

        let frames = ws_stream
            .take_while(|msg| {
                let open = !matches!(msg, Ok(Message::Close(_)));
                async move { open }
            })
            .filter_map(move |msg| async move {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<FeedFrame>(&text) {
                        Ok(FeedFrame::Snapshot { document }) => Some(Ok(Some(document))),
                        Ok(FeedFrame::Absent { .. }) => Some(Ok(None)),
                        Ok(FeedFrame::Error(err)) => {
                            Some(Err(anyhow::Error::new(err).context("trip feed error")))
                        }
                        Err(err) => {
                            warn!(%trip_id, %err, "store: dropping undecodable feed frame");
                            None
                        }
                    },
                    Ok(_) => None,
                    Err(err) => Some(Err(anyhow!("trip feed receive failed: {err}"))),
                }
            });
        Ok(frames.boxed())
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
