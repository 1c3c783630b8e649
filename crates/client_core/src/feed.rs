use futures::StreamExt;
use shared::{domain::TripId, trip::TripRecord};
use tracing::{debug, error, warn};

use crate::store::{DocumentStream, TripStore};

/// What a subscriber sees for its trip.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    /// The document does not exist (yet), or nothing decodable has arrived.
    Loading,
    Snapshot(TripRecord),
}

/// One subscriber's view of the store feed for a single trip.
///
/// Only decoded, valid records are handed out and consecutive identical items are
/// suppressed. Write order is not restored; the projector handles stale deliveries.
pub struct ChangeFeedSubscription {
    trip_id: TripId,
    stream: Option<DocumentStream>,
    last: Option<FeedItem>,
    seen_valid: bool,
}

impl ChangeFeedSubscription {
    pub async fn open(store: &dyn TripStore, trip_id: TripId) -> anyhow::Result<Self> {
        let stream = store.subscribe(trip_id).await?;
        debug!(%trip_id, "feed: subscribed");
        Ok(Self::from_stream(trip_id, stream))
    }

    pub fn from_stream(trip_id: TripId, stream: DocumentStream) -> Self {
        Self {
            trip_id,
            stream: Some(stream),
            last: None,
            seen_valid: false,
        }
    }

    pub fn trip_id(&self) -> TripId {
        self.trip_id
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Waits for the next item that differs from the previous one.
    ///
    /// Returns `None` once the subscription is closed or the transport fails.
    pub async fn next(&mut self) -> Option<FeedItem> {
        loop {
            let stream = self.stream.as_mut()?;
            let item = match stream.next().await {
                Some(Ok(Some(document))) => {
                    if document.trip_id != self.trip_id {
                        debug!(
                            trip_id = %self.trip_id,
                            other = %document.trip_id,
                            "feed: ignoring document for another trip"
                        );
                        continue;
                    }
                    match TripRecord::try_from(document) {
                        Ok(record) => {
                            self.seen_valid = true;
                            FeedItem::Snapshot(record)
                        }
                        Err(err) => {
                            warn!(trip_id = %self.trip_id, %err, "feed: dropping malformed trip document");
                            if self.seen_valid {
                                continue;
                            }
                            FeedItem::Loading
                        }
                    }
                }
                Some(Ok(None)) => FeedItem::Loading,
                Some(Err(err)) => {
                    error!(trip_id = %self.trip_id, error = %err, "feed: subscription failed");
                    self.close();
                    return None;
                }
                None => {
                    debug!(trip_id = %self.trip_id, "feed: stream ended");
                    self.close();
                    return None;
                }
            };

            if self.last.as_ref() == Some(&item) {
                continue;
            }
            self.last = Some(item.clone());
            return Some(item);
        }
    }

    /// Drops the underlying stream. Later calls to [`next`](Self::next) return `None`.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(trip_id = %self.trip_id, "feed: unsubscribed");
        }
    }
}

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod tests;
