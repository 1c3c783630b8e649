//! Route recomputation toward the driver's current target.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use shared::domain::GeoPoint;
use tracing::{debug, warn};

use crate::collaborators::RoutingService;

pub const DEFAULT_ROUTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver position and the stop it is heading to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RouteInput {
    pub driver: GeoPoint,
    pub target: GeoPoint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub seq: u64,
    pub from: GeoPoint,
    pub to: GeoPoint,
    pub path: Vec<GeoPoint>,
}

/// An issued recomputation. Results are matched back by `seq`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteTicket {
    pub seq: u64,
    pub input: RouteInput,
}

#[derive(Debug)]
pub struct RouteResult {
    pub seq: u64,
    pub input: RouteInput,
    pub outcome: Result<Vec<GeoPoint>>,
}

/// Decides when to recompute and which result may be displayed.
///
/// Sequence numbers keep growing across trips so a late result from an earlier trip can
/// never match a newer ticket.
pub struct RouteRecomputer {
    timeout: Duration,
    issued_seq: u64,
    last_issued: Option<RouteInput>,
    applied: Option<Route>,
}

impl Default for RouteRecomputer {
    fn default() -> Self {
        Self::new(DEFAULT_ROUTE_TIMEOUT)
    }
}

impl RouteRecomputer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            issued_seq: 0,
            last_issued: None,
            applied: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issues a ticket unless `input` matches the last issued pair.
    pub fn request(&mut self, input: RouteInput) -> Option<RouteTicket> {
        if self.last_issued == Some(input) {
            return None;
        }
        self.issued_seq += 1;
        self.last_issued = Some(input);
        debug!(seq = self.issued_seq, driver = %input.driver, target = %input.target, "route: recompute issued");
        Some(RouteTicket {
            seq: self.issued_seq,
            input,
        })
    }

    /// Runs one ticket against the routing service, bounded by `timeout`.
    pub async fn compute(
        routing: &dyn RoutingService,
        ticket: RouteTicket,
        timeout: Duration,
    ) -> RouteResult {
        let RouteTicket { seq, input } = ticket;
        let outcome = match tokio::time::timeout(timeout, routing.route(input.driver, input.target))
            .await
        {
            Ok(Ok(path)) if path.is_empty() => Err(anyhow!("routing returned an empty path")),
            Ok(result) => result,
            Err(_) => Err(anyhow!("routing timed out after {timeout:?}")),
        };
        RouteResult {
            seq,
            input,
            outcome,
        }
    }

    /// Applies a result if it belongs to the newest ticket. Returns the new route when it
    /// replaced the displayed one.
    pub fn apply(&mut self, result: RouteResult) -> Option<&Route> {
        if result.seq != self.issued_seq {
            debug!(
                seq = result.seq,
                newest = self.issued_seq,
                "route: dropping superseded result"
            );
            return None;
        }
        match result.outcome {
            Ok(path) => {
                self.applied = Some(Route {
                    seq: result.seq,
                    from: result.input.driver,
                    to: result.input.target,
                    path,
                });
                self.applied.as_ref()
            }
            Err(err) => {
                warn!(seq = result.seq, error = %err, "route: recompute failed, keeping previous route");
                // Let the same pair be retried on the next ping.
                self.last_issued = None;
                None
            }
        }
    }

    pub fn current(&self) -> Option<&Route> {
        self.applied.as_ref()
    }

    /// Forgets the displayed route and pending pair for a trip switch.
    pub fn reset(&mut self) {
        self.last_issued = None;
        self.applied = None;
    }
}

#[cfg(test)]
#[path = "tests/route_tests.rs"]
mod tests;
