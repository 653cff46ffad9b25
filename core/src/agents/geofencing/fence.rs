// Circle fence geometry and the fence state machine
//
//   In  -> Leaving  -> Out | In
//   Out -> Arriving -> In  | Out
//
// Location updates move between steady and pending modes; only the passage
// of a grace period commits a pending mode.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Result, WarrenError};

/// Mean Earth radius used for great-circle distance, in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// How many committed fence ids are remembered.
pub const ISSUED_FENCES_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Haversine distance in metres.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.lon - self.lon).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CircleFence {
    pub id: String,
    pub center: GeoPoint,
    /// Metres
    pub radius: f64,
    #[serde(default)]
    pub entering_description: String,
    #[serde(default)]
    pub leaving_description: String,
}

impl CircleFence {
    /// Points exactly on the boundary count as inside.
    pub fn contains(&self, point: &GeoPoint) -> bool {
        self.center.distance_to(point) <= self.radius
    }

    fn description_for(&self, mode: FenceMode) -> &str {
        match mode {
            FenceMode::In => &self.entering_description,
            _ => &self.leaving_description,
        }
    }
}

/// Options for one geofencing agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeofencingOptions {
    pub circle_fence: CircleFence,
    /// Time spent outside before `Leaving` commits to `Out`.
    #[serde(default)]
    pub leaving_grace_ms: u64,
    /// Time spent inside before `Arriving` commits to `In`.
    #[serde(default)]
    pub arriving_grace_ms: u64,
}

impl GeofencingOptions {
    pub fn validate(&self) -> Result<()> {
        let fence = &self.circle_fence;
        if fence.id.trim().is_empty() {
            return Err(WarrenError::InvalidOptions(
                "circle_fence.id must not be empty".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&fence.center.lat) {
            return Err(WarrenError::InvalidOptions(format!(
                "circle_fence.center.lat out of range: {}",
                fence.center.lat
            )));
        }
        if !(-180.0..=180.0).contains(&fence.center.lon) {
            return Err(WarrenError::InvalidOptions(format!(
                "circle_fence.center.lon out of range: {}",
                fence.center.lon
            )));
        }
        if !fence.radius.is_finite() || fence.radius <= 0.0 {
            return Err(WarrenError::InvalidOptions(format!(
                "circle_fence.radius must be positive, got {}",
                fence.radius
            )));
        }
        Ok(())
    }

    fn grace_for(&self, mode: FenceMode) -> Option<Duration> {
        let ms = match mode {
            FenceMode::Leaving => self.leaving_grace_ms,
            FenceMode::Arriving => self.arriving_grace_ms,
            FenceMode::In | FenceMode::Out => return None,
        };
        Some(Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum FenceMode {
    Leaving,
    Arriving,
    In,
    Out,
}

impl FenceMode {
    pub fn is_steady(self) -> bool {
        matches!(self, FenceMode::In | FenceMode::Out)
    }
}

impl fmt::Display for FenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FenceMode::Leaving => "Leaving",
            FenceMode::Arriving => "Arriving",
            FenceMode::In => "In",
            FenceMode::Out => "Out",
        };
        f.write_str(s)
    }
}

/// Persisted state of a geofencing agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FenceState {
    pub mode: FenceMode,
    pub since: DateTime<Utc>,
    #[serde(default)]
    pub issued_fences: VecDeque<String>,
}

impl Default for FenceState {
    fn default() -> Self {
        Self {
            mode: FenceMode::Out,
            since: DateTime::<Utc>::default(),
            issued_fences: VecDeque::new(),
        }
    }
}

/// A committed steady-state change, ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct FenceCrossing {
    pub fence: String,
    pub description: String,
    pub state: FenceMode,
}

impl FenceState {
    /// Applies a location update. Only moves between steady and pending
    /// modes, so it never produces a crossing.
    pub fn observe(&mut self, inside: bool, now: DateTime<Utc>) {
        let next = match (self.mode, inside) {
            (FenceMode::In, false) => FenceMode::Leaving,
            (FenceMode::Out, true) => FenceMode::Arriving,
            (FenceMode::Leaving, true) => FenceMode::In,
            (FenceMode::Arriving, false) => FenceMode::Out,
            (mode, _) => mode,
        };
        if next == self.mode {
            return;
        }
        // Entering a pending mode starts the grace clock; a revert keeps the
        // timestamp of the last steady commit.
        if !next.is_steady() {
            self.since = now;
        }
        self.mode = next;
    }

    /// Commits a pending mode whose grace period has elapsed.
    pub fn tick(
        &mut self,
        options: &GeofencingOptions,
        now: DateTime<Utc>,
    ) -> Option<FenceCrossing> {
        let grace = options.grace_for(self.mode)?;
        if now - self.since < grace {
            return None;
        }
        let committed = match self.mode {
            FenceMode::Leaving => FenceMode::Out,
            FenceMode::Arriving => FenceMode::In,
            FenceMode::In | FenceMode::Out => return None,
        };
        self.mode = committed;
        self.since = now;

        let fence = &options.circle_fence;
        self.remember(fence.id.clone());
        Some(FenceCrossing {
            fence: fence.id.clone(),
            description: fence.description_for(committed).to_string(),
            state: committed,
        })
    }

    fn remember(&mut self, fence_id: String) {
        self.issued_fences.push_back(fence_id);
        while self.issued_fences.len() > ISSUED_FENCES_LIMIT {
            self.issued_fences.pop_front();
        }
    }
}
