use serde::{Deserialize, Serialize};
use std::fmt;

/// Geographic admission box for trip endpoints. Defaults to the NYC
/// operating area the models were trained on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            min_lat: 40.5,
            min_lon: -74.3,
            max_lat: 40.9,
            max_lon: -73.7,
        }
    }
}

impl BoundingBox {
    /// Parses the `min_lat,min_lon,max_lat,max_lon` form used by the
    /// `BOUNDING_BOX` environment variable.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let parts: Vec<f64> = raw
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("invalid bounding box {raw:?}: {e}"))?;
        if parts.len() != 4 {
            return Err(format!(
                "bounding box must have 4 comma-separated numbers, got {}",
                parts.len()
            ));
        }
        let parsed = Self {
            min_lat: parts[0],
            min_lon: parts[1],
            max_lat: parts[2],
            max_lon: parts[3],
        };
        if !parsed.min_lat.is_finite()
            || !parsed.min_lon.is_finite()
            || !parsed.max_lat.is_finite()
            || !parsed.max_lon.is_finite()
            || parsed.min_lat >= parsed.max_lat
            || parsed.min_lon >= parsed.max_lon
        {
            return Err(format!("bounding box {raw:?} is not a valid area"));
        }
        Ok(parsed)
    }

    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

/// A single prediction request as received on the wire. Unknown JSON fields
/// are ignored for forward compatibility; validation happens in
/// [`crate::features::build_features`], not during deserialization.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TripRequest {
    pub pickup_latitude: f64,
    pub pickup_longitude: f64,
    pub dropoff_latitude: f64,
    pub dropoff_longitude: f64,
    pub passenger_count: i64,
    pub vendor_id: i64,
    pub pickup_datetime: String,
}

/// Client-side mistakes rejected at ingress. These map to HTTP 400 and are
/// never logged as service errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    InvalidCoordinate { field: &'static str, value: f64 },
    OutsideBoundingBox { field: &'static str, lat: f64, lon: f64 },
    InvalidPassengerCount { value: i64 },
    InvalidTimestamp { value: String },
    DistanceExceedsLimit { distance_km: f64 },
}

impl ValidationError {
    /// Stable wire identifier surfaced as `error_kind`.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCoordinate { .. } => "InvalidCoordinate",
            Self::OutsideBoundingBox { .. } => "OutsideBoundingBox",
            Self::InvalidPassengerCount { .. } => "InvalidPassengerCount",
            Self::InvalidTimestamp { .. } => "InvalidTimestamp",
            Self::DistanceExceedsLimit { .. } => "DistanceExceedsLimit",
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCoordinate { field, value } => {
                write!(f, "{field} is not a finite coordinate: {value}")
            }
            Self::OutsideBoundingBox { field, lat, lon } => {
                write!(f, "{field} ({lat}, {lon}) is outside the service area")
            }
            Self::InvalidPassengerCount { value } => {
                write!(f, "passenger_count must be between 1 and 6, got {value}")
            }
            Self::InvalidTimestamp { value } => {
                write!(f, "pickup_datetime is not a valid ISO-8601 timestamp: {value:?}")
            }
            Self::DistanceExceedsLimit { distance_km } => {
                write!(f, "trip distance {distance_km:.1} km exceeds the 200 km limit")
            }
        }
    }
}

impl std::error::Error for ValidationError {}
