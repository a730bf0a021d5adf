use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::request::{BoundingBox, TripRequest, ValidationError};

/// Canonical feature ordering. This is a wire contract shared with every
/// trained model; reordering is a breaking change.
pub const FEATURE_ORDER: [&str; 8] = [
    "distance_km",
    "passenger_count",
    "vendor_id",
    "hour_of_day",
    "day_of_week",
    "month",
    "is_weekend",
    "is_rush_hour",
];

pub const FEATURE_COUNT: usize = FEATURE_ORDER.len();

const EARTH_RADIUS_KM: f64 = 6371.0;
const MAX_TRIP_DISTANCE_KM: f64 = 200.0;
const RUSH_HOURS: [u32; 6] = [7, 8, 9, 17, 18, 19];

/// The ordered 8-tuple every predictor consumes. Derived purely from a
/// [`TripRequest`]; immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub distance_km: f64,
    pub passenger_count: i64,
    pub vendor_id: i64,
    pub hour_of_day: u32,
    pub day_of_week: u32,
    pub month: u32,
    pub is_weekend: u8,
    pub is_rush_hour: u8,
}

impl FeatureVector {
    /// Dense representation in [`FEATURE_ORDER`] order.
    #[must_use]
    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.distance_km,
            self.passenger_count as f64,
            self.vendor_id as f64,
            f64::from(self.hour_of_day),
            f64::from(self.day_of_week),
            f64::from(self.month),
            f64::from(self.is_weekend),
            f64::from(self.is_rush_hour),
        ]
    }
}

/// Great-circle distance between two coordinates in kilometers.
#[must_use]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// Builds the feature vector for a request, enforcing every ingress
/// invariant. Pure and stateless: no I/O, no clock reads.
pub fn build_features(
    req: &TripRequest,
    bbox: &BoundingBox,
) -> Result<FeatureVector, ValidationError> {
    let coords = [
        ("pickup_latitude", req.pickup_latitude),
        ("pickup_longitude", req.pickup_longitude),
        ("dropoff_latitude", req.dropoff_latitude),
        ("dropoff_longitude", req.dropoff_longitude),
    ];
    for (field, value) in coords {
        if !value.is_finite() {
            return Err(ValidationError::InvalidCoordinate { field, value });
        }
    }
    if !bbox.contains(req.pickup_latitude, req.pickup_longitude) {
        return Err(ValidationError::OutsideBoundingBox {
            field: "pickup",
            lat: req.pickup_latitude,
            lon: req.pickup_longitude,
        });
    }
    if !bbox.contains(req.dropoff_latitude, req.dropoff_longitude) {
        return Err(ValidationError::OutsideBoundingBox {
            field: "dropoff",
            lat: req.dropoff_latitude,
            lon: req.dropoff_longitude,
        });
    }
    if !(1..=6).contains(&req.passenger_count) {
        return Err(ValidationError::InvalidPassengerCount {
            value: req.passenger_count,
        });
    }
    let pickup = parse_pickup_datetime(&req.pickup_datetime).ok_or_else(|| {
        ValidationError::InvalidTimestamp {
            value: req.pickup_datetime.clone(),
        }
    })?;

    let distance_km = haversine_km(
        req.pickup_latitude,
        req.pickup_longitude,
        req.dropoff_latitude,
        req.dropoff_longitude,
    );
    if distance_km > MAX_TRIP_DISTANCE_KM {
        return Err(ValidationError::DistanceExceedsLimit { distance_km });
    }

    let hour_of_day = pickup.hour();
    let day_of_week = pickup.weekday().num_days_from_monday();
    Ok(FeatureVector {
        distance_km: distance_km.max(0.0),
        passenger_count: req.passenger_count,
        vendor_id: req.vendor_id,
        hour_of_day,
        day_of_week,
        month: pickup.month(),
        is_weekend: u8::from(day_of_week >= 5),
        is_rush_hour: u8::from(RUSH_HOURS.contains(&hour_of_day)),
    })
}

/// Pickup timestamps arrive as ISO-8601 local wall-clock time. A trailing
/// `Z` is tolerated and treated as the same wall-clock instant.
fn parse_pickup_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim().trim_end_matches('Z');
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pickup_datetime: &str) -> TripRequest {
        TripRequest {
            pickup_latitude: 40.7580,
            pickup_longitude: -73.9855,
            dropoff_latitude: 40.7614,
            dropoff_longitude: -73.9776,
            passenger_count: 1,
            vendor_id: 1,
            pickup_datetime: pickup_datetime.to_string(),
        }
    }

    #[test]
    fn haversine_is_symmetric() {
        let d1 = haversine_km(40.7580, -73.9855, 40.6413, -73.7781);
        let d2 = haversine_km(40.6413, -73.7781, 40.7580, -73.9855);
        assert!((d1 - d2).abs() < 1e-9);
    }

    #[test]
    fn haversine_zero_for_identical_points() {
        assert!(haversine_km(40.75, -73.98, 40.75, -73.98).abs() < 1e-12);
    }

    #[test]
    fn times_square_to_central_park_is_short() {
        let d = haversine_km(40.7580, -73.9855, 40.7614, -73.9776);
        assert!((d - 0.77).abs() < 0.05, "expected ~0.77 km, got {d}");
    }

    #[test]
    fn times_square_to_jfk_matches_known_distance() {
        let d = haversine_km(40.7580, -73.9855, 40.6413, -73.7781);
        assert!((d - 21.8).abs() < 0.5, "expected ~21.8 km, got {d}");
    }

    #[test]
    fn weekday_rush_hour_trip_features() {
        // 2024-03-14 is a Thursday.
        let features =
            build_features(&request("2024-03-14T17:30:00"), &BoundingBox::default())
                .expect("build");
        assert_eq!(features.hour_of_day, 17);
        assert_eq!(features.day_of_week, 3);
        assert_eq!(features.month, 3);
        assert_eq!(features.is_weekend, 0);
        assert_eq!(features.is_rush_hour, 1);
        assert!((features.distance_km - 0.77).abs() < 0.05);
    }

    #[test]
    fn saturday_midday_is_weekend_not_rush() {
        // 2024-03-16 is a Saturday.
        let features =
            build_features(&request("2024-03-16T13:00:00"), &BoundingBox::default())
                .expect("build");
        assert_eq!(features.day_of_week, 5);
        assert_eq!(features.is_weekend, 1);
        assert_eq!(features.is_rush_hour, 0);
    }

    #[test]
    fn feature_bounds_hold_for_accepted_requests() {
        let features =
            build_features(&request("2024-12-31T23:59:59"), &BoundingBox::default())
                .expect("build");
        assert!(features.hour_of_day <= 23);
        assert!(features.day_of_week <= 6);
        assert!((1..=12).contains(&features.month));
        assert!((0.0..=200.0).contains(&features.distance_km));
    }

    #[test]
    fn out_of_area_pickup_is_rejected() {
        let mut req = request("2024-03-14T12:00:00");
        req.pickup_latitude = 34.0522;
        req.pickup_longitude = -118.2437;
        let err = build_features(&req, &BoundingBox::default()).expect_err("reject");
        assert_eq!(err.kind(), "OutsideBoundingBox");
    }

    #[test]
    fn non_finite_coordinate_is_rejected_before_bbox() {
        let mut req = request("2024-03-14T12:00:00");
        req.dropoff_longitude = f64::NAN;
        let err = build_features(&req, &BoundingBox::default()).expect_err("reject");
        assert_eq!(err.kind(), "InvalidCoordinate");
    }

    #[test]
    fn passenger_count_out_of_range_is_rejected() {
        for bad in [0, 7, -1] {
            let mut req = request("2024-03-14T12:00:00");
            req.passenger_count = bad;
            let err = build_features(&req, &BoundingBox::default()).expect_err("reject");
            assert_eq!(err.kind(), "InvalidPassengerCount");
        }
    }

    #[test]
    fn unparseable_timestamp_is_rejected() {
        let err = build_features(&request("yesterday-ish"), &BoundingBox::default())
            .expect_err("reject");
        assert_eq!(err.kind(), "InvalidTimestamp");
    }

    #[test]
    fn timestamp_variants_parse() {
        for ts in [
            "2024-03-14T17:30:00",
            "2024-03-14 17:30:00",
            "2024-03-14T17:30:00.250",
            "2024-03-14T17:30:00Z",
        ] {
            assert!(
                build_features(&request(ts), &BoundingBox::default()).is_ok(),
                "failed to parse {ts}"
            );
        }
    }

    #[test]
    fn as_array_follows_feature_order() {
        let features =
            build_features(&request("2024-03-14T17:30:00"), &BoundingBox::default())
                .expect("build");
        let arr = features.as_array();
        assert_eq!(arr.len(), FEATURE_ORDER.len());
        assert_eq!(arr[1], 1.0); // passenger_count
        assert_eq!(arr[3], 17.0); // hour_of_day
        assert_eq!(arr[7], 1.0); // is_rush_hour
    }
}
