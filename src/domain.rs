use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TrackerError;

pub const UNKNOWN_ADDRESS: &str = "Unknown";

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    /// Stand-in used when no fix could be read at all.
    pub const ORIGIN: Position = Position {
        latitude: 0.0,
        longitude: 0.0,
    };

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn validated(self) -> Result<Self, TrackerError> {
        if !self.latitude.is_finite() || !self.longitude.is_finite() {
            return Err(TrackerError::MalformedCallbackPayload(
                "latitude/longitude must be finite numbers".to_string(),
            ));
        }
        if self.latitude.abs() > 90.0 || self.longitude.abs() > 180.0 {
            return Err(TrackerError::MalformedCallbackPayload(format!(
                "latitude {:.6} or longitude {:.6} is out of range",
                self.latitude, self.longitude
            )));
        }
        Ok(self)
    }

    /// Great-circle distance in metres (haversine).
    pub fn distance_to(&self, other: &Position) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }
}

/// A position as reported by a position source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFix {
    pub position: Position,
    pub accuracy: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<u64>,
}

impl PositionFix {
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|ms| i64::try_from(ms).ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }
}

/// Untyped payload handed over by a position watch. Accepts either a flat
/// `{ latitude, longitude }` object or the geolocation-style `{ coords: { .. }, timestamp }`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFix(pub Value);

impl RawFix {
    pub fn parse(&self) -> Result<PositionFix, TrackerError> {
        let coords = self.0.get("coords").unwrap_or(&self.0);

        let latitude = coords
            .get("latitude")
            .and_then(Value::as_f64)
            .ok_or_else(|| TrackerError::MalformedCallbackPayload("missing latitude".into()))?;
        let longitude = coords
            .get("longitude")
            .and_then(Value::as_f64)
            .ok_or_else(|| TrackerError::MalformedCallbackPayload("missing longitude".into()))?;

        let accuracy = coords.get("accuracy").and_then(Value::as_f64);
        if let Some(acc) = accuracy {
            if !acc.is_finite() || acc < 0.0 {
                return Err(TrackerError::MalformedCallbackPayload(
                    "accuracy must be a finite number >= 0".into(),
                ));
            }
        }

        Ok(PositionFix {
            position: Position::new(latitude, longitude).validated()?,
            accuracy,
            timestamp: self.0.get("timestamp").and_then(Value::as_u64),
        })
    }

    /// Validated coordinates, if the payload carries any.
    pub fn coordinates(&self) -> Option<Position> {
        self.parse().ok().map(|fix| fix.position)
    }
}

impl From<PositionFix> for RawFix {
    fn from(fix: PositionFix) -> Self {
        let mut coords = serde_json::json!({
            "latitude": fix.position.latitude,
            "longitude": fix.position.longitude,
        });
        if let Some(acc) = fix.accuracy {
            coords["accuracy"] = acc.into();
        }
        let mut value = serde_json::json!({ "coords": coords });
        if let Some(ts) = fix.timestamp {
            value["timestamp"] = ts.into();
        }
        RawFix(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationRecord {
    #[serde(flatten)]
    pub position: Position,
    pub reverse_data: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LocationRecord {
    pub fn new(position: Position, reverse_data: String, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            position,
            reverse_data,
            timestamp,
        }
    }

    pub fn unresolved(position: Position, timestamp: Option<DateTime<Utc>>) -> Self {
        Self::new(position, UNKNOWN_ADDRESS.to_string(), timestamp)
    }

    pub fn is_resolved(&self) -> bool {
        !self.reverse_data.is_empty() && self.reverse_data != UNKNOWN_ADDRESS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub device_name: String,
    pub os: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Start,
    Ongoing,
    Finish,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Start => "START",
            EventType::Ongoing => "ONGOING",
            EventType::Finish => "FINISH",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    pub device_id: String,
    pub device_name: String,
    pub os: String,
    pub event_type: EventType,
    pub latitude: f64,
    pub longitude: f64,
    pub reverse_data: String,
}

impl TrackingEvent {
    pub fn new(event_type: EventType, device: &DeviceDescriptor, location: &LocationRecord) -> Self {
        let reverse_data = if location.reverse_data.is_empty() {
            UNKNOWN_ADDRESS.to_string()
        } else {
            location.reverse_data.clone()
        };

        Self {
            device_id: device.device_id.clone(),
            device_name: device.device_name.clone(),
            os: device.os.clone(),
            event_type,
            latitude: location.position.latitude,
            longitude: location.position.longitude,
            reverse_data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutgoingMessage {
    #[serde(rename = "locationUpdate")]
    LocationUpdate(TrackingEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: "dev-1".into(),
            device_name: "pixel".into(),
            os: "android 14".into(),
        }
    }

    #[test]
    fn envelope_matches_wire_format() {
        let record = LocationRecord::new(Position::new(35.6812, 139.7671), "{\"city\":\"Tokyo\"}".into(), None);
        let message = OutgoingMessage::LocationUpdate(TrackingEvent::new(EventType::Start, &device(), &record));

        let v = serde_json::to_value(&message).unwrap();
        assert_eq!(
            v,
            json!({
                "event": "locationUpdate",
                "data": {
                    "deviceId": "dev-1",
                    "deviceName": "pixel",
                    "os": "android 14",
                    "eventType": "START",
                    "latitude": 35.6812,
                    "longitude": 139.7671,
                    "reverseData": "{\"city\":\"Tokyo\"}"
                }
            })
        );
    }

    #[test]
    fn empty_address_is_sent_as_unknown() {
        let record = LocationRecord::new(Position::ORIGIN, String::new(), None);
        let event = TrackingEvent::new(EventType::Finish, &device(), &record);
        assert_eq!(event.reverse_data, UNKNOWN_ADDRESS);
    }

    #[test]
    fn parses_nested_and_flat_payloads() {
        let nested = RawFix(json!({
            "coords": { "latitude": 1.0, "longitude": 2.0, "accuracy": 5.0 },
            "timestamp": 1_700_000_000_000u64
        }));
        let fix = nested.parse().unwrap();
        assert_eq!(fix.position, Position::new(1.0, 2.0));
        assert_eq!(fix.accuracy, Some(5.0));
        assert!(fix.recorded_at().is_some());

        let flat = RawFix(json!({ "latitude": -33.5, "longitude": 151.2 }));
        assert_eq!(flat.parse().unwrap().position, Position::new(-33.5, 151.2));
    }

    #[test]
    fn rejects_missing_or_out_of_range_coordinates() {
        let missing = RawFix(json!({ "coords": { "latitude": 1.0 } }));
        assert!(matches!(
            missing.parse(),
            Err(TrackerError::MalformedCallbackPayload(_))
        ));

        let out_of_range = RawFix(json!({ "latitude": 91.0, "longitude": 0.0 }));
        let err = out_of_range.parse().unwrap_err();
        assert!(err.to_string().contains("out of range"));

        assert!(RawFix(json!("not an object")).parse().is_err());
    }

    #[test]
    fn haversine_distance_is_plausible() {
        let tokyo = Position::new(35.6812, 139.7671);
        let shinjuku = Position::new(35.6896, 139.7006);
        let d = tokyo.distance_to(&shinjuku);
        assert!((5_900.0..6_200.0).contains(&d), "got {d}");
        assert_eq!(tokyo.distance_to(&tokyo), 0.0);
    }

    #[test]
    fn raw_fix_from_typed_fix_parses_back() {
        let fix = PositionFix {
            position: Position::new(10.0, 20.0),
            accuracy: Some(3.0),
            timestamp: Some(42),
        };
        assert_eq!(RawFix::from(fix).parse().unwrap(), fix);
    }

    #[test]
    fn unknown_record_is_not_resolved() {
        assert!(!LocationRecord::unresolved(Position::ORIGIN, None).is_resolved());
        assert!(LocationRecord::new(Position::ORIGIN, "{}".into(), None).is_resolved());
    }
}
