use thiserror::Error;

use crate::geocode::GeocodeError;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("location permission was not granted")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    PositionUnavailable(String),

    #[error("address resolution failed: {0}")]
    AddressResolutionFailed(#[from] GeocodeError),

    #[error("event connection is not open")]
    ConnectionNotOpen,

    #[error("malformed position payload: {0}")]
    MalformedCallbackPayload(String),

    #[error("a tracking session is already active")]
    AlreadyTracking,
}

impl TrackerError {
    /// Errors the user gets an alert for; everything else only reaches the log.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            TrackerError::PermissionDenied | TrackerError::PositionUnavailable(_)
        )
    }
}
