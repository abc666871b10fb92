use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    alert::Alerter,
    device::DeviceIdentity,
    domain::{
        DeviceDescriptor, EventType, LocationRecord, Position, PositionFix, RawFix, UNKNOWN_ADDRESS,
    },
    error::TrackerError,
    forwarder::EventForwarder,
    geocode::AddressResolver,
    permission::PermissionGate,
    position::{PositionSource, PositionWatch, WatchOptions},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Tracking,
}

/// What happens to the recorded locations once a session stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// Keep them around for display until the next session starts.
    #[default]
    Retain,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    PermissionDenied,
    WatchFailed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSettings {
    pub watch: WatchOptions,
    pub history: HistoryMode,
}

enum Phase {
    Idle,
    Tracking {
        watch: PositionWatch,
        device: DeviceDescriptor,
    },
}

pub struct TrackingSession<S, R, G> {
    source: S,
    resolver: R,
    gate: G,
    device: Arc<dyn DeviceIdentity>,
    alerter: Arc<dyn Alerter>,
    forwarder: EventForwarder,
    settings: SessionSettings,
    phase: Phase,
    history: Vec<LocationRecord>,
    last_known: Option<LocationRecord>,
}

impl<S, R, G> TrackingSession<S, R, G>
where
    S: PositionSource,
    R: AddressResolver,
    G: PermissionGate,
{
    pub fn new(
        source: S,
        resolver: R,
        gate: G,
        device: Arc<dyn DeviceIdentity>,
        alerter: Arc<dyn Alerter>,
        forwarder: EventForwarder,
        settings: SessionSettings,
    ) -> Self {
        Self {
            source,
            resolver,
            gate,
            device,
            alerter,
            forwarder,
            settings,
            phase: Phase::Idle,
            history: Vec::new(),
            last_known: None,
        }
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Idle => SessionState::Idle,
            Phase::Tracking { .. } => SessionState::Tracking,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.state() == SessionState::Tracking
    }

    pub fn history(&self) -> &[LocationRecord] {
        &self.history
    }

    pub fn last_known(&self) -> Option<&LocationRecord> {
        self.last_known.as_ref()
    }

    pub fn forwarder(&self) -> &EventForwarder {
        &self.forwarder
    }

    pub async fn start_tracking(&mut self) -> Result<StartOutcome, TrackerError> {
        if self.is_tracking() {
            warn!("start requested while a session is active");
            return Err(TrackerError::AlreadyTracking);
        }

        if !self.gate.request_permission().await {
            info!("location permission denied; staying idle");
            self.alerter.alert(
                "Permission denied",
                "Location permission is required to track your position.",
            );
            return Ok(StartOutcome::PermissionDenied);
        }

        let device = self.device.describe();
        self.history.clear();

        let record = match self
            .source
            .current_position(&self.settings.watch.position)
            .await
        {
            Ok(fix) => self.locate(fix).await,
            Err(err) => {
                warn!(%err, "current position unavailable; starting from fallback");
                self.raise(&err);
                LocationRecord::unresolved(Position::ORIGIN, Some(Utc::now()))
            }
        };

        self.forwarder.send_event(EventType::Start, &device, &record);
        self.last_known = Some(record);

        match self.source.watch_position(&self.settings.watch) {
            Ok(watch) => {
                info!(
                    device = %device.device_id,
                    distance_filter = self.settings.watch.distance_filter,
                    "tracking started"
                );
                self.phase = Phase::Tracking { watch, device };
                Ok(StartOutcome::Started)
            }
            Err(err) => {
                warn!(%err, "failed to watch position");
                self.raise(&err);
                if let Some(record) = self.last_known.as_ref() {
                    self.forwarder.send_event(EventType::Finish, &device, record);
                }
                Ok(StartOutcome::WatchFailed)
            }
        }
    }

    /// Waits for the next payload of the active watch. `None` once idle or the feed ended.
    pub async fn next_update(&mut self) -> Option<RawFix> {
        match &mut self.phase {
            Phase::Tracking { watch, .. } => watch.next().await,
            Phase::Idle => None,
        }
    }

    /// Returns whether the update produced a record.
    pub async fn handle_update(&mut self, raw: RawFix) -> bool {
        let device = match &self.phase {
            Phase::Tracking { watch, device } if !watch.is_cancelled() => device.clone(),
            _ => {
                debug!("position update while idle; ignored");
                return false;
            }
        };

        let fix = match raw.parse() {
            Ok(fix) => fix,
            Err(err) => {
                warn!(%err, payload = %raw.0, "ignoring malformed position update");
                return false;
            }
        };

        let record = self.locate(fix).await;
        self.history.push(record.clone());
        self.forwarder.send_event(EventType::Ongoing, &device, &record);
        self.last_known = Some(record);
        true
    }

    /// Returns `false` when there was no session to stop.
    pub async fn stop_tracking(&mut self) -> bool {
        let Phase::Tracking { mut watch, .. } = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            debug!("stop requested while idle; nothing to do");
            return false;
        };
        watch.cancel();
        drop(watch);

        let device = self.device.describe();
        let record = match self.last_known.take() {
            Some(record) if record.is_resolved() => record,
            Some(record) => {
                let address = self.resolve_or_unknown(record.position).await;
                LocationRecord::new(record.position, address, record.timestamp)
            }
            None => match self
                .source
                .current_position(&self.settings.watch.position)
                .await
            {
                Ok(fix) => self.locate(fix).await,
                Err(err) => {
                    warn!(%err, "no position available for the finish event");
                    LocationRecord::unresolved(Position::ORIGIN, Some(Utc::now()))
                }
            },
        };

        self.forwarder.send_event(EventType::Finish, &device, &record);
        info!(records = self.history.len(), "tracking stopped");

        match self.settings.history {
            HistoryMode::Retain => self.last_known = Some(record),
            HistoryMode::Clear => self.history.clear(),
        }
        true
    }

    fn raise(&self, err: &TrackerError) {
        if err.is_user_visible() {
            self.alerter.alert("Location error", &err.to_string());
        }
    }

    async fn locate(&self, fix: PositionFix) -> LocationRecord {
        let address = self.resolve_or_unknown(fix.position).await;
        LocationRecord::new(
            fix.position,
            address,
            fix.recorded_at().or_else(|| Some(Utc::now())),
        )
    }

    async fn resolve_or_unknown(&self, position: Position) -> String {
        match self
            .resolver
            .resolve_address(position.latitude, position.longitude)
            .await
        {
            Ok(address) => address,
            Err(err) => {
                warn!(
                    error = %TrackerError::from(err),
                    latitude = position.latitude,
                    longitude = position.longitude,
                    "address lookup failed; using fallback"
                );
                UNKNOWN_ADDRESS.to_string()
            }
        }
    }
}

impl<S, R, G> TrackingSession<S, R, G> {
    /// Cancels a live watch without announcing a finish.
    pub fn teardown(&mut self) {
        if let Phase::Tracking { mut watch, .. } = std::mem::replace(&mut self.phase, Phase::Idle) {
            watch.cancel();
            debug!("session torn down with an active watch");
        }
    }

    pub async fn unmount(mut self) {
        self.teardown();
        self.forwarder.close().await;
    }
}

impl<S, R, G> Drop for TrackingSession<S, R, G> {
    fn drop(&mut self) {
        self.teardown();
    }
}
