use std::{
    fs,
    future::Future,
    path::Path,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::warn;

use crate::{
    domain::{Position, PositionFix, RawFix},
    error::TrackerError,
};

const BAD_ACCURACY_THRESHOLD: f64 = 100.0; // meters
const WATCH_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest cached fix that may be answered without reading a new one.
    pub maximum_age: Duration,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_millis(15_000),
            maximum_age: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub position: PositionOptions,
    /// Minimum movement in meters between two delivered fixes.
    pub distance_filter: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            position: PositionOptions::default(),
            distance_filter: 1.0,
        }
    }
}

pub trait PositionSource: Send + Sync {
    fn current_position(
        &self,
        options: &PositionOptions,
    ) -> impl Future<Output = Result<PositionFix, TrackerError>> + Send;

    fn watch_position(&self, options: &WatchOptions) -> Result<PositionWatch, TrackerError>;
}

/// A live subscription to position updates. Cancelling is idempotent and also happens on drop.
pub struct PositionWatch {
    rx: mpsc::Receiver<RawFix>,
    feeder: Option<JoinHandle<()>>,
    cancelled: bool,
}

impl PositionWatch {
    pub fn new(rx: mpsc::Receiver<RawFix>, feeder: JoinHandle<()>) -> Self {
        Self {
            rx,
            feeder: Some(feeder),
            cancelled: false,
        }
    }

    /// A watch fed by whoever holds the sender.
    #[cfg(test)]
    pub fn from_receiver(rx: mpsc::Receiver<RawFix>) -> Self {
        Self {
            rx,
            feeder: None,
            cancelled: false,
        }
    }

    pub async fn next(&mut self) -> Option<RawFix> {
        if self.cancelled {
            return None;
        }
        self.rx.recv().await
    }

    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Drops fixes that moved less than the configured distance since the last delivered one.
/// Payloads without coordinates always pass so the consumer can report them.
#[derive(Debug, Clone)]
pub struct DistanceFilter {
    min_distance: f64,
    last: Option<Position>,
}

impl DistanceFilter {
    pub fn new(min_distance: f64) -> Self {
        Self {
            min_distance: min_distance.max(0.0),
            last: None,
        }
    }

    pub fn admit(&mut self, raw: &RawFix) -> bool {
        let Some(pos) = raw.coordinates() else {
            return true;
        };
        if let Some(last) = self.last {
            if pos.distance_to(&last) < self.min_distance {
                return false;
            }
        }
        self.last = Some(pos);
        true
    }
}

fn check_accuracy(raw: &RawFix, options: &PositionOptions) {
    if !options.high_accuracy {
        return;
    }
    if let Some(acc) = raw.parse().ok().and_then(|fix| fix.accuracy) {
        if acc > BAD_ACCURACY_THRESHOLD {
            warn!(
                accuracy = acc,
                "reported accuracy {acc:.1}m exceeds threshold {BAD_ACCURACY_THRESHOLD:.0}m"
            );
        }
    }
}

/// Plays back a recorded track.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    fixes: Arc<Vec<RawFix>>,
    interval: Duration,
}

impl ReplaySource {
    pub fn new(fixes: Vec<RawFix>, interval: Duration) -> Self {
        Self {
            fixes: Arc::new(fixes),
            interval,
        }
    }

    pub fn fix_count(&self) -> usize {
        self.fixes.len()
    }

    pub fn from_file(path: impl AsRef<Path>, interval: Duration) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let ext = path_ref
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let fixes = match ext.as_str() {
            "json" => fixes_from_json(path_ref)?,
            "csv" => fixes_from_csv(path_ref)?,
            _ => {
                warn!(
                    path = %path_ref.display(),
                    ext = %ext,
                    "unknown track file extension; trying JSON then CSV"
                );
                match fixes_from_json(path_ref) {
                    Ok(fixes) => fixes,
                    Err(json_err) => fixes_from_csv(path_ref).map_err(|csv_err| {
                        anyhow!(
                            "failed to load track {}: json error: {json_err:#}; csv error: {csv_err:#}",
                            path_ref.display()
                        )
                    })?,
                }
            }
        };

        if fixes.is_empty() {
            anyhow::bail!("track file {} contains no fixes", path_ref.display());
        }

        Ok(Self::new(fixes, interval))
    }
}

fn fixes_from_json(path: &Path) -> anyhow::Result<Vec<RawFix>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read track file at {}", path.display()))?;
    let parsed: Vec<Value> = serde_json::from_str(&raw).with_context(|| {
        format!(
            "failed to parse track JSON at {}; expected an array of {{ \"latitude\", \"longitude\" }} objects",
            path.display()
        )
    })?;
    Ok(parsed.into_iter().map(RawFix).collect())
}

fn fixes_from_csv(path: &Path) -> anyhow::Result<Vec<RawFix>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open track CSV at {}", path.display()))?;

    #[derive(Deserialize)]
    struct Row {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        accuracy: Option<f64>,
        #[serde(default)]
        timestamp: Option<u64>,
    }

    let mut fixes = Vec::new();
    for rec in rdr.deserialize() {
        let row: Row = rec.with_context(|| {
            format!(
                "failed to parse row in {} as (latitude, longitude[, accuracy, timestamp])",
                path.display()
            )
        })?;
        fixes.push(RawFix::from(PositionFix {
            position: Position::new(row.latitude, row.longitude),
            accuracy: row.accuracy,
            timestamp: row.timestamp,
        }));
    }
    Ok(fixes)
}

impl PositionSource for ReplaySource {
    async fn current_position(&self, options: &PositionOptions) -> Result<PositionFix, TrackerError> {
        let first = self.fixes.iter().find_map(|raw| raw.parse().ok());
        match first {
            Some(fix) => {
                check_accuracy(&RawFix::from(fix), options);
                Ok(fix)
            }
            None => Err(TrackerError::PositionUnavailable(
                "track has no valid fix".to_string(),
            )),
        }
    }

    fn watch_position(&self, options: &WatchOptions) -> Result<PositionWatch, TrackerError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let fixes = self.fixes.clone();
        let interval = self.interval;
        let options = *options;

        let feeder = tokio::spawn(async move {
            let mut filter = DistanceFilter::new(options.distance_filter);
            for (idx, raw) in fixes.iter().enumerate() {
                if idx > 0 && !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                if !filter.admit(raw) {
                    tracing::trace!(idx, "fix below distance filter; skipped");
                    continue;
                }
                check_accuracy(raw, &options.position);
                if tx.send(raw.clone()).await.is_err() {
                    break;
                }
            }
            tracing::debug!("track replay finished");
        });

        Ok(PositionWatch::new(rx, feeder))
    }
}

type SharedLines<R> = Arc<Mutex<Lines<R>>>;

/// Newline-delimited JSON fixes from a reader, e.g. piped in from a GPS daemon.
pub struct LineSource<R> {
    lines: SharedLines<R>,
    cached: Arc<StdMutex<Option<(PositionFix, Instant)>>>,
}

pub type StdinSource = LineSource<BufReader<Stdin>>;

impl StdinSource {
    pub fn stdin() -> Self {
        LineSource::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: Arc::new(Mutex::new(reader.lines())),
            cached: Arc::default(),
        }
    }

    fn cached_fix(&self, maximum_age: Duration) -> Option<PositionFix> {
        let cached = self.cached.lock().ok()?;
        cached
            .as_ref()
            .filter(|(_, seen)| seen.elapsed() <= maximum_age)
            .map(|(fix, _)| *fix)
    }
}

async fn next_raw<R>(lines: &SharedLines<R>) -> std::io::Result<Option<RawFix>>
where
    R: AsyncBufRead + Unpin + Send,
{
    loop {
        let Some(line) = lines.lock().await.next_line().await? else {
            return Ok(None);
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str::<Value>(trimmed).unwrap_or(Value::String(line));
        return Ok(Some(RawFix(value)));
    }
}

fn remember(cache: &StdMutex<Option<(PositionFix, Instant)>>, raw: &RawFix) {
    if let (Ok(fix), Ok(mut slot)) = (raw.parse(), cache.lock()) {
        *slot = Some((fix, Instant::now()));
    }
}

impl<R> PositionSource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn current_position(&self, options: &PositionOptions) -> Result<PositionFix, TrackerError> {
        if let Some(fix) = self.cached_fix(options.maximum_age) {
            return Ok(fix);
        }

        let read = async {
            loop {
                match next_raw(&self.lines).await {
                    Ok(Some(raw)) => match raw.parse() {
                        Ok(fix) => {
                            remember(&self.cached, &raw);
                            check_accuracy(&raw, options);
                            return Ok(fix);
                        }
                        Err(err) => warn!(%err, "skipping malformed fix while reading current position"),
                    },
                    Ok(None) => {
                        return Err(TrackerError::PositionUnavailable(
                            "position feed ended".to_string(),
                        ))
                    }
                    Err(err) => {
                        return Err(TrackerError::PositionUnavailable(format!(
                            "failed to read position feed: {err}"
                        )))
                    }
                }
            }
        };

        match tokio::time::timeout(options.timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(TrackerError::PositionUnavailable(format!(
                "timed out after {}ms",
                options.timeout.as_millis()
            ))),
        }
    }

    fn watch_position(&self, options: &WatchOptions) -> Result<PositionWatch, TrackerError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let lines = self.lines.clone();
        let cached = self.cached.clone();
        let options = *options;

        let feeder = tokio::spawn(async move {
            let mut filter = DistanceFilter::new(options.distance_filter);
            loop {
                let raw = match next_raw(&lines).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(?err, "position feed read error");
                        break;
                    }
                };
                if !filter.admit(&raw) {
                    continue;
                }
                remember(&cached, &raw);
                check_accuracy(&raw, &options.position);
                if tx.send(raw).await.is_err() {
                    break;
                }
            }
            tracing::debug!("position feed closed");
        });

        Ok(PositionWatch::new(rx, feeder))
    }
}
