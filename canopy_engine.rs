//! # Canopy Engine - Hierarchical Metric Store
//!
//! A local time-series store for metrics organized in a '/'-delimited tree.
//! Every metric buffers fixed-schema samples in memory, persists them as
//! binary slice files, streams them to live subscribers and rolls them up
//! into every ancestor metric.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              CANOPY ENGINE                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  add(point) → METRIC → DATA EVENTS → WATCHERS → ALARM CALLBACKS             │
//! │                  │                                                           │
//! │                  └─→ PARENT → ... → ROOT           (rollup by accumulation)  │
//! │                                                                              │
//! │  flush() → SORT → SLICE PLAN → APPEND <root>/<a>/<b>/<first-timestamp>      │
//! │  get(start, end) → MEMORY BUFFER + DECODED SLICES → SORTED POINTS           │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Hierarchical**: metrics and their ancestors are materialized on first use
//! - **Compact**: 24-byte big-endian records, one directory per path segment
//! - **Live**: deferred, failure-isolated fan-out of data, creation and removal events
//! - **Alarms**: glob-bound threshold alarms with duration debounce
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use canopy_engine::{AlarmState, DataPoint, Store, StoreConfig};
//!
//! # async fn run() -> canopy_engine::StoreResult<()> {
//! let store = Store::open(StoreConfig::new("/var/lib/canopy")).await?;
//!
//! let alarm = store.alarm(
//!     "hosts/*/cpu",
//!     |point| point.avg > 90.0,
//!     Duration::from_secs(60),
//!     |metric, state| {
//!         println!("{} is now {}", metric.name(), state);
//!         Ok(())
//!     },
//! )?;
//!
//! store.add("hosts/web-01/cpu", DataPoint::sample(1_700_000_000, 97.5))?;
//! store.metric("hosts/web-01/cpu")?.flush().await?;
//! alarm.off();
//! # Ok(())
//! # }
//! ```

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports, grouped by concern.
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::io;
use std::mem;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::fs::{self as async_fs, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::{mpsc, oneshot, watch, RwLock as TokioRwLock};
use futures::future::try_join_all;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Parking Lot & DashMap
// ----------------------------------------------------------------------------
use parking_lot::Mutex;
use dashmap::DashMap;

// ----------------------------------------------------------------------------
// Serialization & Binary Encoding
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use bytes::{Buf, BufMut, Bytes, BytesMut};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Patterns & Identifiers
// ----------------------------------------------------------------------------
use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{providers::{Env, Format, Toml}, Figment};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "canopy-engine";

// ----------------------------------------------------------------------------
// Storage Layout
// ----------------------------------------------------------------------------

/// Size of one encoded data point on disk (bytes)
pub const RECORD_SIZE: usize = 24;

/// Default cap for a single slice file (bytes) - 416 records
pub const DEFAULT_MAX_SLICE_BYTES: u64 = 10_000;

/// Default store root when none is configured
pub const DEFAULT_ROOT: &str = "./data";

// ----------------------------------------------------------------------------
// Naming
// ----------------------------------------------------------------------------

/// Separator between metric path segments
pub const PATH_SEPARATOR: char = '/';

/// Marks a name as a glob pattern
pub const WILDCARD: char = '*';

/// Prefix for environment overrides (`CANOPY_MAX_SLICE_BYTES`, `CANOPY_LOGGING__LEVEL`, ...)
pub const ENV_PREFIX: &str = "CANOPY_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The sample type flowing through the engine and its fixed binary layout.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Data Point
// ----------------------------------------------------------------------------

/// One pre-aggregated sample.
///
/// Encoded on disk as a 24-byte big-endian record, fields in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Sample time (seconds)
    pub timestamp: u32,
    /// Number of raw observations folded into this sample
    pub count: u32,
    pub avg: f32,
    pub min: f32,
    pub max: f32,
    pub percentile: f32,
}

impl DataPoint {
    /// Create a new data point.
    #[inline]
    pub fn new(timestamp: u32, count: u32, avg: f32, min: f32, max: f32, percentile: f32) -> Self {
        Self {
            timestamp,
            count,
            avg,
            min,
            max,
            percentile,
        }
    }

    /// Create a single-observation point; every aggregate field takes `value`.
    #[inline]
    pub fn sample(timestamp: u32, value: f32) -> Self {
        Self::new(timestamp, 1, value, value, value, value)
    }

    /// Whether the point falls inside the inclusive range `[start, end]`.
    #[inline]
    pub fn in_range(&self, start: u32, end: u32) -> bool {
        self.timestamp >= start && self.timestamp <= end
    }

    /// Append the 24-byte record to `buf`.
    #[inline]
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.timestamp);
        buf.put_u32(self.count);
        buf.put_f32(self.avg);
        buf.put_f32(self.min);
        buf.put_f32(self.max);
        buf.put_f32(self.percentile);
    }

    /// Read one record from `buf`, or `None` when fewer than 24 bytes remain.
    #[inline]
    pub fn decode<B: Buf>(buf: &mut B) -> Option<Self> {
        if buf.remaining() < RECORD_SIZE {
            return None;
        }
        Some(Self {
            timestamp: buf.get_u32(),
            count: buf.get_u32(),
            avg: buf.get_f32(),
            min: buf.get_f32(),
            max: buf.get_f32(),
            percentile: buf.get_f32(),
        })
    }

    /// The encoded record as a fixed array.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }
}

impl From<(u32, u32, f32, f32, f32, f32)> for DataPoint {
    fn from((timestamp, count, avg, min, max, percentile): (u32, u32, f32, f32, f32, f32)) -> Self {
        Self::new(timestamp, count, avg, min, max, percentile)
    }
}

impl Display for DataPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}, {}, {}]",
            self.timestamp, self.count, self.avg, self.min, self.max, self.percentile
        )
    }
}

// ----------------------------------------------------------------------------
// 3.2 Slice Codec
// ----------------------------------------------------------------------------

/// Encode points back to back into one contiguous buffer.
pub fn encode_points(points: &[DataPoint]) -> Bytes {
    let mut buf = BytesMut::with_capacity(points.len() * RECORD_SIZE);
    for point in points {
        point.encode(&mut buf);
    }
    buf.freeze()
}

/// Decode every complete record in `data`. A trailing partial record is ignored.
pub fn decode_points(data: &[u8]) -> Vec<DataPoint> {
    let mut buf = data;
    let mut points = Vec::with_capacity(data.len() / RECORD_SIZE);
    while let Some(point) = DataPoint::decode(&mut buf) {
        points.push(point);
    }
    points
}

/// Pick the slices that can hold records in `[start, end]`.
///
/// `timestamps` must be sorted ascending. Returns every slice starting inside
/// the range plus the one right before the first of them, whose tail may
/// still reach into the range.
pub fn select_slices(timestamps: &[u32], start: u32, end: u32) -> &[u32] {
    if start > end {
        return &[];
    }
    let first = timestamps.partition_point(|&t| t < start);
    let last = timestamps.partition_point(|&t| t <= end);
    &timestamps[first.saturating_sub(1)..last]
}

/// Slices that retention may drop: every slice whose successor starts at or
/// before `horizon`. The newest slice is never returned.
pub fn expired_slices(timestamps: &[u32], horizon: u32) -> Vec<u32> {
    timestamps
        .windows(2)
        .filter(|pair| pair[1] <= horizon)
        .map(|pair| pair[0])
        .collect()
}

// ----------------------------------------------------------------------------
// 3.3 Metric Names
// ----------------------------------------------------------------------------

/// Check that `name` is a usable metric name.
pub fn validate_name(name: &str) -> StoreResult<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name.contains(WILDCARD) {
        Some("wildcards are only allowed in patterns")
    } else if name.split(PATH_SEPARATOR).any(str::is_empty) {
        Some("empty path segment")
    } else if name.split(PATH_SEPARATOR).any(|s| s == "." || s == "..") {
        Some("relative path segment")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// `a/b/c` -> `a/b`; top-level names have no parent.
#[inline]
pub fn parent_name(name: &str) -> Option<&str> {
    name.rfind(PATH_SEPARATOR).map(|index| &name[..index])
}

/// Number of path segments in `name`.
#[inline]
pub fn depth(name: &str) -> usize {
    name.split(PATH_SEPARATOR).count()
}

/// Directory holding a metric's slices and child directories.
pub fn metric_dir(root: &Path, name: &str) -> PathBuf {
    name.split(PATH_SEPARATOR)
        .fold(root.to_path_buf(), |dir, segment| dir.join(segment))
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every layer of the store.
// Designed for:
// - Clear error categorization
// - Path context on every slice I/O failure
// - No synchronous failure for disk problems (they surface from async ops)
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Store Errors
// ----------------------------------------------------------------------------

/// The main error type for the store.
#[derive(Error, Debug)]
pub enum StoreError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Naming Errors ----
    #[error("Invalid metric name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Pattern error: {0}")]
    Pattern(#[from] GlobError),

    #[error("Unsupported metric event '{0}' (metrics only emit 'data')")]
    InvalidEvent(String),

    // ---- IO Errors ----
    #[error("Storage I/O failed for {}: {source}", path.display())]
    SliceIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // ---- Environment Errors ----
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Logging error: {0}")]
    Logging(String),
}

impl StoreError {
    /// Check if retrying the same call may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::SliceIo { .. } | StoreError::Io(_) => true,
            StoreError::Config(_)
            | StoreError::InvalidName { .. }
            | StoreError::Pattern(_)
            | StoreError::InvalidEvent(_)
            | StoreError::NoRuntime(_)
            | StoreError::Logging(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            StoreError::Config(_) => "config",
            StoreError::InvalidName { .. } => "name",
            StoreError::Pattern(_) => "pattern",
            StoreError::InvalidEvent(_) => "event",
            StoreError::SliceIo { .. } => "slice_io",
            StoreError::Io(_) => "io",
            StoreError::NoRuntime(_) => "runtime",
            StoreError::Logging(_) => "logging",
        }
    }
}

/// Result alias used across the store
pub type StoreResult<T> = Result<T, StoreError>;

/// What subscribers and alarm callbacks return; errors are logged, never propagated.
pub type HandlerResult = anyhow::Result<()>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Pattern Errors
// ----------------------------------------------------------------------------

/// Errors from compiling a glob pattern
#[derive(Error, Debug)]
pub enum GlobError {
    #[error("Invalid glob pattern '{pattern}': {source}")]
    Compile {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

// ----------------------------------------------------------------------------
// 4.4 Error Context Extension
// ----------------------------------------------------------------------------

/// Attach the slice path to raw I/O failures
pub trait SliceContext<T> {
    fn slice_context(self, path: &Path) -> StoreResult<T>;
}

impl<T> SliceContext<T> for Result<T, io::Error> {
    fn slice_context(self, path: &Path) -> StoreResult<T> {
        self.map_err(|source| StoreError::SliceIo {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Store configuration with:
// - TOML file parsing
// - Environment variable overrides (CANOPY_*)
// - Validation
// - Sensible defaults
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Store Configuration
// ----------------------------------------------------------------------------

/// Root configuration for a store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one sub-directory per top-level metric
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Slice file cap; a flush starts a new slice rather than exceed it
    #[serde(default = "default_max_slice_bytes")]
    pub max_slice_bytes: u64,

    /// How long slices are kept by `rotate` (e.g. "7d"); unset keeps everything
    #[serde(default, with = "humantime_serde")]
    pub retention: Option<Duration>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            max_slice_bytes: default_max_slice_bytes(),
            retention: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_max_slice_bytes(mut self, max_slice_bytes: u64) -> Self {
        self.max_slice_bytes = max_slice_bytes;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string, without environment overrides
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::invalid_value("root", "Store root cannot be empty"));
        }

        if self.max_slice_bytes < RECORD_SIZE as u64 {
            return Err(ConfigError::invalid_value(
                "max_slice_bytes",
                format!("A slice must hold at least one {}-byte record", RECORD_SIZE),
            ));
        }

        Ok(())
    }

    /// Whole records that fit in one slice
    pub fn records_per_slice(&self) -> u64 {
        self.max_slice_bytes / RECORD_SIZE as u64
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_max_slice_bytes() -> u64 {
    DEFAULT_MAX_SLICE_BYTES
}

// ----------------------------------------------------------------------------
// 5.2 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Events are emitted under `canopy::*` targets:
// - canopy::store   registry changes, open/remove
// - canopy::metric  flush, rotate, directory scans
// - canopy::pubsub  isolated subscriber failures
// - canopy::alarm   watcher lifecycle and state transitions
// ============================================================================

/// Map a configured level name onto a filter; unknown names mean `info`.
pub fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> StoreResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_fmt::layer()
                        .json()
                        .with_target(true)
                        .with_file(config.source_location)
                        .with_line_number(config.source_location),
                );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| StoreError::Logging(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_fmt::layer()
                        .compact()
                        .with_ansi(config.colors)
                        .with_target(true),
                );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| StoreError::Logging(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_fmt::layer()
                        .pretty()
                        .with_ansi(config.colors)
                        .with_target(true)
                        .with_file(config.source_location)
                        .with_line_number(config.source_location),
                );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| StoreError::Logging(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "canopy::init",
        level = %config.level,
        format = %config.format,
        version = ENGINE_VERSION,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: GLOB MATCHING
// ============================================================================
// Metric name patterns:
// - `*`  matches exactly one path segment
// - `**` matches one or more characters, separators included
// Matching is anchored at both ends.
// ============================================================================

/// Compiled metric name pattern.
///
/// Only `*` and `**` are translated; every other character is handed to the
/// regex engine unescaped, so `.` in a pattern matches any character and
/// unbalanced brackets fail with [`GlobError`].
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    pattern: String,
    regex: Regex,
}

impl GlobMatcher {
    /// Compile a glob pattern.
    pub fn new(pattern: &str) -> Result<Self, GlobError> {
        let translated = format!(
            "^{}$",
            pattern.replace("**", ".+").replace(WILDCARD, "[^/]+")
        );
        Self::compile(pattern, &translated)
    }

    /// Matcher for exactly one name.
    pub fn literal(name: &str) -> Result<Self, GlobError> {
        Self::compile(name, &format!("^{}$", regex::escape(name)))
    }

    fn compile(pattern: &str, translated: &str) -> Result<Self, GlobError> {
        let regex = Regex::new(translated).map_err(|source| GlobError::Compile {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Whether `pattern` should be treated as a glob rather than a name
    #[inline]
    pub fn is_glob(pattern: &str) -> bool {
        pattern.contains(WILDCARD)
    }

    #[inline]
    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

// ============================================================================
// SECTION 8: EVENT FAN-OUT (PUBSUB)
// ============================================================================
// Every emitter of a store shares one dispatcher task. Events are queued,
// never delivered inline, and handlers run one at a time in emission order.
// A failing or panicking handler is logged and skipped.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Dispatcher
// ----------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single consumer task draining queued deliveries.
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    queue: mpsc::UnboundedSender<Job>,
    /// Jobs submitted but not yet finished
    pending: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub(crate) fn spawn(runtime: &RuntimeHandle) -> Self {
        let (queue, mut jobs) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pending);

        runtime.spawn(async move {
            while let Some(job) = jobs.recv().await {
                job();
                counter.fetch_sub(1, AtomicOrdering::AcqRel);
            }
            trace!(target: "canopy::pubsub", "Dispatcher stopped");
        });

        Self { queue, pending }
    }

    fn submit(&self, job: Job) {
        self.pending.fetch_add(1, AtomicOrdering::AcqRel);
        if self.queue.send(job).is_err() {
            self.pending.fetch_sub(1, AtomicOrdering::AcqRel);
            debug!(target: "canopy::pubsub", "Dispatcher closed, event dropped");
        }
    }

    /// Resolve once the queue has drained, including jobs queued by jobs.
    pub(crate) async fn settled(&self) {
        loop {
            let (tx, rx) = oneshot::channel();
            let pending = Arc::clone(&self.pending);
            // The barrier itself is still counted while it runs.
            self.submit(Box::new(move || {
                let _ = tx.send(pending.load(AtomicOrdering::Acquire).saturating_sub(1));
            }));

            match rx.await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 8.2 Subscribers
// ----------------------------------------------------------------------------

/// Subscriber callback; an `Err` is logged by the dispatcher.
pub type Handler<E> = Arc<dyn Fn(&E) -> HandlerResult + Send + Sync>;

struct Subscribers<E> {
    topic: String,
    handlers: DashMap<Uuid, Handler<E>>,
}

impl<E> Subscribers<E> {
    fn deliver(&self, event: &E) {
        let snapshot: Vec<(Uuid, Handler<E>)> = self
            .handlers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        for (id, handler) in snapshot {
            // Cancelled by an earlier handler of this same event
            if !self.handlers.contains_key(&id) {
                continue;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    target: "canopy::pubsub",
                    topic = %self.topic,
                    subscription = %id,
                    error = %e,
                    "Subscriber failed"
                ),
                Err(_) => error!(
                    target: "canopy::pubsub",
                    topic = %self.topic,
                    subscription = %id,
                    "Subscriber panicked"
                ),
            }
        }
    }
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: &Uuid) -> bool;
    fn is_subscribed(&self, id: &Uuid) -> bool;
}

impl<E> Unsubscribe for Subscribers<E> {
    fn unsubscribe(&self, id: &Uuid) -> bool {
        self.handlers.remove(id).is_some()
    }

    fn is_subscribed(&self, id: &Uuid) -> bool {
        self.handlers.contains_key(id)
    }
}

// ----------------------------------------------------------------------------
// 8.3 Subscription Handle
// ----------------------------------------------------------------------------

/// Cancellation handle returned by every `on*`/`add` call.
///
/// Dropping it does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    id: Uuid,
    source: Weak<dyn Unsubscribe>,
}

impl Subscription {
    /// Remove this subscription. Returns `false` when it was already gone.
    pub fn off(&self) -> bool {
        self.source
            .upgrade()
            .map_or(false, |source| source.unsubscribe(&self.id))
    }

    pub fn is_active(&self) -> bool {
        self.source
            .upgrade()
            .map_or(false, |source| source.is_subscribed(&self.id))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 8.4 PubSub
// ----------------------------------------------------------------------------

/// One event topic with any number of subscribers.
pub struct PubSub<E> {
    subscribers: Arc<Subscribers<E>>,
    dispatcher: Dispatcher,
}

impl<E: Send + 'static> PubSub<E> {
    pub(crate) fn new(topic: impl Into<String>, dispatcher: Dispatcher) -> Self {
        Self {
            subscribers: Arc::new(Subscribers {
                topic: topic.into(),
                handlers: DashMap::new(),
            }),
            dispatcher,
        }
    }

    /// Register a handler for every future event.
    pub fn add<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.subscribers.handlers.insert(id, Arc::new(handler));

        let source: Arc<dyn Unsubscribe> = self.subscribers.clone();
        Subscription {
            id,
            source: Arc::downgrade(&source),
        }
    }

    /// Queue `event` for delivery.
    ///
    /// Subscribers are looked up when the event is dispatched, not now, so a
    /// handler registered by an earlier event in the queue still sees it.
    pub fn invoke(&self, event: E) {
        let subscribers = Arc::clone(&self.subscribers);
        self.dispatcher
            .submit(Box::new(move || subscribers.deliver(&event)));
    }

    pub fn len(&self) -> usize {
        self.subscribers.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.handlers.is_empty()
    }

    pub fn topic(&self) -> &str {
        &self.subscribers.topic
    }
}

impl<E> Clone for PubSub<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<E> Debug for PubSub<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSub")
            .field("topic", &self.subscribers.topic)
            .field("subscribers", &self.subscribers.handlers.len())
            .finish()
    }
}

// ============================================================================
// SECTION 9: METRIC SERIES
// ============================================================================
// One node of the metric tree:
//   memory buffer ──flush──→ <root>/<segments...>/<first-timestamp>
// Slices are append-only files of whole records. `timestamps` mirrors the
// slice file names, sorted ascending.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Series State
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SeriesState {
    /// Points added since the last flush
    buffer: Vec<DataPoint>,
    /// Start timestamps of the slice files on disk
    timestamps: Vec<u32>,
}

/// Outcome of one `flush`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub records: usize,
    pub bytes: u64,
    /// Number of slice files written to
    pub slices: usize,
}

/// Outcome of one `rotate`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotateSummary {
    /// Start timestamps of the deleted slices
    pub removed: Vec<u32>,
}

/// Events a metric emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    Data,
}

impl FromStr for MetricEvent {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(MetricEvent::Data),
            other => Err(StoreError::InvalidEvent(other.to_string())),
        }
    }
}

// ----------------------------------------------------------------------------
// 9.2 Slice Planning
// ----------------------------------------------------------------------------

/// Split sorted `points` into slice appends, one entry per distinct file.
///
/// `existing` holds the current slice starts (ascending) and `latest_size`
/// the byte size of the newest one. The first chunk continues the newest
/// slice while it has room. Remaining points go to fresh slices named by
/// their first record.
///
/// A fresh slice never reuses a name already taken. A point whose timestamp
/// names an existing slice stays in the current chunk instead, so a run of
/// one timestamp longer than a slice makes that slice exceed the cap.
pub fn plan_slices(
    points: &[DataPoint],
    existing: &[u32],
    latest_size: u64,
    max_slice_bytes: u64,
) -> Vec<(u32, Range<usize>)> {
    let record = RECORD_SIZE as u64;
    let capacity = (max_slice_bytes / record).max(1) as usize;
    let mut used = existing.to_vec();
    let mut plan = Vec::new();
    let mut index = 0;

    let mut current = existing.last().copied();
    let mut room = (max_slice_bytes.saturating_sub(latest_size) / record) as usize;

    while index < points.len() {
        let start = match current.take() {
            Some(start) => start,
            None => {
                let start = points[index].timestamp;
                if let Err(at) = used.binary_search(&start) {
                    used.insert(at, start);
                }
                room = capacity;
                start
            }
        };

        let mut end = (index + room).min(points.len());
        while end < points.len() && used.binary_search(&points[end].timestamp).is_ok() {
            end += 1;
        }

        if end > index {
            plan.push((start, index..end));
        }
        index = end;
    }

    plan
}

// ----------------------------------------------------------------------------
// 9.3 Metric Core
// ----------------------------------------------------------------------------

struct MetricCore {
    name: String,
    dir: PathBuf,
    max_slice_bytes: u64,
    retention: Option<Duration>,
    state: Mutex<SeriesState>,
    data_events: PubSub<DataPoint>,
    /// Shared by readers, exclusive for flush and rotate
    io_gate: TokioRwLock<()>,
    /// Flips to true once the directory scan finished
    loaded: watch::Sender<bool>,
}

impl MetricCore {
    fn new(name: &str, config: &StoreConfig, dispatcher: Dispatcher) -> Self {
        let (loaded, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            dir: metric_dir(&config.root, name),
            max_slice_bytes: config.max_slice_bytes,
            retention: config.retention,
            state: Mutex::new(SeriesState::default()),
            data_events: PubSub::new(format!("data:{}", name), dispatcher),
            io_gate: TokioRwLock::new(()),
            loaded,
        }
    }

    fn record(&self, point: DataPoint) {
        self.data_events.invoke(point);
        self.state.lock().buffer.push(point);
    }

    fn slice_path(&self, start: u32) -> PathBuf {
        self.dir.join(start.to_string())
    }

    fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    fn mark_loaded(&self) {
        self.loaded.send_replace(true);
    }

    async fn ready(&self) {
        let mut loaded = self.loaded.subscribe();
        let _ = loaded.wait_for(|done| *done).await;
    }

    fn merge_slices(&self, found: Vec<u32>) {
        let mut state = self.state.lock();
        state.timestamps.extend(found);
        state.timestamps.sort_unstable();
        state.timestamps.dedup();
    }

    async fn read_slice(&self, start: u32) -> StoreResult<Vec<DataPoint>> {
        let path = self.slice_path(start);
        match async_fs::read(&path).await {
            Ok(data) => Ok(decode_points(&data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(
                    target: "canopy::metric",
                    metric = %self.name,
                    slice = start,
                    "Slice vanished, reading as empty"
                );
                Ok(Vec::new())
            }
            Err(source) => Err(StoreError::SliceIo { path, source }),
        }
    }

    async fn slice_size(&self, start: u32) -> StoreResult<u64> {
        let path = self.slice_path(start);
        match async_fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(StoreError::SliceIo { path, source }),
        }
    }

    async fn append_slice(&self, start: u32, bytes: &[u8]) -> StoreResult<()> {
        let path = self.slice_path(start);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .slice_context(&path)?;
        file.write_all(bytes).await.slice_context(&path)?;
        file.flush().await.slice_context(&path)?;
        Ok(())
    }
}

/// List a metric directory: child directory names and slice start timestamps,
/// both sorted. Creates the directory when missing.
async fn scan_dir(dir: &Path) -> StoreResult<(Vec<String>, Vec<u32>)> {
    async_fs::create_dir_all(dir).await.slice_context(dir)?;
    let mut entries = async_fs::read_dir(dir).await.slice_context(dir)?;
    let mut children = Vec::new();
    let mut slices = Vec::new();

    while let Some(entry) = entries.next_entry().await.slice_context(dir)? {
        let path = entry.path();
        let file_type = entry.file_type().await.slice_context(&path)?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            debug!(target: "canopy::metric", path = %path.display(), "Skipping non UTF-8 entry");
            continue;
        };

        if file_type.is_dir() {
            children.push(name);
        } else if let Ok(start) = name.parse::<u32>() {
            slices.push(start);
        } else {
            debug!(target: "canopy::metric", path = %path.display(), "Skipping unrecognized file");
        }
    }

    children.sort();
    slices.sort_unstable();
    Ok((children, slices))
}

// ----------------------------------------------------------------------------
// 9.4 Metric Handle
// ----------------------------------------------------------------------------

/// Handle to one metric of a [`Store`]. Cheap to clone.
#[derive(Clone)]
pub struct Metric {
    core: Arc<MetricCore>,
    store: Weak<StoreShared>,
}

impl Metric {
    /// Full '/'-separated name
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Directory holding this metric's slices
    pub fn path(&self) -> &Path {
        &self.core.dir
    }

    /// Record a point here and in every ancestor.
    pub fn add(&self, point: DataPoint) {
        self.core.record(point);

        let Some(store) = self.store.upgrade() else {
            return;
        };

        let mut name = self.core.name.as_str();
        while let Some(parent) = parent_name(name) {
            match store.lookup_core(parent) {
                Some(core) => core.record(point),
                None => trace!(
                    target: "canopy::metric",
                    metric = %self.core.name,
                    ancestor = parent,
                    "Ancestor no longer registered"
                ),
            }
            name = parent;
        }
    }

    /// Points with `start <= timestamp <= end`, from slices and memory,
    /// sorted by timestamp.
    pub async fn get(&self, start: u32, end: u32) -> StoreResult<Vec<DataPoint>> {
        if start > end {
            return Ok(Vec::new());
        }

        let core = &self.core;
        core.ready().await;
        let _gate = core.io_gate.read().await;

        let (mut memory, slices) = {
            let state = core.state.lock();
            let memory: Vec<DataPoint> = state
                .buffer
                .iter()
                .filter(|point| point.in_range(start, end))
                .copied()
                .collect();
            (memory, select_slices(&state.timestamps, start, end).to_vec())
        };

        let decoded = try_join_all(slices.iter().map(|&slice| core.read_slice(slice))).await?;

        let mut points: Vec<DataPoint> = decoded
            .into_iter()
            .flatten()
            .filter(|point| point.in_range(start, end))
            .collect();
        points.append(&mut memory);
        points.sort_by_key(|point| point.timestamp);

        trace!(
            target: "canopy::metric",
            metric = %core.name,
            start,
            end,
            slices = slices.len(),
            points = points.len(),
            "Range read"
        );
        Ok(points)
    }

    /// Move the memory buffer into slice files.
    ///
    /// The buffer is taken up front; points added meanwhile wait for the
    /// next flush. A failure part way leaves earlier slices written.
    pub async fn flush(&self) -> StoreResult<FlushSummary> {
        let core = &self.core;
        core.ready().await;
        let _gate = core.io_gate.write().await;

        let mut points = mem::take(&mut core.state.lock().buffer);
        if points.is_empty() {
            trace!(target: "canopy::metric", metric = %core.name, "Nothing to flush");
            return Ok(FlushSummary::default());
        }
        points.sort_by_key(|point| point.timestamp);

        async_fs::create_dir_all(&core.dir)
            .await
            .slice_context(&core.dir)?;

        let existing = core.state.lock().timestamps.clone();
        let latest_size = match existing.last() {
            Some(&start) => core.slice_size(start).await?,
            None => 0,
        };

        let plan = plan_slices(&points, &existing, latest_size, core.max_slice_bytes);
        {
            let mut state = core.state.lock();
            state.timestamps.extend(plan.iter().map(|(start, _)| *start));
            state.timestamps.sort_unstable();
            state.timestamps.dedup();
        }

        let mut summary = FlushSummary {
            records: points.len(),
            ..FlushSummary::default()
        };
        for (start, range) in plan {
            let bytes = encode_points(&points[range]);
            core.append_slice(start, &bytes).await?;
            summary.bytes += bytes.len() as u64;
            summary.slices += 1;
        }

        debug!(
            target: "canopy::metric",
            metric = %core.name,
            records = summary.records,
            bytes = summary.bytes,
            slices = summary.slices,
            "Flushed"
        );
        Ok(summary)
    }

    /// Apply the retention policy as of now.
    pub async fn rotate(&self) -> StoreResult<RotateSummary> {
        let now = u32::try_from(Utc::now().timestamp().max(0)).unwrap_or(u32::MAX);
        self.rotate_at(now).await
    }

    /// Apply the retention policy as of `now` (seconds).
    ///
    /// Deletes every slice whose successor starts at or before
    /// `now - retention`. Without a retention the call only completes.
    pub async fn rotate_at(&self, now: u32) -> StoreResult<RotateSummary> {
        let core = &self.core;
        let Some(retention) = core.retention else {
            trace!(target: "canopy::metric", metric = %core.name, "No retention configured");
            return Ok(RotateSummary::default());
        };

        core.ready().await;
        let _gate = core.io_gate.write().await;

        let keep_secs = u32::try_from(retention.as_secs()).unwrap_or(u32::MAX);
        let horizon = now.saturating_sub(keep_secs);
        let removed = {
            let mut state = core.state.lock();
            let expired = expired_slices(&state.timestamps, horizon);
            state.timestamps.retain(|start| expired.binary_search(start).is_err());
            expired
        };

        for &start in &removed {
            let path = core.slice_path(start);
            match async_fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::SliceIo { path, source }),
            }
        }

        if !removed.is_empty() {
            info!(
                target: "canopy::metric",
                metric = %core.name,
                horizon,
                removed = removed.len(),
                "Rotated slices"
            );
        }
        Ok(RotateSummary { removed })
    }

    /// Subscribe to every point added here, including rolled-up points.
    pub fn on_data<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DataPoint) -> HandlerResult + Send + Sync + 'static,
    {
        self.core.data_events.add(handler)
    }

    /// Subscribe by event name. Only `"data"` exists.
    pub fn on<F>(&self, event: &str, handler: F) -> StoreResult<Subscription>
    where
        F: Fn(&DataPoint) -> HandlerResult + Send + Sync + 'static,
    {
        match event.parse::<MetricEvent>()? {
            MetricEvent::Data => Ok(self.on_data(handler)),
        }
    }

    /// Wait until the directory scan for this metric finished.
    pub async fn ready(&self) {
        self.core.ready().await
    }

    /// Start timestamps of the slice files, ascending
    pub fn slice_starts(&self) -> Vec<u32> {
        self.core.state.lock().timestamps.clone()
    }

    /// Number of unflushed points
    pub fn buffered(&self) -> usize {
        self.core.state.lock().buffer.len()
    }

    pub fn parent(&self) -> Option<Metric> {
        let store = self.store.upgrade()?;
        let core = store.lookup_core(parent_name(&self.core.name)?)?;
        Some(store.handle(core))
    }

    /// Child names in creation order
    pub fn children(&self) -> Vec<String> {
        let Some(store) = self.store.upgrade() else {
            return Vec::new();
        };
        let tree = store.tree.lock();
        let children = tree
            .nodes
            .get(&self.core.name)
            .map(|entry| entry.children.clone())
            .unwrap_or_default();
        children
    }
}

impl Debug for Metric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("name", &self.core.name)
            .field("path", &self.core.dir)
            .field("buffered", &self.buffered())
            .field("slices", &self.core.state.lock().timestamps.len())
            .finish()
    }
}

// ============================================================================
// SECTION 10: METRIC REGISTRY (STORE)
// ============================================================================
// The store owns every metric. Parent/child links are names resolved through
// the tree map, and both sides of a link change under the same lock.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Tree
// ----------------------------------------------------------------------------

struct TreeEntry {
    core: Arc<MetricCore>,
    children: Vec<String>,
}

#[derive(Default)]
struct MetricTree {
    nodes: HashMap<String, TreeEntry>,
}

enum Removal {
    Removed,
    Missing,
    HasChildren,
}

/// Directory deletions still in flight, keyed by the removed metric's name.
/// The flag flips to true once the directory is gone.
type PurgeMap = HashMap<String, (Uuid, watch::Receiver<bool>)>;

/// Whether `name` is `ancestor` itself or lives below it.
fn is_within(name: &str, ancestor: &str) -> bool {
    name.strip_prefix(ancestor)
        .map_or(false, |rest| rest.is_empty() || rest.starts_with(PATH_SEPARATOR))
}

struct StoreShared {
    config: StoreConfig,
    runtime: RuntimeHandle,
    dispatcher: Dispatcher,
    tree: Mutex<MetricTree>,
    purges: Arc<Mutex<PurgeMap>>,
    new_events: PubSub<String>,
    remove_events: PubSub<String>,
}

impl StoreShared {
    fn lookup_core(&self, name: &str) -> Option<Arc<MetricCore>> {
        self.tree
            .lock()
            .nodes
            .get(name)
            .map(|entry| Arc::clone(&entry.core))
    }

    fn is_current(&self, core: &Arc<MetricCore>) -> bool {
        self.tree
            .lock()
            .nodes
            .get(&core.name)
            .map_or(false, |entry| Arc::ptr_eq(&entry.core, core))
    }

    fn handle(self: &Arc<Self>, core: Arc<MetricCore>) -> Metric {
        Metric {
            core,
            store: Arc::downgrade(self),
        }
    }

    /// Get or create `name` and its ancestors, oldest ancestor first.
    /// `name` must already be validated.
    fn materialize(self: &Arc<Self>, name: &str) -> Arc<MetricCore> {
        loop {
            if let Some(core) = self.lookup_core(name) {
                return core;
            }
            if let Some(parent) = parent_name(name) {
                self.materialize(parent);
            }

            let mut tree = self.tree.lock();
            if let Some(entry) = tree.nodes.get(name) {
                return Arc::clone(&entry.core);
            }
            if let Some(parent) = parent_name(name) {
                match tree.nodes.get_mut(parent) {
                    Some(entry) => entry.children.push(name.to_string()),
                    // Parent removed in between
                    None => continue,
                }
            }

            let core = Arc::new(MetricCore::new(name, &self.config, self.dispatcher.clone()));
            tree.nodes.insert(
                name.to_string(),
                TreeEntry {
                    core: Arc::clone(&core),
                    children: Vec::new(),
                },
            );
            drop(tree);

            debug!(target: "canopy::store", metric = name, "Metric created");
            self.new_events.invoke(name.to_string());
            self.spawn_scan(Arc::clone(&core));
            return core;
        }
    }

    /// Purges that must finish before `name`'s directory can be reused.
    fn pending_purges(&self, name: &str) -> Vec<watch::Receiver<bool>> {
        self.purges
            .lock()
            .iter()
            .filter(|(removed, _)| is_within(name, removed))
            .map(|(_, (_, done))| done.clone())
            .collect()
    }

    fn is_purging(&self, name: &str) -> bool {
        self.purges
            .lock()
            .get(name)
            .map_or(false, |(_, done)| !*done.borrow())
    }

    /// Discover existing slices and child directories in the background.
    ///
    /// A re-created metric shares its directory with the removed one, so the
    /// scan first waits for any pending deletion of that directory or an
    /// ancestor of it.
    fn spawn_scan(self: &Arc<Self>, core: Arc<MetricCore>) {
        let store = Arc::downgrade(self);
        let purges = self.pending_purges(&core.name);
        self.runtime.spawn(async move {
            for mut done in purges {
                let _ = done.wait_for(|done| *done).await;
            }

            match scan_dir(&core.dir).await {
                Ok((children, slices)) => {
                    trace!(
                        target: "canopy::metric",
                        metric = %core.name,
                        children = children.len(),
                        slices = slices.len(),
                        "Directory scanned"
                    );
                    core.merge_slices(slices);

                    if let Some(store) = store.upgrade() {
                        if store.is_current(&core) {
                            for child in children {
                                let name = format!("{}{}{}", core.name, PATH_SEPARATOR, child);
                                if let Err(e) = validate_name(&name) {
                                    debug!(target: "canopy::metric", error = %e, "Skipping directory");
                                    continue;
                                }
                                // Removed while the scan ran; its directory is going away
                                if store.is_purging(&name) {
                                    continue;
                                }
                                store.materialize(&name);
                            }
                        }
                    }
                }
                Err(e) => warn!(
                    target: "canopy::metric",
                    metric = %core.name,
                    error = %e,
                    "Directory scan failed"
                ),
            }
            core.mark_loaded();
        });
    }

    fn unlink(&self, name: &str) -> Removal {
        let (core, done) = {
            let mut tree = self.tree.lock();
            match tree.nodes.get(name) {
                None => return Removal::Missing,
                Some(entry) if !entry.children.is_empty() => return Removal::HasChildren,
                Some(_) => {}
            }
            let Some(entry) = tree.nodes.remove(name) else {
                return Removal::Missing;
            };
            if let Some(parent) = parent_name(name) {
                if let Some(parent) = tree.nodes.get_mut(parent) {
                    parent.children.retain(|child| child != name);
                }
            }

            // Registered before the name disappears from the tree, so any
            // later materialize of it sees the barrier.
            let id = Uuid::new_v4();
            let (done, pending) = watch::channel(false);
            self.purges.lock().insert(name.to_string(), (id, pending));
            (entry.core, (id, done))
        };

        info!(target: "canopy::store", metric = name, "Metric removed");
        self.spawn_purge(core, done);
        self.remove_events.invoke(name.to_string());
        Removal::Removed
    }

    /// Delete a removed metric's directory once its pending I/O is done,
    /// then release whoever waits to reuse the directory.
    fn spawn_purge(&self, core: Arc<MetricCore>, (id, done): (Uuid, watch::Sender<bool>)) {
        let purges = Arc::clone(&self.purges);
        self.runtime.spawn(async move {
            core.ready().await;
            let gate = core.io_gate.write().await;
            match async_fs::remove_dir_all(&core.dir).await {
                Ok(()) => debug!(target: "canopy::store", metric = %core.name, "Directory deleted"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    target: "canopy::store",
                    metric = %core.name,
                    path = %core.dir.display(),
                    error = %e,
                    "Failed to delete metric directory"
                ),
            }
            drop(gate);

            done.send_replace(true);
            let mut pending = purges.lock();
            if pending.get(&core.name).map_or(false, |(current, _)| *current == id) {
                pending.remove(&core.name);
            }
        });
    }

    fn matching(&self, matcher: &GlobMatcher) -> Vec<(String, Arc<MetricCore>)> {
        let mut found: Vec<(String, Arc<MetricCore>)> = self
            .tree
            .lock()
            .nodes
            .iter()
            .filter(|(name, _)| matcher.is_match(name))
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.core)))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }
}

// ----------------------------------------------------------------------------
// 10.2 Store Handle
// ----------------------------------------------------------------------------

/// A metric tree rooted at one directory. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Store {
    /// Open (or create) the store under `config.root` and load the existing tree.
    ///
    /// Must be called from inside a Tokio runtime.
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let runtime =
            RuntimeHandle::try_current().map_err(|e| StoreError::NoRuntime(e.to_string()))?;

        async_fs::create_dir_all(&config.root)
            .await
            .slice_context(&config.root)?;

        let mut top_level = Vec::new();
        let mut entries = async_fs::read_dir(&config.root)
            .await
            .slice_context(&config.root)?;
        while let Some(entry) = entries.next_entry().await.slice_context(&config.root)? {
            let file_type = entry.file_type().await.slice_context(&entry.path())?;
            if !file_type.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_name(name).is_ok() {
                    top_level.push(name.to_string());
                }
            }
        }
        top_level.sort();

        let dispatcher = Dispatcher::spawn(&runtime);
        let shared = Arc::new(StoreShared {
            new_events: PubSub::new("new", dispatcher.clone()),
            remove_events: PubSub::new("remove", dispatcher.clone()),
            dispatcher,
            config,
            runtime,
            tree: Mutex::new(MetricTree::default()),
            purges: Arc::new(Mutex::new(HashMap::new())),
        });

        for name in &top_level {
            shared.materialize(name);
        }

        let store = Self { shared };
        store.loaded().await;

        info!(
            target: "canopy::store",
            root = %store.root().display(),
            metrics = store.len(),
            max_slice_bytes = store.config().max_slice_bytes,
            "Store opened"
        );
        Ok(store)
    }

    /// Open with default settings under `root`
    pub async fn open_path(root: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::open(StoreConfig::new(root)).await
    }

    pub fn root(&self) -> &Path {
        &self.shared.config.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Get or create a metric, creating missing ancestors first.
    pub fn metric(&self, name: &str) -> StoreResult<Metric> {
        validate_name(name)?;
        let core = self.shared.materialize(name);
        Ok(self.shared.handle(core))
    }

    /// Existing metric only
    pub fn lookup(&self, name: &str) -> Option<Metric> {
        self.shared
            .lookup_core(name)
            .map(|core| self.shared.handle(core))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shared.tree.lock().nodes.contains_key(name)
    }

    /// All metric names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.tree.lock().nodes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.shared.tree.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.tree.lock().nodes.is_empty()
    }

    /// Metrics whose names match `pattern`, sorted by name.
    pub fn find(&self, pattern: &str) -> StoreResult<Vec<Metric>> {
        let matcher = GlobMatcher::new(pattern)?;
        Ok(self
            .shared
            .matching(&matcher)
            .into_iter()
            .map(|(_, core)| self.shared.handle(core))
            .collect())
    }

    /// Remove a metric, or every metric matching a glob.
    ///
    /// A metric with children is never removed. For an exact name that
    /// yields `false`; an unknown name counts as removed. For a glob, matches
    /// are removed deepest first and the result is `true` only when every
    /// match went away.
    pub fn remove(&self, target: &str) -> StoreResult<bool> {
        if !GlobMatcher::is_glob(target) {
            validate_name(target)?;
            return Ok(!matches!(self.shared.unlink(target), Removal::HasChildren));
        }

        let matcher = GlobMatcher::new(target)?;
        let mut names: Vec<String> = self
            .shared
            .matching(&matcher)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort_by_key(|name| Reverse(depth(name)));

        let mut all_removed = true;
        for name in &names {
            if let Removal::HasChildren = self.shared.unlink(name) {
                debug!(target: "canopy::store", metric = %name, "Kept metric with children");
                all_removed = false;
            }
        }
        Ok(all_removed)
    }

    /// Subscribe to metric creation; the handler receives the new name.
    pub fn on_new<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared
            .new_events
            .add(move |name: &String| handler(name.as_str()))
    }

    /// Subscribe to metric removal; the handler receives the removed name.
    pub fn on_remove<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared
            .remove_events
            .add(move |name: &String| handler(name.as_str()))
    }

    /// Subscribe to the data events of `name`, creating it when absent.
    pub fn on_data<F>(&self, name: &str, handler: F) -> StoreResult<Subscription>
    where
        F: Fn(&DataPoint) -> HandlerResult + Send + Sync + 'static,
    {
        Ok(self.metric(name)?.on_data(handler))
    }

    /// Shorthand for `metric(name)?.add(point)`
    pub fn add(&self, name: &str, point: DataPoint) -> StoreResult<()> {
        self.metric(name)?.add(point);
        Ok(())
    }

    fn all_metrics(&self) -> Vec<Metric> {
        let mut cores: Vec<Arc<MetricCore>> = self
            .shared
            .tree
            .lock()
            .nodes
            .values()
            .map(|entry| Arc::clone(&entry.core))
            .collect();
        cores.sort_by(|a, b| a.name.cmp(&b.name));
        cores
            .into_iter()
            .map(|core| self.shared.handle(core))
            .collect()
    }

    /// Flush every metric. Returns the number of records written.
    pub async fn flush_all(&self) -> StoreResult<usize> {
        let metrics = self.all_metrics();
        let summaries = try_join_all(metrics.iter().map(|metric| metric.flush())).await?;
        let records: usize = summaries.iter().map(|summary| summary.records).sum();
        debug!(target: "canopy::store", metrics = metrics.len(), records, "Flushed all metrics");
        Ok(records)
    }

    /// Rotate every metric. Returns the number of slices deleted.
    pub async fn rotate_all(&self) -> StoreResult<usize> {
        let metrics = self.all_metrics();
        let summaries = try_join_all(metrics.iter().map(|metric| metric.rotate())).await?;
        Ok(summaries.iter().map(|summary| summary.removed.len()).sum())
    }

    /// Resolve once every event emitted so far has been delivered,
    /// including events emitted by handlers along the way.
    pub async fn settled(&self) {
        self.shared.dispatcher.settled().await
    }

    /// Resolve once every registered metric finished its directory scan.
    pub async fn loaded(&self) {
        loop {
            let pending: Vec<Arc<MetricCore>> = self
                .shared
                .tree
                .lock()
                .nodes
                .values()
                .filter(|entry| !entry.core.is_loaded())
                .map(|entry| Arc::clone(&entry.core))
                .collect();

            if pending.is_empty() {
                return;
            }
            for core in pending {
                core.ready().await;
            }
        }
    }
}

impl Debug for Store {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.shared.config.root)
            .field("metrics", &self.len())
            .finish()
    }
}

// ============================================================================
// SECTION 11: THRESHOLD ALARMS
// ============================================================================
// An alarm binds a condition to every metric matching its pattern:
//
//   data point → condition → Hysteresis → (state flip) → callback
//
// A flip needs the new condition to hold for `duration` measured in sample
// time. Watchers follow the registry, so metrics created later are picked up
// and removed ones are released.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Alarm State
// ----------------------------------------------------------------------------

/// Confirmed state of one watched metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmState {
    #[default]
    Ok,
    Alarm,
    /// Reserved for watchers that stop receiving data; never entered yet
    Stale,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Ok => "OK",
            AlarmState::Alarm => "ALARM",
            AlarmState::Stale => "STALE",
        }
    }
}

impl Display for AlarmState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 11.2 Hysteresis
// ----------------------------------------------------------------------------

/// Debounced two-state machine driven by sample timestamps.
#[derive(Debug, Clone)]
pub struct Hysteresis {
    state: AlarmState,
    /// Earliest timestamp of the current disagreeing run
    pending_since: Option<u32>,
    duration_secs: u64,
}

impl Hysteresis {
    pub fn new(duration: Duration) -> Self {
        Self {
            state: AlarmState::Ok,
            pending_since: None,
            duration_secs: duration.as_secs(),
        }
    }

    /// Feed one evaluated sample. Returns the new state when it flips.
    pub fn observe(&mut self, timestamp: u32, breached: bool) -> Option<AlarmState> {
        let target = if breached {
            AlarmState::Alarm
        } else {
            AlarmState::Ok
        };

        if target == self.state {
            self.pending_since = None;
            return None;
        }

        let since = self
            .pending_since
            .map_or(timestamp, |pending| pending.min(timestamp));
        self.pending_since = Some(since);

        if u64::from(timestamp.saturating_sub(since)) >= self.duration_secs {
            self.state = target;
            self.pending_since = None;
            Some(target)
        } else {
            None
        }
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn pending_since(&self) -> Option<u32> {
        self.pending_since
    }
}

// ----------------------------------------------------------------------------
// 11.3 Watchers
// ----------------------------------------------------------------------------

type Condition = Arc<dyn Fn(&DataPoint) -> bool + Send + Sync>;
type AlarmCallback = Arc<dyn Fn(&Metric, AlarmState) -> HandlerResult + Send + Sync>;

struct Watcher {
    machine: Arc<Mutex<Hysteresis>>,
    subscription: Subscription,
}

struct AlarmShared {
    pattern: String,
    matcher: GlobMatcher,
    condition: Condition,
    duration: Duration,
    callback: AlarmCallback,
    /// `None` once the alarm is off
    watchers: Mutex<Option<HashMap<String, Watcher>>>,
    registry: Mutex<Vec<Subscription>>,
    store: Weak<StoreShared>,
}

impl AlarmShared {
    fn attach(self: &Arc<Self>, metric: &Metric) {
        let mut guard = self.watchers.lock();
        let Some(watchers) = guard.as_mut() else {
            return;
        };
        if watchers.contains_key(metric.name()) {
            return;
        }

        let machine = Arc::new(Mutex::new(Hysteresis::new(self.duration)));
        let alarm = Arc::clone(self);
        let state = Arc::clone(&machine);
        let core = Arc::downgrade(&metric.core);
        let store = metric.store.clone();

        let subscription = metric.on_data(move |point| match core.upgrade() {
            Some(core) => {
                let metric = Metric {
                    core,
                    store: store.clone(),
                };
                alarm.evaluate(&metric, &state, point)
            }
            None => Ok(()),
        });

        watchers.insert(
            metric.name().to_string(),
            Watcher {
                machine,
                subscription,
            },
        );
        debug!(target: "canopy::alarm", pattern = %self.pattern, metric = metric.name(), "Watcher attached");
    }

    fn admit(self: &Arc<Self>, name: &str) {
        if !self.matcher.is_match(name) {
            return;
        }
        let Some(store) = self.store.upgrade() else {
            return;
        };
        if let Some(core) = store.lookup_core(name) {
            self.attach(&store.handle(core));
        }
    }

    fn detach(&self, name: &str) {
        let watcher = self
            .watchers
            .lock()
            .as_mut()
            .and_then(|watchers| watchers.remove(name));
        if let Some(watcher) = watcher {
            watcher.subscription.off();
            debug!(target: "canopy::alarm", pattern = %self.pattern, metric = name, "Watcher detached");
        }
    }

    fn evaluate(&self, metric: &Metric, machine: &Mutex<Hysteresis>, point: &DataPoint) -> HandlerResult {
        let breached = (self.condition)(point);
        let transition = machine.lock().observe(point.timestamp, breached);

        if let Some(state) = transition {
            info!(
                target: "canopy::alarm",
                pattern = %self.pattern,
                metric = metric.name(),
                state = %state,
                timestamp = point.timestamp,
                "Alarm state changed"
            );
            (self.callback)(metric, state)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 11.4 Alarm Handle
// ----------------------------------------------------------------------------

/// A registered alarm. It stays armed until [`Alarm::off`], even when every
/// handle has been dropped.
#[derive(Clone)]
pub struct Alarm {
    shared: Arc<AlarmShared>,
}

impl Alarm {
    /// Disarm: drop the registry subscriptions and every watcher. Idempotent.
    pub fn off(&self) {
        let registry = mem::take(&mut *self.shared.registry.lock());
        for subscription in &registry {
            subscription.off();
        }

        let watchers = self.shared.watchers.lock().take();
        if let Some(watchers) = watchers {
            for watcher in watchers.values() {
                watcher.subscription.off();
            }
            info!(
                target: "canopy::alarm",
                pattern = %self.shared.pattern,
                watchers = watchers.len(),
                "Alarm disarmed"
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.watchers.lock().is_some()
    }

    pub fn pattern(&self) -> &str {
        &self.shared.pattern
    }

    /// Confirmed state of a watched metric
    pub fn state(&self, name: &str) -> Option<AlarmState> {
        self.shared
            .watchers
            .lock()
            .as_ref()
            .and_then(|watchers| watchers.get(name))
            .map(|watcher| watcher.machine.lock().state())
    }

    /// Names currently watched, sorted
    pub fn watched(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .watchers
            .lock()
            .as_ref()
            .map(|watchers| watchers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Debug for Alarm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alarm")
            .field("pattern", &self.shared.pattern)
            .field("duration", &self.shared.duration)
            .field("watched", &self.watched())
            .finish()
    }
}

impl Store {
    /// Arm an alarm on a metric name or glob pattern.
    ///
    /// `condition` is evaluated for every point reaching a watched metric.
    /// `callback` runs on each confirmed OK/ALARM flip; its errors are logged.
    pub fn alarm<C, F>(
        &self,
        pattern: &str,
        condition: C,
        duration: Duration,
        callback: F,
    ) -> StoreResult<Alarm>
    where
        C: Fn(&DataPoint) -> bool + Send + Sync + 'static,
        F: Fn(&Metric, AlarmState) -> HandlerResult + Send + Sync + 'static,
    {
        let glob = GlobMatcher::is_glob(pattern);
        let matcher = if glob {
            GlobMatcher::new(pattern)?
        } else {
            validate_name(pattern)?;
            GlobMatcher::literal(pattern)?
        };

        let shared = Arc::new(AlarmShared {
            pattern: pattern.to_string(),
            matcher,
            condition: Arc::new(condition),
            duration,
            callback: Arc::new(callback),
            watchers: Mutex::new(Some(HashMap::new())),
            registry: Mutex::new(Vec::new()),
            store: Arc::downgrade(&self.shared),
        });

        let on_new = {
            let alarm = Arc::clone(&shared);
            self.on_new(move |name| {
                alarm.admit(name);
                Ok(())
            })
        };
        let on_remove = {
            let alarm = Arc::clone(&shared);
            self.on_remove(move |name| {
                alarm.detach(name);
                Ok(())
            })
        };
        *shared.registry.lock() = vec![on_new, on_remove];

        if glob {
            for metric in self.find(pattern)? {
                shared.attach(&metric);
            }
        } else {
            shared.attach(&self.metric(pattern)?);
        }

        info!(
            target: "canopy::alarm",
            pattern,
            duration_secs = duration.as_secs(),
            "Alarm armed"
        );
        Ok(Alarm { shared })
    }
}

// ============================================================================
// SECTION 12: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    // ---- Codec ----

    #[test]
    fn test_record_layout_is_big_endian() {
        let point = DataPoint::new(1, 2, 1.5, -1.0, 2.0, 0.0);
        let bytes = point.to_bytes();

        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(&bytes[8..12], &[0x3F, 0xC0, 0x00, 0x00]);
        assert_eq!(&bytes[12..16], &[0xBF, 0x80, 0x00, 0x00]);
        assert_eq!(&bytes[16..20], &[0x40, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_ignores_partial_record() {
        let points = vec![DataPoint::sample(7, 3.0), DataPoint::sample(9, 4.0)];
        let encoded = encode_points(&points);
        assert_eq!(encoded.len(), 2 * RECORD_SIZE);

        let truncated = &encoded[..encoded.len() - 5];
        assert_eq!(decode_points(truncated), vec![points[0]]);
        assert!(decode_points(&[]).is_empty());
    }

    #[test]
    fn test_sample_fills_every_aggregate() {
        let point = DataPoint::sample(5, 2.5);
        assert_eq!(point, DataPoint::from((5, 1, 2.5, 2.5, 2.5, 2.5)));
        assert_eq!(point.to_string(), "[5, 1, 2.5, 2.5, 2.5, 2.5]");
    }

    // ---- Slice selection ----

    #[test]
    fn test_select_slices_includes_preceding_slice() {
        let slices = [10, 20, 30, 40];
        assert_eq!(select_slices(&slices, 25, 35), &[20, 30]);
        assert_eq!(select_slices(&slices, 20, 20), &[10, 20]);
        assert_eq!(select_slices(&slices, 5, 9), &[] as &[u32]);
        assert_eq!(select_slices(&slices, 45, 50), &[40]);
        assert_eq!(select_slices(&slices, 0, 100), &slices);
        assert_eq!(select_slices(&slices, 30, 20), &[] as &[u32]);
    }

    #[test]
    fn test_expired_slices_keeps_newest() {
        assert_eq!(expired_slices(&[0, 2, 4], 4), vec![0, 2]);
        assert_eq!(expired_slices(&[0, 2, 4], 3), vec![0]);
        assert_eq!(expired_slices(&[0, 2, 4], 100), vec![0, 2]);
        assert!(expired_slices(&[7], 100).is_empty());
    }

    #[test]
    fn test_plan_slices_fills_latest_then_splits() {
        let points: Vec<DataPoint> = (0..5).map(|t| DataPoint::sample(t + 10, 0.0)).collect();

        // 48-byte slices hold two records; latest has room for one more
        let plan = plan_slices(&points, &[1], 24, 48);
        assert_eq!(plan, vec![(1, 0..1), (11, 1..3), (13, 3..5)]);

        let plan = plan_slices(&points, &[1], 48, 48);
        assert_eq!(plan, vec![(10, 0..2), (12, 2..4), (14, 4..5)]);

        let plan = plan_slices(&points, &[], 0, 10_000);
        assert_eq!(plan, vec![(10, 0..5)]);
    }

    #[test]
    fn test_plan_slices_never_reuses_a_slice_name() {
        let same: Vec<DataPoint> = (0..500).map(|_| DataPoint::sample(7, 1.0)).collect();
        assert_eq!(plan_slices(&same, &[], 0, 10_000), vec![(7, 0..500)]);

        // Newest slice is full but the first points carry its name
        let points = vec![
            DataPoint::sample(7, 0.0),
            DataPoint::sample(7, 0.0),
            DataPoint::sample(8, 0.0),
        ];
        assert_eq!(
            plan_slices(&points, &[3, 7], 10_000, 10_000),
            vec![(7, 0..2), (8, 2..3)]
        );

        // Late point naming an older slice stays with the chunk before it
        let points = vec![
            DataPoint::sample(10, 0.0),
            DataPoint::sample(11, 0.0),
            DataPoint::sample(12, 0.0),
        ];
        assert_eq!(
            plan_slices(&points, &[2, 11, 20], 23 * 24, 24 * 24),
            vec![(20, 0..2), (12, 2..3)]
        );
    }

    // ---- Glob matching ----

    #[test_case("a/*", "a/b", true ; "star matches a segment")]
    #[test_case("a/*", "a/c", true ; "star matches another segment")]
    #[test_case("a/*", "a", false ; "star needs a segment")]
    #[test_case("a/*", "a/b/c", false ; "star stops at separator")]
    #[test_case("a/**", "a/b", true ; "double star matches one level")]
    #[test_case("a/**", "a/b/c", true ; "double star crosses separators")]
    #[test_case("a/**", "x/b", false ; "double star keeps prefix")]
    #[test_case("*/cpu", "web/cpu", true ; "leading star")]
    #[test_case("a/b", "a/b", true ; "plain name")]
    fn test_glob_matching(pattern: &str, name: &str, expected: bool) {
        let matcher = GlobMatcher::new(pattern).unwrap();
        assert_eq!(matcher.is_match(name), expected);
    }

    #[test]
    fn test_glob_rejects_invalid_regex() {
        let err = GlobMatcher::new("a/(").unwrap_err();
        assert!(matches!(err, GlobError::Compile { .. }));
        assert!(GlobMatcher::is_glob("a/*"));
        assert!(!GlobMatcher::is_glob("a/b"));
    }

    #[test]
    fn test_literal_matcher_escapes() {
        let matcher = GlobMatcher::literal("a.b").unwrap();
        assert!(matcher.is_match("a.b"));
        assert!(!matcher.is_match("axb"));
    }

    // ---- Names ----

    #[test]
    fn test_name_helpers() {
        assert_eq!(parent_name("a/b/c"), Some("a/b"));
        assert_eq!(parent_name("a"), None);
        assert_eq!(depth("a/b/c"), 3);
        assert_eq!(
            metric_dir(Path::new("/data"), "a/b"),
            PathBuf::from("/data/a/b")
        );
    }

    #[test_case("" ; "empty")]
    #[test_case("a//b" ; "empty segment")]
    #[test_case("/a" ; "leading separator")]
    #[test_case("a/../b" ; "parent segment")]
    #[test_case("a/*" ; "wildcard")]
    fn test_invalid_names(name: &str) {
        let err = validate_name(name).unwrap_err();
        assert_eq!(err.category(), "name");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_valid_names() {
        assert!(validate_name("hosts/web-01/cpu").is_ok());
        assert!(validate_name("a").is_ok());
    }

    // ---- Configuration ----

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.root, PathBuf::from(DEFAULT_ROOT));
        assert_eq!(config.max_slice_bytes, 10_000);
        assert_eq!(config.records_per_slice(), 416);
        assert!(config.retention.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = StoreConfig::from_toml_str(
            r#"
            root = "/var/lib/canopy"
            max_slice_bytes = 4800
            retention = "2h"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.root, PathBuf::from("/var/lib/canopy"));
        assert_eq!(config.max_slice_bytes, 4800);
        assert_eq!(config.retention, Some(Duration::from_secs(7200)));
        assert_eq!(config.logging.format, "json");
        assert!(config.logging.colors);
    }

    #[test]
    fn test_config_rejects_tiny_slices() {
        let err = StoreConfig::from_toml_str("max_slice_bytes = 10").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "max_slice_bytes"));

        let err = StoreConfig::new("").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "root"));
    }

    #[test]
    fn test_config_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canopy.toml");
        std::fs::write(&path, "max_slice_bytes = 48\nretention = \"30s\"\n").unwrap();

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.max_slice_bytes, 48);
        assert_eq!(config.retention, Some(Duration::from_secs(30)));

        let missing = StoreConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("warning"), LevelFilter::WARN);
        assert_eq!(level_filter("nonsense"), LevelFilter::INFO);
    }

    // ---- Errors ----

    #[test]
    fn test_error_categories() {
        let err = StoreError::SliceIo {
            path: PathBuf::from("/data/a/10"),
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        };
        assert!(err.is_recoverable());
        assert_eq!(err.category(), "slice_io");
        assert!(err.to_string().contains("/data/a/10"));

        let err: StoreError = "bogus".parse::<MetricEvent>().unwrap_err();
        assert_eq!(err.category(), "event");
    }

    #[test]
    fn test_slice_context_attaches_path() {
        let result: Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        match result.slice_context(Path::new("/x/1")) {
            Err(StoreError::SliceIo { path, .. }) => assert_eq!(path, PathBuf::from("/x/1")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    // ---- Alarm state machine ----

    #[test]
    fn test_hysteresis_flips_after_duration() {
        let mut machine = Hysteresis::new(Duration::from_secs(10));
        assert_eq!(machine.observe(0, true), None);
        assert_eq!(machine.pending_since(), Some(0));
        assert_eq!(machine.observe(5, true), None);
        assert_eq!(machine.observe(12, true), Some(AlarmState::Alarm));
        assert_eq!(machine.state(), AlarmState::Alarm);
        assert_eq!(machine.pending_since(), None);
    }

    #[test]
    fn test_hysteresis_agreeing_point_resets() {
        let mut machine = Hysteresis::new(Duration::from_secs(10));
        assert_eq!(machine.observe(0, true), None);
        assert_eq!(machine.observe(5, true), None);
        assert_eq!(machine.observe(8, false), None);
        assert_eq!(machine.pending_since(), None);
        assert_eq!(machine.observe(12, true), None);
        assert_eq!(machine.state(), AlarmState::Ok);
        assert_eq!(machine.observe(22, true), Some(AlarmState::Alarm));
    }

    #[test]
    fn test_hysteresis_recovers() {
        let mut machine = Hysteresis::new(Duration::from_secs(3));
        assert_eq!(machine.observe(0, true), None);
        assert_eq!(machine.observe(3, true), Some(AlarmState::Alarm));
        assert_eq!(machine.observe(4, false), None);
        assert_eq!(machine.observe(7, false), Some(AlarmState::Ok));
    }

    #[test]
    fn test_hysteresis_zero_duration_flips_immediately() {
        let mut machine = Hysteresis::new(Duration::ZERO);
        assert_eq!(machine.observe(100, true), Some(AlarmState::Alarm));
        assert_eq!(machine.observe(100, true), None);
        assert_eq!(machine.observe(101, false), Some(AlarmState::Ok));
    }

    #[test]
    fn test_alarm_state_names() {
        assert_eq!(AlarmState::default(), AlarmState::Ok);
        assert_eq!(AlarmState::Alarm.to_string(), "ALARM");
        assert_eq!(AlarmState::Stale.as_str(), "STALE");
    }
}



#[cfg(test)]
mod alarm_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    type Transitions = Arc<Mutex<Vec<(String, AlarmState)>>>;

    fn collector() -> (
        Transitions,
        impl Fn(&Metric, AlarmState) -> HandlerResult + Send + Sync + 'static,
    ) {
        let seen: Transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |metric: &Metric, state| {
            sink.lock().push((metric.name().to_string(), state));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_alarm_fires_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).await.unwrap();
        let (seen, callback) = collector();
        let alarm = store
            .alarm("host/cpu", |p| p.avg > 90.0, Duration::from_secs(10), callback)
            .unwrap();
        assert_eq!(alarm.watched(), vec!["host/cpu"]);

        let metric = store.metric("host/cpu").unwrap();
        for (t, value) in [(0, 95.0), (5, 95.0), (12, 95.0), (13, 10.0), (30, 10.0)] {
            metric.add(DataPoint::sample(t, value));
        }
        store.settled().await;

        assert_eq!(
            *seen.lock(),
            vec![
                ("host/cpu".to_string(), AlarmState::Alarm),
                ("host/cpu".to_string(), AlarmState::Ok),
            ]
        );
        assert_eq!(alarm.state("host/cpu"), Some(AlarmState::Ok));
        assert_eq!(alarm.state("host"), None);
    }

    #[tokio::test]
    async fn test_glob_alarm_follows_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).await.unwrap();
        store.metric("hosts/a/cpu").unwrap();

        let (seen, callback) = collector();
        let alarm = store
            .alarm("hosts/*/cpu", |p| p.max > 1.0, Duration::ZERO, callback)
            .unwrap();
        assert_eq!(alarm.pattern(), "hosts/*/cpu");
        assert_eq!(alarm.watched(), vec!["hosts/a/cpu"]);

        // Created after arming; the first point must already be watched
        store.add("hosts/b/cpu", DataPoint::sample(1, 5.0)).unwrap();
        store.add("hosts/b/mem", DataPoint::sample(1, 5.0)).unwrap();
        store.settled().await;

        assert_eq!(alarm.watched(), vec!["hosts/a/cpu", "hosts/b/cpu"]);
        assert_eq!(*seen.lock(), vec![("hosts/b/cpu".to_string(), AlarmState::Alarm)]);

        assert!(store.remove("hosts/b/cpu").unwrap());
        store.settled().await;
        assert_eq!(alarm.watched(), vec!["hosts/a/cpu"]);
    }

    #[tokio::test]
    async fn test_off_stops_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).await.unwrap();
        let (seen, callback) = collector();
        let alarm = store
            .alarm("m", |p| p.avg > 0.0, Duration::ZERO, callback)
            .unwrap();
        assert!(alarm.is_active());

        alarm.off();
        alarm.off();
        assert!(!alarm.is_active());
        assert!(alarm.watched().is_empty());

        store.add("m", DataPoint::sample(1, 1.0)).unwrap();
        store.metric("m/n").unwrap();
        store.settled().await;
        assert!(seen.lock().is_empty());
        assert!(alarm.watched().is_empty());
    }

    #[tokio::test]
    async fn test_failing_callback_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).await.unwrap();
        let alarm = store
            .alarm(
                "disk",
                |p| p.avg > 0.5,
                Duration::ZERO,
                |_, _| Err(anyhow::anyhow!("pager unavailable")),
            )
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store
            .on_data("disk", move |point| {
                sink.lock().push(point.timestamp);
                Ok(())
            })
            .unwrap();

        store.add("disk", DataPoint::sample(1, 0.9)).unwrap();
        store.add("disk", DataPoint::sample(2, 0.9)).unwrap();
        store.settled().await;

        assert_eq!(alarm.state("disk"), Some(AlarmState::Alarm));
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_alarm_rejects_bad_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).await.unwrap();

        let err = store
            .alarm("a//b", |_| true, Duration::ZERO, |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err.category(), "name");

        let err = store
            .alarm("a/(*", |_| true, Duration::ZERO, |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err.category(), "pattern");
    }
}
