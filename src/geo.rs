//! Position input for the pipeline.
//!
//! The pipeline never blocks on positioning for longer than the configured timeout.
//! `LocationWatch` polls a provider on its own thread and serves the latest known fix;
//! callers that already know the position can use `FixedLocation`.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// WGS84-style position in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "lon", alias = "longitude")]
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            accuracy_m: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Haversine distance in meters.
    pub fn distance_m(&self, other: &Location) -> f64 {
        haversine_m(self, other)
    }

    /// Quantize to a grid cell of `cell_deg` degrees.
    pub fn cell(&self, cell_deg: f64) -> (i32, i32) {
        let step = if cell_deg > 0.0 { cell_deg } else { 1e-4 };
        (
            (self.lat / step).floor() as i32,
            (self.lng / step).floor() as i32,
        )
    }
}

pub fn haversine_m(a: &Location, b: &Location) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Best-effort position for one pipeline pass.
///
/// Implementations must return within `timeout`. `None` means no fix is known.
pub trait LocationSource: Send + Sync {
    fn current_location(&self, timeout: Duration) -> Option<Location>;
}

/// Source that never has a fix (indoor, GPS denied, permission refused).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLocation;

impl LocationSource for NoLocation {
    fn current_location(&self, _timeout: Duration) -> Option<Location> {
        None
    }
}

/// Source with a caller-managed position.
#[derive(Debug, Default)]
pub struct FixedLocation {
    inner: Mutex<Option<Location>>,
}

impl FixedLocation {
    pub fn new(location: Option<Location>) -> Self {
        Self {
            inner: Mutex::new(location),
        }
    }

    pub fn set(&self, location: Option<Location>) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = location;
        }
    }
}

impl LocationSource for FixedLocation {
    fn current_location(&self, _timeout: Duration) -> Option<Location> {
        self.inner.lock().ok().and_then(|guard| *guard)
    }
}

/// Device positioning backend polled by `LocationWatch`.
pub trait LocationProvider: Send + 'static {
    fn poll(&mut self) -> Result<Location>;
}

#[derive(Default)]
struct WatchState {
    latest: Option<(Location, Instant)>,
    last_error: Option<String>,
}

struct WatchShared {
    state: Mutex<WatchState>,
    fix_arrived: Condvar,
    cancelled: AtomicBool,
}

/// Cancellable background subscription to a `LocationProvider`.
pub struct LocationWatch {
    shared: Arc<WatchShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    max_fix_age: Duration,
}

impl LocationWatch {
    /// Start polling `provider` every `interval`.
    pub fn spawn<P: LocationProvider>(
        mut provider: P,
        interval: Duration,
        max_fix_age: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(WatchShared {
            state: Mutex::new(WatchState::default()),
            fix_arrived: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });
        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name("location-watch".to_string())
            .spawn(move || {
                while !worker.cancelled.load(Ordering::Acquire) {
                    let polled = provider.poll();
                    if let Ok(mut state) = worker.state.lock() {
                        match polled {
                            Ok(location) if location.is_valid() => {
                                state.latest = Some((location, Instant::now()));
                                state.last_error = None;
                                worker.fix_arrived.notify_all();
                            }
                            Ok(location) => {
                                state.last_error =
                                    Some(format!("provider returned invalid fix {:?}", location));
                            }
                            Err(e) => state.last_error = Some(e.to_string()),
                        }
                    }
                    std::thread::park_timeout(interval);
                }
            })
            .map_err(|e| anyhow!("failed to spawn location watch: {}", e))?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
            max_fix_age,
        })
    }

    /// Stop polling. Safe to call more than once.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::warn!("location watch thread panicked");
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Latest fix no older than `max_fix_age`, waiting at most `timeout` for one.
    pub fn latest_within(&self, timeout: Duration) -> Option<Location> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().ok()?;
        loop {
            if let Some((location, at)) = state.latest {
                if at.elapsed() <= self.max_fix_age {
                    return Some(location);
                }
            }
            let now = Instant::now();
            if now >= deadline || self.is_cancelled() {
                break;
            }
            let (next, _) = self
                .shared
                .fix_arrived
                .wait_timeout(state, deadline - now)
                .ok()?;
            state = next;
        }
        match state.latest {
            Some((_, at)) => log::debug!(
                "location fix is stale ({} ms old, limit {} ms)",
                at.elapsed().as_millis(),
                self.max_fix_age.as_millis()
            ),
            None => log::debug!(
                "location unavailable: {}",
                state.last_error.as_deref().unwrap_or("no fix yet")
            ),
        }
        None
    }
}

impl LocationSource for LocationWatch {
    fn current_location(&self, timeout: Duration) -> Option<Location> {
        self.latest_within(timeout)
    }
}

impl Drop for LocationWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}
