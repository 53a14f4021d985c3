//! Position sampling.
//!
//! A [`PositionSource`] hands out [`GeoWatch`]es: lazy, unbounded feeds of raw
//! fixes or errors. Errors do not end a feed. Dropping the watch stops it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use shared::LatLng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::proximity::haversine_km;

/// A fix as reported by the device, before it becomes a `LocationRecord`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub lat: f64,
    pub lon: f64,
    pub speed_mps: Option<f64>,
    /// Accuracy radius in metres.
    pub accuracy_m: f64,
}

impl RawSample {
    pub fn at(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            speed_mps: None,
            accuracy_m: 0.0,
        }
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = Some(speed_mps);
        self
    }

    pub fn position(&self) -> LatLng {
        LatLng::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeoOptions {
    /// Prefer higher precision at a higher power cost.
    pub high_accuracy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GeoError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("timed out waiting for a position fix")]
    Timeout,
}

pub type GeoEvent = Result<RawSample, GeoError>;

/// Handle to a running watch. Dropping it stops the watch.
pub struct GeoWatch {
    events: mpsc::UnboundedReceiver<GeoEvent>,
    task: Option<JoinHandle<()>>,
}

impl GeoWatch {
    pub fn new(events: mpsc::UnboundedReceiver<GeoEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { events, task }
    }

    /// Next fix or error. `None` once the source has gone away for good.
    pub async fn next(&mut self) -> Option<GeoEvent> {
        self.events.recv().await
    }

    pub fn stop(self) {}
}

impl Drop for GeoWatch {
    fn drop(&mut self) {
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub trait PositionSource: Send + Sync {
    fn start_watching(&self, options: GeoOptions) -> GeoWatch;
}

/// Random walk around an origin, ticking on a fixed interval.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    origin: LatLng,
    interval: Duration,
}

impl SimulatedSource {
    pub fn new(origin: LatLng, interval: Duration) -> Self {
        Self { origin, interval }
    }
}

impl PositionSource for SimulatedSource {
    fn start_watching(&self, options: GeoOptions) -> GeoWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let (step, accuracy_m) = if options.high_accuracy {
            (0.0005, 5.0)
        } else {
            (0.002, 50.0)
        };
        let interval = self.interval;
        let mut current = self.origin;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let next = {
                    let mut rng = rand::thread_rng();
                    LatLng::new(
                        current.lat + (rng.gen::<f64>() - 0.5) * step,
                        current.lon + (rng.gen::<f64>() - 0.5) * step,
                    )
                };
                let secs = interval.as_secs_f64().max(f64::EPSILON);
                let speed_mps = haversine_km(current, next) * 1000.0 / secs;
                current = next;

                let sample = RawSample {
                    lat: next.lat,
                    lon: next.lon,
                    speed_mps: Some(speed_mps),
                    accuracy_m,
                };
                if tx.send(Ok(sample)).is_err() {
                    break;
                }
            }
        });

        GeoWatch::new(rx, Some(task))
    }
}

/// Source fed from outside, e.g. console input or a test.
///
/// Only the most recently started watch receives pushed events.
#[derive(Clone, Default)]
pub struct ManualSource {
    inner: Arc<Mutex<ManualInner>>,
}

#[derive(Default)]
struct ManualInner {
    active: Option<mpsc::UnboundedSender<GeoEvent>>,
    started: usize,
    last_options: Option<GeoOptions>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers an event to the live watch. Returns false if nobody is watching.
    pub fn push(&self, event: GeoEvent) -> bool {
        let inner = self.lock();
        match &inner.active {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_watching(&self) -> bool {
        self.lock().active.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn watches_started(&self) -> usize {
        self.lock().started
    }

    pub fn last_options(&self) -> Option<GeoOptions> {
        self.lock().last_options
    }
}

impl PositionSource for ManualSource {
    fn start_watching(&self, options: GeoOptions) -> GeoWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.active = Some(tx);
        inner.started += 1;
        inner.last_options = Some(options);
        GeoWatch::new(rx, None)
    }
}
