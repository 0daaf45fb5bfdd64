//! Thermal model of the water heater and the background loop that drives it.
//!
//! The engine keeps `{mode, water temperature, timestamp}` together with the
//! loop's `running` flag behind a single mutex. The update loop is the only
//! writer of temperature and timestamp; sessions only read snapshots or
//! request a mode change.

use crate::clock::{Clock, ClockError, SystemClock, NANOS_PER_SEC};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Specific heat capacity of water in J/(g·°C).
pub const SPECIFIC_HEAT_CAPACITY_WATER: f64 = 4.182;
pub const BOILING_THRESHOLD_C: f64 = 100.0;

const LOOP_YIELD: Duration = Duration::from_micros(100);
const LOOP_THREAD_NAME: &str = "waterheater-sim";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Heating,
    Cooling,
}

impl Mode {
    /// Token used for this mode on the wire.
    pub fn as_wire(self) -> &'static str {
        match self {
            Mode::Heating => "ON",
            Mode::Cooling => "OFF",
        }
    }

    pub fn from_wire(token: &str) -> Option<Self> {
        match token {
            "ON" => Some(Mode::Heating),
            "OFF" => Some(Mode::Cooling),
            _ => None,
        }
    }
}

/// Torn-free view of the simulated state at one integration step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub mode: Mode,
    pub water_temp_c: f64,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Amount of water in grams (1000 g ~ 1 l).
    pub water_volume_g: f64,
    pub heater_power_w: f64,
    pub ambient_temp_c: f64,
    pub initial_temp_c: f64,
}

impl SimulationParams {
    pub fn new(water_volume_g: f64, heater_power_w: f64, ambient_temp_c: f64, initial_temp_c: f64) -> Self {
        Self {
            water_volume_g,
            heater_power_w,
            ambient_temp_c,
            initial_temp_c,
        }
    }
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),
    #[error("failed to launch update loop: {0}")]
    Concurrency(#[source] std::io::Error),
}

/// Temperature after heating for `dt_s` seconds, and the mode to continue with.
pub fn heat(temp_c: f64, power_w: f64, volume_g: f64, dt_s: f64) -> (f64, Mode) {
    let next = temp_c + (power_w * dt_s) / (volume_g * SPECIFIC_HEAT_CAPACITY_WATER);
    let mode = if next >= BOILING_THRESHOLD_C {
        Mode::Cooling
    } else {
        Mode::Heating
    };
    (next, mode)
}

/// Newton cooling towards `ambient_c`, using the water volume as time constant.
///
/// A non-finite result falls back to the rounded previous temperature.
pub fn cool(temp_c: f64, ambient_c: f64, volume_g: f64, dt_s: f64) -> f64 {
    let next = ambient_c + (temp_c - ambient_c) * (-dt_s / volume_g).exp();
    if next.is_finite() {
        next
    } else {
        temp_c.round()
    }
}

/// One integration step from `prev` to `now_ns`.
///
/// A clock reading older than `prev` integrates zero seconds and keeps the
/// previous timestamp.
pub fn integrate(params: &SimulationParams, prev: Snapshot, now_ns: u64) -> Snapshot {
    let now_ns = now_ns.max(prev.timestamp_ns);
    let dt_s = (now_ns - prev.timestamp_ns) as f64 / NANOS_PER_SEC;

    let (water_temp_c, mode) = match prev.mode {
        Mode::Heating => heat(
            prev.water_temp_c,
            params.heater_power_w,
            params.water_volume_g,
            dt_s,
        ),
        Mode::Cooling => (
            cool(
                prev.water_temp_c,
                params.ambient_temp_c,
                params.water_volume_g,
                dt_s,
            ),
            Mode::Cooling,
        ),
    };

    Snapshot {
        mode,
        water_temp_c,
        timestamp_ns: now_ns,
    }
}

#[derive(Debug)]
struct SharedState {
    snapshot: Snapshot,
    running: bool,
    // Bumped on every launch; a loop whose generation is stale exits.
    generation: u64,
}

enum LoopStep {
    Advanced,
    Stopped,
}

struct Inner {
    params: SimulationParams,
    clock: Box<dyn Clock>,
    state: Mutex<SharedState>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.loop_handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, generation: Option<u64>) -> Result<LoopStep, SimulationError> {
        let now = self.clock.now_nanos();
        let mut shared = self.lock_state();
        if let Some(generation) = generation {
            if !shared.running || shared.generation != generation {
                return Ok(LoopStep::Stopped);
            }
        }
        let now = now?;
        shared.snapshot = integrate(&self.params, shared.snapshot, now);
        Ok(LoopStep::Advanced)
    }

    fn run_loop(&self, generation: u64) {
        debug!(generation, "update loop started");
        let mut clock_failed = false;
        loop {
            match self.advance(Some(generation)) {
                Ok(LoopStep::Stopped) => break,
                Ok(LoopStep::Advanced) => {
                    if clock_failed {
                        info!("clock recovered, simulation resumed");
                        clock_failed = false;
                    }
                }
                Err(e) => {
                    if !clock_failed {
                        warn!("simulation frozen: {}", e);
                        clock_failed = true;
                    }
                }
            }
            thread::sleep(LOOP_YIELD);
        }

        let mut shared = self.lock_state();
        if shared.generation == generation {
            shared.running = false;
        }
        debug!(generation, "update loop exited");
    }
}

/// The shared water heater simulation.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Simulation {
    inner: Arc<Inner>,
}

impl Simulation {
    pub fn new(params: SimulationParams) -> Result<Self, SimulationError> {
        Self::with_clock(params, SystemClock)
    }

    pub fn with_clock<C>(params: SimulationParams, clock: C) -> Result<Self, SimulationError>
    where
        C: Clock + 'static,
    {
        let timestamp_ns = clock.now_nanos()?;
        let snapshot = Snapshot {
            mode: Mode::Cooling,
            water_temp_c: params.initial_temp_c,
            timestamp_ns,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                params,
                clock: Box::new(clock),
                state: Mutex::new(SharedState {
                    snapshot,
                    running: false,
                    generation: 0,
                }),
                loop_handle: Mutex::new(None),
            }),
        })
    }

    /// Launches the update loop. Does nothing if it is already running.
    pub fn start(&self) -> Result<(), SimulationError> {
        let mut handle_slot = self.inner.lock_handle();
        let generation = {
            let mut shared = self.inner.lock_state();
            if shared.running {
                return Ok(());
            }
            shared.running = true;
            shared.generation += 1;
            shared.generation
        };

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || inner.run_loop(generation));

        match spawned {
            Ok(handle) => {
                // A previous loop that is still winding down is detached here;
                // its generation is stale so it exits on its next check.
                *handle_slot = Some(handle);
                info!("simulation started");
                Ok(())
            }
            Err(e) => {
                let mut shared = self.inner.lock_state();
                if shared.generation == generation {
                    shared.running = false;
                }
                error!("failed to spawn update loop: {}", e);
                Err(SimulationError::Concurrency(e))
            }
        }
    }

    /// Signals the update loop to exit. Never blocks on the loop itself.
    pub fn stop(&self) {
        let mut shared = self.inner.lock_state();
        if shared.running {
            shared.running = false;
            info!("simulation stopping");
        }
    }

    /// Waits for the most recently launched update loop to exit.
    pub fn join(&self) {
        let handle = self.inner.lock_handle().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("update loop panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    /// Number of times an update loop has been launched.
    pub fn launches(&self) -> u64 {
        self.inner.lock_state().generation
    }

    pub fn set_mode(&self, mode: Mode) {
        let mut shared = self.inner.lock_state();
        if shared.snapshot.mode != mode {
            debug!(?mode, "mode changed");
        }
        shared.snapshot.mode = mode;
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock_state().snapshot
    }

    /// Runs a single integration step against the engine's clock.
    pub fn step(&self) -> Result<Snapshot, SimulationError> {
        self.inner.advance(None)?;
        Ok(self.snapshot())
    }

    pub fn params(&self) -> &SimulationParams {
        &self.inner.params
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.stop();
    }
}

impl core::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Simulation")
            .field("params", &self.inner.params)
            .field("state", &*self.inner.lock_state())
            .finish()
    }
}
