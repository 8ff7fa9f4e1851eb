//! Stateful field sensor simulator for local development.
//!
//! Each simulated device reports four channels:
//! - temperature (°C), following a day/night cycle
//! - relative humidity (%), moving against temperature
//! - soil moisture (%), a random walk with mean reversion and drying drift
//! - light level (%), daylight only
//!
//! On top of that: per-reading noise, occasional spikes, and per-device
//! offsets so two devices in the same field never read identically.

use serde::Serialize;
use std::f64::consts::PI;
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Temperate day, soil slowly drying from mid-range. Low noise.
    Mild,
    /// Heat wave: high temperature, dry air, soil drying fast.
    Hot,
    /// Mild weather read through a bad sensor: heavy noise, frequent
    /// spikes, and the odd error report.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Self::Hot,
            "flaky" => Self::Flaky,
            _ => Self::Mild, // default
        }
    }

    fn params(self) -> Params {
        match self {
            Self::Mild => Params {
                temp_mean: 22.0,
                temp_swing: 6.0,
                humidity_mean: 60.0,
                moisture_start: 45.0,
                moisture_drift: -0.02,
                noise_scale: 1.0,
                spike_prob: 0.01,
                fault_prob: 0.0,
            },
            Self::Hot => Params {
                temp_mean: 33.0,
                temp_swing: 8.0,
                humidity_mean: 35.0,
                moisture_start: 35.0,
                moisture_drift: -0.08,
                noise_scale: 1.0,
                spike_prob: 0.02,
                fault_prob: 0.0,
            },
            Self::Flaky => Params {
                temp_mean: 22.0,
                temp_swing: 6.0,
                humidity_mean: 60.0,
                moisture_start: 45.0,
                moisture_drift: -0.02,
                noise_scale: 4.0,
                spike_prob: 0.10,
                fault_prob: 0.03,
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mild => write!(f, "mild"),
            Self::Hot => write!(f, "hot"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

struct Params {
    temp_mean: f64,
    /// Half the day/night temperature difference.
    temp_swing: f64,
    humidity_mean: f64,
    moisture_start: f64,
    /// Percentage points per sample (negative = drying).
    moisture_drift: f64,
    noise_scale: f64,
    spike_prob: f32,
    /// Chance per sample that the device reports `error`.
    fault_prob: f32,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// One reading, in the field names the hub's sensor payload uses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldReading {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_moisture: f64,
    pub light_level: f64,
}

// ---------------------------------------------------------------------------
// Per-device state
// ---------------------------------------------------------------------------

struct DeviceState {
    /// Current "true" soil moisture (%). Evolves each tick.
    moisture: f64,
    /// Permanent temperature calibration offset (°C).
    temp_offset: f64,
    /// Permanent humidity calibration offset (%).
    humidity_offset: f64,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Random walk parameters for soil moisture.
const WALK_SIGMA: f64 = 0.4;
const MEAN_REVERSION: f64 = 0.01;

pub struct FieldSim {
    devices: Vec<DeviceState>,
    params: Params,
    /// Length of one simulated day in seconds.
    day_period_s: f64,
}

impl FieldSim {
    /// Create a simulator for `device_count` devices.
    ///
    /// `day_period_s` controls the day/night cycle length. Use 600 (10 min)
    /// for fast dev iteration or 86400 for real time.
    pub fn new(scenario: Scenario, device_count: usize, day_period_s: f64) -> Self {
        let params = scenario.params();
        let devices = (0..device_count)
            .map(|_| DeviceState {
                moisture: (params.moisture_start + gaussian(0.0, 3.0)).clamp(0.0, 100.0),
                temp_offset: gaussian(0.0, 0.5),
                humidity_offset: gaussian(0.0, 2.0),
            })
            .collect();

        Self {
            devices,
            params,
            day_period_s,
        }
    }

    /// Produce the next reading for the device at `index`, `now_s` seconds
    /// since the epoch. The moisture walk advances with each call.
    pub fn sample(&mut self, index: usize, now_s: f64) -> FieldReading {
        let p = &self.params;
        let device = &mut self.devices[index];

        // -- Evolve soil moisture -----------------------------------------

        let pull = MEAN_REVERSION * (p.moisture_start - device.moisture);
        let walk = gaussian(0.0, WALK_SIGMA);
        device.moisture = (device.moisture + p.moisture_drift + pull + walk).clamp(0.0, 100.0);

        // -- Day/night cycle ------------------------------------------------

        // -1 at "midnight", +1 at "afternoon".
        let day = (2.0 * PI * now_s / self.day_period_s).sin();

        let spike = |sigma: f64| {
            if fastrand::f32() < p.spike_prob {
                gaussian(0.0, sigma)
            } else {
                0.0
            }
        };
        let noise = |sigma: f64| gaussian(0.0, sigma * p.noise_scale);

        let temperature =
            p.temp_mean + p.temp_swing * day + device.temp_offset + noise(0.2) + spike(5.0);
        let humidity = (p.humidity_mean - 1.5 * p.temp_swing * day
            + device.humidity_offset
            + noise(1.0))
        .clamp(0.0, 100.0);
        let soil_moisture = (device.moisture + noise(0.3) + spike(15.0)).clamp(0.0, 100.0);
        let light_level = (100.0 * day.max(0.0) + noise(1.0)).clamp(0.0, 100.0);

        FieldReading {
            temperature: round1(temperature),
            humidity: round1(humidity),
            soil_moisture: round1(soil_moisture),
            light_level: round1(light_level),
        }
    }

    /// Whether this sample should be reported as a device fault.
    pub fn fault(&self) -> bool {
        fastrand::f32() < self.params.fault_prob
    }

    /// Number of simulated devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
