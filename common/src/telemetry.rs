use log::warn;

use crate::{
    clock::{elapsed, Millis},
    hal::SensorDriver,
};

/// One acquisition. `None` marks a failed (NaN) read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub temperature_c: Option<f32>,
    pub humidity_pct: Option<f32>,
}

impl SensorSample {
    pub fn read<S: SensorDriver + ?Sized>(sensor: &mut S, temperature_offset_c: f32) -> Self {
        let temperature_c = valid(sensor.read_temperature()).map(|value| value + temperature_offset_c);
        if temperature_c.is_none() {
            warn!("error reading temperature; skipping this cycle");
        }

        let humidity_pct = valid(sensor.read_humidity());
        if humidity_pct.is_none() {
            warn!("error reading humidity; skipping this cycle");
        }

        Self {
            temperature_c,
            humidity_pct,
        }
    }
}

fn valid(reading: f32) -> Option<f32> {
    reading.is_finite().then_some(reading)
}

/// Wrap-safe refresh timer for the telemetry cycle. Idle until armed.
#[derive(Debug, Clone)]
pub struct TelemetrySchedule {
    refresh_ms: Millis,
    last_run: Option<Millis>,
    armed: bool,
}

impl TelemetrySchedule {
    pub fn new(refresh_ms: Millis) -> Self {
        Self {
            refresh_ms,
            last_run: None,
            armed: false,
        }
    }

    /// Enables the cycle; the first run is due immediately.
    pub fn arm(&mut self) {
        self.armed = true;
        self.last_run = None;
    }

    /// Returns true, and records `now`, when a cycle should run.
    pub fn due(&mut self, now: Millis) -> bool {
        if !self.armed {
            return false;
        }
        match self.last_run {
            Some(mark) if elapsed(now, mark) < self.refresh_ms => false,
            _ => {
                self.last_run = Some(now);
                true
            }
        }
    }
}
