//! Software PWM for a pin without a timer channel.
//!
//! The pin is switched on for the first `level / 255` of every cycle. Duty
//! resolution is bounded by how often [`SoftwarePwm::tick`] runs; a caller
//! that ticks once per cycle only gets full-on or full-off.

use embedded_hal::digital::{OutputPin, PinState};

pub const MAX_LEVEL: u8 = u8::MAX;
pub const DEFAULT_CYCLE_US: u32 = 1_000;

pub struct SoftwarePwm<P> {
    pin: P,
    level: u8,
    cycle_us: u32,
    active_low: bool,
    started: bool,
    driven: Option<bool>,
}

impl<P: OutputPin> SoftwarePwm<P> {
    pub fn new(pin: P, cycle_us: u32, active_low: bool) -> Self {
        Self {
            pin,
            level: 0,
            cycle_us: cycle_us.max(1),
            active_low,
            started: false,
            driven: None,
        }
    }

    /// Drives the pin off. Repeated calls are no-ops.
    pub fn begin(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.drive(false);
    }

    /// Out-of-range requests clamp to `0..=255`.
    pub fn set_level(&mut self, level: i32) {
        self.level = level.clamp(0, i32::from(MAX_LEVEL)) as u8;
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn cycle_us(&self) -> u32 {
        self.cycle_us
    }

    /// Updates the pin for the current phase and returns whether it is lit.
    pub fn tick(&mut self, now_us: u64) -> bool {
        if !self.started {
            return false;
        }
        let lit = duty_on(now_us, self.cycle_us, self.level);
        self.drive(lit);
        lit
    }

    pub fn release(self) -> P {
        self.pin
    }

    fn drive(&mut self, lit: bool) {
        if self.driven == Some(lit) {
            return;
        }
        let state = PinState::from(lit != self.active_low);
        if self.pin.set_state(state).is_ok() {
            self.driven = Some(lit);
        }
    }
}

/// Whether `now_us` falls in the lit part of the cycle for `level`.
pub fn duty_on(now_us: u64, cycle_us: u32, level: u8) -> bool {
    let cycle = u64::from(cycle_us.max(1));
    let phase = now_us % cycle;
    phase * u64::from(MAX_LEVEL) < u64::from(level) * cycle
}
