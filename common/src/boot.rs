use log::info;

use crate::hal::{Display, Watchdog};

pub const BOOT_STEPS: [&str; 6] = ["Init", "WiFi", "MQTT", "Add temp", "Add humid", "DHT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootStep<'a> {
    pub label: &'a str,
    /// 1-based.
    pub index: usize,
    pub total: usize,
}

/// Counts startup progress; feeds the watchdog on every step.
#[derive(Debug, Clone)]
pub struct BootSequencer {
    completed: usize,
    total: usize,
}

impl BootSequencer {
    pub fn new(total: usize) -> Self {
        Self {
            completed: 0,
            total,
        }
    }

    pub fn advance<'a, W, D>(&mut self, label: &'a str, watchdog: &mut W, display: &mut D) -> BootStep<'a>
    where
        W: Watchdog + ?Sized,
        D: Display + ?Sized,
    {
        self.completed += 1;
        let step = BootStep {
            label,
            index: self.completed,
            total: self.total.max(self.completed),
        };
        watchdog.feed();
        display.show_progress(step.label, step.index, step.total);
        info!("boot {}/{}: {}", step.index, step.total, step.label);
        step
    }
}

impl Default for BootSequencer {
    fn default() -> Self {
        Self::new(BOOT_STEPS.len())
    }
}
