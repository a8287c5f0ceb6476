use log::{error, info};

use crate::hal::Display;

/// Display collaborator for headless nodes: renders to the log.
///
/// Widget updates are only logged when they change.
#[derive(Debug, Default)]
pub struct LogDisplay {
    link_quality: Option<u8>,
    session_connected: Option<bool>,
}

impl LogDisplay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Display for LogDisplay {
    fn show_progress(&mut self, label: &str, step: usize, total: usize) {
        info!("[display] {label} {step}/{total}");
    }

    fn show_values(&mut self, temperature_c: f32, humidity_pct: f32) {
        info!("[display] {temperature_c:.1} °C  {humidity_pct:.1} %");
    }

    fn show_error(&mut self, message: &str) {
        error!("[display] {message}");
    }

    fn show_info(&mut self, message: &str) {
        info!("[display] {message}");
    }

    fn set_link_quality(&mut self, level: u8) {
        if self.link_quality.replace(level) != Some(level) {
            info!("[display] link quality {level}/3");
        }
    }

    fn set_session_state(&mut self, connected: bool) {
        if self.session_connected.replace(connected) != Some(connected) {
            let label = if connected { "connected" } else { "disconnected" };
            info!("[display] broker {label}");
        }
    }
}
