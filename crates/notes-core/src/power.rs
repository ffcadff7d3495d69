//! Power supply status for the status line
//!
//! Reads the kernel's power_supply class directly:
//! - `AC/online` decides mains vs battery (missing file means mains)
//! - `BAT0`, `BAT1`, ... are summed until the first missing battery

use std::fmt;
use std::path::Path;

/// Default power_supply class directory
pub const DEFAULT_POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerStatus {
    pub on_mains: bool,
    /// Combined charge of all batteries, `None` without batteries
    pub battery_percent: Option<u8>,
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.on_mains, self.battery_percent) {
            (true, _) => write!(f, "Mains power"),
            (false, Some(percent)) => write!(f, "Battery powered ({}%)", percent),
            (false, None) => write!(f, "Battery powered"),
        }
    }
}

/// Read a sysfs attribute as an integer; unreadable or garbled reads as 0
fn read_value(path: &Path) -> u64 {
    match std::fs::read_to_string(path) {
        Ok(text) => text.trim().parse().unwrap_or_else(|_| {
            log::debug!("Unparseable power value in {}", path.display());
            0
        }),
        Err(e) => {
            log::debug!("Failed to read {}: {}", path.display(), e);
            0
        }
    }
}

/// Snapshot the power status from a power_supply directory
pub fn read_power_status(power_supply_dir: &Path) -> PowerStatus {
    let ac_online = power_supply_dir.join("AC/online");
    let on_mains = !ac_online.exists() || read_value(&ac_online) != 0;

    let mut sum_now = 0u64;
    let mut sum_full = 0u64;
    for index in 0.. {
        let battery = power_supply_dir.join(format!("BAT{}", index));
        let now = battery.join("energy_now");
        let full = battery.join("energy_full");
        if !now.exists() || !full.exists() {
            break;
        }
        sum_now += read_value(&now);
        sum_full += read_value(&full);
    }

    let battery_percent = if sum_full > 0 {
        let percent = (100.0 * sum_now as f64 / sum_full as f64).round();
        Some(percent.clamp(0.0, 100.0) as u8)
    } else {
        None
    };

    PowerStatus {
        on_mains,
        battery_percent,
    }
}
