//! Battery state from the kernel power_supply class.
//!
//! Layout under /sys/class/power_supply/<name>/:
//!   type      "Battery" | "Mains" | "USB" ...
//!   capacity  0-100
//!   status    "Charging" | "Discharging" | "Full" | "Not charging" | "Unknown"
//!   online    1/0 (Mains only)
//!   energy_now + power_now   (µWh, µW)  or
//!   charge_now + current_now (µAh, µA)

use crate::types::BatteryInfo;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn power_supply_root() -> PathBuf {
    env::var("VITALS_POWER_SUPPLY_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys/class/power_supply"))
}

/// Read the first battery found. `None` on desktops or when sysfs is absent.
pub fn read_battery() -> Option<BatteryInfo> {
    read_battery_from(&power_supply_root())
}

pub fn read_battery_from(root: &Path) -> Option<BatteryInfo> {
    let entries = fs::read_dir(root).ok()?;

    let mut battery_dir = None;
    let mut mains_online = None;
    for entry in entries.filter_map(|e| e.ok()) {
        let dir = entry.path();
        match read_trimmed(&dir.join("type")).as_deref() {
            Some("Battery") if battery_dir.is_none() => battery_dir = Some(dir),
            Some("Mains") => {
                let online = read_u64(&dir.join("online")).map(|v| v == 1);
                mains_online = mains_online.or(online);
            }
            _ => {}
        }
    }

    let dir = battery_dir?;
    let percent = read_u64(&dir.join("capacity"))? as f32;
    let status = read_trimmed(&dir.join("status")).unwrap_or_default();
    let discharging = status == "Discharging";
    let plugged = mains_online.unwrap_or(!discharging);

    let secs_left = if discharging {
        time_left(&dir)
    } else {
        None
    };

    Some(BatteryInfo {
        percent: percent.clamp(0.0, 100.0),
        plugged,
        secs_left,
    })
}

fn time_left(dir: &Path) -> Option<u64> {
    let (remaining, rate) = match (
        read_u64(&dir.join("energy_now")),
        read_u64(&dir.join("power_now")),
    ) {
        (Some(energy), Some(power)) => (energy, power),
        _ => (
            read_u64(&dir.join("charge_now"))?,
            read_u64(&dir.join("current_now"))?,
        ),
    };
    if rate == 0 {
        return None;
    }
    Some(remaining.checked_mul(3_600)? / rate)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_u64(path: &Path) -> Option<u64> {
    read_trimmed(path)?.parse().ok()
}
