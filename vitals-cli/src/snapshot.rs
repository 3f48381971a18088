//! Human-readable rendering of `/api/all`.

use colored::*;
use std::fmt::Write;
use std::time::Duration;
use vitalsd::remote::SnapshotCache;
use vitalsd::types::MetricSnapshot;

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = MIB * 1024.0;

fn pct(value: f32) -> ColoredString {
    let text = format!("{value:.1}%");
    if value >= 90.0 {
        text.red()
    } else if value >= 70.0 {
        text.yellow()
    } else {
        text.green()
    }
}

fn gib(bytes: u64) -> String {
    format!("{:.1} GiB", bytes as f64 / GIB)
}

pub fn render(s: &MetricSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} ({} {}, {})",
        "Host".bold().cyan(),
        s.system.info.hostname,
        s.system.info.os,
        s.system.info.os_version,
        s.system.info.architecture
    );
    let _ = writeln!(out, "  Uptime   {}", s.system.uptime);

    let mut cpu = format!(
        "  CPU      {} of {} cores",
        pct(s.cpu.usage),
        s.cpu.count.1
    );
    if let Some(freq) = s.cpu.freq {
        let _ = write!(cpu, " @ {freq:.2} GHz");
    }
    if let Some(temp) = s.cpu.temp {
        let _ = write!(cpu, ", {temp:.0}°C");
    }
    let _ = writeln!(out, "{cpu}");

    let _ = writeln!(
        out,
        "  Memory   {} ({} / {})",
        pct(s.memory.percent),
        gib(s.memory.used),
        gib(s.memory.total)
    );
    let _ = writeln!(
        out,
        "  Disk     {} ({} / {}), read {:.2} MB/s, write {:.2} MB/s",
        pct(s.disk.usage.percent),
        gib(s.disk.usage.used),
        gib(s.disk.usage.total),
        s.disk.io.read_speed,
        s.disk.io.write_speed
    );
    let _ = writeln!(
        out,
        "  Network  up {:.2} MB/s, down {:.2} MB/s",
        s.network.speed.upload / MIB,
        s.network.speed.download / MIB
    );
    match &s.gpu {
        Some(gpu) => {
            let _ = writeln!(
                out,
                "  GPU      {} {}, {:.0}°C",
                gpu.name,
                pct(gpu.usage),
                gpu.temp
            );
        }
        None => {
            let _ = writeln!(out, "  GPU      {}", "not detected".dimmed());
        }
    }
    if let Some(battery) = s.system.battery {
        let source = if battery.plugged { "plugged in" } else { "on battery" };
        let _ = writeln!(out, "  Battery  {:.0}% ({source})", battery.percent);
    }
    out
}

/// One line per refresh, suitable for tailing.
pub fn line(s: &MetricSnapshot) -> String {
    format!(
        "cpu {} mem {} disk {} net up {:.2} down {:.2} MB/s",
        pct(s.cpu.usage),
        pct(s.memory.percent),
        pct(s.disk.usage.percent),
        s.network.speed.upload / MIB,
        s.network.speed.download / MIB
    )
}

pub async fn watch(cache: &SnapshotCache, interval: Duration, count: Option<u64>) {
    let mut ticker = tokio::time::interval(interval);
    let mut printed = 0;
    while count.is_none_or(|limit| printed < limit) {
        ticker.tick().await;
        let fresh = cache.refresh().await.is_ok();
        match cache.current().await {
            Some(snapshot) if fresh => println!("{}", line(&snapshot)),
            Some(snapshot) => {
                let age = cache.age().await.unwrap_or_default().as_secs();
                println!("{} {}", line(&snapshot), format!("(stale {age}s)").yellow());
            }
            None => println!("{}", format!("FAIL (no data from {})", cache.url()).red()),
        }
        printed += 1;
    }
}
