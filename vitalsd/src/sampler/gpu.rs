//! GPU readings through vendor command line tools.
//!
//! `nvidia-smi` is tried first, then `rocm-smi --json`. Each call is bounded
//! by a timeout and the child is killed if it overruns. When neither tool is
//! present the probe backs off for `retry_after` instead of forking twice a
//! second.

use crate::types::GpuInfo;
use log::debug;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::process::Command;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RETRY: Duration = Duration::from_secs(60);

pub struct GpuProbe {
    timeout: Duration,
    retry_after: Duration,
    unavailable_until: Mutex<Option<Instant>>,
}

impl GpuProbe {
    pub fn new(timeout: Duration, retry_after: Duration) -> Self {
        Self {
            timeout,
            retry_after,
            unavailable_until: Mutex::new(None),
        }
    }

    /// Best effort; `None` when no GPU tool answered in time.
    pub async fn read(&self) -> Option<GpuInfo> {
        if let Some(until) = *self.lock()
            && Instant::now() < until
        {
            return None;
        }

        let info = match self.nvidia().await {
            Some(info) => Some(info),
            None => self.rocm().await,
        };

        *self.lock() = match info {
            Some(_) => None,
            None => Some(Instant::now() + self.retry_after),
        };
        info
    }

    async fn nvidia(&self) -> Option<GpuInfo> {
        let stdout = self
            .run(
                "nvidia-smi",
                &[
                    "--query-gpu=name,utilization.gpu,temperature.gpu",
                    "--format=csv,noheader,nounits",
                ],
            )
            .await?;
        parse_nvidia_smi(&stdout)
    }

    async fn rocm(&self) -> Option<GpuInfo> {
        let stdout = self
            .run(
                "rocm-smi",
                &["--showproductname", "--showuse", "--showtemp", "--json"],
            )
            .await?;
        parse_rocm_smi(&stdout)
    }

    async fn run(&self, program: &str, args: &[&str]) -> Option<String> {
        let child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => {
                debug!("[gpu] {program} exited with {}", output.status);
                None
            }
            Ok(Err(err)) => {
                debug!("[gpu] {program} unavailable: {err}");
                None
            }
            Err(_) => {
                debug!("[gpu] {program} timed out after {:?}", self.timeout);
                None
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.unavailable_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for GpuProbe {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_RETRY)
    }
}

/// First line of `name, util, temp`.
pub fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }
    Some(GpuInfo {
        name: parts[0].to_string(),
        usage: parts[1].parse().ok()?,
        temp: parts[2].parse().ok()?,
    })
}

/// `rocm-smi --json` emits `{"card0": {"GPU use (%)": "12", "Temperature (Sensor edge) (C)": "45.0", ...}}`.
pub fn parse_rocm_smi(stdout: &str) -> Option<GpuInfo> {
    let value: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let (_, card) = value
        .as_object()?
        .iter()
        .find(|(key, _)| key.starts_with("card"))?;
    let card = card.as_object()?;

    let field = |needle: &str| -> Option<f32> {
        card.iter()
            .find(|(key, _)| key.contains(needle))
            .and_then(|(_, v)| v.as_str())
            .and_then(|s| s.trim().parse().ok())
    };

    let name = card
        .iter()
        .find(|(key, _)| key.contains("Card series") || key.contains("Card SKU"))
        .and_then(|(_, v)| v.as_str())
        .unwrap_or("AMD GPU")
        .to_string();

    Some(GpuInfo {
        name,
        usage: field("GPU use")?,
        temp: field("Temperature").unwrap_or(0.0),
    })
}
