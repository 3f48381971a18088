use anyhow::Result;
use colored::*;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use vitalsd::types::GpuInfo;

#[derive(Deserialize, Debug)]
struct HealthResponse {
    #[allow(dead_code)]
    status: String,
}

#[derive(Deserialize, Debug)]
struct StatusResponse {
    status: String,
    uptime_secs: u64,
    ticks: u64,
    tick_failures: u64,
    history_saves: u64,
    history_failures: u64,
    alerts_fired: u64,
    notifications_sent: u64,
    notifications_suppressed: u64,
    last_error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct AlertsResponse {
    rules: Vec<RuleSummary>,
}

#[derive(Deserialize, Debug)]
struct RuleSummary {
    enabled: bool,
}

pub async fn run_doctor(url: &str) -> Result<()> {
    println!("{}", "Vitals Doctor".bold().cyan());
    println!("{}", "Checking daemon health...".dimmed());
    println!();

    let url = url.trim_end_matches('/');
    let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
    let mut all_good = true;

    print!("• Daemon Connectivity: ");
    match client.get(format!("{url}/health")).send().await {
        Ok(resp) => {
            if resp.status().is_success() {
                if resp.json::<HealthResponse>().await.is_ok() {
                    println!("{}", "OK".green());
                } else {
                    println!("{}", "OK (Invalid JSON)".yellow());
                }
            } else {
                println!("{}", format!("FAIL (Status {})", resp.status()).red());
                all_good = false;
            }
        }
        Err(e) => {
            println!("{}", format!("FAIL ({e})").red());
            println!("  → Is vitalsd running? Try 'systemctl status vitalsd'");
            return Ok(());
        }
    }

    print!("• Daemon Status:       ");
    let status: StatusResponse = match client.get(format!("{url}/status")).send().await {
        Ok(resp) => match resp.json().await {
            Ok(status) => status,
            Err(e) => {
                println!("{}", format!("FAIL (bad response: {e})").red());
                return Ok(());
            }
        },
        Err(e) => {
            println!("{}", format!("FAIL ({e})").red());
            return Ok(());
        }
    };
    if status.status == "ok" {
        println!("{}", "OK".green());
    } else {
        println!("{}", status.status.to_uppercase().yellow());
        all_good = false;
    }

    print!("• Uptime:              ");
    if status.uptime_secs < 60 {
        println!("{}", format!("{}s (Just started)", status.uptime_secs).yellow());
    } else {
        println!("{}", format!("{}s", status.uptime_secs).green());
    }

    print!("• Sampler:             ");
    if status.ticks == 0 {
        println!("{}", "No ticks yet".yellow());
    } else if status.tick_failures > 0 {
        println!(
            "{}",
            format!("{} ticks, {} failed", status.ticks, status.tick_failures).yellow()
        );
    } else {
        println!("{}", format!("{} ticks", status.ticks).green());
    }

    print!("• History Store:       ");
    if status.history_failures > 0 {
        println!(
            "{}",
            format!(
                "{} saved, {} failed",
                status.history_saves, status.history_failures
            )
            .red()
        );
        all_good = false;
    } else {
        println!("{}", format!("{} saved", status.history_saves).green());
    }

    print!("• Alert Rules:         ");
    match client.get(format!("{url}/api/alerts")).send().await {
        Ok(resp) => match resp.json::<AlertsResponse>().await {
            Ok(alerts) => {
                let enabled = alerts.rules.iter().filter(|r| r.enabled).count();
                if alerts.rules.is_empty() {
                    println!("{}", "None configured".dimmed());
                } else {
                    println!(
                        "{}",
                        format!("{enabled} of {} enabled", alerts.rules.len()).green()
                    );
                }
            }
            Err(_) => println!("{}", "Unreadable".yellow()),
        },
        Err(e) => {
            println!("{}", format!("FAIL ({e})").red());
            all_good = false;
        }
    }

    print!("• Notifications:       ");
    if status.alerts_fired == 0 {
        println!("{}", "Idle".dimmed());
    } else {
        println!(
            "{}",
            format!(
                "{} fired ({} sent, {} suppressed)",
                status.alerts_fired, status.notifications_sent, status.notifications_suppressed
            )
            .green()
        );
    }

    print!("• GPU:                 ");
    match client.get(format!("{url}/api/gpu")).send().await {
        Ok(resp) => match resp.json::<GpuInfo>().await {
            Ok(gpu) if gpu == GpuInfo::not_detected() => {
                println!("{}", "Not detected".dimmed())
            }
            Ok(gpu) => println!("{}", gpu.name.green()),
            Err(_) => println!("{}", "Unreadable".yellow()),
        },
        Err(_) => println!("{}", "Unreachable".yellow()),
    }

    if let Some(err) = &status.last_error {
        println!("  → Last error: {}", err.red());
    }

    println!();
    if all_good {
        println!("{}", "✅ Daemon is healthy.".bold().green());
    } else {
        println!("{}", "⚠️  Daemon has issues. See above.".bold().yellow());
    }

    Ok(())
}

