use anyhow::Result;
use colored::*;
use reqwest::Client;
use vitalsd::processes::{ProcessRecord, ProcessStatus, SortKey};

#[derive(Debug, Clone)]
pub struct Query {
    pub filter: Option<String>,
    pub sort: SortKey,
    pub descending: bool,
    pub limit: usize,
}

impl Query {
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("sort", self.sort.as_str().to_string()),
            ("desc", self.descending.to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(filter) = &self.filter {
            params.push(("filter", filter.clone()));
        }
        params
    }
}

fn status_color(status: ProcessStatus) -> Color {
    match status {
        ProcessStatus::Running => Color::Green,
        ProcessStatus::Sleeping => Color::Blue,
        ProcessStatus::Stopped => Color::Yellow,
        ProcessStatus::Zombie => Color::Red,
        ProcessStatus::Unknown => Color::White,
    }
}

pub async fn run_processes(client: &Client, url: &str, query: &Query) -> Result<()> {
    let processes: Vec<ProcessRecord> = client
        .get(format!("{}/api/processes", url.trim_end_matches('/')))
        .query(&query.params())
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if processes.is_empty() {
        println!("{}", "No matching processes".dimmed());
        return Ok(());
    }

    println!(
        "{:<8} {:<10} {:<6} {:<6} {:<9} {:<12} NAME",
        "PID", "STATUS", "CPU%", "MEM%", "MEM(MB)", "USER"
    );
    for p in processes {
        let status = format!("{:<10}", format!("{:?}", p.status).to_lowercase());
        println!(
            "{:<8} {} {:<6.1} {:<6.1} {:<9.1} {:<12} {}",
            p.pid,
            status.color(status_color(p.status)),
            p.cpu_percent,
            p.memory_percent,
            p.memory_mb,
            truncate(&p.owner, 12),
            p.name
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max.saturating_sub(1)).chain(['~']).collect()
    }
}
