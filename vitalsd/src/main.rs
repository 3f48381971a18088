use anyhow::{Context as _, anyhow, bail};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use vitalsd::alerts::{RulePatch, RuleSpec, RuleStore, parse_threshold};
use vitalsd::config::Config;
use vitalsd::context::Context;
use vitalsd::db::Database;
use vitalsd::driver::Driver;
use vitalsd::history::{HistoryField, HistoryStore};
use vitalsd::processes::{ProcessInspector, ProcessQuery, SortKey};
use vitalsd::settings::SettingsStore;
use vitalsd::{api, settings};

#[derive(Parser, Debug)]
#[clap(name = "vitalsd", version, about = "Host telemetry daemon")]
struct Args {
    /// Config file (default: $VITALS_CONFIG, then /etc/vitals/vitals.toml)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample, alert and serve the API until interrupted (default)
    Run,
    /// Manage alert rules
    #[clap(subcommand)]
    Rules(RulesCommand),
    /// Inspect or prune metric history
    #[clap(subcommand)]
    History(HistoryCommand),
    /// List processes
    Ps {
        /// Case-insensitive name filter
        #[clap(long)]
        filter: Option<String>,
        /// pid, name, cpu_percent, memory_percent or memory_mb
        #[clap(long, default_value = "cpu_percent")]
        sort: SortKey,
        /// Ascending order
        #[clap(long)]
        asc: bool,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
    /// Process counts by state
    Stats,
    /// Send SIGTERM (or SIGKILL with --force)
    Kill {
        pid: u32,
        #[clap(long)]
        force: bool,
    },
    /// Change a process's nice value
    Renice {
        pid: u32,
        #[clap(allow_hyphen_values = true)]
        nice: i32,
    },
    /// User preferences
    #[clap(subcommand)]
    Settings(SettingsCommand),
}

#[derive(Subcommand, Debug)]
enum RulesCommand {
    List,
    Add {
        name: String,
        /// cpu_usage, cpu_temp, ram_usage, disk_usage, gpu_usage, gpu_temp, net_upload, net_download
        metric: String,
        /// >, <, >=, <= or ==
        op: String,
        #[clap(allow_hyphen_values = true)]
        threshold: String,
        #[clap(long)]
        disabled: bool,
        /// Do not request a sound with notifications
        #[clap(long)]
        silent: bool,
    },
    Set {
        id: i64,
        #[clap(long)]
        name: Option<String>,
        #[clap(long)]
        metric: Option<String>,
        #[clap(long)]
        op: Option<String>,
        #[clap(long, allow_hyphen_values = true)]
        threshold: Option<String>,
        #[clap(long)]
        enabled: Option<bool>,
        #[clap(long)]
        notify_sound: Option<bool>,
    },
    Toggle {
        id: i64,
    },
    Rm {
        id: i64,
    },
    Clear,
}

#[derive(Subcommand, Debug)]
enum HistoryCommand {
    Show {
        #[clap(long, default_value_t = 1.0)]
        hours: f64,
        #[clap(long, default_value_t = 20)]
        limit: i64,
    },
    Summary {
        #[clap(long, default_value_t = 24.0)]
        hours: f64,
    },
    /// Delete records older than N days (default: the retention setting)
    Cleanup {
        #[clap(long)]
        days: Option<u64>,
    },
    Clear,
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    List,
    Get { key: String },
    Set { key: String, value: String },
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Rules(cmd) => rules(&config, cmd).await,
        Command::History(cmd) => history(&config, cmd).await,
        Command::Settings(cmd) => settings_cmd(&config, cmd).await,
        Command::Ps {
            filter,
            sort,
            asc,
            limit,
        } => {
            let mut inspector = ProcessInspector::system(config.processes.prime_interval());
            let records = inspector.list(&ProcessQuery {
                filter,
                sort,
                descending: !asc,
                limit: Some(limit),
            });
            println!(
                "{:>7}  {:<24} {:>7} {:>7} {:>10}  {:<10} {:>4}  CMD",
                "PID", "NAME", "CPU%", "MEM%", "MEM(MB)", "USER", "THR"
            );
            for p in records {
                println!(
                    "{:>7}  {:<24} {:>7.1} {:>7.1} {:>10.1}  {:<10} {:>4}  {}",
                    p.pid,
                    truncate(&p.name, 24),
                    p.cpu_percent,
                    p.memory_percent,
                    p.memory_mb,
                    truncate(&p.owner, 10),
                    p.threads,
                    p.cmdline
                );
            }
            Ok(())
        }
        Command::Stats => {
            let mut inspector = ProcessInspector::system(Duration::ZERO);
            let stats = inspector.stats();
            println!("total:    {}", stats.total);
            println!("running:  {}", stats.running);
            println!("sleeping: {}", stats.sleeping);
            println!("stopped:  {}", stats.stopped);
            println!("zombie:   {}", stats.zombie);
            println!("threads:  {}", stats.total_threads);
            Ok(())
        }
        Command::Kill { pid, force } => {
            let mut inspector = ProcessInspector::system(Duration::ZERO);
            let sent = if force {
                inspector.kill(pid)
            } else {
                inspector.terminate(pid)
            };
            if !sent {
                bail!("could not signal process {pid}");
            }
            println!("sent {} to {pid}", if force { "SIGKILL" } else { "SIGTERM" });
            Ok(())
        }
        Command::Renice { pid, nice } => {
            let mut inspector = ProcessInspector::system(Duration::ZERO);
            if !inspector.set_priority(pid, nice) {
                bail!("could not set nice {nice} on process {pid}");
            }
            println!("process {pid} now at nice {nice}");
            Ok(())
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let listen = config.api.listen;
    let api_enabled = config.api.enabled;
    let ctx = Context::new(config)
        .await
        .context("failed to open the metrics database")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let api_task = if api_enabled {
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;
        Some(tokio::spawn(api::serve(ctx.clone(), listener, stopped(stop_rx))))
    } else {
        info!("[api] disabled in config");
        None
    };

    Driver::new(ctx).run(shutdown_signal()).await;

    let _ = stop_tx.send(true);
    if let Some(task) = api_task {
        task.await.context("api task panicked")??;
    }
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::warn!("[main] ctrl-c handler failed: {err}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("[main] shutdown requested");
}

async fn open_db(config: &Config) -> anyhow::Result<Database> {
    Database::connect(&config.storage.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.storage.db_path.display()))
}

async fn rules(config: &Config, cmd: RulesCommand) -> anyhow::Result<()> {
    let store = RuleStore::new(&open_db(config).await?);
    match cmd {
        RulesCommand::List => {
            let rules = store.list(false).await?;
            if rules.is_empty() {
                println!("no rules");
            }
            for rule in rules {
                println!(
                    "#{:<4} {:<20} {} {} {:<8} {:<8} triggered {}x{}",
                    rule.id,
                    rule.name,
                    rule.metric,
                    rule.operator,
                    rule.threshold,
                    if rule.enabled { "enabled" } else { "disabled" },
                    rule.trigger_count,
                    rule.last_triggered
                        .map(|t| format!(" (last {})", t.format("%Y-%m-%d %H:%M:%S")))
                        .unwrap_or_default()
                );
            }
        }
        RulesCommand::Add {
            name,
            metric,
            op,
            threshold,
            disabled,
            silent,
        } => {
            let mut spec = RuleSpec::parse(&name, &metric, &op, &threshold)?;
            spec.enabled = !disabled;
            spec.notify_sound = !silent;
            let rule = store.create(&spec).await?;
            println!("created rule #{}", rule.id);
        }
        RulesCommand::Set {
            id,
            name,
            metric,
            op,
            threshold,
            enabled,
            notify_sound,
        } => {
            let patch = RulePatch {
                name,
                metric: metric.as_deref().map(str::parse).transpose()?,
                operator: op.as_deref().map(str::parse).transpose()?,
                threshold: threshold.as_deref().map(parse_threshold).transpose()?,
                enabled,
                notify_sound,
            };
            if patch.is_empty() {
                bail!("nothing to change");
            }
            if !store.update(id, &patch).await? {
                bail!("rule {id} not found");
            }
            println!("updated rule #{id}");
        }
        RulesCommand::Toggle { id } => match store.toggle(id).await? {
            Some(enabled) => println!(
                "rule #{id} {}",
                if enabled { "enabled" } else { "disabled" }
            ),
            None => bail!("rule {id} not found"),
        },
        RulesCommand::Rm { id } => {
            if !store.delete(id).await? {
                bail!("rule {id} not found");
            }
            println!("deleted rule #{id}");
        }
        RulesCommand::Clear => {
            println!("deleted {} rules", store.delete_all().await?);
        }
    }
    Ok(())
}

async fn history(config: &Config, cmd: HistoryCommand) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let store = HistoryStore::new(&db);
    match cmd {
        HistoryCommand::Show { hours, limit } => {
            for record in store.query(hours_window(hours)?, limit).await? {
                let v = record.values;
                println!(
                    "{}  cpu {:>6}  ram {:>6}  disk {:>6}  up {:>8}  down {:>8}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    fmt_opt(v.cpu_usage),
                    fmt_opt(v.ram_usage),
                    fmt_opt(v.disk_usage),
                    fmt_opt(v.net_upload),
                    fmt_opt(v.net_download),
                );
            }
        }
        HistoryCommand::Summary { hours } => {
            let summary = store.summary(hours_window(hours)?).await?;
            println!("{} records", summary.record_count);
            for field in HistoryField::ALL {
                let agg = summary.get(field);
                println!(
                    "{:<17} avg {:>8}  min {:>8}  max {:>8}",
                    field.column(),
                    fmt_opt(agg.avg),
                    fmt_opt(agg.min),
                    fmt_opt(agg.max)
                );
            }
        }
        HistoryCommand::Cleanup { days } => {
            let window = match days {
                Some(days) => Duration::from_secs(days.saturating_mul(86_400)),
                None => SettingsStore::new(&db).await?.retention().await?,
            };
            println!("deleted {} records", store.cleanup(window).await?);
        }
        HistoryCommand::Clear => {
            println!("deleted {} records", store.clear_all().await?);
        }
    }
    Ok(())
}

async fn settings_cmd(config: &Config, cmd: SettingsCommand) -> anyhow::Result<()> {
    let store = SettingsStore::new(&open_db(config).await?).await?;
    match cmd {
        SettingsCommand::List => {
            for (key, value) in store.all().await? {
                println!("{key} = {value}");
            }
        }
        SettingsCommand::Get { key } => match store.get(&key).await? {
            Some(value) => println!("{value}"),
            None => bail!("no setting '{key}'"),
        },
        SettingsCommand::Set { key, value } => {
            if settings::DEFAULTS.iter().all(|(known, _)| *known != key) {
                log::warn!("[settings] '{key}' is not a known setting");
            }
            store.set(&key, &value).await?;
        }
        SettingsCommand::Reset => store.reset().await?,
    }
    Ok(())
}

fn hours_window(hours: f64) -> anyhow::Result<Duration> {
    if !hours.is_finite() || hours < 0.0 {
        bail!("--hours must be a non-negative number");
    }
    Duration::try_from_secs_f64(hours * 3_600.0).map_err(|_| anyhow!("--hours is out of range"))
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max.saturating_sub(1)).chain(['…']).collect()
    }
}
