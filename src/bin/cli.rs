//! geolife-tracks CLI - ingest a GeoLife dataset and report statistics
//!
//! Usage:
//!   geolife-tracks ingest <data_root> --db <file> [--labeled-ids <file>] [--resume-user <id> --resume-activity <n>]
//!   geolife-tracks report <task> --db <file>
//!
//! Reports are printed to stdout as JSON; progress goes to the log.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use geolife_tracks::analytics::{
    invalid_activities_per_user, top_altitude_gain, total_distance_km, users_in_region,
};
use geolife_tracks::{
    queries, ActivityFilter, AnalyticsConfig, IngestConfig, IngestionPipeline, MalformedLinePolicy,
    Result, SqliteStore, TransportMode,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "geolife-tracks")]
#[command(about = "GPS trajectory ingestion and mobility statistics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file
    #[arg(long, global = true, default_value = "geolife.db")]
    db: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every user directory under a dataset root
    Ingest {
        /// Dataset root containing one directory per user
        data_root: PathBuf,

        /// JSON file with ingestion settings (overridden by flags)
        #[arg(long)]
        config: Option<PathBuf>,

        /// File listing the ids of users that have labels
        #[arg(long)]
        labeled_ids: Option<PathBuf>,

        /// Resume from this user id
        #[arg(long, requires = "resume_activity")]
        resume_user: Option<String>,

        /// 1-indexed activity position within the resume user
        #[arg(long, requires = "resume_user")]
        resume_activity: Option<usize>,

        /// Drop only malformed lines instead of whole files
        #[arg(long)]
        skip_malformed_lines: bool,
    },

    /// Run a report over an ingested database
    Report {
        task: Task,

        /// JSON file with analytics settings
        #[arg(long)]
        config: Option<PathBuf>,

        /// Restrict distance to one user
        #[arg(long)]
        user: Option<String>,

        /// Restrict distance / user listing to one transportation mode
        #[arg(long)]
        mode: Option<String>,

        /// Restrict distance to activities starting in this year
        #[arg(long)]
        year: Option<i32>,

        /// Number of users in top-N reports (default 20, or `top_n` from --config)
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Task {
    Counts,
    AverageActivities,
    TopUsers,
    UsersWithMode,
    ModeCounts,
    BusiestYear,
    BusiestYearHours,
    Distance,
    AltitudeGain,
    InvalidActivities,
    RegionVisitors,
    MostUsedMode,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| writeln!(buf, "[{:5}] {}", record.level(), record.args()))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Commands::Ingest {
            data_root,
            config,
            labeled_ids,
            resume_user,
            resume_activity,
            skip_malformed_lines,
        } => {
            let mut config = match config {
                Some(path) => IngestConfig::from_json_file(path)?,
                None => IngestConfig::default(),
            };
            config.data_root = data_root;
            if labeled_ids.is_some() {
                config.labeled_ids = labeled_ids;
            }
            if let (Some(user), Some(activity)) = (resume_user, resume_activity) {
                config = config.with_resume(user, activity);
            }
            if skip_malformed_lines {
                config.malformed_lines = MalformedLinePolicy::SkipLine;
            }
            let report = IngestionPipeline::new(&mut store, config).run()?;
            print_json(&report)?;
        }
        Commands::Report {
            task,
            config,
            user,
            mode,
            year,
            limit,
        } => {
            let config = match config {
                Some(path) => AnalyticsConfig::from_json_file(path)?,
                None => AnalyticsConfig::default(),
            };
            let mode = mode.map(|m| m.parse::<TransportMode>()).transpose().map_err(
                |e| geolife_tracks::IngestError::Config(e.to_string()),
            )?;
            report(&store, task, &config, user, mode, year, limit)?;
        }
    }
    store.close()
}

fn report(
    store: &SqliteStore,
    task: Task,
    config: &AnalyticsConfig,
    user: Option<String>,
    mode: Option<TransportMode>,
    year: Option<i32>,
    limit: Option<usize>,
) -> Result<()> {
    match task {
        Task::Counts => print_json(&queries::counts(store)?),
        Task::AverageActivities => print_json(&queries::average_activities_per_user(store)?),
        Task::TopUsers => print_json(&queries::top_users_by_activities(store, limit.unwrap_or(config.top_n))?),
        Task::UsersWithMode => print_json(&queries::users_with_mode(
            store,
            mode.unwrap_or(TransportMode::Taxi),
        )?),
        Task::ModeCounts => print_json(&queries::mode_counts(store)?),
        Task::BusiestYear => print_json(&queries::busiest_year_by_activities(store)?),
        Task::BusiestYearHours => print_json(&queries::busiest_year_by_hours(store)?),
        Task::MostUsedMode => print_json(&queries::most_used_mode_per_user(store)?),
        Task::Distance => {
            let mut filter = ActivityFilter::all();
            filter.user_id = user;
            filter.mode = mode;
            if let Some(year) = year {
                let (from, before) = year_window(year)?;
                filter = filter.window(from, before);
            }
            let km = total_distance_km(store, &filter)?;
            print_json(&serde_json::json!({ "total_distance_km": km }))
        }
        Task::AltitudeGain => {
            let mut config = config.clone();
            if let Some(limit) = limit {
                config.top_n = limit;
            }
            print_json(&top_altitude_gain(store, &config)?)
        }
        Task::InvalidActivities => print_json(&invalid_activities_per_user(store, config)?),
        Task::RegionVisitors => print_json(&users_in_region(store, config.region)?),
    }
}

fn year_window(year: i32) -> Result<(chrono::NaiveDateTime, chrono::NaiveDateTime)> {
    let invalid = || geolife_tracks::IngestError::Config(format!("invalid year {}", year));
    let start = |y: i32| {
        NaiveDate::from_ymd_opt(y, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(invalid)
    };
    let next = year.checked_add(1).ok_or_else(invalid)?;
    Ok((start(year)?, start(next)?))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| geolife_tracks::IngestError::Config(e.to_string()))?;
    println!("{}", text);
    Ok(())
}
