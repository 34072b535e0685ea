use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tally::analytics::{summarize, DateRange};
use tally::config::Config;
use tally::storage::open_repository;

#[derive(Parser)]
#[command(name = "tally-admin")]
#[command(about = "Tally rollup reporting and maintenance CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RangeArgs {
    /// First day (YYYY-MM-DD), defaults to six days before --to
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Last day (YYYY-MM-DD), defaults to today (UTC)
    #[arg(long)]
    to: Option<NaiveDate>,
}

impl RangeArgs {
    fn range(&self) -> DateRange {
        let to = self.to.unwrap_or_else(|| Utc::now().date_naive());
        match self.from {
            Some(from) => DateRange::new(from, to),
            None => DateRange::last_days(to, 7),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Pageviews and unique visitors per day
    Summary {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Most viewed paths
    TopPaths {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Referrer domains with the most visitors
    TopSources {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Visitors per browser and OS
    Devices {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Delete rollups older than the retention window
    Prune {
        /// Days to keep, defaults to TALLY_RETENTION_DAYS
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Ensure database is initialized
    let repository = open_repository(&config.database).await?;

    match cli.command {
        Commands::Summary { range } => {
            let summary = summarize(repository.as_ref(), range.range()).await?;
            println!("Summary {} .. {}", summary.start, summary.end);
            println!("  Pageviews:       {}", summary.total_pageviews);
            println!("  Unique visitors: {}", summary.total_visitors);
            if summary.unreadable_sketches > 0 {
                println!(
                    "  ⚠ {} stored sketches could not be read, visitors may be undercounted",
                    summary.unreadable_sketches
                );
            }
            if !summary.daily.is_empty() {
                println!();
                println!("{:<12} {:>12} {:>12}", "Date", "Pageviews", "Visitors");
                println!("{}", "-".repeat(38));
                for day in summary.daily {
                    println!("{:<12} {:>12} {:>12}", day.date, day.pageviews, day.visitors);
                }
            }
        }
        Commands::TopPaths { range, limit } => {
            let paths = repository.query_top_paths(range.range(), limit).await?;
            if paths.is_empty() {
                println!("No pageviews recorded in this range.");
            } else {
                println!("{:<50} {:>12} {:>12}", "Path", "Pageviews", "Visitors");
                println!("{}", "-".repeat(76));
                for path in paths {
                    println!("{:<50} {:>12} {:>12}", path.path, path.pageviews, path.visitors);
                }
            }
        }
        Commands::TopSources { range, limit } => {
            let sources = repository.query_top_sources(range.range(), limit).await?;
            if sources.is_empty() {
                println!("No referrers recorded in this range.");
            } else {
                println!("{:<50} {:>12}", "Source", "Visitors");
                println!("{}", "-".repeat(63));
                for source in sources {
                    println!("{:<50} {:>12}", source.source, source.visitors);
                }
            }
        }
        Commands::Devices { range } => {
            let devices = repository.query_device_breakdown(range.range()).await?;
            if devices.is_empty() {
                println!("No devices recorded in this range.");
            } else {
                println!("{:<25} {:<25} {:>12}", "Browser", "OS", "Visitors");
                println!("{}", "-".repeat(64));
                for device in devices {
                    println!("{:<25} {:<25} {:>12}", device.browser, device.os, device.visitors);
                }
            }
        }
        Commands::Prune { days } => {
            let days = days.unwrap_or(config.retention.days).max(1);
            let cutoff = Utc::now()
                .date_naive()
                .checked_sub_days(Days::new(u64::from(days)))
                .context("retention window reaches before the earliest representable date")?;
            let removed = repository.delete_older_than(cutoff).await?;
            println!("✓ Removed {removed} rollup rows dated before {cutoff}");
        }
    }

    Ok(())
}
