use std::{env, fs};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{self, LevelFilter, debug, error, info};

use mapcov::cli::parse;
use mapcov::config::defs::RunConfig;
use mapcov::pipelines::coverage_analysis;
use mapcov::utils::command::check_versions;
use mapcov::utils::stats::RedundancyReport;
use mapcov::utils::system::detect_cores;

/// Exit status for a run aborted by a fatal stage failure.
const EXIT_FATAL: i32 = 1;
/// Exit status for unusable command-line configuration.
const EXIT_INVALID_CONFIG: i32 = 2;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n mapcov\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let cores = detect_cores();
    let config = match RunConfig::from_args(&args, &dir, cores) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };
    if let Err(e) = fs::create_dir_all(&config.out_dir) {
        error!("Cannot create output directory {}: {}", config.out_dir.display(), e);
        std::process::exit(EXIT_INVALID_CONFIG);
    }
    debug!("Detected {} physical cores; using {} threads", cores, config.threads);

    if !args.skip_version_check {
        check_versions(&config).await;
    }

    let run_config = Arc::new(config);
    match coverage_analysis::run(run_config).await {
        Ok(summary) => {
            for path in &summary.published {
                info!("Saved {}", path.display());
            }
            if let Some(dir) = &summary.archive_dir {
                info!("Temporary files kept in {}", dir.display());
            }
            match &summary.redundancy {
                Some(RedundancyReport::Found(stats)) => info!(
                    "Redundant reads: {} of {} mapped, rate {:.2}",
                    stats.per_read.count, stats.mapped_reads, stats.redundancy_rate
                ),
                Some(RedundancyReport::NoneFound) => info!("No redundant alignments found"),
                None => {}
            }
        }
        Err(_) => {
            error!("Pipeline failed at {} milliseconds.", run_start.elapsed().as_millis());
            std::process::exit(EXIT_FATAL);
        }
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}
