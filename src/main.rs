//! ridctl
//!
//! Command-line front end of the RID manager. Every subcommand is a thin
//! wrapper over the library; failures print a one-line diagnostic and exit
//! with the code of their error kind.

use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rid_manager::config::local_hostname;
use rid_manager::domain::ports::{CommandRunnerRef, Confirm};
use rid_manager::lifecycle::set_ini_option;
use rid_manager::{
    BatchMode, BatchOrchestrator, BatchReport, BlockDevice, CommandCache, DepotConfig, ErrorKind,
    IbpServer, LinuxHost, OptionScope, ResourceManager, Result, Rid, ServerCoordinator,
    ShellExecutor, SlotPlanner,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// RID manager - lifecycle of depot storage resources
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "RIDCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Depot root, overriding the configuration
    #[arg(long, env = "DEPOT_DIR")]
    depot_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Write Prometheus metrics to this file after the command
    #[arg(long, env = "RIDCTL_METRICS_FILE")]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a device as a new resource and mount it
    Create {
        rid: Rid,
        device: PathBuf,
        /// Delete existing partitions without asking
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Mount a resource
    Mount { rid: Rid },
    /// Unmount a resource
    Umount { rid: Rid },
    /// Move a resource's metadata to an external directory
    Import {
        rid: Rid,
        /// Keep a timestamped copy of the metadata
        #[arg(long)]
        snap: bool,
        /// Import root (default: the configured import directory)
        #[arg(long = "md-dir")]
        md_dir: Option<PathBuf>,
    },
    /// Move a resource's metadata back onto its partition
    Export {
        rid: Rid,
        /// Keep a timestamped copy of the external metadata
        #[arg(long)]
        snap: bool,
        /// Import root (default: the configured import directory)
        #[arg(long = "md-dir")]
        md_dir: Option<PathBuf>,
    },
    /// Check the unmounted partitions of a resource
    Fsck { rid: Rid },
    /// Defragment fragmented files of a mounted resource
    Defrag {
        rid: Rid,
        #[arg(long)]
        log_dir: Option<PathBuf>,
        #[arg(long)]
        threshold: Option<u64>,
    },
    /// Quarantine a resource
    Sequester { rid: Rid, reason: String },
    /// Lift a quarantine
    Unsequester { rid: Rid, reason: String },
    /// Print the last sequester ledger line
    CheckSequester { rid: Rid },
    /// List mounted resources
    List {
        /// Print RIDs only
        #[arg(long)]
        rid_only: bool,
    },
    /// Set an option in a resource's rid.settings
    SetOption {
        rid: Rid,
        scope: OptionScope,
        key: String,
        value: String,
    },
    /// Set a key in an ini file, keeping a .old backup
    SetIni {
        file: PathBuf,
        section: String,
        key: String,
        value: String,
    },
    /// Remove what a failed unmount left behind
    Cleanup { rid: Rid },
    /// Detach, unmount, check, remount and re-attach a resource
    Repair { rid: Rid },
    /// Rebuild the storage daemon configuration
    MergeConfig,
    /// Compare expected, visible and attached drives
    Reconcile {
        /// Repair unattached, unsequestered resources
        #[arg(long)]
        repair: bool,
    },
    /// Mount every resource not yet mounted
    MountAll,
    /// Unmount every mounted resource
    UmountAll,
    /// Check every resource
    FsckAll,
    /// Defragment every mounted resource
    DefragAll {
        /// Log outcomes instead of collecting a report
        #[arg(long)]
        detach: bool,
    },
    /// Provision every free slot of this depot
    FormatEmptySlots {
        /// Log outcomes instead of collecting a report
        #[arg(long)]
        detach: bool,
    },
    /// Run the storage daemon
    Server {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonAction {
    /// Start the daemon, stopping a running instance first
    Start {
        /// Daemon configuration (default: rebuild and use the depot's ibp.conf)
        #[arg(long)]
        conf: Option<PathBuf>,
    },
    /// Send SIGQUIT and wait for the daemon to exit
    Stop,
    /// Show the running daemon process
    Status,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(&args);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("ridctl: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

struct Context {
    manager: Arc<ResourceManager>,
    runner: CommandRunnerRef,
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => DepotConfig::from_file(path)?,
        None => DepotConfig::default(),
    };
    if let Some(depot_dir) = args.depot_dir.clone() {
        config = config.with_depot_dir(depot_dir);
    }

    let cache = Arc::new(CommandCache::new());
    let runner: CommandRunnerRef = Arc::new(ShellExecutor::new(cache, config.timeouts.clone()));
    let ports = LinuxHost::new(
        runner.clone(),
        config.mounts_file.clone(),
        config.initializer_programs.clone(),
        config.cache_ttl(),
    )
    .into_ports();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            token.cancel();
        }
    });

    let manager = Arc::new(ResourceManager::new(config, ports)?.with_cancellation(cancel));
    info!(version = rid_manager::VERSION, command = ?args.command, "ridctl starting");

    let ctx = Context {
        manager: manager.clone(),
        runner,
    };
    let outcome = dispatch(&ctx, args.command).await;

    if let Some(path) = &args.metrics_file {
        match manager.metrics().encode() {
            Ok(text) => {
                if let Err(e) = std::fs::write(path, text) {
                    warn!(path = %path.display(), "Cannot write metrics: {}", e);
                }
            }
            Err(e) => warn!("Cannot encode metrics: {}", e),
        }
    }
    outcome
}

async fn dispatch(ctx: &Context, command: Command) -> Result<ExitCode> {
    let manager = &ctx.manager;
    let config = manager.config();

    match command {
        Command::Create { rid, device, yes } => {
            let device = BlockDevice::new(device);
            let descriptor = manager.create(rid, &device, yes, &StdinConfirm).await?;
            println!("Rid {} created on {} ({}).", rid, device, descriptor);
        }
        Command::Mount { rid } => {
            let descriptor = manager.mount(rid).await?;
            println!("Rid {} mounted ({}).", rid, descriptor);
        }
        Command::Umount { rid } => {
            manager.umount(rid).await?;
            println!("Rid {} unmounted.", rid);
        }
        Command::Import { rid, snap, md_dir } => {
            let target = md_dir.unwrap_or_else(|| config.import_dir.clone());
            let at = manager.import(rid, &target, snap).await?;
            println!("Rid {} metadata imported to {}.", rid, at.display());
        }
        Command::Export { rid, snap, md_dir } => {
            let target = md_dir.unwrap_or_else(|| config.import_dir.clone());
            manager.export(rid, &target, snap).await?;
            println!("Rid {} metadata exported.", rid);
        }
        Command::Fsck { rid } => {
            let report = manager.fsck(rid).await?;
            for partition in &report.checked {
                println!("checked {}", partition.display());
            }
            for partition in &report.skipped {
                println!("skipped {} (mounted)", partition.display());
            }
        }
        Command::Defrag {
            rid,
            log_dir,
            threshold,
        } => {
            let log_dir = log_dir.unwrap_or_else(|| config.defrag.log_dir.clone());
            let threshold = threshold.unwrap_or(config.defrag.extent_threshold);
            let report = manager.defrag(rid, &log_dir, threshold).await?;
            println!(
                "Rid {}: {} files scanned, {} defragmented (log {}).",
                rid,
                report.scanned,
                report.defragmented,
                report.log.display()
            );
        }
        Command::Sequester { rid, reason } => {
            println!("{}", manager.sequester(rid, &reason).await?);
        }
        Command::Unsequester { rid, reason } => {
            println!("{}", manager.unsequester(rid, &reason).await?);
        }
        Command::CheckSequester { rid } => {
            println!("{}", manager.check_sequester(rid).await?);
        }
        Command::List { rid_only } => print_list(manager, rid_only)?,
        Command::SetOption {
            rid,
            scope,
            key,
            value,
        } => manager.set_rid_option(rid, scope, &key, &value).await?,
        Command::SetIni {
            file,
            section,
            key,
            value,
        } => set_ini_option(&file, &section, &key, &value)?,
        Command::Cleanup { rid } => {
            manager.force_cleanup(rid).await?;
            println!("Rid {} cleaned up.", rid);
        }
        Command::Repair { rid } => {
            coordinator(ctx)?.repair(rid).await?;
            println!("Rid {} repaired.", rid);
        }
        Command::MergeConfig => {
            let path = coordinator(ctx)?.merge_config()?;
            println!("Wrote {}.", path.display());
        }
        Command::Reconcile { repair } => {
            let coordinator = coordinator(ctx)?;
            if !repair {
                println!("{}", coordinator.reconcile().await?);
                return Ok(ExitCode::SUCCESS);
            }
            let (report, failures) = coordinator.reconcile_and_repair().await?;
            println!("{}", report);
            for (rid, e) in &failures {
                println!("Rid {} repair failed: {}", rid, e);
            }
            if !failures.is_empty() {
                return Ok(ExitCode::from(ErrorKind::Partial.exit_code()));
            }
        }
        Command::MountAll => {
            let batch = BatchOrchestrator::new(manager.clone());
            return Ok(finish_batch(&batch.mount_all(BatchMode::Join).await?));
        }
        Command::UmountAll => {
            let batch = BatchOrchestrator::new(manager.clone());
            return Ok(finish_batch(&batch.umount_all(BatchMode::Join).await?));
        }
        Command::FsckAll => {
            let batch = BatchOrchestrator::new(manager.clone());
            return Ok(finish_batch(&batch.fsck_all(BatchMode::Join).await?));
        }
        Command::DefragAll { detach } => {
            let batch = BatchOrchestrator::new(manager.clone());
            let report = batch.defrag_all(mode(detach)).await?;
            batch.wait_detached().await;
            return Ok(finish_batch(&report));
        }
        Command::FormatEmptySlots { detach } => {
            let hostname = match config.slots.depot_number {
                Some(_) => String::new(),
                None => local_hostname()?,
            };
            let planner = SlotPlanner::for_host(config.slots.clone(), &hostname)?;
            info!(depot = planner.depot_number(), "Formatting empty slots");
            let batch = BatchOrchestrator::new(manager.clone());
            let report = batch.format_empty_slots(&planner, mode(detach)).await?;
            batch.wait_detached().await;
            coordinator(ctx)?.merge_config()?;
            return Ok(finish_batch(&report));
        }
        Command::Server { action } => {
            let coordinator = coordinator(ctx)?;
            match action {
                DaemonAction::Start { conf } => {
                    let process = coordinator.start_daemon(conf.as_deref()).await?;
                    println!("Started {}.", process);
                }
                DaemonAction::Stop => match coordinator.server().stop().await? {
                    Some(process) => println!("Completed shutdown of {}.", process),
                    None => println!("ibp_server is not running."),
                },
                DaemonAction::Status => match coordinator.server().status().await? {
                    Some(process) => println!("{}", process),
                    None => {
                        println!("ibp_server is not running.");
                        return Ok(ExitCode::from(ErrorKind::Generic.exit_code()));
                    }
                },
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn mode(detach: bool) -> BatchMode {
    if detach {
        BatchMode::Detach
    } else {
        BatchMode::Join
    }
}

fn coordinator(ctx: &Context) -> Result<ServerCoordinator> {
    let server = &ctx.manager.config().server;
    let host = match &server.host {
        Some(host) => host.clone(),
        None => local_hostname()?,
    };
    let ibp =
        IbpServer::new(ctx.runner.clone(), host, server.port).with_daemon_config(server.clone());
    Ok(ServerCoordinator::new(ctx.manager.clone(), Arc::new(ibp)))
}

fn finish_batch(report: &BatchReport) -> ExitCode {
    println!("{}", report);
    for (rid, e) in &report.failed {
        println!("  rid {}: {}", rid, e);
    }
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(ErrorKind::Partial.exit_code())
    }
}

fn print_list(manager: &ResourceManager, rid_only: bool) -> Result<()> {
    if rid_only {
        for rid in manager.list_rids()? {
            println!("{}", rid);
        }
        return Ok(());
    }

    println!(
        "{:<6} {:>4}  {:<13} {:<13}  {:<25} {:<25}",
        "RID", "Type", "Data", "Metadata", "Import Metadata", "Sequester Status"
    );
    println!(
        "{:<6} {:>4}  {:<13} {:<13}  {:<25} {:<25}",
        "-----", "----", "-----------", "-----------", "----------------------", "-----------------"
    );
    for summary in manager.list()? {
        let show = |p: &Option<PathBuf>, missing: &str| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| missing.to_string())
        };
        let kind = if summary.md_partition.is_some() { "dev" } else { "UNKNOWN" };
        println!(
            "{:<6} {:>4}  {:<13} {:<13}  {:<25} {}",
            summary.rid,
            kind,
            show(&summary.data_partition, "UNKNOWN"),
            show(&summary.md_partition, "UNKNOWN"),
            show(&summary.import_dir, "NOT_IMPORTED"),
            summary.sequester
        );
    }
    Ok(())
}

// =============================================================================
// Confirmation
// =============================================================================

/// Asks on the terminal; anything but yes declines
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, question: &str) -> bool {
        let stdin = io::stdin();
        let mut stderr = io::stderr();
        loop {
            let _ = write!(stderr, "{} [y/N] ", question);
            let _ = stderr.flush();
            let mut answer = String::new();
            if stdin.lock().read_line(&mut answer).unwrap_or(0) == 0 {
                return false;
            }
            match answer.trim().to_lowercase().as_str() {
                "y" | "ye" | "yes" => return true,
                "" | "n" | "no" => return false,
                _ => {
                    let _ = writeln!(stderr, "Please respond with 'yes' or 'no' (or 'y' or 'n').");
                }
            }
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init();
    }
}
