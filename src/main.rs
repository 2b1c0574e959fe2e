use anyhow::Result;
use blocksmith::config::Settings;
use blocksmith::health::{HealthProber, TestOutcome};
use blocksmith::inventory::{require_tool, Inventory};
use blocksmith::planner::{OperationIntent, Plan, Planner, RaidLevel};
use blocksmith::reporter::ConsoleReporter;
use blocksmith::{
    human_size, ConfirmationToken, DeviceRole, HealthVerdict, PrivilegedExecutor,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::{self, Write};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blocksmith")]
#[command(about = "Orchestrates bcache, md RAID, wipe, format and fstab operations on block devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Answer yes to confirmation prompts (scripted use)
    #[arg(long, global = true)]
    yes: bool,

    /// Show the plan without executing anything
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices with size, transport and current role
    List {
        /// Show partitions and serial numbers
        #[arg(short, long)]
        detailed: bool,
    },

    /// Show the SMART health report for a device
    Health {
        /// Device path (e.g., /dev/sda)
        device: String,
    },

    /// Start a drive self-test (returns immediately; poll with `health`)
    Selftest {
        /// Device path (e.g., /dev/sda)
        device: String,

        /// Run the extended test instead of the short one
        #[arg(long)]
        long: bool,
    },

    /// Create an md RAID array
    CreateRaid {
        /// RAID level (0 or 1)
        #[arg(short, long)]
        level: u8,

        /// Array name (e.g., md0)
        #[arg(short, long, default_value = "md0")]
        name: String,

        /// Member devices (e.g., /dev/sdb /dev/sdc)
        #[arg(required = true, num_args = 2..)]
        members: Vec<String>,
    },

    /// Create a bcache device from a backing and a caching device
    CreateBcache {
        /// Backing (slow, large) device
        #[arg(short, long)]
        backing: String,

        /// Caching (fast) device
        #[arg(short, long)]
        caching: String,
    },

    /// Erase all filesystem signatures from a device
    Wipe {
        /// Device path (e.g., /dev/sdb)
        device: String,

        /// Unmount / stop arrays / detach bcache first instead of refusing
        #[arg(long)]
        teardown: bool,
    },

    /// Create a filesystem on a device
    Format {
        /// Device path (e.g., /dev/sdb)
        device: String,

        /// Filesystem type (ext4, xfs, btrfs, vfat, ...)
        #[arg(short, long, default_value = "ext4")]
        filesystem: String,

        /// Volume label
        #[arg(short, long)]
        label: Option<String>,

        /// Unmount the device first instead of refusing
        #[arg(long)]
        teardown: bool,
    },

    /// Add a persistent mount to the fstab table (idempotent)
    FstabAdd {
        /// Device path (e.g., /dev/md0)
        device: String,

        /// Mount point (e.g., /mnt/raid)
        mountpoint: String,

        /// Filesystem type recorded in the entry
        #[arg(short, long, default_value = "auto")]
        filesystem: String,

        /// Mount options (default from configuration)
        #[arg(short, long)]
        options: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "warn" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    setup_signal_handlers()?;

    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Warning: failed to load configuration ({}); using defaults", e);
            Settings::default()
        }
    };

    if settings.escalation.binary().is_none() && !is_root() {
        eprintln!("Error: escalation is disabled in the configuration but this");
        eprintln!("process is not running as root. Privileged commands would fail.");
        std::process::exit(1);
    }

    match &cli.command {
        Commands::List { detailed } => list_devices(*detailed)?,
        Commands::Health { device } => show_health(device)?,
        Commands::Selftest { device, long } => start_selftest(device, *long)?,
        Commands::CreateRaid {
            level,
            name,
            members,
        } => {
            require_tool("mdadm")?;
            let level = match level {
                0 => RaidLevel::Raid0,
                1 => RaidLevel::Raid1,
                other => anyhow::bail!("unsupported RAID level {}; only 0 and 1 are supported", other),
            };
            let intent = OperationIntent::CreateRaid {
                level,
                members: members.clone(),
                array_name: name.clone(),
            };
            run_intent(&cli, &settings, intent).await?;
        }
        Commands::CreateBcache { backing, caching } => {
            require_tool("make-bcache")?;
            let intent = OperationIntent::CreateBcache {
                backing: backing.clone(),
                caching: caching.clone(),
            };
            run_intent(&cli, &settings, intent).await?;
        }
        Commands::Wipe { device, teardown } => {
            require_tool("wipefs")?;
            let intent = OperationIntent::Wipe {
                device: device.clone(),
                force_teardown: *teardown,
            };
            run_intent(&cli, &settings, intent).await?;
        }
        Commands::Format {
            device,
            filesystem,
            label,
            teardown,
        } => {
            let intent = OperationIntent::Format {
                device: device.clone(),
                filesystem: filesystem.clone(),
                label: label.clone(),
                force_teardown: *teardown,
            };
            run_intent(&cli, &settings, intent).await?;
        }
        Commands::FstabAdd {
            device,
            mountpoint,
            filesystem,
            options,
        } => {
            let intent = OperationIntent::AddFstabEntry {
                device: device.clone(),
                mountpoint: mountpoint.clone(),
                filesystem: filesystem.clone(),
                options: options.clone(),
            };
            run_intent(&cli, &settings, intent).await?;
        }
    }

    Ok(())
}

/// Plan, confirm and execute one intent.
async fn run_intent(cli: &Cli, settings: &Settings, intent: OperationIntent) -> Result<()> {
    let snapshot = Inventory::scan()?;
    let planner = Planner::new(settings.clone());
    let mut plan = planner.plan(&intent, &snapshot)?;

    print_plan(&plan);

    if cli.dry_run {
        println!("\nDry run: nothing was executed.");
        return Ok(());
    }

    let token = if plan.is_destructive() {
        if let Some(binary) = settings.escalation.binary() {
            require_tool(binary)?;
        }
        Some(confirm(&mut plan, cli.yes)?)
    } else {
        None
    };

    let mut executor = PrivilegedExecutor::new(settings.clone(), ConsoleReporter::new());
    let result = executor.execute(plan, token.as_ref()).await?;

    if let Some(err) = result.as_error() {
        return Err(err.into());
    }

    Ok(())
}

fn print_plan(plan: &Plan) {
    println!("\n{}", plan.description.bold());
    for (i, step) in plan.steps.iter().enumerate() {
        let marker = if step.destructive {
            "!".red().bold().to_string()
        } else {
            "·".to_string()
        };
        println!("  {} [{}] {}", marker, i + 1, step.description);
        println!("       $ {}", step.command_line().dimmed());
    }
    for warning in &plan.warnings {
        println!("  {} {}", "⚠".yellow().bold(), warning);
    }
}

fn confirm(plan: &mut Plan, assume_yes: bool) -> Result<ConfirmationToken> {
    if assume_yes {
        return Ok(ConfirmationToken::approve(plan)?);
    }

    plan.begin_confirmation()?;

    println!(
        "\n{}",
        "WARNING: this will permanently modify the devices listed above."
            .red()
            .bold()
    );
    println!("Affected devices: {}", plan.targets.join(", "));
    print!("\nType 'YES' to confirm: ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    if input.trim() != "YES" {
        anyhow::bail!("operation cancelled");
    }

    Ok(ConfirmationToken::approve(plan)?)
}

fn list_devices(detailed: bool) -> Result<()> {
    let snapshot = Inventory::scan()?;

    if snapshot.devices.is_empty() {
        println!("No block devices found.");
        return Ok(());
    }

    for dev in &snapshot.devices {
        let role = match dev.role {
            DeviceRole::Free => "free".green().to_string(),
            DeviceRole::Mounted => "mounted".to_string(),
            DeviceRole::RaidMember => "raid member".cyan().to_string(),
            DeviceRole::BcacheBacking => "bcache backing".cyan().to_string(),
            DeviceRole::BcacheCache => "bcache cache".cyan().to_string(),
            DeviceRole::Claimed => "in use by a running plan".yellow().to_string(),
        };

        println!(
            "{:<14} {:>10}  {:<6} {:<20} {}",
            dev.path,
            human_size(dev.size),
            dev.transport.as_deref().unwrap_or("-"),
            dev.model.as_deref().unwrap_or("-"),
            role
        );

        if detailed {
            if let Some(serial) = &dev.serial {
                println!("    serial: {}", serial);
            }
            if let Some(pt) = &dev.partition_table {
                println!("    partition table: {}", pt);
            }
            for p in &dev.partitions {
                println!(
                    "    /dev/{:<10} {:>10}  {:<6} {}",
                    p.name,
                    human_size(p.size),
                    p.fstype.as_deref().unwrap_or("-"),
                    p.mountpoint.as_deref().unwrap_or("")
                );
            }
        }
    }

    if !snapshot.arrays.is_empty() {
        println!("\nActive md arrays:");
        for arr in &snapshot.arrays {
            println!(
                "  /dev/{} ({}) members: {}",
                arr.name,
                arr.level.as_deref().unwrap_or("unknown"),
                arr.members.join(", ")
            );
        }
    }

    Ok(())
}

fn show_health(device: &str) -> Result<()> {
    let report = HealthProber::read_report(device)?;

    let verdict = match report.verdict {
        HealthVerdict::Passed => "PASSED".green().bold().to_string(),
        HealthVerdict::Failed => "FAILED".red().bold().to_string(),
        HealthVerdict::Unknown => "UNKNOWN".yellow().to_string(),
    };

    println!("Device:  {}", report.device);
    if let Some(model) = &report.model {
        println!("Model:   {}", model);
    }
    if let Some(serial) = &report.serial {
        println!("Serial:  {}", serial);
    }
    println!("Health:  {}", verdict);

    if let Some(test) = &report.last_test {
        let outcome = match &test.outcome {
            TestOutcome::Passed => "passed".green().to_string(),
            TestOutcome::Failed(reason) => format!("{} ({})", "failed".red(), reason),
            TestOutcome::InProgress(remaining) => {
                format!("in progress, {}% remaining", remaining)
            }
            TestOutcome::NotRun => "not run".to_string(),
        };
        println!("Last self-test: {}: {}", test.kind, outcome);
    }

    if !report.attributes.is_empty() {
        println!("\n{:<4} {:<28} {:>8} {:>8} {:>8}  RAW", "ID", "ATTRIBUTE", "VALUE", "WORST", "THRESH");
        for attr in &report.attributes {
            let flag = if attr.failing_now {
                " FAILING".red().to_string()
            } else if attr.failed_before {
                " failed in the past".yellow().to_string()
            } else {
                String::new()
            };
            println!(
                "{:<4} {:<28} {:>8} {:>8} {:>8}  {}{}",
                attr.id, attr.name, attr.value, attr.worst, attr.threshold, attr.raw, flag
            );
        }
    }

    Ok(())
}

fn start_selftest(device: &str, long: bool) -> Result<()> {
    let handle = if long {
        HealthProber::run_long_test(device)?
    } else {
        HealthProber::run_quick_test(device)?
    };

    println!(
        "Started {:?} self-test on {} at {}.",
        handle.kind, handle.device, handle.issued_at
    );
    println!("The test runs inside the drive; check progress with:");
    println!("  blocksmith health {}", device);

    Ok(())
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn setup_signal_handlers() -> Result<()> {
    use signal_hook::{consts::SIGINT, iterator::Signals};

    let mut signals = Signals::new([SIGINT])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if sig == SIGINT {
                eprintln!("\nInterrupt received; finishing the current step before stopping...");
                blocksmith::set_interrupted();
            }
        }
    });

    Ok(())
}
