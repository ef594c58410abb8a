use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use flowlint::backend::discovery;
use flowlint::backend::REGISTRY;
use flowlint::freshness::{FreshnessCache, HttpReleaseFeed};
use flowlint::report::{self, ValidateOptions};
use flowlint::{QuotaConfig, SimPolicy, Supervisor};

#[derive(Parser)]
#[command(
    name = "flowlint",
    version,
    about = "Automation-flow validator and diagnostic bridge"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Show project information
    #[arg(long)]
    about: bool,
}

/// Output format for results.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Format {
    /// Human-readable text output (default)
    #[default]
    Text,
    /// Machine-readable JSON
    Json,
}

/// Nesting cost policy for the bulk simulation.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Policy {
    /// records ^ nesting depth (worst case, default)
    #[default]
    Multiplicative,
    /// records x nesting depth
    Linear,
}

impl From<Policy> for SimPolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::Multiplicative => SimPolicy::Multiplicative,
            Policy::Linear => SimPolicy::Linear,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate files: backend diagnostics plus flow score and simulation
    Check {
        /// Files to validate
        paths: Vec<PathBuf>,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
        /// Simulated record batch size
        #[arg(long, default_value_t = 250)]
        records: u64,
        /// Nesting cost policy
        #[arg(long, value_enum, default_value_t = Policy::Multiplicative)]
        policy: Policy,
        /// Skip language-server backends (structural analysis only)
        #[arg(long)]
        no_backends: bool,
        /// Watch for changes and re-validate (requires 'watch' feature)
        #[arg(long)]
        watch: bool,
    },
    /// Score a flow document against the structural rule catalogue
    Score {
        /// Path to a flow document
        path: PathBuf,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Project quota usage for a flow against a synthetic record batch
    Simulate {
        /// Path to a flow document
        path: PathBuf,
        /// Simulated record batch size
        #[arg(long, default_value_t = 250)]
        records: u64,
        /// Nesting cost policy
        #[arg(long, value_enum, default_value_t = Policy::Multiplicative)]
        policy: Policy,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Show each registered backend's discovery status
    Backends {
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Show installed component versions against latest releases
    Doctor {
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
        /// Refresh the cache even if it is fresh
        #[arg(long)]
        refresh: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if cli.about {
        print_about();
        return;
    }

    match cli.command {
        Some(Commands::Check {
            paths,
            format,
            records,
            policy,
            no_backends,
            watch,
        }) => {
            if paths.is_empty() {
                eprintln!("Usage: flowlint check <file> [<file>...]");
                std::process::exit(1);
            }
            let options = ValidateOptions {
                records,
                policy: policy.into(),
                quotas: QuotaConfig::default(),
                use_backends: !no_backends,
            };

            #[cfg(feature = "watch")]
            if watch {
                run_watch_mode(&paths, &options);
                return;
            }
            #[cfg(not(feature = "watch"))]
            if watch {
                eprintln!(
                    "Watch mode requires the 'watch' feature. Rebuild with: cargo build --features watch"
                );
                std::process::exit(1);
            }

            let supervisor = Supervisor::new();
            let failed = run_check(&supervisor, &paths, &options, format);
            if failed {
                std::process::exit(1);
            }
        }
        Some(Commands::Score { path, format }) => {
            let doc = parse_flow_or_exit(&path);
            let result = flowlint::score(&doc);
            match format {
                Format::Text => {
                    eprint!("{}", flowlint::flow::rules::format_text(&result));
                }
                Format::Json => {
                    println!("{}", serde_json::to_string_pretty(&result).unwrap());
                }
            }
            if result.total < result.max {
                std::process::exit(1);
            }
        }
        Some(Commands::Simulate {
            path,
            records,
            policy,
            format,
        }) => {
            let doc = parse_flow_or_exit(&path);
            let result = flowlint::simulate_with(
                &doc,
                records,
                policy.into(),
                &QuotaConfig::default(),
            );
            match format {
                Format::Text => {
                    eprintln!("Simulation ({records} records):");
                    eprintln!("  queryOps: {}", result.counts.query_ops);
                    eprintln!("  mutationOps: {}", result.counts.mutation_ops);
                    eprintln!("  mutatedRows: {}", result.counts.mutated_rows);
                    eprintln!("  elapsedUnits: {}", result.counts.elapsed_units);
                    for violation in &result.violations {
                        eprintln!("  quota violation: {}", violation.reason);
                    }
                    if let Some(cycle) = &result.cycle {
                        eprintln!(
                            "  structural cycle detected at '{}'; counts are partial",
                            cycle.element_id
                        );
                    }
                }
                Format::Json => {
                    println!("{}", serde_json::to_string_pretty(&result).unwrap());
                }
            }
            if !result.is_clean() {
                std::process::exit(1);
            }
        }
        Some(Commands::Backends { format }) => {
            let mut entries = Vec::new();
            for descriptor in REGISTRY {
                let status = discovery::discover(descriptor);
                entries.push((descriptor, status));
            }
            match format {
                Format::Text => {
                    for (descriptor, status) in &entries {
                        match status {
                            Ok(found) => {
                                eprintln!(
                                    "{}: found via {} ({})",
                                    descriptor.key,
                                    found.via,
                                    found.program.display()
                                );
                                if let Some(version) = found.runtime_version {
                                    eprintln!("  runtime: {version}");
                                }
                                eprintln!(
                                    "  diagnostics: {}",
                                    if descriptor.capabilities.pull_diagnostics {
                                        "pull"
                                    } else {
                                        "push"
                                    }
                                );
                            }
                            Err(failure) => {
                                eprintln!("{}: {}", descriptor.key, failure.message);
                                eprintln!("  remediation: {}", failure.remediation);
                            }
                        }
                    }
                }
                Format::Json => {
                    let json: Vec<serde_json::Value> = entries
                        .iter()
                        .map(|(descriptor, status)| match status {
                            Ok(found) => serde_json::json!({
                                "backend": descriptor.key,
                                "found": true,
                                "via": found.via,
                                "program": found.program.display().to_string(),
                                "runtime_version":
                                    found.runtime_version.map(|v| v.to_string()),
                                "pull_diagnostics": descriptor.capabilities.pull_diagnostics,
                            }),
                            Err(failure) => serde_json::json!({
                                "backend": descriptor.key,
                                "found": false,
                                "message": failure.message,
                                "remediation": failure.remediation,
                            }),
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&json).unwrap());
                }
            }
        }
        Some(Commands::Doctor { format, refresh }) => {
            let Some(cache) = FreshnessCache::default_location() else {
                eprintln!("flowlint doctor: no cache directory available");
                std::process::exit(1);
            };
            let installed = installed_components();
            let now = flowlint::freshness::unix_now();
            let record = if refresh {
                cache.refresh(&HttpReleaseFeed, &installed, now)
            } else {
                cache.refresh_if_stale(&HttpReleaseFeed, &installed, now)
            };
            match format {
                Format::Text => {
                    eprint!("{}", flowlint::freshness::format_text(&record, now));
                }
                Format::Json => {
                    println!("{}", serde_json::to_string_pretty(&record).unwrap());
                }
            }
        }
        None => {
            eprintln!("Usage: flowlint <command> [args]");
            eprintln!("Run `flowlint --help` for details.");
            std::process::exit(1);
        }
    }
}

/// Validate each path and print its report. Returns `true` when any
/// report failed or could not be produced.
fn run_check(
    supervisor: &Supervisor,
    paths: &[PathBuf],
    options: &ValidateOptions,
    format: Format,
) -> bool {
    let mut reports = Vec::new();
    let mut any_failed = false;

    for path in paths {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                eprintln!("flowlint check: {}: {e}", path.display());
                any_failed = true;
                continue;
            }
        };
        let report = report::validate(
            supervisor,
            &path.display().to_string(),
            &contents,
            options,
        );
        if !report.passed() {
            any_failed = true;
        }
        reports.push(report);
    }

    match format {
        Format::Text => {
            let multi = reports.len() > 1;
            for report in &reports {
                if multi {
                    eprintln!("{}:", report.path);
                }
                eprint!("{}", report::format_text(report));
                if multi {
                    eprintln!();
                }
            }
        }
        Format::Json => {
            println!("{}", serde_json::to_string_pretty(&reports).unwrap());
        }
    }

    any_failed
}

/// Read and parse a flow document, exiting on failure.
fn parse_flow_or_exit(path: &PathBuf) -> flowlint::flow::FlowDocument {
    let contents = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("flowlint: {}: {e}", path.display());
        std::process::exit(1);
    });
    flowlint::parse(&contents).unwrap_or_else(|e| {
        eprintln!("flowlint: {}: {e}", path.display());
        std::process::exit(1);
    })
}

/// Locally observed component versions for the doctor report.
fn installed_components() -> Vec<(String, Option<String>)> {
    let mut components = vec![(
        "flowlint".to_string(),
        Some(env!("CARGO_PKG_VERSION").to_string()),
    )];
    for descriptor in REGISTRY {
        let runtime_version = discovery::discover(descriptor)
            .ok()
            .and_then(|found| found.runtime_version)
            .map(|v| v.to_string());
        let component = match descriptor.key {
            "yaml" => "yaml-language-server",
            "xml" => "lemminx",
            other => other,
        };
        components.push((component.to_string(), runtime_version));
    }
    components
}

fn print_about() {
    println!(
        "flowlint: Automation Flow Validator\n\
         ├─ version:    {}\n\
         ├─ source:     {}\n\
         └─ licence:    {} https://opensource.org/licenses/{}",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_REPOSITORY"),
        env!("CARGO_PKG_LICENSE"),
        env!("CARGO_PKG_LICENSE"),
    );
}

/// Run watch mode: re-validate on filesystem changes (requires `watch` feature).
#[cfg(feature = "watch")]
fn run_watch_mode(paths: &[PathBuf], options: &ValidateOptions) {
    use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    let supervisor = Supervisor::new();

    // Run the initial pass.
    run_check(&supervisor, paths, options, Format::Text);

    let (tx, rx) = mpsc::channel();
    let mut watcher = RecommendedWatcher::new(tx, Config::default()).unwrap_or_else(|e| {
        eprintln!("flowlint watch: failed to create watcher: {e}");
        std::process::exit(1);
    });

    for path in paths {
        let watch_target = path.parent().filter(|p| !p.as_os_str().is_empty());
        let target = watch_target.unwrap_or(path.as_path());
        if let Err(e) = watcher.watch(target, RecursiveMode::NonRecursive) {
            eprintln!("flowlint watch: failed to watch {}: {e}", target.display());
        }
    }

    eprintln!("Watching for changes... (press Ctrl+C to stop)");

    let debounce = Duration::from_millis(500);
    let mut last_run = Instant::now();

    loop {
        match rx.recv() {
            Ok(_event) => {
                if last_run.elapsed() < debounce {
                    while rx.try_recv().is_ok() {}
                    continue;
                }
                eprint!("\x1b[2J\x1b[H");
                run_check(&supervisor, paths, options, Format::Text);
                last_run = Instant::now();
                while rx.try_recv().is_ok() {}
            }
            Err(e) => {
                eprintln!("flowlint watch: watcher error: {e}");
                break;
            }
        }
    }
}
