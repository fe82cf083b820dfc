//! UPnP Manager
//!
//! Command-line front end for editing a rule file and applying it to the
//! local UPnP gateway.
//!
//! # Usage
//!
//! ```bash
//! upnp-manager -f presets.json list                  # Show rules
//! upnp-manager -f presets.json add 8080 tcp -n web   # Add an active rule
//! upnp-manager -f presets.json set 0 --inactive      # Deactivate rule 0
//! upnp-manager -f presets.json apply                 # Reconcile with the gateway
//! upnp-manager -f presets.json remove 0              # Close and delete rule 0
//! upnp-manager history                               # Recent audit events
//! ```
//!
//! The last file used is remembered, so `-f` can be omitted afterwards.

use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use upnp_manager::core::engine::DiscoveryPolicy;
use upnp_manager::core::gateway::UpnpGatewayClient;
use upnp_manager::core::store::RuleEdit;
use upnp_manager::validators::{check_well_known_port, parse_port};
use upnp_manager::{
    Error, PortMappingRule, Protocol, ReconciliationEngine, RuleStore, audit, config, utils,
};

#[derive(Parser)]
#[command(name = "upnp-manager")]
#[command(about = "Declarative UPnP port-forwarding manager", long_about = None)]
struct Cli {
    /// Rule file to operate on (defaults to the last file used)
    #[arg(short, long, global = true, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Seconds to wait for the gateway on each discovery
    #[arg(short, long, global = true, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Discover the gateway once per pass instead of once per rule
    #[arg(long, global = true)]
    reuse_gateway: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the rules in the file
    List,
    /// Forward active rules and close inactive ones on the gateway
    Apply,
    /// Append a rule to the file
    Add {
        /// Port number (1-65535)
        port: String,
        /// Protocol (tcp or udp)
        protocol: String,
        /// Rule name, used as the mapping description
        #[arg(short, long, default_value = "")]
        name: String,
        /// Add the rule as inactive
        #[arg(long)]
        inactive: bool,
    },
    /// Edit a rule in place
    Set {
        /// Rule index as shown by `list`
        index: usize,
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        protocol: Option<String>,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long, conflicts_with = "inactive")]
        active: bool,
        #[arg(long)]
        inactive: bool,
    },
    /// Close a rule's mapping on the gateway and delete it from the file
    Remove {
        /// Rule index as shown by `list`
        index: usize,
    },
    /// Show recent audit log events, newest first
    History {
        /// Number of events to show
        #[arg(default_value_t = 10)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    init_logging();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    if let Some(mut log_path) = utils::get_state_dir() {
        log_path.push("upnp-manager.log");
        if let Ok(file) = std::fs::File::create(log_path) {
            tracing_subscriber::fmt()
                .with_writer(file)
                .with_ansi(false)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
}

fn parse_protocol(text: &str) -> Result<Protocol, Box<dyn std::error::Error>> {
    text.parse::<Protocol>()
        .map_err(|_| format!("Unknown protocol '{text}'. Use tcp or udp.").into())
}

fn print_error_help(error: &Error) {
    let translation = error.translate();
    eprintln!("    {}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("      - {suggestion}");
    }
}

/// Loads the rule file, reporting foreign or unreadable files before any change happens.
async fn load_store(path: &Path, audit_enabled: bool) -> Result<RuleStore, Error> {
    let mut store = RuleStore::new();
    match store.load(path).await {
        Ok(count) => {
            audit::log_load(audit_enabled, path, count, None).await;
            Ok(store)
        }
        Err(e) => {
            audit::log_load(audit_enabled, path, 0, Some(e.to_string())).await;
            Err(e)
        }
    }
}

async fn save_store(store: &RuleStore, path: &Path, audit_enabled: bool) -> Result<(), Error> {
    let result = store.save(path).await;
    match &result {
        Ok(count) => audit::log_save(audit_enabled, path, *count, None).await,
        Err(e) => audit::log_save(audit_enabled, path, 0, Some(e.to_string())).await,
    }
    result.map(|_| ())
}

fn print_rules(store: &RuleStore) {
    if store.is_empty() {
        println!("No rules.");
        return;
    }

    let mut seen = HashSet::new();
    for (index, rule) in store.iter().enumerate() {
        println!("  [{index}] {rule}");
        if let Some(key) = rule.mapping_key() {
            if !seen.insert(key) {
                println!("        warning: {key} appears more than once; the last rule applied wins");
            }
            if let Some(note) = check_well_known_port(key.port) {
                println!("        note: {note}");
            }
        }
    }
}

async fn print_history(count: usize, audit_enabled: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log = audit::AuditLog::new()?;
    if !tokio::fs::try_exists(log.path()).await? {
        println!("No audit events recorded yet.");
        if !audit_enabled {
            println!("Set enable_event_log to true in the configuration to record them.");
        }
        return Ok(());
    }

    println!("Recent events from {}:", log.path().display());
    for event in log.read_recent(count).await? {
        let marker = if event.success { '✓' } else { '✗' };
        println!(
            "  {marker} {} {:?} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.details
        );
        if let Some(error) = &event.error {
            println!("      {error}");
        }
    }
    Ok(())
}

async fn handle_cli(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut app_config = config::load_config().await;
    let audit_enabled = app_config.enable_event_log;

    if let Commands::History { count } = cli.command {
        return print_history(count, audit_enabled).await;
    }

    // Command-line overrides apply to this run only and are never persisted
    let mut run_config = app_config.clone();
    if let Some(timeout) = cli.timeout {
        run_config.discovery_timeout_secs = timeout;
    }
    if cli.reuse_gateway {
        run_config.discovery_policy = DiscoveryPolicy::PerPass;
    }

    let path = cli
        .file
        .clone()
        .or_else(|| app_config.last_rules_file.clone())
        .ok_or("No rule file given. Use --file <PATH>.")?;

    let engine = ReconciliationEngine::new(
        UpnpGatewayClient::new(run_config.lease_duration_secs),
        run_config.engine_config(),
    );

    match cli.command {
        Commands::List => {
            let store = load_store(&path, audit_enabled).await?;
            println!("Rules in {}:", path.display());
            print_rules(&store);
        }
        Commands::Apply => {
            let store = load_store(&path, audit_enabled).await?;
            let lease = match engine.client().lease_duration() {
                0 => "permanent".to_string(),
                secs => format!("{secs}s"),
            };
            println!(
                "Applying {} rules from {} (lease: {lease})...",
                store.len(),
                path.display()
            );

            let mut pass = engine.reconcile_all(store.rules())?;
            while let Some(result) = pass.next_outcome().await {
                let marker = if result.outcome.is_success() { '✓' } else { '✗' };
                println!("  {marker} [{}] {}: {result}", result.index, result.name);
                if let Some(error) = result.outcome.error() {
                    print_error_help(error);
                }
            }
            let summary = *pass.summary();
            drop(pass);

            println!("Done: {summary}");
            audit::log_reconcile(audit_enabled, &summary).await;
            if summary.failed > 0 {
                return Err(format!("{} rule(s) could not be applied", summary.failed).into());
            }
        }
        Commands::Add {
            port,
            protocol,
            name,
            inactive,
        } => {
            let mut store = if tokio::fs::try_exists(&path).await? {
                load_store(&path, audit_enabled).await?
            } else {
                RuleStore::new()
            };

            let port = parse_port(&port).ok_or_else(|| format!("Invalid port '{port}'"))?;
            let rule = PortMappingRule::new(name, port, parse_protocol(&protocol)?, !inactive);
            println!("Added [{}] {rule}", store.len());
            if let Some(note) = check_well_known_port(port) {
                println!("  note: {note}");
            }
            store.apply_edit(RuleEdit::Add(rule));
            save_store(&store, &path, audit_enabled).await?;
        }
        Commands::Set {
            index,
            port,
            protocol,
            name,
            active,
            inactive,
        } => {
            let mut store = load_store(&path, audit_enabled).await?;
            let mut rule = store
                .get(index)
                .cloned()
                .ok_or_else(|| format!("No rule at index {index}"))?;

            if let Some(port) = port {
                rule.port = Some(parse_port(&port).ok_or_else(|| format!("Invalid port '{port}'"))?);
            }
            if let Some(protocol) = protocol {
                rule.protocol = Some(parse_protocol(&protocol)?);
            }
            if let Some(name) = name {
                rule.name = name;
            }
            if active {
                rule.active = true;
            } else if inactive {
                rule.active = false;
            }

            println!("Updated [{index}] {rule}");
            store.apply_edit(RuleEdit::Update(index, rule));
            save_store(&store, &path, audit_enabled).await?;
        }
        Commands::Remove { index } => {
            let mut store = load_store(&path, audit_enabled).await?;
            let removed = engine
                .remove_rule(&mut store, index)
                .await?
                .ok_or_else(|| format!("No rule at index {index}"))?;

            match &removed.outcome {
                Some(outcome) => {
                    println!("  {outcome}");
                    if let Some(error) = outcome.error() {
                        print_error_help(error);
                    }
                }
                None => println!("  incomplete rule, nothing to close on the gateway"),
            }
            println!("Removed [{index}] {}", removed.rule);

            audit::log_remove(
                audit_enabled,
                removed.outcome.as_ref().map(|o| o.key().to_string()),
                removed
                    .outcome
                    .as_ref()
                    .and_then(|o| o.error())
                    .map(ToString::to_string),
            )
            .await;
            save_store(&store, &path, audit_enabled).await?;
        }
        // Answered before a rule file is resolved
        Commands::History { .. } => {}
    }

    if app_config.last_rules_file.as_deref() != Some(path.as_path()) {
        app_config.last_rules_file = Some(path);
        if let Err(e) = config::save_config(&app_config).await {
            tracing::warn!("Failed to remember rule file: {e}");
        }
    }

    Ok(())
}
