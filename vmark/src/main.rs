use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vmark_lib::forwarding::{RuleEngine, RuleParams, ShowFilter, ShowOutput, SnapshotStore};
use vmark_lib::twamp::{
    Responder, ResponderConfig, Sender, SenderConfig, SessionReport, SocketOptions,
};
use vmark_lib::{paths, NodeError, Result};

#[derive(Parser, Debug)]
#[command(version, about = "vmark-node: software Ethernet demarcation device")]
struct Cli {
    /// Path of the forwarding-rule snapshot (defaults to the user config
    /// directory)
    #[arg(long, value_name = "FILE", global = true)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage transparent L2 forwarding rules
    Rule {
        #[command(subcommand)]
        command: RuleCommand,
    },
    /// Run TWAMP Light measurement sessions
    Twamp {
        #[command(subcommand)]
        command: TwampCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RuleCommand {
    /// Create a rule (inactive unless --enable is given)
    Create(CreateArgs),
    /// Delete a disabled rule and its inverse
    Delete { name: String },
    /// Enable a rule and program the data plane
    Enable { name: String },
    /// Disable a rule and withdraw its map entries
    Disable { name: String },
    /// Show rules; filter: json | simple | <name> | egress-<name>
    Show { filter: Option<String> },
}

#[derive(Args, Debug)]
struct CreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long = "in-interface", value_name = "IFACE")]
    in_interface: String,
    #[arg(long, value_name = "1-4094")]
    svlan: Option<u16>,
    #[arg(long, value_name = "1-4094")]
    cvlan: Option<u16>,
    #[arg(long = "out-interface", value_name = "IFACE")]
    out_interface: String,
    #[arg(long = "pop-tags", default_value_t = 0, value_name = "0-2")]
    pop_tags: u8,
    #[arg(long = "push-svlan", value_name = "1-4094")]
    push_svlan: Option<u16>,
    #[arg(long = "push-cvlan", value_name = "1-4094")]
    push_cvlan: Option<u16>,
    /// Activate immediately instead of creating the rule disabled
    #[arg(long)]
    enable: bool,
    /// Permit in-interface == out-interface (hairpin)
    #[arg(long = "allow-same-interface")]
    allow_same_interface: bool,
}

#[derive(Subcommand, Debug)]
enum TwampCommand {
    /// Reflect test packets until interrupted
    Responder(ResponderArgs),
    /// Send a paced test stream and report delay, jitter and loss
    Sender(SenderArgs),
}

#[derive(Args, Debug)]
struct ResponderArgs {
    #[arg(long, value_name = "1-65535")]
    port: u16,
    /// Bind an IPv6 wildcard socket instead of IPv4
    #[arg(long)]
    ipv6: bool,
    #[arg(long, default_value_t = 0, value_name = "0-9000")]
    padding: usize,
    #[arg(long, default_value_t = 64, value_name = "1-255")]
    ttl: u8,
    #[arg(long, default_value_t = 0, value_name = "0-255")]
    tos: u8,
    /// Set DF on outgoing packets (IPv4 only)
    #[arg(long = "do-not-fragment")]
    do_not_fragment: bool,
}

#[derive(Args, Debug)]
struct SenderArgs {
    #[arg(long = "destination-ip", value_name = "ADDR")]
    destination_ip: IpAddr,
    #[arg(long, value_name = "1-65535")]
    port: u16,
    #[arg(long, default_value_t = 100, value_name = "1-9999")]
    count: u32,
    /// Inter-packet interval in milliseconds
    #[arg(long, default_value_t = 100, value_name = "10-1000")]
    interval: u64,
    #[arg(long, default_value_t = 0, value_name = "0-9000")]
    padding: usize,
    #[arg(long, default_value_t = 64, value_name = "1-255")]
    ttl: u8,
    #[arg(long, default_value_t = 0, value_name = "0-255")]
    tos: u8,
    /// Set DF on outgoing packets (IPv4 only)
    #[arg(long = "do-not-fragment")]
    do_not_fragment: bool,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[cfg(all(feature = "xdp", target_os = "linux"))]
type ActiveDataplane = vmark_ebpf::XdpDataplane;
#[cfg(not(all(feature = "xdp", target_os = "linux")))]
type ActiveDataplane = vmark_lib::MemoryDataplane;

#[cfg(all(feature = "xdp", target_os = "linux"))]
fn build_dataplane() -> Result<ActiveDataplane> {
    vmark_ebpf::XdpDataplane::from_env()
}

#[cfg(not(all(feature = "xdp", target_os = "linux")))]
fn build_dataplane() -> Result<ActiveDataplane> {
    info!("built without XDP support; forwarding state is simulated in-memory");
    Ok(vmark_lib::MemoryDataplane::permissive())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(err) = dispatch(cli).await {
        error!(%err, "command failed");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Rule { command } => run_rule(cli.state_file, command),
        Commands::Twamp { command } => run_twamp(command).await,
    }
}

fn build_engine(state_file: Option<PathBuf>) -> Result<RuleEngine<ActiveDataplane>> {
    let path = match state_file {
        Some(path) => path,
        None => paths::rules_snapshot()?,
    };
    let engine = RuleEngine::new(SnapshotStore::new(path), build_dataplane()?);
    let report = engine.startup()?;
    for skipped in &report.skipped {
        info!(rule = %skipped.name, reason = %skipped.reason, "rule not applied");
    }
    Ok(engine)
}

fn run_rule(state_file: Option<PathBuf>, command: RuleCommand) -> Result<()> {
    let engine = build_engine(state_file)?;
    match command {
        RuleCommand::Create(args) => {
            let summary = engine.create_rule(RuleParams {
                name: args.name,
                in_interface: args.in_interface,
                svlan: args.svlan,
                cvlan: args.cvlan,
                out_interface: args.out_interface,
                pop_tags: args.pop_tags,
                push_svlan: args.push_svlan,
                push_cvlan: args.push_cvlan,
                active: args.enable,
                allow_same_interface: args.allow_same_interface,
            })?;
            println!(
                "rule '{}' created ({})",
                summary.name,
                if summary.active { "enabled" } else { "disabled" }
            );
        }
        RuleCommand::Delete { name } => {
            engine.delete_rule(&name)?;
            println!("rule '{name}' deleted");
        }
        RuleCommand::Enable { name } => {
            let summary = engine.enable_rule(&name)?;
            println!(
                "rule '{}' enabled{}",
                summary.name,
                if summary.applied { "" } else { " (not applied: interface missing)" }
            );
        }
        RuleCommand::Disable { name } => {
            engine.disable_rule(&name)?;
            println!("rule '{name}' disabled");
        }
        RuleCommand::Show { filter } => {
            let output = engine.show_forwarding(&ShowFilter::parse(filter.as_deref()))?;
            print_show(&output)?;
        }
    }
    Ok(())
}

fn print_show(output: &ShowOutput) -> Result<()> {
    match output {
        ShowOutput::Json(value) => {
            let text = serde_json::to_string_pretty(value)
                .map_err(|e| NodeError::Persistence(format!("render json: {e}")))?;
            println!("{text}");
        }
        ShowOutput::Brief(rows) => {
            for row in rows {
                println!(
                    "{:<32} {:<8} {}",
                    row.name,
                    if row.active { "enabled" } else { "disabled" },
                    if row.applied { "applied" } else { "-" }
                );
            }
        }
        ShowOutput::Rules(views) => {
            for view in views {
                let rule = &view.rule;
                println!(
                    "{:<32} in={} svlan={} cvlan={} out={} pop={} push_svlan={} push_cvlan={} {} {}",
                    rule.name,
                    rule.in_interface,
                    opt(rule.svlan),
                    opt(rule.cvlan),
                    rule.out_interface,
                    rule.pop_tags,
                    opt(rule.push_svlan),
                    opt(rule.push_cvlan),
                    if rule.active { "enabled" } else { "disabled" },
                    if view.applied { "applied" } else { "-" }
                );
            }
        }
    }
    Ok(())
}

fn opt(value: Option<u16>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

async fn run_twamp(command: TwampCommand) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    match command {
        TwampCommand::Responder(args) => {
            let config = ResponderConfig {
                port: args.port,
                ipv6: args.ipv6,
                padding: args.padding,
                socket: SocketOptions { ttl: args.ttl, tos: args.tos, df: args.do_not_fragment },
            };
            let responder = Responder::bind(&config)?;
            let reflected = responder.run(&mut shutdown_rx).await?;
            println!("reflected {reflected} packet(s)");
        }
        TwampCommand::Sender(args) => {
            let config = SenderConfig {
                destination: args.destination_ip,
                port: args.port,
                count: args.count,
                interval: Duration::from_millis(args.interval),
                padding: args.padding,
                socket: SocketOptions { ttl: args.ttl, tos: args.tos, df: args.do_not_fragment },
            };
            let report = Sender::new(config)?.run(&mut shutdown_rx).await?;
            if args.json {
                let text = serde_json::to_string_pretty(&report)
                    .map_err(|e| NodeError::Persistence(format!("render json: {e}")))?;
                println!("{text}");
            } else {
                print_report(&report);
            }
        }
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    println!(
        "sent {}  matched {}  lost {}  loss {:.1}%{}",
        report.sent,
        report.matched,
        report.lost,
        report.loss_pct,
        if report.canceled { "  (canceled, partial)" } else { "" }
    );
    for (label, stats) in [
        ("outbound", &report.outbound),
        ("inbound", &report.inbound),
        ("round-trip", &report.roundtrip),
    ] {
        match stats {
            Some(stats) => println!(
                "{label:<10} min {}  avg {}  max {}  jitter {}",
                fmt_ms(stats.min_ns),
                fmt_ms(stats.avg_ns),
                fmt_ms(stats.max_ns),
                fmt_ms(stats.jitter_ns)
            ),
            None => println!("{label:<10} no samples"),
        }
    }
}

fn fmt_ms(ns: i64) -> String {
    format!("{:.3}ms", ns as f64 / 1e6)
}
