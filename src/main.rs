use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hosthawk_rs::config::ScanConfig;
use hosthawk_rs::dns::{self, DEFAULT_RECORD_TYPES};
use hosthawk_rs::logging::{init_logging, LogConfig, LogFormat};
use hosthawk_rs::targets::load_ports_file;
use hosthawk_rs::types::{Hop, OsFingerprint};
use hosthawk_rs::{
    expand_ports, expand_targets, fingerprint_os, netdetect, server, traceroute, PhaseEnd, ProbeOutcome, Protocol,
    ScanError, ScanMode, ScanSession,
};

/// hosthawk-rs: concurrent host discovery, port probing, banner capture and OS estimation.
#[derive(Debug, Parser)]
#[command(name = "hosthawk-rs", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Worker count per scan phase.
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Per-probe timeout in milliseconds.
    #[arg(long = "timeout-ms", global = true)]
    timeout_ms: Option<u64>,

    /// JSON config file (defaults to ~/.hosthawk/config.json when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON instead of a table.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    /// Debug logging.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Log format: pretty, compact or json.
    #[arg(long = "log-format", global = true, default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Find live hosts, then optionally scan their ports.
    Discover {
        /// CIDR to sweep. If omitted, the local IPv4 /24 networks are used.
        #[arg(long)]
        network: Option<String>,
        /// Use ARP instead of ICMP echo (local segment only).
        #[arg(long, default_value_t = false)]
        arp: bool,
        /// Send ARP requests on this interface.
        #[arg(long, requires = "arp")]
        interface: Option<String>,
        /// Port expression to TCP-scan on every live host.
        #[arg(long, conflicts_with = "ports_file")]
        ports: Option<String>,
        /// File with one port expression per line; `#` starts a comment.
        #[arg(long = "ports-file")]
        ports_file: Option<PathBuf>,
    },
    /// Scan ports on one host.
    Scan {
        #[arg(long)]
        host: IpAddr,
        #[arg(long, default_value = "1-1024")]
        ports: String,
        /// Read the port list from a file instead of `--ports`.
        #[arg(long = "ports-file", conflicts_with = "ports")]
        ports_file: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = TransportArg::Tcp)]
        protocol: TransportArg,
        #[arg(long = "scan-type", value_enum, default_value_t = ScanTypeArg::Connect)]
        scan_type: ScanTypeArg,
        /// Capture service banners on open TCP ports.
        #[arg(long, default_value_t = false)]
        banners: bool,
        /// Estimate the OS from ICMP reply TTLs.
        #[arg(long, default_value_t = false)]
        os: bool,
    },
    /// Trace the route to a host.
    Trace {
        #[arg(long)]
        host: IpAddr,
        #[arg(long = "max-hops")]
        max_hops: Option<usize>,
    },
    /// Look up DNS records and attempt a zone transfer.
    Dns {
        #[arg(long)]
        domain: String,
        /// Comma-separated record types, e.g. A,MX,TXT.
        #[arg(long)]
        types: Option<String>,
    },
    /// Serve the scan session API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Tcp,
    Udp,
}

impl From<TransportArg> for Protocol {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Tcp => Protocol::Tcp,
            TransportArg::Udp => Protocol::Udp,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScanTypeArg {
    Connect,
    Syn,
}

impl From<ScanTypeArg> for ScanMode {
    fn from(arg: ScanTypeArg) -> Self {
        match arg {
            ScanTypeArg::Connect => ScanMode::Connect,
            ScanTypeArg::Syn => ScanMode::Syn,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ScanConfig::load(cli.config.as_deref())?;
    if let Some(threads) = cli.threads {
        config.concurrency = threads;
    }
    if let Some(ms) = cli.timeout_ms {
        config.timeout_ms = ms;
    }
    init_logging(
        LogConfig::default()
            .level(config.log_level.clone())
            .format(cli.log_format)
            .verbose(cli.verbose),
    );
    config.validate()?;

    match cli.command {
        Command::Discover {
            network,
            arp,
            interface,
            ports,
            ports_file,
        } => {
            let ports = match (ports, ports_file) {
                (_, Some(path)) => Some(load_ports_file(&path)?),
                (Some(expr), None) => Some(expand_ports(&expr)?),
                (None, None) => None,
            };
            let method = if arp { Protocol::Arp } else { Protocol::Icmp };
            discover(&config, network, method, interface, ports, cli.json).await
        }
        Command::Scan {
            host,
            ports,
            ports_file,
            protocol,
            scan_type,
            banners,
            os,
        } => {
            let ports = match ports_file {
                Some(path) => load_ports_file(&path)?,
                None => expand_ports(&ports)?,
            };
            let request = ScanArgs {
                host,
                ports,
                protocol: protocol.into(),
                mode: scan_type.into(),
                banners,
                os,
            };
            scan(&config, request, cli.json).await
        }
        Command::Trace { host, max_hops } => {
            let hops = traceroute(host, max_hops.unwrap_or(config.max_hops), config.probe_timeout()).await?;
            if cli.json {
                print_json(&hops)
            } else {
                print_hops(&hops);
                Ok(())
            }
        }
        Command::Dns { domain, types } => {
            let types = match types {
                Some(list) => dns::parse_record_types(&list)?,
                None => DEFAULT_RECORD_TYPES.to_vec(),
            };
            let report = dns::dns_lookup(&domain, &types, config.probe_timeout()).await?;
            if cli.json {
                print_json(&report)
            } else {
                print_dns(&report);
                Ok(())
            }
        }
        Command::Serve { bind } => server::serve(&bind, config).await,
    }
}

/// A session whose token is cancelled by Ctrl-C.
fn interactive_session(config: &ScanConfig, quiet: bool) -> Result<ScanSession> {
    let mut session = ScanSession::from_config(config)?;
    if !quiet {
        session = session.with_progress(Arc::new(|done: usize, total: usize, _desc: &str| {
            eprint!("\r  {done}/{total}");
            if done == total {
                eprintln!();
            }
        }));
    }
    cancel_on_ctrl_c(session.cancel_token());
    Ok(session)
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; finishing in-flight probes");
            token.cancel();
        }
    });
}

async fn discover(
    config: &ScanConfig,
    network: Option<String>,
    method: Protocol,
    interface: Option<String>,
    ports: Option<Vec<u16>>,
    json: bool,
) -> Result<()> {
    let networks = match network {
        Some(n) => vec![n],
        None => {
            let cidrs = netdetect::detect_local_cidrs().context("failed to detect local networks")?;
            if cidrs.is_empty() {
                bail!("no local IPv4 network found; pass --network");
            }
            cidrs.iter().map(ToString::to_string).collect()
        }
    };
    let mut hosts = Vec::new();
    for n in &networks {
        hosts.extend(expand_targets(n)?);
    }
    info!(networks = ?networks, hosts = hosts.len(), %method, "host discovery");

    let mut session = interactive_session(config, json)?;
    if let Some(name) = interface {
        session = session.with_interface(name);
    }
    let outcome = run_discovery(&mut session, hosts, method, ports.as_deref(), config).await;
    report(&session, json)?;
    outcome
}

async fn run_discovery(
    session: &mut ScanSession,
    hosts: Vec<IpAddr>,
    method: Protocol,
    ports: Option<&[u16]>,
    config: &ScanConfig,
) -> Result<()> {
    let live = session.discover_hosts(hosts, method).await?;
    info!(live = live.len(), "discovery finished");
    let Some(ports) = ports else {
        return Ok(());
    };
    let banners = config.enable_service_detection.then(|| config.banner());
    for host in live {
        if session.scan_ports(host, ports, Protocol::Tcp, ScanMode::Connect, banners).await? != PhaseEnd::Completed {
            break;
        }
    }
    Ok(())
}

struct ScanArgs {
    host: IpAddr,
    ports: Vec<u16>,
    protocol: Protocol,
    mode: ScanMode,
    banners: bool,
    os: bool,
}

async fn scan(config: &ScanConfig, args: ScanArgs, json: bool) -> Result<()> {
    let banners = (args.banners && args.protocol == Protocol::Tcp).then(|| config.banner());
    let mut session = interactive_session(config, json)?;
    let scanned = session
        .scan_ports(args.host, &args.ports, args.protocol, args.mode, banners)
        .await;

    let os = if args.os && config.enable_os_detection && !session.is_cancelled() {
        match fingerprint_os(args.host, config.probe_timeout()).await {
            Ok(fp) => Some(fp),
            Err(e @ (ScanError::Permission { .. } | ScanError::Unsupported { .. })) => {
                warn!(error = %e, "os fingerprint skipped");
                None
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        None
    };

    if json {
        #[derive(Serialize)]
        struct Out<'a> {
            results: Vec<ProbeOutcome>,
            #[serde(skip_serializing_if = "Option::is_none")]
            os: Option<&'a OsFingerprint>,
        }
        print_json(&Out {
            results: session.sorted_results(),
            os: os.as_ref(),
        })?;
    } else {
        report(&session, false)?;
        if let Some(fp) = &os {
            match fp.sampled_ttl {
                Some(ttl) => println!("OS estimate: {} (ttl {ttl})", fp.label),
                None => println!("OS estimate: {}", fp.label),
            }
        }
    }
    scanned.map(|_| ()).map_err(Into::into)
}

fn report(session: &ScanSession, json: bool) -> Result<()> {
    let results = session.sorted_results();
    if json {
        return print_json(&results);
    }
    print_results_table(&results);
    let summary: Vec<String> = session.summary().iter().map(|(s, n)| format!("{s}: {n}")).collect();
    println!("Summary: {}", if summary.is_empty() { "-".to_string() } else { summary.join(", ") });
    if let Some(end) = session.last_end().filter(|e| *e != PhaseEnd::Completed) {
        println!("Scan {}; results are partial.", end.as_str());
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_results_table(results: &[ProbeOutcome]) {
    let rows: Vec<[String; 5]> = results
        .iter()
        .map(|o| {
            let mut detail = o
                .banner
                .as_ref()
                .map(|b| b.to_display_string())
                .or_else(|| o.peer_mac.clone())
                .unwrap_or_default();
            if detail.len() > 60 {
                let cut = (0..=60).rev().find(|&i| detail.is_char_boundary(i)).unwrap_or(0);
                detail.truncate(cut);
            }
            [
                o.unit.ip().to_string(),
                o.unit.port().map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                format!("{}/{}", o.protocol, o.state),
                o.round_trip_time
                    .map(|d| d.as_millis().to_string())
                    .unwrap_or_else(|| "-".into()),
                detail,
            ]
        })
        .collect();

    let headers = ["ip", "port", "state", "rtt_ms", "detail"];
    let mut widths = headers.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    println!("\nResults: {}", results.len());
    println!(
        "{:<w0$}  {:>w1$}  {:<w2$}  {:>w3$}  {:<w4$}",
        headers[0],
        headers[1],
        headers[2],
        headers[3],
        headers[4],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3],
        w4 = widths[4]
    );
    println!(
        "{:-<w0$}  {:-<w1$}  {:-<w2$}  {:-<w3$}  {:-<w4$}",
        "",
        "",
        "",
        "",
        "",
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3],
        w4 = widths[4]
    );
    for row in &rows {
        println!(
            "{:<w0$}  {:>w1$}  {:<w2$}  {:>w3$}  {:<w4$}",
            row[0],
            row[1],
            row[2],
            row[3],
            row[4],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3],
            w4 = widths[4]
        );
    }
}

fn print_hops(hops: &[Hop]) {
    if hops.is_empty() {
        println!("No hop answered.");
        return;
    }
    for hop in hops {
        println!("{:>3}  {:<39}  {:>6.1} ms", hop.ttl, hop.address, hop.rtt.as_secs_f64() * 1000.0);
    }
}

fn print_dns(report: &dns::DnsReport) {
    for (record_type, answers) in &report.records {
        if answers.is_empty() {
            println!("{record_type:<6} -");
        }
        for answer in answers {
            println!("{record_type:<6} {answer}");
        }
    }
    match &report.zone_transfer {
        Some(xfr) => {
            println!("\nZone transfer from {} ({} records):", xfr.nameserver, xfr.records.len());
            for record in &xfr.records {
                println!("  {record}");
            }
        }
        None => println!("\nZone transfer: not permitted"),
    }
}
