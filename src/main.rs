use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal,
};
use natprobe::nat_probe::{
    DetectorConfig, DnsResolver, HelloSender, ListenEvent, MappingListener, NatClassification,
    NatDetector, StunServer, UdpTransport, DEFAULT_LOCAL_PORT, DEFAULT_STUN_SERVERS,
};
use std::{
    io::{self, Write},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "natprobe", version, about = "Detect NAT mapping behaviour with STUN")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare the public port seen by several STUN servers
    Detect {
        /// STUN servers, host[:port], probed in order
        #[arg(long, env = "STUN_SERVERS", value_delimiter = ',', default_values = DEFAULT_STUN_SERVERS)]
        servers: Vec<StunServer>,

        /// Fixed local UDP port shared by every probe
        #[arg(long, env = "LOCAL_PORT", default_value_t = DEFAULT_LOCAL_PORT)]
        local_port: u16,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Query one STUN server for the public address of the local port
    Probe {
        /// STUN server, host[:port]
        server: StunServer,

        #[arg(long, env = "LOCAL_PORT", default_value_t = DEFAULT_LOCAL_PORT)]
        local_port: u16,
    },
    /// Keep the mapping alive and print every datagram that arrives
    Listen {
        #[arg(long, env = "STUN_SERVER", default_value = DEFAULT_STUN_SERVERS[0])]
        server: StunServer,

        #[arg(long, env = "LOCAL_PORT", default_value_t = DEFAULT_LOCAL_PORT)]
        local_port: u16,

        /// Seconds between STUN refreshes
        #[arg(long, default_value_t = 25)]
        keepalive: u64,
    },
    /// Send HELLO datagrams to a peer's public address (ESC or q to stop)
    Hello {
        /// Peer public address, ip:port
        target: SocketAddr,

        /// Name put into each hello
        #[arg(long, default_value = "OLD")]
        label: String,

        /// Stop after this many hellos
        #[arg(long)]
        count: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command {
        Command::Detect {
            servers,
            local_port,
            json,
        } => runtime.block_on(run_detect(servers, local_port, json)),
        Command::Probe { server, local_port } => runtime.block_on(run_probe(server, local_port)),
        Command::Listen {
            server,
            local_port,
            keepalive,
        } => runtime.block_on(run_listen(server, local_port, Duration::from_secs(keepalive))),
        Command::Hello {
            target,
            label,
            count,
        } => runtime.block_on(run_hello(target, label, count)),
    }
}

/// Console output is printed directly, tracing only carries diagnostics
fn init_logging(verbose: bool) {
    let default = if verbose { "natprobe=debug" } else { "natprobe=warn" };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Two-server NAT mapping detection
async fn run_detect(servers: Vec<StunServer>, local_port: u16, json: bool) -> Result<()> {
    let config = DetectorConfig {
        servers,
        local_port,
        ..DetectorConfig::default()
    };

    if !json {
        println!("╔══════════════════════════════════════════════════════════╗");
        println!("║         natprobe - NAT Mapping Detection                 ║");
        println!("╚══════════════════════════════════════════════════════════╝");
        println!();
        println!("Configuration:");
        println!("  Local Port : {} (0x{:04x})", config.local_port, config.local_port);
        for server in &config.servers {
            println!("  STUN Server: {}", server);
        }
        println!();

        if config.servers.len() < 2 {
            println!("⚠️  At least two servers are needed for a verdict.");
            println!();
        }

        println!("🔍 Probing servers one by one...");
        println!();
    }

    let detector = NatDetector::new(config);
    let report = detector.detect().await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
        return Ok(());
    }

    for result in &report.results {
        println!("Testing {}:{} ...", result.server_host, result.server_port);
        match &result.outcome {
            Ok(mapped) => println!("  Public address: {}", mapped),
            Err(e) => println!("  Failed: {}", e),
        }
    }

    println!();
    println!("=== Result ===");
    match report.classification {
        NatClassification::EndpointIndependent => {
            println!("✅ Same public port → {}", report.classification)
        }
        NatClassification::EndpointDependent => {
            println!("❌ Different public ports → {}", report.classification)
        }
        NatClassification::Incomplete => println!("⚠️  {}", report.classification),
    }
    println!("   {}", report.classification.outlook());

    if report.public_ips_differ() {
        println!();
        println!("⚠️  Servers saw different public IPs; the host may have several egress paths.");
    }

    Ok(())
}

/// Single server public address lookup
async fn run_probe(server: StunServer, local_port: u16) -> Result<()> {
    let config = DetectorConfig {
        local_port,
        ..DetectorConfig::default()
    };

    println!("Querying {} from local port {}...", server, local_port);

    let detector = NatDetector::new(config);
    let result = detector.probe_once(&server).await?;

    match &result.outcome {
        Ok(mapped) => {
            println!();
            println!("✅ Public address discovered");
            println!("  IP     : {}", mapped.ip);
            println!("  Port   : {}", mapped.port);
            println!("  Address: {}", mapped);
        }
        Err(e) => {
            println!();
            println!("❌ Could not get the public address: {}", e);
            println!();
            println!("Things to try:");
            println!("  1. Check that the network connection works");
            println!("  2. Use another STUN server, for example:");
            println!("     - stun.l.google.com:19302");
            println!("     - stun.stunprotocol.org:3478");
            println!("     - stun.voipbuster.com:3478");
            println!("  3. Check that a local firewall does not drop UDP");
            println!("  4. If DNS works but the request times out, retry or pick another server");
        }
    }

    Ok(())
}

/// Hole punching receiver: hold the mapping open and show incoming datagrams
async fn run_listen(server: StunServer, local_port: u16, keepalive: Duration) -> Result<()> {
    let transport = UdpTransport::bind(local_port)
        .await
        .with_context(|| format!("Failed to bind UDP port {}", local_port))?;

    println!("Local port bound: {}", local_port);
    println!("Discovering public address via {}...", server);

    let resolver = DnsResolver;
    let listener = MappingListener::start(transport, &resolver, server, DetectorConfig::default().response_timeout)
        .await
        .context("Could not discover the public address")?
        .with_keepalive(keepalive);

    println!("✅ Public address: {}", listener.external());
    println!("Listening for peer datagrams (Ctrl+C to stop)...");
    println!();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    listener
        .run(
            |event| match event {
                ListenEvent::MappingChanged { old, new } => {
                    println!("⚠️  Public address changed: {} → {}", old, new)
                }
                ListenEvent::MappingRefreshed(_) => println!("STUN refresh ok, address unchanged"),
                ListenEvent::LateStunResponse { from } => {
                    println!("Late STUN response from {} ignored", from)
                }
                ListenEvent::InvalidStunResponse { from, error } => {
                    println!("Invalid STUN response from {}: {}", from, error)
                }
                ListenEvent::PeerDatagram { from, text } => println!("📨 {} : {}", from, text),
                ListenEvent::RefreshFailed { reason } => println!("⚠️  STUN refresh failed: {}", reason),
            },
            shutdown,
        )
        .await
        .context("Failed to close listener")?;

    println!();
    println!("Stopped.");
    Ok(())
}

/// Hole punching sender
async fn run_hello(target: SocketAddr, label: String, count: Option<u64>) -> Result<()> {
    let transport = UdpTransport::bind(0)
        .await
        .context("Failed to bind UDP socket")?;

    println!("Target address: {}", target);
    println!("Sending HELLO... (press ESC or 'q' to quit)");

    let stop = Arc::new(AtomicBool::new(false));
    let (quit_tx, quit_rx) = tokio::sync::oneshot::channel::<()>();
    let watcher_stop = stop.clone();

    // Raw mode lets single key presses through without Enter
    let watcher = thread::spawn(move || {
        match terminal::enable_raw_mode() {
            Ok(()) => {
                if let Err(e) = wait_for_quit_key(&watcher_stop) {
                    tracing::warn!(error = %e, "Terminal key watcher failed");
                }
                if let Err(e) = terminal::disable_raw_mode() {
                    tracing::warn!(error = %e, "Failed to leave raw mode");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "No terminal, stop with --count or Ctrl+C");
                while !watcher_stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
        let _ = quit_tx.send(());
    });

    let sender = HelloSender::new(transport, target, label);
    let sent = sender
        .run(
            count,
            |result| {
                match result {
                    Ok(message) => print!("Sent: {}\r\n", message),
                    Err(e) => print!("Send error: {}\r\n", e),
                }
                let _ = io::stdout().flush();
            },
            async {
                let _ = quit_rx.await;
            },
        )
        .await;

    // Raw mode is restored before any error returns
    stop_key_watcher(&stop, watcher);
    let sent = sent.context("Failed to close socket")?;

    println!();
    println!("Done, {} hello(s) sent.", sent);
    Ok(())
}

/// Signal the key watcher and wait until it has left raw mode
fn stop_key_watcher(stop: &AtomicBool, watcher: thread::JoinHandle<()>) {
    stop.store(true, Ordering::SeqCst);
    if watcher.join().is_err() {
        tracing::warn!("Terminal key watcher panicked");
    }
}

/// Block until ESC, q or Ctrl+C is pressed, or `stop` is set
fn wait_for_quit_key(stop: &AtomicBool) -> io::Result<()> {
    while !stop.load(Ordering::SeqCst) {
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(k) = event::read()? {
                match k.code {
                    KeyCode::Esc | KeyCode::Char('q') | KeyCode::Char('Q') => return Ok(()),
                    KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => {
                        return Ok(())
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
