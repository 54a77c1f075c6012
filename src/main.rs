//! Trellis - peer-to-peer VPN capture engine and provider node

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use trellis::capture::Capture;
use trellis::config::Config;
use trellis::error::{Error, Result};
use trellis::node::{egress::Drain, Negotiator, Node, TlsIdentity};
use trellis::origin::Local;
use trellis::{analysis, tun};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    // Load configuration: defaults, then the JSON file, then key=value
    // overlays from TRELLIS_CONFIG and the command line.
    let mut config = if let Some(path) = &args.config {
        Config::load(path)?
    } else {
        Config::default()
    };
    if let Ok(path) = std::env::var("TRELLIS_CONFIG") {
        config.overlay_file(path)?;
    }
    for (key, value) in &args.settings {
        config.set(key, value)?;
    }

    info!("trellis v{} starting...", env!("CARGO_PKG_VERSION"));

    // The packet path assumes one cooperative scheduler.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match args.mode {
        Mode::Serve => runtime.block_on(serve(config)),
        Mode::Capture => runtime.block_on(capture(config)),
    }
}

/// Run the provider node: TLS signalling endpoint plus egress wiring.
async fn serve(config: Config) -> Result<()> {
    let tls = load_tls(&config)?;
    if config.dh.is_some() {
        info!("dh parameters are not consumed by the TLS stack, ignoring");
    }

    let egress = Arc::new(Drain::new());
    if let Some(ovpn) = &config.ovpn_file {
        // The OpenVPN session itself is provided by an external stack.
        warn!(
            "upstream {} configured, but no OpenVPN stack is linked in; egress will drain",
            ovpn.display()
        );
    }

    let node = Arc::new(Node::new(
        vec![config.stun.clone()],
        &config.rpc,
        config.eth_lottery.clone(),
        Arc::new(UnwiredNegotiator),
        egress,
    )?);

    info!(
        "tls = https://{}:{}{}",
        config.advertised_host(),
        config.port,
        config.path
    );

    node.run(config.port, config.path.clone(), tls).await
}

/// Run the capture engine against the local origin.
async fn capture(config: Config) -> Result<()> {
    let logger = analysis::Logger::open(config.journal_path())?;

    let tun_config = tun::TunConfig {
        address: config.address,
        ..Default::default()
    };
    let (reader, writer) = tun::create(&tun_config)?;

    let capture = Capture::start(
        Arc::new(writer),
        logger,
        Arc::new(Local::new()),
        config.address,
    )
    .await?;
    info!("capturing on {} via {:?}", config.address, capture.local());

    tun::run(reader, capture).await;
    Ok(())
}

/// Placeholder negotiator used until a WebRTC stack is wired in; every
/// offer is refused, which surfaces to peers as a 404.
struct UnwiredNegotiator;

#[async_trait::async_trait]
impl Negotiator for UnwiredNegotiator {
    async fn respond(&self, _offer: &str, _ice: &[String]) -> Result<String> {
        Err(Error::Signalling("no negotiator wired".into()))
    }
}

/// Load the PEM bundle holding the private key and certificate chain.
fn load_tls(config: &Config) -> Result<TlsIdentity> {
    let path = config
        .tls
        .as_ref()
        .ok_or_else(|| Error::Config("serving requires --tls <pem bundle>".into()))?;
    let bundle = std::fs::read_to_string(path)
        .map_err(|error| Error::Config(format!("failed to read {}: {}", path.display(), error)))?;
    Ok(TlsIdentity {
        key: bundle.clone(),
        chain: bundle,
    })
}

/// Which program to run.
enum Mode {
    Serve,
    Capture,
}

/// Command line arguments
struct Args {
    mode: Mode,
    config: Option<PathBuf>,
    settings: Vec<(String, String)>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut mode = Mode::Serve;
        let mut config = None;
        let mut settings = Vec::new();
        let mut version = false;

        let mut index = 1;
        while index < args.len() {
            match args[index].as_str() {
                "serve" => mode = Mode::Serve,
                "capture" => mode = Mode::Capture,
                "-c" | "--config" => {
                    if index + 1 < args.len() {
                        config = Some(PathBuf::from(&args[index + 1]));
                        index += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                option if option.starts_with("--") => {
                    if index + 1 < args.len() {
                        settings.push((option[2..].to_string(), args[index + 1].clone()));
                        index += 1;
                    }
                }
                _ => {}
            }
            index += 1;
        }

        Self {
            mode,
            config,
            settings,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Trellis - peer-to-peer VPN capture engine and provider node

USAGE:
    trellis [serve|capture] [OPTIONS]

MODES:
    serve                   Run the provider node (default)
    capture                 Run the client capture engine

OPTIONS:
    -c, --config <FILE>     Path to a JSON configuration file
    --<option> <VALUE>      Set one option (see below)
    -v, --version           Print version information
    -h, --help              Print help information

SERVER OPTIONS:
    --dh <FILE>             Diffie-Hellman parameters (pem encoded)
    --rpc <URL>             Ethereum JSON-RPC endpoint [http://127.0.0.1:8545/]
    --eth-lottery <ADDR>    Lottery contract address
    --stun <URL>            STUN server url [stun:stun.l.google.com:19302]
    --host <NAME>           Hostname to advertise [system hostname]
    --port <PORT>           TLS listen port [8443]
    --path <PATH>           Signalling POST path [/]
    --tls <FILE>            TLS key and chain (pem bundle)
    --ovpn-file <FILE>      Upstream OpenVPN configuration
    --ovpn-user <USER>      OpenVPN credential (username)
    --ovpn-pass <PASS>      OpenVPN credential (password)

CAPTURE OPTIONS:
    --group <DIR>           Data directory for the flow journal [.]
    --address <IP>          Capture address on the tun interface

ENVIRONMENT:
    TRELLIS_CONFIG          Additional key=value configuration file
"#
    );
}

fn print_version() {
    println!("trellis v{}", env!("CARGO_PKG_VERSION"));
}
