//! rtp-manager - RTP/RTCP session tool
//!
//! Binds RTP/RTCP port pairs and runs local media loopbacks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtp_manager::transport::stun::DEFAULT_STUN_SERVER;
use rtp_manager::{CryptoSuite, NatContext, RtpPacket, Session, SessionConfig, SrtpEngine};

/// 20ms of PCMU at 8kHz.
const FRAME_SAMPLES: u32 = 160;
const FRAME_INTERVAL_MS: u64 = 20;
/// PCMU silence byte.
const PCMU_SILENCE: u8 = 0xFF;

#[derive(Parser)]
#[command(name = "rtp-manager")]
#[command(about = "RTP/RTCP session transport manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind an RTP/RTCP port pair and print it
    Ports {
        /// First port of the range
        #[arg(long)]
        start: Option<u16>,

        /// End of the range (exclusive)
        #[arg(long)]
        stop: Option<u16>,

        /// Bind RTP only
        #[arg(long)]
        no_rtcp: bool,

        /// Discover public addresses via STUN (uses the configured server
        /// or the default one)
        #[arg(long)]
        stun: bool,
    },

    /// Run two sessions on localhost and exchange PCMU silence frames
    Loopback {
        /// Number of frames each side sends
        #[arg(short, long, default_value = "50")]
        packets: u32,

        /// Encrypt with SRTP: 80 or 32 (auth tag bits)
        #[arg(long)]
        srtp: Option<u8>,
    },

    /// Show the effective configuration
    Config {
        /// Write the configuration file with current values
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &cli.config {
        Some(path) => SessionConfig::load_from(path)?,
        None => SessionConfig::load()?,
    };

    match cli.command {
        Commands::Ports {
            start,
            stop,
            no_rtcp,
            stun,
        } => {
            let mut config = config;
            if no_rtcp {
                config.rtcp_enabled = false;
            }
            run_ports(config, start, stop, stun).await?;
        }
        Commands::Loopback { packets, srtp } => {
            let suite = match srtp {
                None => None,
                Some(80) => Some(CryptoSuite::AesCm128HmacSha1_80),
                Some(32) => Some(CryptoSuite::AesCm128HmacSha1_32),
                Some(other) => anyhow::bail!("Unsupported SRTP tag size: {} (use 80 or 32)", other),
            };
            run_loopback(config, packets, suite).await?;
        }
        Commands::Config { init } => {
            if init {
                match &cli.config {
                    Some(path) => config.save_to(path)?,
                    None => config.save()?,
                }
                println!("Configuration written.");
            }
            print!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
        }
    }

    Ok(())
}

async fn run_ports(
    config: SessionConfig,
    start: Option<u16>,
    stop: Option<u16>,
    stun: bool,
) -> Result<()> {
    let session = Session::new(&config, None)?;
    let (cfg_start, cfg_stop) = session.port_range();
    session.set_port_range(start.unwrap_or(cfg_start), stop.unwrap_or(cfg_stop))?;
    session.prepare()?;

    if stun {
        let server = config
            .stun_server
            .clone()
            .unwrap_or_else(|| DEFAULT_STUN_SERVER.to_string());
        session.set_nat_context(NatContext::new(server)).await?;
    }

    let show = |addr: Option<std::net::SocketAddr>| {
        addr.map_or_else(|| "-".to_string(), |a| a.to_string())
    };
    println!("SSRC:  {:#010x}", session.ssrc());
    println!("RTP:   {}", show(session.rtp_public_addr()));
    println!("RTCP:  {}", show(session.rtcp_public_addr()));
    Ok(())
}

async fn run_loopback(
    config: SessionConfig,
    packets: u32,
    suite: Option<CryptoSuite>,
) -> Result<()> {
    let config = SessionConfig {
        local_ip: if config.ipv6 { "::1".into() } else { "127.0.0.1".into() },
        ..config
    };
    let host = config.local_ip.clone();

    let engine = match suite {
        Some(_) => Some(Arc::new(SrtpEngine::init()?)),
        None => None,
    };
    let alice = Session::new(&config, engine.clone())?;
    let bob = Session::new(&config, engine)?;
    alice.prepare()?;
    bob.prepare()?;

    if let Some(suite) = suite {
        let pick = |lines: Vec<String>| {
            lines
                .into_iter()
                .find(|l| l.contains(suite.name()))
                .with_context(|| format!("No local crypto line for {}", suite))
        };
        let alice_line = pick(alice.local_crypto_lines())?;
        let bob_line = pick(bob.local_crypto_lines())?;
        tracing::debug!("alice: {}", alice_line);
        tracing::debug!("bob:   {}", bob_line);
        alice.set_remote_crypto(0, &bob_line)?;
        bob.set_remote_crypto(0, &alice_line)?;
    }

    let received = Arc::new(AtomicU64::new(0));
    for (me, peer) in [(&alice, &bob), (&bob, &alice)] {
        let counter = received.clone();
        me.set_consumer(Arc::new(move |_pkt: &RtpPacket| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        let peer_rtp = peer.rtp_public_addr().context("peer not prepared")?;
        me.set_rtp_remote(&host, peer_rtp.port())?;
        if let Some(peer_rtcp) = peer.rtcp_public_addr() {
            me.set_rtcp_remote(&host, peer_rtcp.port())?;
        }
    }

    alice.start().await?;
    bob.start().await?;
    if let Some((local, remote)) = alice.negotiated_suites() {
        println!("SRTP negotiated: local {}, remote {}", local, remote);
    } else {
        println!("Running in cleartext");
    }

    let frame = [PCMU_SILENCE; FRAME_SAMPLES as usize];
    let mut interval = time::interval(Duration::from_millis(FRAME_INTERVAL_MS));
    for i in 0..packets {
        interval.tick().await;
        let marker = i == 0;
        alice.send(&frame, FRAME_SAMPLES, marker, true)?;
        bob.send(&frame, FRAME_SAMPLES, marker, true)?;
    }

    // Let the last datagrams land
    time::sleep(Duration::from_millis(200)).await;
    alice.stop().await?;
    bob.stop().await?;

    for (name, session) in [("alice", &alice), ("bob", &bob)] {
        let s = session.stats();
        println!(
            "{}: sent {} pkts ({} bytes), received {} pkts ({} bytes)",
            name, s.packets_sent, s.bytes_sent, s.packets_received, s.bytes_received
        );
        println!(
            "{}: decrypt errors {}, deframe errors {}",
            name, s.decrypt_errors, s.deframe_errors
        );
    }
    println!(
        "Delivered {}/{} frames",
        received.load(Ordering::Relaxed),
        u64::from(packets) * 2
    );
    Ok(())
}
