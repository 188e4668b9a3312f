use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webrtc_conference::config::AppConfig;
use webrtc_conference::manager::{ConnectionManager, ManagerEvent};
use webrtc_conference::media::SyntheticMediaSource;
use webrtc_conference::peer::WebRtcTransportFactory;
use webrtc_conference::signaling::{self, SignalingClient};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

#[derive(Parser, Debug)]
#[command(name = "webrtc-conference")]
#[command(version, about = "Room signaling server and headless conference participant", long_about = None)]
struct CliArgs {
    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// More output: -v for debug, -vv for trace including webrtc internals
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling server
    Serve {
        /// Listen address (overrides config)
        #[arg(short = 'a', long, value_name = "ADDRESS")]
        bind: Option<String>,

        /// Room TTL in seconds (overrides config)
        #[arg(long, value_name = "SECS")]
        room_ttl: Option<u64>,
    },
    /// Join a room as a headless participant with synthetic media
    Join {
        #[arg(long)]
        room: String,

        #[arg(long)]
        pin: String,

        /// Participant id (random if omitted)
        #[arg(long)]
        user: Option<String>,

        /// Signaling WebSocket URL (overrides config)
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// Start a screen share once joined
        #[arg(long)]
        share_screen: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    let mut config = match args.config {
        Some(ref path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match args.command {
        Command::Serve { bind, room_ttl } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(ttl) = room_ttl {
                config.server.room_ttl_secs = ttl;
            }
            tracing::info!("Starting webrtc-conference v{}", env!("CARGO_PKG_VERSION"));
            signaling::serve(config.server).await?;
        }
        Command::Join {
            room,
            pin,
            user,
            url,
            share_screen,
        } => {
            if let Some(url) = url {
                config.client.signaling_url = url;
            }
            let user = user.unwrap_or_else(|| format!("user-{}", rand::random::<u32>()));
            join(config, room, pin, user, share_screen).await?;
        }
    }

    Ok(())
}

async fn join(
    config: AppConfig,
    room: String,
    pin: String,
    user: String,
    share_screen: bool,
) -> anyhow::Result<()> {
    let client = SignalingClient::connect(&config.client.signaling_url).await?;
    let (sender, signaling_rx) = client.into_parts();

    let (manager, channels) = ConnectionManager::new(
        user.clone(),
        config.client.clone(),
        sender,
        Arc::new(WebRtcTransportFactory::new(config.client.clone())),
        Arc::new(SyntheticMediaSource::new(&user)),
    );

    manager.start_local_media().await?;
    manager.join(&room, &pin)?;

    let runner = tokio::spawn(Arc::clone(&manager).run(signaling_rx, channels.peer_events));

    let mut ui = channels.ui_events;
    loop {
        tokio::select! {
            event = ui.recv() => {
                let Some(event) = event else { break };
                match event {
                    ManagerEvent::Joined { role, participants } => {
                        tracing::info!("In room {} as {} with {:?}", room, role, participants);
                        for remote_id in &participants {
                            watch_session(&manager, remote_id).await;
                        }
                        if share_screen {
                            manager.start_screen_share().await?;
                        }
                    }
                    ManagerEvent::ParticipantJoined(remote_id) => {
                        tracing::info!("{} joined", remote_id);
                        watch_session(&manager, &remote_id).await;
                    }
                    ManagerEvent::SignalingError { code: 401, message } => {
                        anyhow::bail!("Join rejected: {}", message);
                    }
                    other => tracing::debug!("{:?}", other),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Leaving room {}", room);
                break;
            }
        }
    }

    manager.leave().await?;
    runner.abort();
    Ok(())
}

/// Log status changes of one session until it is dropped
async fn watch_session(manager: &ConnectionManager, remote_id: &str) {
    let Some(mut status) = manager.subscribe_session(remote_id).await else {
        return;
    };
    let remote_id = remote_id.to_string();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow().clone();
            tracing::debug!(
                "{}: {} / {}",
                remote_id,
                current.state,
                current.negotiation
            );
        }
        if let Some(err) = status.borrow().last_error.as_deref() {
            tracing::warn!("Session with {} ended: {}", remote_id, err);
        }
    });
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let (own, http, webrtc) = match level {
        LogLevel::Error => ("error", "error", "error"),
        LogLevel::Warn => ("warn", "warn", "error"),
        LogLevel::Info => ("info", "info", "warn"),
        LogLevel::Debug => ("debug", "debug", "warn"),
        LogLevel::Trace => ("trace", "debug", "debug"),
    };
    let default_filter = format!(
        "webrtc_conference={},tower_http={},webrtc={}",
        own, http, webrtc
    );

    // RUST_LOG wins over the command line
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(level >= LogLevel::Debug))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
