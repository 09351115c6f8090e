use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use beach_buoy::config::BuoyConfig;
use beach_buoy::engine::RtcEngine;
use beach_buoy::media::FileMediaSource;
use beach_buoy::{Buoy, CallManager, DuplicateOfferPolicy, telemetry};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "beach-buoy",
    about = "Waits in a signaling room and answers incoming calls",
    version
)]
struct Cli {
    #[arg(long, env = "BUOY_SIGNALING_URL", value_name = "URL")]
    signaling_url: Option<String>,

    #[arg(long, env = "BUOY_IDENTITY", help = "Room owner identity; the room id is derived from it")]
    identity: Option<String>,

    #[arg(long, env = "BUOY_ROOM_ID")]
    room_id: Option<String>,

    #[arg(long, env = "BUOY_CREDENTIALS_URL", value_name = "URL")]
    credentials_url: Option<String>,

    #[arg(long = "media", env = "BUOY_MEDIA_PATH", value_name = "PATH", help = "Media base path; .ivf and .ogg are appended")]
    media_path: Option<PathBuf>,

    #[arg(long = "ice-timeout", env = "BUOY_ICE_TIMEOUT_SECS", value_name = "SECS")]
    ice_timeout_secs: Option<u64>,

    #[arg(long, env = "BUOY_MAX_SESSIONS", help = "0 for unbounded, 1 for single-call mode")]
    max_sessions: Option<usize>,

    #[arg(long, env = "BUOY_DUPLICATE_OFFERS", value_name = "replace|ignore")]
    duplicate_offers: Option<DuplicateOfferPolicy>,

    #[arg(long, help = "Skip certificate checks for signaling and credentials")]
    insecure_tls: bool,
}

impl Cli {
    fn apply(self, config: &mut BuoyConfig) {
        if let Some(url) = self.signaling_url {
            config.signaling_url = url;
        }
        if let Some(identity) = self.identity {
            config.set_identity(identity);
        }
        if let Some(room_id) = self.room_id {
            config.room_id = room_id;
        }
        if let Some(url) = self.credentials_url {
            config.credentials_url = url;
        }
        if let Some(path) = self.media_path {
            config.media_path = path;
        }
        if let Some(secs) = self.ice_timeout_secs {
            config.connect_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = max;
        }
        if let Some(policy) = self.duplicate_offers {
            config.duplicate_offers = policy;
        }
        if self.insecure_tls {
            config.insecure_tls = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = BuoyConfig::from_env();
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    telemetry::init_tracing(&config.log_filter);
    tracing::info!(
        room = %config.room_id,
        signaling = %config.signaling_url,
        media = %config.media_path.display(),
        "starting beach-buoy"
    );

    let engine = RtcEngine::new().context("failed to initialise negotiation engine")?;
    let manager = CallManager::new(
        Arc::new(engine),
        Arc::new(FileMediaSource),
        config.call_settings(),
    );
    let buoy = Buoy::new(config, manager.clone());

    tokio::select! {
        _ = buoy.run_forever() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::warn!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
        }
    }

    let closed = manager.teardown_all().await;
    tracing::info!(closed, "all calls closed");
    Ok(())
}
