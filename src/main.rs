use alloy::primitives::U256;
use anyhow::{bail, Context};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use valuation_watch::config::Config;
use valuation_watch::oracle::abi::verify_topic_hashes;
use valuation_watch::oracle::types::ValuationRequest;
use valuation_watch::oracle::{
    AlloyTransport, OracleError, OracleNotice, OracleService, OracleStatus, SystemClock,
};

const DEFAULT_CONFIG: &str = "valuation-watch.toml";

struct Args {
    config: Option<PathBuf>,
    request: Option<(U256, String, U256)>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        request: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        if arg == "--request" {
            let (Some(pid), Some(location), Some(size)) = (it.next(), it.next(), it.next()) else {
                bail!("usage: --request <propertyId> <location> <size>");
            };
            let pid = U256::from_str(&pid).with_context(|| format!("invalid property id {pid}"))?;
            let size = U256::from_str(&size).with_context(|| format!("invalid size {size}"))?;
            args.request = Some((pid, location, size));
        } else if arg.starts_with("--") {
            bail!("unknown flag {arg}");
        } else {
            args.config = Some(PathBuf::from(arg));
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let args = parse_args()?;

    // Load config
    let config_path = args.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config_from_file = config_path.exists();
    let config = if config_from_file {
        Config::load(&config_path)?
    } else {
        Config::from_env()
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("valuation-watch v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_from_file {
        info!(path = %config_path.display(), "no config file found, using env-only config");
    }

    for (sig, ok) in verify_topic_hashes() {
        if !ok {
            bail!("event topic hash mismatch for {sig}");
        }
    }

    let oracle_address = config.oracle_address()?;
    let private_key = config.has_wallet().then_some(config.chain.private_key.as_str());
    if private_key.is_none() {
        warn!("no wallet configured - running in read-only mode (set ORACLE_PRIVATE_KEY to request updates)");
    }
    let transport = Arc::new(AlloyTransport::connect_http(
        &config.chain.http_url,
        oracle_address,
        private_key,
    )?);

    if config.simulation.enabled {
        warn!(
            timeout_secs = config.reconcile.resolve_timeout_secs,
            placeholder = config.simulation.placeholder_valuation,
            "simulated resolution is ON - unanswered requests will be settled with a placeholder valuation"
        );
    }

    let (mut service, mut notices) =
        OracleService::start(transport, Arc::new(SystemClock), config.service_settings())
            .await
            .context("failed to start oracle service")?;

    let watched: Vec<U256> = config.watch.property_ids.iter().map(|&p| U256::from(p)).collect();
    let mut status_interval =
        tokio::time::interval(Duration::from_secs(config.watch.status_interval_secs.max(1)));

    if let Some((property_id, location, size)) = args.request {
        let request = ValuationRequest {
            property_id,
            location,
            size,
            api_key: config.api_key().map(str::to_string),
        };
        match service.request_update(request).await {
            Ok(receipt) => info!(
                tx = %receipt.tx_hash,
                block = ?receipt.block_number,
                request_id = ?receipt.requested.as_ref().map(|r| r.request_id),
                "valuation update requested"
            ),
            Err(OracleError::Denied(reason)) => warn!(property = %property_id, reason = %reason, "request not allowed"),
            Err(e) => error!(property = %property_id, error = %e, "valuation request failed"),
        }
    }

    info!("watching oracle - press Ctrl+C to stop");

    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Some(notice) => log_notice(&notice),
                None => {
                    error!("oracle service stopped unexpectedly");
                    break;
                }
            },

            _ = status_interval.tick(), if !watched.is_empty() => {
                for pid in &watched {
                    match service.status(*pid).await {
                        Ok(status) => log_status(&status),
                        Err(e) => warn!(property = %pid, error = %e, "status unavailable"),
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                break;
            }
        }
    }

    service.shutdown();
    Ok(())
}

fn log_notice(notice: &OracleNotice) {
    let at = chrono::Utc::now().format("%H:%M:%S");
    match notice {
        OracleNotice::Error { .. }
        | OracleNotice::SimulatedResolved { .. }
        | OracleNotice::Failed { .. } => warn!("[{at}] {notice}"),
        _ => info!("[{at}] {notice}"),
    }
}

fn log_status(status: &OracleStatus) {
    let last_update = status
        .last_update_ms
        .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64))
        .map(|t| t.to_rfc3339());
    info!(
        property = %status.property_id,
        pending = status.pending_requests,
        stale = status.stale_requests,
        valuation = ?status.latest_valuation.map(|v| v.to_string()),
        last_update = ?last_update,
        cooldown_secs = status.cooldown_remaining_ms / 1000,
        can_request = status.can_request_update,
        last_error = ?status.last_error,
        "oracle status"
    );
}
