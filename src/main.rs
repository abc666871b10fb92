mod alert;
mod config;
mod device;
mod domain;
mod error;
mod forwarder;
mod geocode;
mod permission;
mod position;
mod session;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use config::{Cli, Config};

use crate::{
    alert::TerminalAlerter,
    device::HostDevice,
    forwarder::EventForwarder,
    geocode::NominatimResolver,
    position::{PositionSource, ReplaySource, StdinSource},
    session::{StartOutcome, TrackingSession},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;
    tracing::info!(
        ws_url = %config.ws_url.as_deref().unwrap_or("<none>"),
        geocoder = %config.geocoder_url,
        distance_filter = config.distance_filter,
        permission = ?config.permission,
        history = ?config.history,
        "starting geotrack"
    );

    let result = match config.track.clone() {
        Some(path) => {
            let source = ReplaySource::from_file(&path, config.replay_interval)?;
            tracing::info!(path = %path.display(), fixes = source.fix_count(), "replaying recorded track");
            run(source, &config).await
        }
        None => {
            tracing::info!("reading newline-delimited JSON fixes from stdin");
            run(StdinSource::stdin(), &config).await
        }
    };

    match result {
        Ok(()) => {
            tracing::info!("geotrack exited normally");
            Ok(())
        }
        Err(err) => {
            tracing::error!(?err, "geotrack exited with error");
            Err(err)
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,geotrack=debug".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run<S: PositionSource>(source: S, config: &Config) -> anyhow::Result<()> {
    let resolver = NominatimResolver::new(
        config.geocoder_url.clone(),
        config.geocoder_timeout,
        &config.user_agent,
    )
    .context("failed to build reverse geocoding client")?;

    let forwarder = match config.ws_url.as_deref() {
        Some(url) => match EventForwarder::connect(url).await {
            Ok(forwarder) => forwarder,
            Err(err) => {
                tracing::warn!(%url, ?err, "failed to connect to event endpoint; events will be dropped");
                EventForwarder::disconnected()
            }
        },
        None => {
            tracing::warn!("no event endpoint configured; events will be dropped");
            EventForwarder::disconnected()
        }
    };

    let device = Arc::new(HostDevice::detect(
        config.device_id.clone(),
        config.device_name.clone(),
    ));

    let mut session = TrackingSession::new(
        source,
        resolver,
        config.permission,
        device,
        Arc::new(TerminalAlerter),
        forwarder,
        config.session_settings(),
    );

    let outcome = session.start_tracking().await?;
    if outcome != StartOutcome::Started {
        tracing::info!(?outcome, "tracking did not start");
        session.unmount().await;
        return Ok(());
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let update = tokio::select! {
            update = session.next_update() => update,
            _ = &mut shutdown => break,
        };
        match update {
            Some(raw) => {
                session.handle_update(raw).await;
            }
            None => {
                tracing::info!("position feed ended");
                break;
            }
        }
    }

    session.stop_tracking().await;
    print_history(session.history())?;
    if let Some(last) = session.last_known() {
        tracing::info!(
            latitude = last.position.latitude,
            longitude = last.position.longitude,
            address = %last.reverse_data,
            "last known location"
        );
    }
    tracing::info!(sent = session.forwarder().sent_count(), "session summary");
    session.unmount().await;
    Ok(())
}

fn print_history(history: &[domain::LocationRecord]) -> anyhow::Result<()> {
    if history.is_empty() {
        return Ok(());
    }
    let rendered =
        serde_json::to_string_pretty(history).context("failed to render location history")?;
    println!("{rendered}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(?err, "failed to install ctrl+c handler; ignoring");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(?err, "failed to install SIGTERM handler; ignoring");
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("stop requested");
}
