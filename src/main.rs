use std::{process::ExitCode, sync::Arc};

use gotify_tray::{
    core::init_logging,
    settings::{default_settings_path, Settings},
    Controller, ControllerEvent, GotifyClient, GotifyClientFactory,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    info!("gotify-tray starting (pid={})", std::process::id());

    let settings_path = default_settings_path();
    debug!("settings file path = {settings_path:?}");
    let settings = match Settings::load(&settings_path) {
        Ok(settings) => settings,
        Err(error) => {
            error!("{error}");
            return ExitCode::FAILURE;
        }
    };
    let server = match settings.server() {
        Ok(server) => server,
        Err(error) => {
            error!("{error}");
            return ExitCode::FAILURE;
        }
    };

    let client = match GotifyClient::new(&server.base_url, &server.token, settings.request_timeout())
    {
        Ok(client) => Arc::new(client),
        Err(error) => {
            error!("{error}");
            return ExitCode::FAILURE;
        }
    };
    let factory = Arc::new(GotifyClientFactory::new(settings.request_timeout()));
    let mut controller = Controller::new(client, factory, &settings);

    let events = controller.subscribe();
    tokio::spawn(log_events(events));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    controller.run(shutdown_rx).await;
    info!(
        "stopped with {} applications and {} messages cached",
        controller.model().applications().len(),
        controller.model().message_count()
    );
    ExitCode::SUCCESS
}

async fn log_events(mut events: broadcast::Receiver<ControllerEvent>) {
    loop {
        match events.recv().await {
            Ok(ControllerEvent::ConnectionState(state)) => info!("connection: {state}"),
            Ok(ControllerEvent::MessageReceived(message)) => info!(
                "[{}] {}: {}",
                message.priority, message.title, message.message
            ),
            Ok(ControllerEvent::ModelChanged(delta)) => debug!("model changed: {delta:?}"),
            Ok(ControllerEvent::RequestFailed { key, detail }) => warn!("{key}: {detail}"),
            Ok(ControllerEvent::DeleteFailed { appid, message_id }) => {
                warn!("delete failed appid={appid:?} message_id={message_id:?}")
            }
            Ok(ControllerEvent::Diagnostics(_)) => {}
            Ok(other) => debug!("{other:?}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("event log lagged, skipped {skipped}")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
