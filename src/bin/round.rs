use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use fedround::{
    client::ClientProtocol,
    coordinator::RoundCoordinator,
    injector::Injector,
    logging,
    message::{ClientMessage, CoordinatorMessage, RoundEvent},
    settings::Settings,
};

/// Federated learning round coordinator.
///
/// Hosts the coordinator, the module injector and the configured client
/// profiles in one process and runs the configured number of rounds.
#[derive(Debug, Parser)]
#[command(name = "round", version)]
struct Opt {
    /// Path to the configuration file
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let settings = Settings::new(&opt.config)
        .with_context(|| format!("failed to load configuration from {}", opt.config))?;
    logging::configure(settings.logging);

    let (injector_handle, injector) = Injector::new(settings.injector);
    tokio::spawn(injector.run());

    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let rounds = settings.coordinator.rounds;
    let (coordinator, service) =
        RoundCoordinator::new(settings.coordinator, settings.trainer, events_tx);
    tokio::spawn(service.run());

    let mut clients = Vec::new();
    for client_settings in settings.clients {
        let id = client_settings.id.clone();
        let task_id = client_settings.task_id.clone();
        let (handle, client) = ClientProtocol::new(
            client_settings,
            coordinator.clone(),
            injector_handle.clone(),
        )
        .with_context(|| format!("failed to set up client {}", id))?;
        tokio::spawn(client.run());
        clients.push((task_id, handle));
    }

    for round in 1..=rounds {
        info!(round, "starting round");
        coordinator.send(CoordinatorMessage::StartRound);
        for (task_id, client) in &clients {
            client.send(ClientMessage::StartLearning {
                task_id: task_id.clone(),
            });
        }

        tokio::select! {
            event = events.recv() => match event {
                Some(RoundEvent::Ended) => info!(round, "round ended"),
                Some(RoundEvent::Failed) => warn!(round, "round failed"),
                None => {
                    error!("coordinator is gone, shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}
