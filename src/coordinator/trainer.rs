//! Invocation of the external training driver.
//!
//! The training computation itself is an external collaborator: a script run
//! as a child process with the participant roster serialized on its command
//! line. Awaiting it deliberately blocks the coordinator's message loop for
//! the round; the round has no concurrent sub-phases once training starts.

use std::{path::Path, process::ExitStatus};

use thiserror::Error;
use tokio::process::Command;

use crate::settings::TrainerSettings;

use super::registry::ParticipantRegistry;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to spawn training driver: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("training driver exited with {0}")]
    Failed(ExitStatus),
    #[error("failed to serialize participant roster: {0}")]
    Roster(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct RosterEntry<'a> {
    id: &'a str,
    port: u16,
}

/// Serialize the roster the way the driver expects it: a JSON array of
/// `{id, port}` objects.
pub fn roster_json(registry: &ParticipantRegistry) -> Result<String, serde_json::Error> {
    let entries: Vec<RosterEntry> = registry
        .iter()
        .map(|p| RosterEntry {
            id: &p.client_id,
            port: p.port,
        })
        .collect();
    serde_json::to_string(&entries)
}

/// Run the training driver to completion. Secure-aggregation rounds use a
/// different script to construct the model.
pub async fn run(
    settings: &TrainerSettings,
    secure_agg: bool,
    model_config: &str,
    resources_path: &Path,
    registry: &ParticipantRegistry,
) -> Result<(), TrainingError> {
    let module = if secure_agg {
        &settings.secure_module
    } else {
        &settings.module
    };
    let roster = roster_json(registry)?;

    debug!(module = %module.display(), roster = %roster, "spawning training driver");
    let status = Command::new(&settings.command)
        .arg(module)
        .arg("--datapath")
        .arg(&settings.data_path)
        .arg("--participantsjsonlist")
        .arg(&roster)
        .arg("--epochs")
        .arg(settings.epochs.to_string())
        .arg("--modelpath")
        .arg(&settings.model_path)
        .arg("--pathToResources")
        .arg(resources_path)
        .arg("--model_config")
        .arg(model_config)
        .arg("--model_output")
        .arg(settings.target_output_size.to_string())
        .status()
        .await?;

    if status.success() {
        Ok(())
    } else {
        Err(TrainingError::Failed(status))
    }
}
