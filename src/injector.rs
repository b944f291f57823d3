//! The module injector: the server-side catalogue that hands out module
//! descriptors and module files to clients.

use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    channel,
    message::{ClientMessage, InjectorHandle, InjectorMessage},
    settings::InjectorSettings,
};

pub struct Injector {
    settings: InjectorSettings,
    inbox: UnboundedReceiver<InjectorMessage>,
}

impl Injector {
    pub fn new(settings: InjectorSettings) -> (InjectorHandle, Self) {
        let (handle, inbox) = channel::endpoint();
        (handle, Self { settings, inbox })
    }

    pub async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            self.handle_message(message).await;
        }
        info!("injector terminated: all handles dropped");
    }

    async fn handle_message(&mut self, message: InjectorMessage) {
        match message {
            InjectorMessage::ModuleListRequest { task_id, reply_to } => {
                let modules: Vec<_> = self
                    .settings
                    .modules
                    .iter()
                    .filter(|module| module.task_id == task_id)
                    .cloned()
                    .collect();
                debug!(%task_id, count = modules.len(), "module list requested");
                reply_to.send(ClientMessage::ModuleListResponse { modules });
            }
            InjectorMessage::ModuleRequest { file_name, reply_to } => {
                let path = self.settings.module_dir.join(&file_name);
                match tokio::fs::read(&path).await {
                    Ok(content) => {
                        debug!(%file_name, "module sent");
                        reply_to.send(ClientMessage::ModuleResponse {
                            file_name,
                            content: content.into(),
                        });
                    }
                    // no negative reply; the requester is expected to know
                    // the catalogue it picked from
                    Err(e) => warn!(%file_name, error = %e, "requested module is unavailable"),
                }
            }
        }
    }
}
