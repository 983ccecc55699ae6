use async_trait::async_trait;
use futures::StreamExt;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use super::proto::{
    InstallAppRequest, InstallappClient, ReadyNotifyClient, Topic, UninstallAppRequest,
    UpdateAppRequest,
};
use super::{AppInstaller, NotificationStream, ReadyNotifier, UpdateOutcome};
use crate::error::Error;

/// gRPC client for both synchronizer services over one channel
#[derive(Clone, Debug)]
pub struct RsyncClient {
    installer: InstallappClient<Channel>,
    notifier: ReadyNotifyClient<Channel>,
}

impl RsyncClient {
    pub fn new(channel: Channel) -> RsyncClient {
        RsyncClient {
            installer: InstallappClient::new(channel.clone()),
            notifier: ReadyNotifyClient::new(channel),
        }
    }

    /// Build a client whose channel connects on first use
    pub fn connect_lazy(endpoint: &str) -> Result<RsyncClient, Error> {
        let channel = Endpoint::from_shared(endpoint.to_string())?.connect_lazy();
        info!(endpoint, "synchronizer client configured");
        Ok(RsyncClient::new(channel))
    }
}

#[async_trait]
impl AppInstaller for RsyncClient {
    async fn install_app(&self, tree_id: &str) -> Result<(), Error> {
        let response = self
            .installer
            .clone()
            .install_app(InstallAppRequest {
                app_context: tree_id.to_string(),
            })
            .await?
            .into_inner();
        if !response.app_context_installed {
            return Err(Error::Rejected(format!(
                "install of tree {}: {}",
                tree_id, response.app_context_install_message
            )));
        }
        debug!(tree = %tree_id, "install accepted");
        Ok(())
    }

    async fn uninstall_app(&self, tree_id: &str) -> Result<(), Error> {
        let response = self
            .installer
            .clone()
            .uninstall_app(UninstallAppRequest {
                app_context: tree_id.to_string(),
            })
            .await?
            .into_inner();
        if !response.app_context_uninstalled {
            return Err(Error::Rejected(format!(
                "uninstall of tree {}: {}",
                tree_id, response.app_context_uninstall_message
            )));
        }
        debug!(tree = %tree_id, "uninstall accepted");
        Ok(())
    }

    async fn update_app(&self, from_tree: &str, to_tree: &str) -> Result<UpdateOutcome, Error> {
        let response = self
            .installer
            .clone()
            .update_app(UpdateAppRequest {
                update_from_app_context: from_tree.to_string(),
                update_to_app_context: to_tree.to_string(),
            })
            .await?
            .into_inner();
        Ok(UpdateOutcome {
            updated: response.app_context_updated,
            message: response.app_context_update_message,
        })
    }
}

#[async_trait]
impl ReadyNotifier for RsyncClient {
    async fn alert(&self, client_name: &str, tree_id: &str) -> Result<NotificationStream, Error> {
        let stream = self
            .notifier
            .clone()
            .alert(Topic {
                client_name: client_name.to_string(),
                app_context: tree_id.to_string(),
            })
            .await
            .map_err(Error::from_status)?
            .into_inner();
        Ok(stream.map(|item| item.map(|n| n.app_context)).boxed())
    }

    async fn unsubscribe(&self, client_name: &str, tree_id: &str) -> Result<(), Error> {
        self.notifier
            .clone()
            .unsubscribe(Topic {
                client_name: client_name.to_string(),
                app_context: tree_id.to_string(),
            })
            .await?;
        Ok(())
    }
}
