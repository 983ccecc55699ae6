//! The resource synchronizer: applies resource trees to clusters and reports
//! completion on a client-scoped notification feed.

use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;

use crate::error::Error;

mod client;
pub mod proto;
mod watcher;

pub use client::RsyncClient;
pub use watcher::{next_backoff, NotificationWatcher, WatchPolicy};

/// Tree ids reported ready on a subscription
pub type NotificationStream = BoxStream<'static, Result<String, tonic::Status>>;

#[derive(Clone, PartialEq, Debug)]
pub struct UpdateOutcome {
    pub updated: bool,
    pub message: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppInstaller: Send + Sync {
    async fn install_app(&self, tree_id: &str) -> Result<(), Error>;

    async fn uninstall_app(&self, tree_id: &str) -> Result<(), Error>;

    /// Move the clusters of `from_tree` to the resources of `to_tree`
    async fn update_app(&self, from_tree: &str, to_tree: &str) -> Result<UpdateOutcome, Error>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReadyNotifier: Send + Sync {
    async fn alert(&self, client_name: &str, tree_id: &str) -> Result<NotificationStream, Error>;

    async fn unsubscribe(&self, client_name: &str, tree_id: &str) -> Result<(), Error>;
}
