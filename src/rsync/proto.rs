//! Generated messages and clients of the synchronizer's `installapp` and
//! `readynotify` gRPC services.

/// `installapp.Installapp`: install, uninstall and update of resource trees
pub mod installapp {
    tonic::include_proto!("installapp");
}

/// `readynotify.readyNotify`: the client-scoped ready feed
pub mod readynotify {
    tonic::include_proto!("readynotify");
}

pub use installapp::installapp_client::InstallappClient;
pub use installapp::{
    InstallAppRequest, InstallAppResponse, UninstallAppRequest, UninstallAppResponse,
    UpdateAppRequest, UpdateAppResponse,
};
pub use readynotify::ready_notify_client::ReadyNotifyClient;
pub use readynotify::{Notification, Topic, UnsubscribeResponse};
