//! HTTP to WebSocket bridge for a bootloader device.
//!
//! HTTP callers issue bootloader commands through [`CommandBridge::execute`].
//! Each command travels through a bounded mailbox to the single device link,
//! which forwards it over the device's WebSocket and hands the decoded reply
//! back. Device connectivity is fanned out to any number of subscribers by the
//! status hub.
//!
//! ```text
//! HTTP ──▶ CommandBridge ──▶ command mailbox ──▶ DeviceLink ──▶ device
//! HTTP ◀── CommandBridge ◀── response mailbox ◀── DeviceLink ◀── device
//!                                                  │
//!                                                  └──▶ StatusHub ──▶ SSE subscribers
//! ```

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod hub;
pub mod link;
pub mod mailbox;
pub mod stats;
pub mod transport;

use std::sync::Arc;

use axum::Router;

pub use bridge::CommandBridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, ConfigError, HubError};
pub use hub::{ConnectivityEvent, HubHandle, Subscription, spawn_hub};
pub use link::{DeviceLink, LinkState};
pub use stats::{LinkStats, StatsSnapshot};

use crate::mailbox::{command_mailbox, response_mailbox};

/// The wired-up bridge: one command path and one device link sharing the
/// mailboxes, counters and status hub.
#[derive(Clone)]
pub struct Bridge {
    pub commands: Arc<CommandBridge>,
    pub link: DeviceLink,
    pub hub: HubHandle,
    pub stats: Arc<LinkStats>,
    max_upload_bytes: usize,
}

impl Bridge {
    pub fn new(config: &BridgeConfig, hub: HubHandle) -> Self {
        let (commands, inbox) = command_mailbox(config.command_capacity);
        let (responses, replies) = response_mailbox();
        let stats = Arc::new(LinkStats::new());

        let link = DeviceLink::new(
            inbox,
            responses,
            hub.clone(),
            Arc::clone(&stats),
            config.reply_timeout(),
        );
        let commands = Arc::new(CommandBridge::new(
            commands,
            replies,
            Arc::clone(&stats),
            config.request_timeout(),
        ));

        Self {
            commands,
            link,
            hub,
            stats,
            max_upload_bytes: config.max_upload_bytes,
        }
    }

    /// Router for the HTTP API.
    pub fn api_router(&self) -> Router {
        let state = api::AppState {
            bridge: Arc::clone(&self.commands),
            hub: self.hub.clone(),
            stats: Arc::clone(&self.stats),
        };
        api::router(state, self.max_upload_bytes)
    }

    /// Router for the device WebSocket listener.
    pub fn device_router(&self) -> Router {
        transport::device_router(self.link.clone())
    }
}
