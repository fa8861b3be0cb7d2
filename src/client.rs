use std::time::Duration;

use reqwest::Method;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::error::{GatewayError, RestError};
use crate::gateway::events::{opcode, GatewayEvent, GatewayPayload};
use crate::gateway::{GatewayConfig, GatewayManager, ShardSnapshot};
use crate::rest::{RequestOptions, RestBody, RestConfig, RestDispatcher};

/// A bot connection: one REST dispatcher plus the gateway shards that share
/// its credential.
pub struct Client {
    rest: RestDispatcher,
    gateway: GatewayManager,
}

impl Client {
    pub fn new(rest: RestConfig, gateway: GatewayConfig) -> Result<Self, RestError> {
        let rest = RestDispatcher::new(rest)?;
        let gateway = GatewayManager::new(gateway, rest.clone());
        Ok(Self { rest, gateway })
    }

    pub fn from_config(config: Config) -> Result<Self, RestError> {
        Self::new(config.rest, config.gateway)
    }

    pub fn rest(&self) -> &RestDispatcher {
        &self.rest
    }

    pub fn gateway(&self) -> &GatewayManager {
        &self.gateway
    }

    /// Event stream. Subscribe before `connect` to see the startup events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.gateway.subscribe()
    }

    /// Log in: a missing token fails immediately, a rejected one fails with
    /// `TokenInvalid` once discovery answers.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.gateway.connect().await
    }

    pub fn send_on_shard(
        &self,
        shard_id: u32,
        payload: GatewayPayload,
    ) -> Result<(), GatewayError> {
        self.gateway.send(shard_id, payload)
    }

    /// Update presence on every shard.
    pub fn set_presence(&self, presence: serde_json::Value) -> Result<(), GatewayError> {
        for shard_id in self.gateway.shard_ids() {
            self.gateway.send(
                shard_id,
                GatewayPayload::new(opcode::STATUS_UPDATE, presence.clone()),
            )?;
        }
        Ok(())
    }

    /// Ask for a guild's member list; members arrive as GUILD_MEMBERS_CHUNK.
    pub fn request_guild_members(
        &self,
        shard_id: u32,
        request: serde_json::Value,
    ) -> Result<(), GatewayError> {
        self.gateway.send(
            shard_id,
            GatewayPayload::new(opcode::REQUEST_GUILD_MEMBERS, request),
        )
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<RestBody, RestError> {
        self.rest.dispatch(method, path, options).await
    }

    pub fn ping(&self) -> Option<Duration> {
        self.gateway.average_ping()
    }

    pub fn shard_status(&self, shard_id: u32) -> Option<ShardSnapshot> {
        self.gateway.status(shard_id)
    }

    pub fn destroy(&self) {
        self.gateway.destroy();
    }
}
