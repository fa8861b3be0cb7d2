pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod etf;
pub mod events;
pub mod heartbeat;
pub mod intents;
pub mod manager;
pub mod session;
pub mod shard;
pub mod throttle;

pub use connection::ShardSnapshot;
pub use events::{GatewayEvent, GatewayPayload};
pub use intents::Intents;
pub use manager::{GatewayConfig, GatewayManager, ShardSpec};
