use std::collections::HashMap;

use tokio::sync::broadcast;

use super::events::{DispatchEvent, GatewayEvent, GatewayPayload};
use super::intents;
use crate::error::GatewayError;

/// Dispatch events the client knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Resumed,
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    GuildMemberAdd,
    GuildMemberUpdate,
    GuildMemberRemove,
    GuildMembersChunk,
    GuildRoleCreate,
    GuildRoleUpdate,
    GuildRoleDelete,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    MessageDeleteBulk,
    MessageReactionAdd,
    MessageReactionRemove,
    PresenceUpdate,
    TypingStart,
    VoiceStateUpdate,
    VoiceServerUpdate,
    UserUpdate,
    InteractionCreate,
}

pub const DISPATCH_TABLE: &[(&str, EventKind)] = &[
    ("READY", EventKind::Ready),
    ("RESUMED", EventKind::Resumed),
    ("GUILD_CREATE", EventKind::GuildCreate),
    ("GUILD_UPDATE", EventKind::GuildUpdate),
    ("GUILD_DELETE", EventKind::GuildDelete),
    ("GUILD_MEMBER_ADD", EventKind::GuildMemberAdd),
    ("GUILD_MEMBER_UPDATE", EventKind::GuildMemberUpdate),
    ("GUILD_MEMBER_REMOVE", EventKind::GuildMemberRemove),
    ("GUILD_MEMBERS_CHUNK", EventKind::GuildMembersChunk),
    ("GUILD_ROLE_CREATE", EventKind::GuildRoleCreate),
    ("GUILD_ROLE_UPDATE", EventKind::GuildRoleUpdate),
    ("GUILD_ROLE_DELETE", EventKind::GuildRoleDelete),
    ("CHANNEL_CREATE", EventKind::ChannelCreate),
    ("CHANNEL_UPDATE", EventKind::ChannelUpdate),
    ("CHANNEL_DELETE", EventKind::ChannelDelete),
    ("MESSAGE_CREATE", EventKind::MessageCreate),
    ("MESSAGE_UPDATE", EventKind::MessageUpdate),
    ("MESSAGE_DELETE", EventKind::MessageDelete),
    ("MESSAGE_DELETE_BULK", EventKind::MessageDeleteBulk),
    ("MESSAGE_REACTION_ADD", EventKind::MessageReactionAdd),
    ("MESSAGE_REACTION_REMOVE", EventKind::MessageReactionRemove),
    ("PRESENCE_UPDATE", EventKind::PresenceUpdate),
    ("TYPING_START", EventKind::TypingStart),
    ("VOICE_STATE_UPDATE", EventKind::VoiceStateUpdate),
    ("VOICE_SERVER_UPDATE", EventKind::VoiceServerUpdate),
    ("USER_UPDATE", EventKind::UserUpdate),
    ("INTERACTION_CREATE", EventKind::InteractionCreate),
];

/// Events delivered even before every shard is ready.
const BEFORE_READY: &[EventKind] = &[EventKind::Ready, EventKind::Resumed, EventKind::GuildCreate];

/// Static lookup from event name to its kind.
#[derive(Debug, Clone)]
pub struct EventRegistry {
    kinds: HashMap<&'static str, EventKind>,
}

impl EventRegistry {
    /// Build a registry, rejecting tables that name an event twice.
    pub fn from_table(table: &[(&'static str, EventKind)]) -> Result<Self, GatewayError> {
        let mut kinds = HashMap::with_capacity(table.len());
        for (name, kind) in table {
            if kinds.insert(*name, *kind).is_some() {
                return Err(GatewayError::InvalidConfig(format!(
                    "dispatch event {name} is registered twice"
                )));
            }
        }
        Ok(Self { kinds })
    }

    pub fn standard() -> Result<Self, GatewayError> {
        Self::from_table(DISPATCH_TABLE)
    }

    pub fn lookup(&self, name: &str) -> Option<EventKind> {
        self.kinds.get(name).copied()
    }

    /// The intent a consumer needs to receive this event, if any.
    pub fn required_intent(&self, name: &str) -> Option<&'static str> {
        self.lookup(name).and(intents::intent_for_event(name))
    }
}

/// Routes shard output to consumers, holding back application events until
/// the gateway is ready.
pub struct Dispatcher {
    registry: EventRegistry,
    tx: broadcast::Sender<GatewayEvent>,
    buffered: Vec<DispatchEvent>,
    ready: bool,
    emit_raw: bool,
}

impl Dispatcher {
    pub fn new(
        registry: EventRegistry,
        tx: broadcast::Sender<GatewayEvent>,
        emit_raw: bool,
    ) -> Self {
        Self {
            registry,
            tx,
            buffered: Vec::new(),
            ready: false,
            emit_raw,
        }
    }

    pub fn has_listeners(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn raw(&self, shard_id: u32, payload: &GatewayPayload) {
        if self.emit_raw {
            self.publish(GatewayEvent::Raw {
                shard_id,
                payload: payload.clone(),
            });
        }
    }

    /// Route a dispatch event. Returns false when the name is unknown.
    pub fn dispatch(&mut self, shard_id: u32, name: &str, data: serde_json::Value) -> bool {
        let Some(kind) = self.registry.lookup(name) else {
            tracing::trace!(shard = shard_id, "no route for dispatch event {name}");
            return false;
        };

        let event = DispatchEvent {
            kind,
            name: name.to_string(),
            data,
            shard_id,
        };

        if !self.ready && !BEFORE_READY.contains(&kind) {
            self.buffered.push(event);
        } else {
            self.publish(GatewayEvent::Dispatch(event));
        }
        true
    }

    /// Publish READY once, then release everything held back.
    pub fn mark_ready(&mut self) {
        if self.ready {
            return;
        }
        self.ready = true;
        self.publish(GatewayEvent::Ready);
        for event in self.buffered.drain(..) {
            let _ = self.tx.send(GatewayEvent::Dispatch(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> (Dispatcher, broadcast::Receiver<GatewayEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (
            Dispatcher::new(EventRegistry::standard().unwrap(), tx, false),
            rx,
        )
    }

    #[test]
    fn test_standard_table_has_no_duplicates() {
        assert!(EventRegistry::standard().is_ok());
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let table = [
            ("READY", EventKind::Ready),
            ("READY", EventKind::Resumed),
        ];
        assert!(EventRegistry::from_table(&table).is_err());
    }

    #[test]
    fn test_unknown_event_is_a_miss() {
        let (mut dispatcher, mut rx) = dispatcher();
        assert!(!dispatcher.dispatch(0, "SOMETHING_NEW", serde_json::Value::Null));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_required_intent() {
        let registry = EventRegistry::standard().unwrap();
        assert_eq!(registry.required_intent("MESSAGE_CREATE"), Some("guild_messages"));
        assert_eq!(registry.required_intent("NOT_AN_EVENT"), None);
    }

    #[test]
    fn test_events_are_held_until_ready() {
        let (mut dispatcher, mut rx) = dispatcher();
        dispatcher.dispatch(0, "MESSAGE_CREATE", serde_json::json!({ "id": "1" }));
        dispatcher.dispatch(0, "GUILD_CREATE", serde_json::json!({ "id": "g" }));

        match rx.try_recv().unwrap() {
            GatewayEvent::Dispatch(event) => assert_eq!(event.kind, EventKind::GuildCreate),
            other => panic!("expected guild create, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        dispatcher.mark_ready();
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Ready));
        match rx.try_recv().unwrap() {
            GatewayEvent::Dispatch(event) => assert_eq!(event.kind, EventKind::MessageCreate),
            other => panic!("expected message create, got {other:?}"),
        }
    }

    #[test]
    fn test_ready_is_published_once() {
        let (mut dispatcher, mut rx) = dispatcher();
        dispatcher.mark_ready();
        dispatcher.mark_ready();
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Ready));
        assert!(rx.try_recv().is_err());
    }
}
