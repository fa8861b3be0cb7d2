/// Gateway intent bits, paired with their configuration names.
pub const ALL_INTENTS: &[(&str, u64)] = &[
    ("guilds", 1 << 0),
    ("guild_members", 1 << 1),
    ("guild_moderation", 1 << 2),
    ("guild_emojis_and_stickers", 1 << 3),
    ("guild_integrations", 1 << 4),
    ("guild_webhooks", 1 << 5),
    ("guild_invites", 1 << 6),
    ("guild_voice_states", 1 << 7),
    ("guild_presences", 1 << 8),
    ("guild_messages", 1 << 9),
    ("guild_message_reactions", 1 << 10),
    ("guild_message_typing", 1 << 11),
    ("direct_messages", 1 << 12),
    ("direct_message_reactions", 1 << 13),
    ("direct_message_typing", 1 << 14),
    ("message_content", 1 << 15),
    ("guild_scheduled_events", 1 << 16),
];

pub const PRIVILEGED_INTENTS: &[&str] = &["guild_members", "guild_presences", "message_content"];

/// A set of gateway intents sent with IDENTIFY.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Intents(pub u64);

impl Intents {
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Look up a single intent by name.
    pub fn named(name: &str) -> Option<Intents> {
        let name = name.trim().to_lowercase();
        ALL_INTENTS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, bit)| Intents(*bit))
    }

    /// Parse a comma separated list of intent names, or a raw bit value.
    /// Unknown names are reported back so the caller can warn about them.
    pub fn parse(list: &str) -> (Intents, Vec<String>) {
        if let Ok(bits) = list.trim().parse::<u64>() {
            return (Intents(bits), Vec::new());
        }

        let mut bits = 0;
        let mut unknown = Vec::new();
        for name in list.split(',').filter(|n| !n.trim().is_empty()) {
            match Intents::named(name) {
                Some(intent) => bits |= intent.0,
                None => unknown.push(name.trim().to_string()),
            }
        }
        (Intents(bits), unknown)
    }

    pub fn contains(self, other: Intents) -> bool {
        self.0 & other.0 == other.0
    }

    /// Names of the privileged intents in this set.
    pub fn privileged(self) -> Vec<&'static str> {
        PRIVILEGED_INTENTS
            .iter()
            .copied()
            .filter(|name| Intents::named(name).is_some_and(|i| self.contains(i)))
            .collect()
    }
}

impl std::ops::BitOr for Intents {
    type Output = Intents;

    fn bitor(self, rhs: Intents) -> Intents {
        Intents(self.0 | rhs.0)
    }
}

/// Map an event type to its required intent.
pub fn intent_for_event(event_type: &str) -> Option<&'static str> {
    match event_type {
        "GUILD_CREATE" | "GUILD_UPDATE" | "GUILD_DELETE" | "CHANNEL_CREATE" | "CHANNEL_UPDATE"
        | "CHANNEL_DELETE" | "CHANNEL_PINS_UPDATE" | "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE"
        | "GUILD_ROLE_DELETE" | "THREAD_CREATE" | "THREAD_UPDATE" | "THREAD_DELETE" => {
            Some("guilds")
        }
        "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" | "GUILD_MEMBER_REMOVE" => {
            Some("guild_members")
        }
        "GUILD_BAN_ADD" | "GUILD_BAN_REMOVE" => Some("guild_moderation"),
        "GUILD_EMOJIS_UPDATE" => Some("guild_emojis_and_stickers"),
        "INVITE_CREATE" | "INVITE_DELETE" => Some("guild_invites"),
        "VOICE_STATE_UPDATE" => Some("guild_voice_states"),
        "PRESENCE_UPDATE" => Some("guild_presences"),
        "MESSAGE_CREATE" | "MESSAGE_UPDATE" | "MESSAGE_DELETE" | "MESSAGE_DELETE_BULK" => {
            Some("guild_messages")
        }
        "MESSAGE_REACTION_ADD" | "MESSAGE_REACTION_REMOVE" | "MESSAGE_REACTION_REMOVE_ALL" => {
            Some("guild_message_reactions")
        }
        "TYPING_START" => Some("guild_message_typing"),
        _ => None,
    }
}
