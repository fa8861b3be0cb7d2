//! Route builders for the REST API.
//!
//! Each route is also its rate limit bucket key, so callers should build
//! paths here rather than by hand.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

pub const CDN_URL: &str = "https://cdn.discordapp.com";

pub fn gateway() -> String {
    "/gateway".to_string()
}

pub fn gateway_bot() -> String {
    "/gateway/bot".to_string()
}

pub fn guilds() -> String {
    "/guilds".to_string()
}

pub fn guild(guild_id: &str) -> String {
    format!("/guilds/{guild_id}")
}

pub fn guild_preview(guild_id: &str) -> String {
    format!("/guilds/{guild_id}/preview")
}

pub fn guild_members(guild_id: &str) -> String {
    format!("/guilds/{guild_id}/members")
}

pub fn guild_member(guild_id: &str, user_id: &str) -> String {
    format!("/guilds/{guild_id}/members/{user_id}")
}

pub fn channel(channel_id: &str) -> String {
    format!("/channels/{channel_id}")
}

pub fn messages(channel_id: &str) -> String {
    format!("/channels/{channel_id}/messages")
}

pub fn message(channel_id: &str, message_id: &str) -> String {
    format!("/channels/{channel_id}/messages/{message_id}")
}

/// Own reaction on a message. Unicode emoji are percent-encoded; custom
/// emoji are passed as `name:id`.
pub fn own_reaction(channel_id: &str, message_id: &str, emoji: &str) -> String {
    let emoji = utf8_percent_encode(emoji, NON_ALPHANUMERIC).to_string();
    format!("/channels/{channel_id}/messages/{message_id}/reactions/{emoji}/@me")
}

pub fn user(user_id: &str) -> String {
    format!("/users/{user_id}")
}

pub fn webhook(webhook_id: &str, token: &str) -> String {
    format!("/webhooks/{webhook_id}/{token}")
}

/// Image formats served by the CDN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpg,
    Webp,
    Gif,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpg => "jpg",
            ImageFormat::Webp => "webp",
            ImageFormat::Gif => "gif",
        }
    }
}

fn image_url(path: &str, format: ImageFormat, size: Option<u16>) -> String {
    match size {
        Some(size) => format!("{CDN_URL}{path}.{}?size={size}", format.extension()),
        None => format!("{CDN_URL}{path}.{}", format.extension()),
    }
}

/// Animated hashes start with `a_`; `dynamic` serves those as gifs.
fn pick_format(hash: &str, format: ImageFormat, dynamic: bool) -> ImageFormat {
    if dynamic && hash.starts_with("a_") {
        ImageFormat::Gif
    } else {
        format
    }
}

pub fn emoji_url(emoji_id: &str, format: ImageFormat) -> String {
    image_url(&format!("/emojis/{emoji_id}"), format, None)
}

pub fn default_avatar_url(index: u64) -> String {
    format!("{CDN_URL}/embed/avatars/{index}.png")
}

pub fn avatar_url(
    user_id: &str,
    hash: &str,
    format: ImageFormat,
    size: Option<u16>,
    dynamic: bool,
) -> String {
    image_url(
        &format!("/avatars/{user_id}/{hash}"),
        pick_format(hash, format, dynamic),
        size,
    )
}

pub fn icon_url(
    guild_id: &str,
    hash: &str,
    format: ImageFormat,
    size: Option<u16>,
    dynamic: bool,
) -> String {
    image_url(
        &format!("/icons/{guild_id}/{hash}"),
        pick_format(hash, format, dynamic),
        size,
    )
}

pub fn banner_url(guild_id: &str, hash: &str, format: ImageFormat, size: Option<u16>) -> String {
    image_url(&format!("/banners/{guild_id}/{hash}"), format, size)
}

pub fn splash_url(guild_id: &str, hash: &str, format: ImageFormat, size: Option<u16>) -> String {
    image_url(&format!("/splashes/{guild_id}/{hash}"), format, size)
}
