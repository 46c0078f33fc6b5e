#![forbid(unsafe_code)]

mod chat;
mod connector;
mod follows;
mod helix;
mod irc;

pub use chat::{DEFAULT_IRC_WS_URL, TwitchChat, TwitchChatConfig};
pub use connector::{TwitchConfig, TwitchConnector};
pub use helix::{DEFAULT_HELIX_BASE_URL, HelixClient, TwitchTokenValidation, revoke_user_token, validate_user_token};
pub use irc::{IrcLine, IrcParseError, decode_event};
