//! Recognized packet type identifiers (spec §3).

pub const PKT_MAP_INFO: i32 = 106;
pub const PKT_PING_REQUEST: i32 = 108;
pub const PKT_PING_REPLY: i32 = 109;
pub const PKT_LOGIN: i32 = 110;
pub const PKT_CHAT_SYSTEM_PROMPT: i32 = 117;
pub const PKT_CLIENT_TEXT_INPUT: i32 = 118;
pub const PKT_ANALYZED_STRING: i32 = 140;
pub const PKT_CHAT_BROADCAST: i32 = 141;
pub const PKT_PLAYER_LIST: i32 = 115;
pub const PKT_CLIENT_HELLO: i32 = 160;
pub const PKT_SERVER_HELLO_REPLY: i32 = 161;
pub const PKT_SERVER_REDIRECT: i32 = 178;

pub const DEFAULT_RELAY_PORT: u16 = 5123;
pub const MAX_PLAYER_LIST_SLOTS: usize = 8;
