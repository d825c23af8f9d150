//! Discord-facing components: the two gateway WebSocket control planes
//! (C6/C7), their wire model, and the REST wrapper used to post chat
//! messages (spec.md §6 "Discord REST").

pub mod gateway;
pub mod model;
pub mod rest;
pub mod voice_gateway;

pub use gateway::GuildGateway;
pub use rest::DiscordRest;
pub use voice_gateway::VoiceGateway;
