//! Runtime components of the bot multiplexer: upstream long polling, local
//! echo synthesis, outbound cooldowns and the downstream HTTP boundary.

pub mod cooldown;
pub mod echo;
pub mod poller;
pub mod retry;
pub mod server;

/// User-Agent applied to every request the proxy makes upstream.
pub const USER_AGENT: &str = "Mozilla/5.0 tbmux/0.1 (Telegram bot multiplexer)";
