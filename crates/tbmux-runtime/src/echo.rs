//! Local echo synthesis.
//!
//! Upstream never replays a bot's own outbound messages over the long poll,
//! so a downstream client that sends through the proxy would otherwise never
//! see its own traffic in the update stream. When a send or edit succeeds,
//! the response body is replayed here as a synthetic update, indistinguishable
//! from an upstream-delivered one.

use std::sync::Arc;

use serde_json::Value;
use tbmux_store::{StoreResult, UpdateOrigin, UpdateStore};
use tracing::warn;

use crate::cooldown::CooldownTracker;

/// How the response body of an echo-capable method is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoKind {
    /// `result` is a single message object.
    Message,
    /// `result` is an array of message objects (`sendMediaGroup`).
    MessageArray,
    /// `result` is the edited message object, or `true` for inline edits.
    MessageEdit,
}

/// Echo handling for a Bot API method name, if it has any.
pub fn echo_kind_for_method(method: &str) -> Option<EchoKind> {
    match method {
        "sendMessage" | "forwardMessage" | "copyMessage" | "sendPhoto" | "sendAudio"
        | "sendDocument" | "sendVideo" | "sendAnimation" | "sendVoice" | "sendVideoNote"
        | "sendPaidMedia" | "sendLocation" | "sendVenue" | "sendContact" | "sendPoll"
        | "sendDice" => Some(EchoKind::Message),
        "sendMediaGroup" => Some(EchoKind::MessageArray),
        "editMessageText" | "editMessageCaption" | "editMessageMedia"
        | "editMessageLiveLocation" | "stopMessageLiveLocation" | "editMessageReplyMarkup" => {
            Some(EchoKind::MessageEdit)
        }
        _ => None,
    }
}

/// Turns successful send/edit responses into synthetic local updates.
pub struct EchoProcessor {
    store: Arc<UpdateStore>,
    cooldowns: Arc<CooldownTracker>,
}

impl EchoProcessor {
    pub fn new(store: Arc<UpdateStore>, cooldowns: Arc<CooldownTracker>) -> Self {
        Self { store, cooldowns }
    }

    /// Interprets a buffered 2xx response body. Storage failures are logged
    /// and dropped: the downstream client already holds the upstream answer,
    /// and the local log is best-effort.
    pub fn process(&self, kind: EchoKind, body: &[u8]) {
        let envelope: Value = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!("failed to decode send response body: {error:#}");
                return;
            }
        };
        if envelope.get("ok").and_then(Value::as_bool) != Some(true) {
            warn!(
                "upstream send error {}: {}",
                envelope
                    .get("error_code")
                    .and_then(|value| value.as_i64())
                    .unwrap_or_default(),
                envelope
                    .get("description")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default(),
            );
            return;
        }
        let Some(result) = envelope.get("result") else {
            return;
        };

        let stored = match kind {
            EchoKind::Message => self.inject_messages(std::slice::from_ref(result)),
            EchoKind::MessageArray => match result.as_array() {
                Some(messages) => self.inject_messages(messages),
                None => {
                    warn!("send response result is not a message array");
                    return;
                }
            },
            EchoKind::MessageEdit => {
                if result.as_bool() == Some(true) {
                    // Inline-message edit acknowledgement: nothing to echo.
                    return;
                }
                self.inject_edit(result)
            }
        };
        if let Err(error) = stored {
            warn!("failed to store local update: {error}");
        }
        self.store.notify_updates();
    }

    /// Inserts one synthetic `message` update per sent message, all inside a
    /// single transaction, and reserves rate-limit budget for each.
    fn inject_messages(&self, messages: &[Value]) -> StoreResult<()> {
        let tx = self.store.begin()?;
        for message in messages {
            self.cooldowns.observe_send(message);
            tx.upsert_message(message)?;
            tx.insert_update(UpdateOrigin::Local, None, "message", message)?;
        }
        tx.commit()
    }

    /// Edits refresh the cache and surface as `edited_message`, but do not
    /// touch the rate limiter.
    fn inject_edit(&self, message: &Value) -> StoreResult<()> {
        let tx = self.store.begin()?;
        tx.upsert_message(message)?;
        tx.insert_update(UpdateOrigin::Local, None, "edited_message", message)?;
        tx.commit()
    }
}
