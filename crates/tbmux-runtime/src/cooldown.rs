//! Outbound send cooldowns: one global deadline plus one per chat.
//!
//! Senders call [`CooldownTracker::wait_for_send`] before going upstream and
//! [`CooldownTracker::observe_send`] with the message the upstream returned.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

/// Reserves 1/30 s of the ~30 msg/s global budget per send. The extra
/// nanosecond keeps two sends observed at the same instant from aliasing to
/// an equal deadline.
const GLOBAL_SEND_COOLDOWN: Duration = Duration::from_nanos(1_000_000_000 / 30 + 1);

const PRIVATE_CHAT_COOLDOWN: Duration = Duration::from_secs(1);
const GROUP_CHAT_COOLDOWN: Duration = Duration::from_secs(3);

/// Expired per-chat entries are swept once the map grows past this size.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct CooldownState {
    global_until: Instant,
    per_chat_until: HashMap<i64, Instant>,
}

/// Tracks the earliest instant the next send may proceed, globally and per
/// chat. Reads and writes hold the lock only to compute deadlines; all
/// sleeping happens outside it.
#[derive(Debug)]
pub struct CooldownTracker {
    inner: RwLock<CooldownState>,
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CooldownState {
                global_until: Instant::now(),
                per_chat_until: HashMap::new(),
            }),
        }
    }

    /// Suspends until both the global cooldown and `chat_id`'s cooldown have
    /// passed. Returns immediately when neither is pending. Dropping the
    /// future cancels the wait.
    pub async fn wait_for_send(&self, chat_id: i64) {
        let deadline = {
            let state = self.inner.read().expect("cooldown lock poisoned");
            let mut deadline = state.global_until;
            if let Some(chat_deadline) = state.per_chat_until.get(&chat_id) {
                deadline = deadline.max(*chat_deadline);
            }
            deadline
        };
        if deadline > Instant::now() {
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Records a successfully sent message, reserving global budget and, when
    /// the payload names its chat, per-chat budget: 1 s for private chats,
    /// 3 s for everything else.
    pub fn observe_send(&self, message: &Value) {
        let now = Instant::now();
        let mut state = self.inner.write().expect("cooldown lock poisoned");
        state.global_until = now + GLOBAL_SEND_COOLDOWN;

        let Some(chat_id) = message
            .pointer("/chat/id")
            .and_then(Value::as_i64)
            .filter(|id| *id != 0)
        else {
            // Inline results carry no chat; only the global budget applies.
            return;
        };

        let cooldown = match message.pointer("/chat/type").and_then(Value::as_str) {
            Some("private") => PRIVATE_CHAT_COOLDOWN,
            _ => GROUP_CHAT_COOLDOWN,
        };

        if state.per_chat_until.len() >= SWEEP_THRESHOLD {
            state.per_chat_until.retain(|_, until| *until > now);
        }
        state.per_chat_until.insert(chat_id, now + cooldown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn unit_private_chat_send_cools_down_for_one_second() {
        let tracker = CooldownTracker::new();
        tracker.observe_send(&json!({
            "message_id": 5,
            "chat": {"id": 100, "type": "private"},
        }));

        let started = Instant::now();
        tracker.wait_for_send(100).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unit_group_chat_send_cools_down_for_three_seconds() {
        let tracker = CooldownTracker::new();
        tracker.observe_send(&json!({
            "message_id": 6,
            "chat": {"id": -200, "type": "supergroup"},
        }));

        let started = Instant::now();
        tracker.wait_for_send(-200).await;
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn unit_other_chats_only_pay_the_global_cooldown() {
        let tracker = CooldownTracker::new();
        tracker.observe_send(&json!({
            "message_id": 7,
            "chat": {"id": 100, "type": "private"},
        }));

        let started = Instant::now();
        tracker.wait_for_send(999).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= GLOBAL_SEND_COOLDOWN);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unit_chatless_send_updates_only_the_global_cooldown() {
        let tracker = CooldownTracker::new();
        tracker.observe_send(&json!({"result": true}));

        let started = Instant::now();
        tracker.wait_for_send(100).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= GLOBAL_SEND_COOLDOWN);
        assert!(elapsed < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn unit_wait_is_immediate_once_cooldowns_expire() {
        let tracker = CooldownTracker::new();
        tracker.observe_send(&json!({
            "message_id": 8,
            "chat": {"id": 100, "type": "private"},
        }));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let started = Instant::now();
        tracker.wait_for_send(100).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
