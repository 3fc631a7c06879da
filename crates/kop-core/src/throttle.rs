use std::{collections::HashMap, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two outbound sends (account-level flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(250),
            per_chat_min_interval: Duration::from_millis(1000),
        }
    }
}

/// Earliest instant the next send may start, globally and per chat.
#[derive(Debug)]
struct Slots {
    global: Instant,
    per_chat: HashMap<String, Instant>,
}

/// Send throttle shared by replies and broadcasts.
///
/// A caller books its start time under the lock and sleeps outside it, so concurrent
/// callers line up behind each other instead of bursting together.
pub struct SendThrottle {
    cfg: ThrottleConfig,
    slots: Mutex<Slots>,
}

impl SendThrottle {
    pub fn new(cfg: ThrottleConfig) -> Self {
        Self {
            cfg,
            slots: Mutex::new(Slots {
                global: Instant::now(),
                per_chat: HashMap::new(),
            }),
        }
    }

    /// Wait until a send to `chat` is allowed.
    pub async fn acquire(&self, chat: &str) {
        let start = {
            let mut slots = self.slots.lock().await;
            let now = Instant::now();
            let chat_free = slots.per_chat.get(chat).copied().unwrap_or(now);
            let start = now.max(slots.global).max(chat_free);

            slots.global = start + self.cfg.global_min_interval;
            slots
                .per_chat
                .insert(chat.to_string(), start + self.cfg.per_chat_min_interval);
            // Entries in the past carry no constraint.
            slots.per_chat.retain(|_, free_at| *free_at > now);
            start
        };
        sleep_until(start).await;
    }

    /// Forget per-chat spacing (on session reset).
    pub async fn clear(&self) {
        self.slots.lock().await.per_chat.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> SendThrottle {
        SendThrottle::new(ThrottleConfig {
            global_min_interval: Duration::from_millis(10),
            per_chat_min_interval: Duration::from_millis(500),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn same_chat_sends_are_spaced() {
        let throttle = throttle();
        let start = Instant::now();
        for _ in 0..3 {
            throttle.acquire("628111@c.us").await;
        }
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn different_chats_only_pay_the_global_interval() {
        let throttle = throttle();
        let start = Instant::now();
        throttle.acquire("628111@c.us").await;
        throttle.acquire("628222@c.us").await;
        throttle.acquire("628333@c.us").await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_per_chat_spacing() {
        let throttle = throttle();
        throttle.acquire("628111@c.us").await;
        throttle.clear().await;
        let start = Instant::now();
        throttle.acquire("628111@c.us").await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
