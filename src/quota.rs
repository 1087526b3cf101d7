use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::models::{ ModelProfile, TierLimit };
use crate::error::EngineResult;
use crate::history::Store;
use crate::models::chat::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Standard,
    Premium,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Standard => write!(f, "standard"),
            Tier::Premium => write!(f, "premium"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub remaining: u64,
    pub tier: Tier,
}

impl RateDecision {
    pub fn allows(&self) -> bool {
        self.remaining > 0
    }
}

/// `max(0, limit - used)`, so never negative and non-increasing in `used`.
pub fn remaining_from(limit: u64, used: u64) -> u64 {
    limit.saturating_sub(used)
}

/// Derives remaining quota from the usage events the store records when a
/// turn is persisted. Nothing is written here.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn Store>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn remaining(
        &self,
        user_id: UserId,
        profile: &ModelProfile,
        is_subscribed: bool
    ) -> EngineResult<RateDecision> {
        let (tier, limit) = if is_subscribed {
            (Tier::Premium, profile.limits.subscribed)
        } else {
            (Tier::Standard, profile.limits.standard)
        };
        let remaining = self.remaining_in(user_id, &profile.id, limit).await?;
        Ok(RateDecision { remaining, tier })
    }

    /// Secondary quota of an auxiliary tool, counted on its own stream.
    pub async fn tool_remaining(
        &self,
        user_id: UserId,
        stream: &str,
        limit: TierLimit
    ) -> EngineResult<u64> {
        self.remaining_in(user_id, stream, limit).await
    }

    async fn remaining_in(&self, user_id: UserId, stream: &str, limit: TierLimit) -> EngineResult<u64> {
        let used = self.store.count_events(user_id, stream, limit.interval).await?;
        Ok(remaining_from(limit.limit, used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::TierLimits;
    use crate::history::MemoryStore;
    use crate::llm::BackendFamily;
    use crate::models::chat::{ Message, StoredMessage, UsageEvent };

    fn profile() -> ModelProfile {
        let mut profile = ModelProfile::new("gpt-4o", "gpt-4o", BackendFamily::OpenAI);
        profile.limits = TierLimits {
            standard: TierLimit { limit: 10, interval: 86400 },
            subscribed: TierLimit { limit: 20, interval: 86400 },
        };
        profile
    }

    async fn record(store: &MemoryStore, user_id: UserId, stream: &str) {
        let mut turn = StoredMessage::new(Message::user("hi"));
        turn.usage = Some(UsageEvent { user_id, stream: stream.to_string(), retention: 0 });
        store.append_message("conv", turn).await.unwrap();
    }

    #[test]
    fn test_remaining_is_monotone_and_never_negative() {
        let mut previous = u64::MAX;
        for used in 0..30 {
            let remaining = remaining_from(10, used);
            assert!(remaining <= previous);
            previous = remaining;
        }
        assert_eq!(remaining_from(10, 25), 0);
    }

    #[tokio::test]
    async fn test_standard_tier_runs_out() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone());
        let profile = profile();

        for _ in 0..10 {
            record(&store, 1, "gpt-4o").await;
        }
        let decision = limiter.remaining(1, &profile, false).await.unwrap();
        assert_eq!(decision, RateDecision { remaining: 0, tier: Tier::Standard });
        assert!(!decision.allows());

        let premium = limiter.remaining(1, &profile, true).await.unwrap();
        assert_eq!(premium, RateDecision { remaining: 10, tier: Tier::Premium });
    }

    #[tokio::test]
    async fn test_usage_is_per_user_and_model() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone());
        record(&store, 1, "gpt-4o").await;
        record(&store, 1, "claude").await;
        record(&store, 2, "gpt-4o").await;

        let decision = limiter.remaining(1, &profile(), false).await.unwrap();
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test]
    async fn test_tool_quota_uses_its_own_stream() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone());
        let daily = TierLimit { limit: 2, interval: 86400 };

        record(&store, 1, "gpt-4o").await;
        assert_eq!(limiter.tool_remaining(1, "tool:image", daily).await.unwrap(), 2);
        record(&store, 1, "tool:image").await;
        record(&store, 1, "tool:image").await;
        assert_eq!(limiter.tool_remaining(1, "tool:image", daily).await.unwrap(), 0);
    }
}
