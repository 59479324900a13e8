//! Request-handling state machine.
//!
//! Every content request walks
//! `CheckingFeature → CheckingVerification → CheckingCooldown → Fetching →
//! Validating → Ready`. The first three states may end the request with a
//! denial; the cooldown is only consumed right before fetching, so an early
//! denial never costs the requester a window.

use crate::config::GatewaySettings;
use crate::gateway::catalog::SourceCatalog;
use crate::gateway::clock::Clock;
use crate::gateway::fetcher::{FallbackFetcher, Resource, ResourceOrigin};
use crate::gateway::identity::RawIdentity;
use crate::gateway::policy::{
    AccessPolicyStore, GroupPolicy, PolicyError, PolicyOptions, VerificationRecord,
};
use crate::gateway::rate_limit::RateLimiter;
use crate::gateway::upstream::UpstreamClient;
use crate::gateway::validator::MediaKind;
use crate::storage::GroupSettingsStore;
use reqwest::Url;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// States of one content request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Is the feature on in this conversation?
    CheckingFeature,
    /// Is the requester verified?
    CheckingVerification,
    /// Is the requester outside a cooldown window?
    CheckingCooldown,
    /// Walking the fallback chain
    Fetching,
    /// Checking the fetched locator is deliverable
    Validating,
    /// Resource ready for the transport
    Ready,
}

/// Why a content request was not served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The conversation has the feature turned off
    FeatureDisabled,
    /// The requester has not verified their age
    NotVerified,
    /// The requester must wait
    OnCooldown {
        /// Seconds until the window ends
        remaining_secs: u64,
    },
    /// No such category
    UnknownCategory {
        /// What was asked for
        requested: String,
        /// Configured categories
        available: Vec<String>,
    },
    /// Upstream unavailable and no last resort
    Failed,
}

impl Denial {
    /// User-facing message with a remedy where there is one
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::FeatureDisabled => {
                "🔒 Media commands are turned off in this chat. An admin can enable them with /toggle on."
                    .to_string()
            }
            Self::NotVerified => {
                "🔞 You need to verify your age first: use /verify <age>.".to_string()
            }
            Self::OnCooldown { remaining_secs } => {
                format!("⏳ Slow down! Try again in {remaining_secs}s.")
            }
            Self::UnknownCategory {
                requested,
                available,
            } => format!(
                "❓ Unknown category \"{requested}\". Available: {}.",
                available.join(", ")
            ),
            Self::Failed => {
                "⚠️ Couldn't fetch anything right now. Please try again later.".to_string()
            }
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeatureDisabled => f.write_str("feature disabled"),
            Self::NotVerified => f.write_str("not verified"),
            Self::OnCooldown { remaining_secs } => write!(f, "on cooldown ({remaining_secs}s)"),
            Self::UnknownCategory { requested, .. } => write!(f, "unknown category {requested}"),
            Self::Failed => f.write_str("upstream unavailable"),
        }
    }
}

impl std::error::Error for Denial {}

/// What the transport should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInstruction {
    /// Resource locator
    pub url: String,
    /// Caption for the message
    pub caption: String,
    /// Media kind of the category
    pub kind: MediaKind,
    /// Where the resource came from
    pub origin: ResourceOrigin,
    /// Category name as configured
    pub category: String,
}

/// Point-in-time counters for `/stats`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// Identities with a verification record
    pub verified_identities: usize,
    /// Cooldown windows that have not expired yet
    pub active_cooldowns: usize,
    /// Categories configured
    pub categories: usize,
    /// Requests served from a primary endpoint
    pub served_primary: u64,
    /// Requests served from a fallback endpoint
    pub served_fallback: u64,
    /// Requests served from a last-resort resource
    pub served_last_resort: u64,
    /// Requests that failed upstream
    pub failed: u64,
    /// Fetch attempts that ran past the slow-call threshold
    pub slow_fetches: u64,
    /// Denials because the feature was off
    pub denied_feature: u64,
    /// Denials because of missing verification
    pub denied_unverified: u64,
    /// Denials because of a running cooldown
    pub denied_cooldown: u64,
}

#[derive(Default)]
struct Counters {
    served_primary: AtomicU64,
    served_fallback: AtomicU64,
    served_last_resort: AtomicU64,
    failed: AtomicU64,
    denied_feature: AtomicU64,
    denied_unverified: AtomicU64,
    denied_cooldown: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_denial(&self, denial: &Denial) {
        match denial {
            Denial::FeatureDisabled => Self::bump(&self.denied_feature),
            Denial::NotVerified => Self::bump(&self.denied_unverified),
            Denial::OnCooldown { .. } => Self::bump(&self.denied_cooldown),
            Denial::Failed => Self::bump(&self.failed),
            Denial::UnknownCategory { .. } => {}
        }
    }

    fn record_served(&self, origin: ResourceOrigin) {
        match origin {
            ResourceOrigin::Primary => Self::bump(&self.served_primary),
            ResourceOrigin::Fallback(_) => Self::bump(&self.served_fallback),
            ResourceOrigin::LastResort => Self::bump(&self.served_last_resort),
        }
    }
}

/// Composes policy, cooldowns and fetching into one request handler
pub struct GatewayOrchestrator {
    policy: Arc<AccessPolicyStore>,
    limiter: Arc<RateLimiter>,
    fetcher: FallbackFetcher,
    cooldown: Duration,
    counters: Counters,
}

impl GatewayOrchestrator {
    /// Wire an orchestrator from its parts
    #[must_use]
    pub fn new(
        policy: Arc<AccessPolicyStore>,
        limiter: Arc<RateLimiter>,
        fetcher: FallbackFetcher,
        cooldown: Duration,
    ) -> Self {
        Self {
            policy,
            limiter,
            fetcher,
            cooldown,
            counters: Counters::default(),
        }
    }

    /// Build the whole gateway from settings and the injected collaborators.
    ///
    /// Loads the verification snapshot from the data directory.
    pub async fn from_settings(
        settings: &GatewaySettings,
        clock: Arc<dyn Clock>,
        group_settings: Arc<dyn GroupSettingsStore>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        let options = PolicyOptions {
            snapshot_path: Some(settings.verification_snapshot_path()),
            feature_key: settings.feature_key.clone(),
            identity_domain: settings.identity_domain.clone(),
            minimum_age: settings.minimum_age,
        };
        let policy = AccessPolicyStore::load(options, group_settings, clock.clone()).await;
        let limiter = RateLimiter::new(clock);
        let fetcher = FallbackFetcher::new(
            Arc::new(settings.catalog()),
            upstream,
            settings.retry_policy(),
        );

        Self::new(
            Arc::new(policy),
            Arc::new(limiter),
            fetcher,
            settings.cooldown(),
        )
    }

    /// The access policy store
    #[must_use]
    pub fn policy(&self) -> &AccessPolicyStore {
        &self.policy
    }

    /// The cooldown tracker
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The configured categories
    #[must_use]
    pub fn catalog(&self) -> &SourceCatalog {
        self.fetcher.catalog()
    }

    /// Handle one content request end to end.
    ///
    /// # Errors
    ///
    /// Returns the [`Denial`] that ended the request.
    pub async fn handle_content_request(
        &self,
        identity: impl Into<RawIdentity>,
        conversation_id: &str,
        category: &str,
    ) -> Result<DeliveryInstruction, Denial> {
        let result = self.run(identity.into(), conversation_id, category).await;
        match &result {
            Ok(delivery) => self.counters.record_served(delivery.origin),
            Err(denial) => {
                self.counters.record_denial(denial);
                debug!(conversation_id, category, denial = %denial, "Content request denied");
            }
        }
        result
    }

    async fn run(
        &self,
        identity: RawIdentity,
        conversation_id: &str,
        category: &str,
    ) -> Result<DeliveryInstruction, Denial> {
        enter(RequestState::CheckingFeature, conversation_id, category);
        if !self.policy.is_group_feature_enabled(conversation_id).await {
            return Err(Denial::FeatureDisabled);
        }

        enter(RequestState::CheckingVerification, conversation_id, category);
        let Some(identity) = self.policy.normalize(identity) else {
            return Err(Denial::NotVerified);
        };
        if !self.policy.is_verified(&identity).await {
            return Err(Denial::NotVerified);
        }

        let Some(entry) = self.fetcher.catalog().get(category) else {
            return Err(Denial::UnknownCategory {
                requested: category.to_string(),
                available: self.catalog().names().map(ToString::to_string).collect(),
            });
        };

        enter(RequestState::CheckingCooldown, conversation_id, category);
        if !self.limiter.try_acquire(&identity, self.cooldown) {
            return Err(Denial::OnCooldown {
                remaining_secs: self.limiter.remaining_seconds(&identity),
            });
        }

        enter(RequestState::Fetching, conversation_id, category);
        let resource = match self
            .fetcher
            .fetch(&entry.name, entry.kind.requires_check())
            .await
        {
            Ok(resource) => resource,
            Err(not_found) => {
                warn!(identity = %identity, error = %not_found, "Upstream unavailable");
                return Err(Denial::Failed);
            }
        };

        enter(RequestState::Validating, conversation_id, category);
        if !is_deliverable(&resource) {
            warn!(identity = %identity, url = %resource.url, "Fetched locator is not deliverable");
            return Err(Denial::Failed);
        }

        enter(RequestState::Ready, conversation_id, category);
        info!(
            identity = %identity,
            conversation_id,
            category = %entry.name,
            origin = ?resource.origin,
            attempts = resource.attempts,
            "Content request served"
        );
        Ok(DeliveryInstruction {
            url: resource.url,
            caption: entry.caption().to_string(),
            kind: entry.kind,
            origin: resource.origin,
            category: entry.name.clone(),
        })
    }

    /// `/verify <age>`
    ///
    /// # Errors
    ///
    /// See [`AccessPolicyStore::verify`].
    pub async fn verify(
        &self,
        identity: impl Into<RawIdentity>,
        asserted_age: u32,
    ) -> Result<VerificationRecord, PolicyError> {
        self.policy.verify(identity, asserted_age).await
    }

    /// `/toggle on|off`
    ///
    /// # Errors
    ///
    /// See [`AccessPolicyStore::set_group_feature`].
    pub async fn toggle_feature(
        &self,
        conversation_id: &str,
        enabled: bool,
    ) -> Result<GroupPolicy, PolicyError> {
        self.policy.set_group_feature(conversation_id, enabled).await
    }

    /// `/stats`
    pub async fn stats(&self) -> GatewayStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        GatewayStats {
            verified_identities: self.policy.verified_count().await,
            active_cooldowns: self.limiter.active_count(),
            categories: self.catalog().len(),
            served_primary: load(&self.counters.served_primary),
            served_fallback: load(&self.counters.served_fallback),
            served_last_resort: load(&self.counters.served_last_resort),
            failed: load(&self.counters.failed),
            slow_fetches: self.fetcher.slow_call_count(),
            denied_feature: load(&self.counters.denied_feature),
            denied_unverified: load(&self.counters.denied_unverified),
            denied_cooldown: load(&self.counters.denied_cooldown),
        }
    }
}

fn enter(state: RequestState, conversation_id: &str, category: &str) {
    debug!(?state, conversation_id, category, "Request state");
}

/// The transport can only send absolute http(s) locators
fn is_deliverable(resource: &Resource) -> bool {
    Url::parse(&resource.url)
        .is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::catalog::Category;
    use crate::gateway::clock::ManualClock;
    use crate::gateway::fetcher::RetryPolicy;
    use crate::gateway::upstream::{FetchError, MockUpstreamClient};
    use crate::storage::MemorySettingsStore;
    use serde_json::json;

    fn orchestrator(upstream: MockUpstreamClient) -> GatewayOrchestrator {
        orchestrator_with_endpoints(upstream, &["https://api.test/waifu"])
    }

    fn orchestrator_with_endpoints(
        upstream: MockUpstreamClient,
        endpoints: &[&str],
    ) -> GatewayOrchestrator {
        let clock = Arc::new(ManualClock::default());
        let catalog = SourceCatalog::new([Category {
            name: "waifu".to_string(),
            kind: MediaKind::Static,
            endpoints: endpoints.iter().map(ToString::to_string).collect(),
            last_resort: None,
            caption: Some("Here you go".to_string()),
        }]);
        let policy = AccessPolicyStore::new(
            PolicyOptions::default(),
            Arc::new(MemorySettingsStore::new()),
            clock.clone(),
        );
        let fetcher = FallbackFetcher::new(
            Arc::new(catalog),
            Arc::new(upstream),
            RetryPolicy {
                base_delay: Duration::ZERO,
                jitter: Duration::ZERO,
                ..RetryPolicy::default()
            },
        );
        GatewayOrchestrator::new(
            Arc::new(policy),
            Arc::new(RateLimiter::new(clock)),
            fetcher,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_denials_before_fetch_do_not_consume_cooldown() -> Result<(), PolicyError> {
        let mut upstream = MockUpstreamClient::new();
        upstream
            .expect_get_json()
            .returning(|_| Ok(json!({"url": "https://cdn.test/a.png"})));
        let gateway = orchestrator(upstream);

        assert_eq!(
            gateway.handle_content_request("7", "g1", "waifu").await,
            Err(Denial::FeatureDisabled)
        );
        gateway.toggle_feature("g1", true).await?;
        assert_eq!(
            gateway.handle_content_request("7", "g1", "waifu").await,
            Err(Denial::NotVerified)
        );
        gateway.verify("7", 21).await?;
        assert!(matches!(
            gateway.handle_content_request("7", "g1", "dragons").await,
            Err(Denial::UnknownCategory { ref available, .. }) if available == &["waifu".to_string()]
        ));
        assert_eq!(gateway.limiter().entry_count(), 0);

        let delivery = gateway.handle_content_request("7", "g1", "waifu").await;
        assert_eq!(
            delivery.map(|d| (d.url, d.caption)),
            Ok(("https://cdn.test/a.png".to_string(), "Here you go".to_string()))
        );

        let stats = gateway.stats().await;
        assert_eq!(stats.served_primary, 1);
        assert_eq!(stats.denied_feature, 1);
        assert_eq!(stats.denied_unverified, 1);
        assert_eq!(stats.active_cooldowns, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_upstream_failure_reports_failed() -> Result<(), PolicyError> {
        let mut upstream = MockUpstreamClient::new();
        upstream
            .expect_get_json()
            .returning(|_| Err(FetchError::Status(502)));
        let gateway = orchestrator(upstream);
        gateway.toggle_feature("g1", true).await?;
        gateway.verify("7", 30).await?;

        let denial = gateway.handle_content_request("7", "g1", "waifu").await;
        assert_eq!(denial, Err(Denial::Failed));
        assert!(Denial::Failed.message().contains("try again later"));
        assert_eq!(gateway.stats().await.failed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_undeliverable_locator_fails() -> Result<(), PolicyError> {
        let mut upstream = MockUpstreamClient::new();
        upstream
            .expect_get_json()
            .returning(|_| Ok(json!({"url": "javascript:alert(1)"})));
        let gateway = orchestrator(upstream);
        gateway.toggle_feature("g1", true).await?;
        gateway.verify("7", 30).await?;

        assert_eq!(
            gateway.handle_content_request("7", "g1", "waifu").await,
            Err(Denial::Failed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_relative_locator_uses_fallback() -> Result<(), PolicyError> {
        let mut upstream = MockUpstreamClient::new();
        upstream.expect_get_json().returning(|url| {
            if url.ends_with("/waifu") {
                Ok(json!({"url": "/relative/img.png"}))
            } else {
                Ok(json!({"images": [{"url": "https://cdn.test/b.png"}]}))
            }
        });
        let gateway = orchestrator_with_endpoints(
            upstream,
            &["https://api.test/waifu", "https://mirror.test/gallery"],
        );
        gateway.toggle_feature("g1", true).await?;
        gateway.verify("7", 30).await?;

        let delivery = gateway.handle_content_request("7", "g1", "waifu").await;
        assert_eq!(
            delivery.map(|d| d.url),
            Ok("https://cdn.test/b.png".to_string())
        );
        assert_eq!(gateway.stats().await.served_fallback, 1);
        Ok(())
    }

    #[test]
    fn test_denial_messages_carry_remedies() {
        assert!(Denial::NotVerified.message().contains("/verify <age>"));
        assert!(Denial::FeatureDisabled.message().contains("/toggle on"));
        assert!(Denial::OnCooldown { remaining_secs: 12 }
            .message()
            .contains("12s"));
    }
}
