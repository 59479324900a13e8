//! Ordered multi-endpoint fetch with retries and a last-resort resource.
//!
//! Each category resolves to `[primary, fallback_1 .. fallback_n]`. The
//! primary gets the full retry budget, fallbacks a reduced one, all sharing
//! one exponential backoff policy with jitter. When every endpoint fails the
//! category's static last-resort resource is returned, if it has one.

use crate::gateway::catalog::{Category, EndpointRole, SourceCatalog, SourceEndpoint};
use crate::gateway::upstream::{decode_resource_url, FetchError, UpstreamClient};
use crate::gateway::validator::{ContentValidator, MediaKind};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, info, warn};

/// Retry budgets and backoff shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts on the primary endpoint
    pub primary_budget: usize,
    /// Attempts on each fallback endpoint
    pub fallback_budget: usize,
    /// First delay between attempts, doubled per retry
    pub base_delay: Duration,
    /// Cap for a single delay
    pub max_delay: Duration,
    /// Random offset applied in both directions
    pub jitter: Duration,
    /// Upper bound for one attempt, probe included
    pub attempt_timeout: Duration,
    /// Cumulative elapsed time after which attempts are flagged as slow
    pub slow_call_threshold: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        use crate::config::{
            BACKOFF_BASE_MS, BACKOFF_JITTER_MS, BACKOFF_MAX_MS, FALLBACK_RETRY_BUDGET,
            FETCH_TIMEOUT_SECS, PRIMARY_RETRY_BUDGET, SLOW_CALL_THRESHOLD_MS,
        };

        Self {
            primary_budget: PRIMARY_RETRY_BUDGET,
            fallback_budget: FALLBACK_RETRY_BUDGET,
            base_delay: Duration::from_millis(BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(BACKOFF_MAX_MS),
            jitter: Duration::from_millis(BACKOFF_JITTER_MS),
            attempt_timeout: Duration::from_secs(FETCH_TIMEOUT_SECS),
            slow_call_threshold: Duration::from_millis(SLOW_CALL_THRESHOLD_MS),
        }
    }
}

impl RetryPolicy {
    /// Attempts allowed for an endpoint role, never less than one
    #[must_use]
    pub fn budget(&self, role: EndpointRole) -> usize {
        match role {
            EndpointRole::Primary => self.primary_budget,
            EndpointRole::Fallback(_) => self.fallback_budget,
        }
        .max(1)
    }

    /// Delays slept between the attempts of one endpoint
    pub fn delays(&self, attempts: usize) -> impl Iterator<Item = Duration> {
        let factor = u64::try_from(self.base_delay.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = self.jitter;
        let max_delay = self.max_delay;

        // 2^n * base/2: base, 2*base, 4*base, ...
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(max_delay)
            .map(move |delay| apply_jitter(delay, jitter, max_delay))
            .take(attempts.saturating_sub(1))
    }
}

/// Shift `delay` by a random amount within `±jitter`, kept inside `[0, max]`
fn apply_jitter(delay: Duration, jitter: Duration, max: Duration) -> Duration {
    let jitter_ms = i64::try_from(jitter.as_millis()).unwrap_or(i64::MAX);
    if jitter_ms == 0 {
        return delay.min(max);
    }
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
    let shifted = u64::try_from(delay_ms.saturating_add(offset).max(0)).unwrap_or(0);
    Duration::from_millis(shifted).min(max)
}

/// Where a delivered resource came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOrigin {
    /// The category's primary endpoint
    Primary,
    /// The n-th fallback endpoint (0-based)
    Fallback(usize),
    /// The static last-resort resource
    LastResort,
}

impl From<EndpointRole> for ResourceOrigin {
    fn from(role: EndpointRole) -> Self {
        match role {
            EndpointRole::Primary => Self::Primary,
            EndpointRole::Fallback(index) => Self::Fallback(index),
        }
    }
}

/// A fetched resource locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Resource URL
    pub url: String,
    /// Endpoint role or last resort
    pub origin: ResourceOrigin,
    /// Endpoint that produced it, `None` for the last resort
    pub endpoint: Option<String>,
    /// Attempts made across the whole chain
    pub attempts: usize,
}

/// Final failure of one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    /// Endpoint URL
    pub endpoint: String,
    /// Attempts made on it
    pub attempts: usize,
    /// Error of the last attempt
    pub error: FetchError,
}

/// No endpoint produced a resource and no last resort is configured
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no resource for category '{category}': {}", FailureSummary(.failures))]
pub struct NotFound {
    /// Requested category
    pub category: String,
    /// Per-endpoint reasons, in chain order; empty for unknown categories
    pub failures: Vec<EndpointFailure>,
}

struct FailureSummary<'a>(&'a [EndpointFailure]);

impl fmt::Display for FailureSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no endpoints");
        }
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(
                f,
                "{} ({} attempts): {}",
                failure.endpoint, failure.attempts, failure.error
            )?;
        }
        Ok(())
    }
}

/// Fixed facts about the endpoint an attempt belongs to
#[derive(Clone, Copy)]
struct AttemptContext<'a> {
    category: &'a str,
    endpoint: &'a SourceEndpoint,
    budget: usize,
    /// Start of the whole fetch
    started: Instant,
}

/// Fetches category content through its fallback chain
#[derive(Clone)]
pub struct FallbackFetcher {
    catalog: Arc<SourceCatalog>,
    upstream: Arc<dyn UpstreamClient>,
    validator: ContentValidator,
    policy: RetryPolicy,
    /// Attempts that finished past the slow-call threshold
    slow_calls: Arc<AtomicU64>,
}

impl FallbackFetcher {
    /// Create a fetcher; validator probes share `upstream`
    #[must_use]
    pub fn new(
        catalog: Arc<SourceCatalog>,
        upstream: Arc<dyn UpstreamClient>,
        policy: RetryPolicy,
    ) -> Self {
        let validator = ContentValidator::new(upstream.clone());
        Self {
            catalog,
            upstream,
            validator,
            policy,
            slow_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of attempts flagged as slow so far
    #[must_use]
    pub fn slow_call_count(&self) -> u64 {
        self.slow_calls.load(Ordering::Relaxed)
    }

    /// The catalog this fetcher resolves categories against
    #[must_use]
    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    /// Fetch one resource for `category`.
    ///
    /// With `require_format` every candidate must pass the content validator
    /// for the category's media kind; a failed check counts as a failed
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` with the per-endpoint reasons when the chain is
    /// exhausted and the category has no last-resort resource, or when the
    /// category is unknown.
    pub async fn fetch(&self, category: &str, require_format: bool) -> Result<Resource, NotFound> {
        let Some(category) = self.catalog.get(category) else {
            debug!(category, "Unknown category");
            return Err(NotFound {
                category: category.to_string(),
                failures: Vec::new(),
            });
        };

        let started = Instant::now();
        let mut failures = Vec::new();
        let mut total_attempts = 0;

        for endpoint in category.chain() {
            let check = require_format && endpoint.requires_format_check;
            let (result, attempts) = self
                .fetch_endpoint(&category.name, &endpoint, category.kind, check, started)
                .await;
            total_attempts += attempts;

            match result {
                Ok(url) => {
                    if endpoint.role != EndpointRole::Primary {
                        warn!(
                            category = %category.name,
                            endpoint = %endpoint.url,
                            "Served from fallback endpoint"
                        );
                    }
                    return Ok(Resource {
                        url,
                        origin: endpoint.role.into(),
                        endpoint: Some(endpoint.url),
                        attempts: total_attempts,
                    });
                }
                Err(error) => failures.push(EndpointFailure {
                    endpoint: endpoint.url,
                    attempts,
                    error,
                }),
            }
        }

        self.last_resort(category, failures, total_attempts)
    }

    fn last_resort(
        &self,
        category: &Category,
        failures: Vec<EndpointFailure>,
        attempts: usize,
    ) -> Result<Resource, NotFound> {
        let summary = FailureSummary(&failures).to_string();
        match &category.last_resort {
            Some(url) => {
                warn!(category = %category.name, failures = %summary, "All endpoints failed, serving last-resort resource");
                Ok(Resource {
                    url: url.clone(),
                    origin: ResourceOrigin::LastResort,
                    endpoint: None,
                    attempts,
                })
            }
            None => {
                warn!(category = %category.name, failures = %summary, "All endpoints failed, upstream unavailable");
                Err(NotFound {
                    category: category.name.clone(),
                    failures,
                })
            }
        }
    }

    /// Run the retry loop of one endpoint, returning the outcome and the
    /// number of attempts made
    async fn fetch_endpoint(
        &self,
        category: &str,
        endpoint: &SourceEndpoint,
        kind: MediaKind,
        check_format: bool,
        started: Instant,
    ) -> (Result<String, FetchError>, usize) {
        let context = AttemptContext {
            category,
            endpoint,
            budget: self.policy.budget(endpoint.role),
            started,
        };
        let mut attempts = 0;

        let result = Retry::spawn(self.policy.delays(context.budget), || {
            attempts += 1;
            let attempt = attempts;
            let context = &context;
            async move {
                let attempt_started = Instant::now();
                let result = self.attempt(context.endpoint, kind, check_format).await;
                self.log_attempt(context, attempt, attempt_started, &result);
                result
            }
        })
        .await;

        (result, attempts)
    }

    async fn attempt(
        &self,
        endpoint: &SourceEndpoint,
        kind: MediaKind,
        check_format: bool,
    ) -> Result<String, FetchError> {
        let work = async {
            let body = self.upstream.get_json(&endpoint.url).await?;
            let url = decode_resource_url(&body)?;
            if check_format && !self.validator.validate(&url, kind).await {
                return Err(FetchError::Validation(format!("{url} is not {kind}")));
            }
            Ok(url)
        };

        tokio::time::timeout(self.policy.attempt_timeout, work)
            .await
            .unwrap_or(Err(FetchError::Timeout(self.policy.attempt_timeout)))
    }

    fn log_attempt(
        &self,
        context: &AttemptContext<'_>,
        attempt: usize,
        attempt_started: Instant,
        result: &Result<String, FetchError>,
    ) {
        let AttemptContext {
            category,
            endpoint,
            budget,
            started,
        } = *context;
        let elapsed_ms = attempt_started.elapsed().as_millis();
        let total = started.elapsed();
        let total_ms = total.as_millis();

        match result {
            Ok(url) => info!(
                category,
                endpoint = %endpoint.url,
                attempt,
                budget,
                elapsed_ms,
                total_ms,
                resource = %url,
                "Fetch attempt succeeded"
            ),
            Err(e) => debug!(
                category,
                endpoint = %endpoint.url,
                attempt,
                budget,
                elapsed_ms,
                total_ms,
                error = %e,
                "Fetch attempt failed"
            ),
        }

        if total > self.policy.slow_call_threshold {
            self.slow_calls.fetch_add(1, Ordering::Relaxed);
            warn!(
                category,
                endpoint = %endpoint.url,
                attempt,
                total_ms,
                threshold_ms = self.policy.slow_call_threshold.as_millis(),
                "Slow upstream fetch"
            );
        }
    }
}
