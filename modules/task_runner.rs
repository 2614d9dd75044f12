//! Retrying task runner: one completion call bounded by a timeout, retried
//! with exponential backoff while the failure is retryable

use backon::{BackoffBuilder, ExponentialBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::modules::completion_client::{CompletionClient, CompletionError, CompletionRequest};
use crate::modules::conversation::FailureKind;

const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_FACTOR: f32 = 2.0;

/// Delay schedule between attempts. Delays never decrease and never exceed `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: f32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// Same delay before every retry
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min_delay: delay,
            max_delay: delay,
            factor: 1.0,
        }
    }

    /// Delays for up to `retries` retries
    pub fn delays(&self, retries: u32) -> impl Iterator<Item = Duration> {
        let max_delay = self.max_delay;
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor)
            .with_max_times(retries as usize)
            .build()
            .map(move |d| d.min(max_delay))
    }
}

/// One unit of work: a request plus its timeout and retry budget
#[derive(Debug, Clone)]
pub struct CompletionJob {
    pub position: usize,
    pub request: CompletionRequest,
    /// Bound on each individual attempt
    pub timeout: Duration,
    pub retry_limit: u32,
    pub attempts_made: u32,
}

impl CompletionJob {
    pub fn new(position: usize, request: CompletionRequest, timeout: Duration, retry_limit: u32) -> Self {
        Self {
            position,
            request,
            timeout,
            retry_limit,
            attempts_made: 0,
        }
    }

    pub fn retries_used(&self) -> u32 {
        self.attempts_made.saturating_sub(1)
    }
}

/// Terminal result of a job
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { content: String, attempts: u32 },
    Failure { kind: FailureKind, error: CompletionError, attempts: u32 },
}

/// Runs completion jobs against a client
#[derive(Clone)]
pub struct RetryingTaskRunner {
    client: Arc<dyn CompletionClient>,
    backoff: BackoffPolicy,
}

impl RetryingTaskRunner {
    pub fn new(client: Arc<dyn CompletionClient>, backoff: BackoffPolicy) -> Self {
        Self { client, backoff }
    }

    pub fn client(&self) -> Arc<dyn CompletionClient> {
        self.client.clone()
    }

    /// Drive the job to a terminal state. Suspends only on the client call and
    /// the backoff sleep.
    pub async fn run(&self, job: &mut CompletionJob) -> Outcome {
        let mut delays = self.backoff.delays(job.retry_limit);

        loop {
            job.attempts_made += 1;
            debug!(
                "Unit {}: attempt {} of at most {}",
                job.position,
                job.attempts_made,
                job.retry_limit + 1
            );

            let result = match tokio::time::timeout(job.timeout, self.client.complete(&job.request, job.timeout)).await {
                Ok(result) => result,
                Err(_) => Err(CompletionError::Timeout(job.timeout)),
            };

            let error = match result {
                Ok(content) => {
                    info!(
                        "Unit {} completed by {} after {} attempt(s)",
                        job.position,
                        self.client.vendor().as_str(),
                        job.attempts_made
                    );
                    return Outcome::Success {
                        content,
                        attempts: job.attempts_made,
                    };
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                warn!("Unit {} failed permanently: {}", job.position, error);
                return Outcome::Failure {
                    kind: FailureKind::Fatal,
                    error,
                    attempts: job.attempts_made,
                };
            }

            if job.retries_used() >= job.retry_limit {
                warn!(
                    "Unit {} gave up after {} attempt(s): {}",
                    job.position, job.attempts_made, error
                );
                return Outcome::Failure {
                    kind: FailureKind::RetriesExhausted,
                    error,
                    attempts: job.attempts_made,
                };
            }

            let delay = delays.next().unwrap_or(self.backoff.max_delay);
            warn!(
                "Unit {} attempt {} failed ({}), retrying in {:?}",
                job.position, job.attempts_made, error, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::conversation::{Message, Role};
    use crate::modules::testing::{ScriptedClient, Step};

    fn job(prompt: &str, retry_limit: u32) -> CompletionJob {
        let request = CompletionRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![Message::new(Role::User, prompt)],
            temperature: None,
            max_tokens: None,
        };
        CompletionJob::new(1, request, Duration::from_secs(5), retry_limit)
    }

    fn rate_limited_then_ok(failures: usize) -> ScriptedClient {
        let mut steps: Vec<Step> = (0..failures)
            .map(|_| Step::fail(CompletionError::RateLimited("slow down".into())))
            .collect();
        steps.push(Step::reply("done"));
        ScriptedClient::new().script("q", steps)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_then_success_within_budget() {
        // R = 4: three rate limits, success on the fourth attempt
        for retry_limit in [3, 4, 6] {
            let client = Arc::new(rate_limited_then_ok(3));
            let runner = RetryingTaskRunner::new(client.clone(), BackoffPolicy::default());
            let mut job = job("q", retry_limit);

            let outcome = runner.run(&mut job).await;
            assert_eq!(
                outcome,
                Outcome::Success {
                    content: "done".into(),
                    attempts: 4
                }
            );
            assert_eq!(job.retries_used(), 3);
            assert_eq!(client.calls_for("q"), 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_beyond_budget_is_exhausted() {
        let client = Arc::new(rate_limited_then_ok(3));
        let runner = RetryingTaskRunner::new(client.clone(), BackoffPolicy::default());
        let mut job = job("q", 2);

        match runner.run(&mut job).await {
            Outcome::Failure { kind, error, attempts } => {
                assert_eq!(kind, FailureKind::RetriesExhausted);
                assert!(matches!(error, CompletionError::RateLimited(_)));
                assert_eq!(attempts, 3);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(job.attempts_made, job.retry_limit + 1);
        assert_eq!(client.calls_for("q"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_consumes_no_retries() {
        let client = Arc::new(
            ScriptedClient::new().script("q", vec![Step::fail(CompletionError::Auth("bad key".into()))]),
        );
        let runner = RetryingTaskRunner::new(client.clone(), BackoffPolicy::default());
        let mut job = job("q", 5);

        let outcome = runner.run(&mut job).await;
        assert!(matches!(
            outcome,
            Outcome::Failure {
                kind: FailureKind::Fatal,
                error: CompletionError::Auth(_),
                attempts: 1
            }
        ));
        assert_eq!(job.retries_used(), 0);
        assert_eq!(client.calls_for("q"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out_and_is_retried() {
        let client = Arc::new(ScriptedClient::new().script(
            "q",
            vec![
                Step::reply("too late").after(Duration::from_secs(30)),
                Step::reply("in time").after(Duration::from_secs(1)),
            ],
        ));
        let runner = RetryingTaskRunner::new(client.clone(), BackoffPolicy::fixed(Duration::from_millis(10)));
        let mut job = job("q", 1);

        let started = tokio::time::Instant::now();
        let outcome = runner.run(&mut job).await;
        assert_eq!(
            outcome,
            Outcome::Success {
                content: "in time".into(),
                attempts: 2
            }
        );
        // 5s timeout + 10ms backoff + 1s reply
        assert!(started.elapsed() < Duration::from_secs(7));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_times_out_once() {
        let client = Arc::new(
            ScriptedClient::new().script("q", vec![Step::reply("never").after(Duration::from_secs(60))]),
        );
        let runner = RetryingTaskRunner::new(client.clone(), BackoffPolicy::default());
        let mut job = job("q", 0);

        match runner.run(&mut job).await {
            Outcome::Failure { kind, error, attempts } => {
                assert_eq!(kind, FailureKind::RetriesExhausted);
                assert_eq!(error, CompletionError::Timeout(Duration::from_secs(5)));
                assert_eq!(attempts, 1);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = BackoffPolicy {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        };
        let delays: Vec<Duration> = policy.delays(8).collect();
        assert_eq!(delays.len(), 8);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
        assert_eq!(delays[7], Duration::from_secs(10));

        let fixed: Vec<Duration> = BackoffPolicy::fixed(Duration::from_millis(250)).delays(3).collect();
        assert_eq!(fixed, vec![Duration::from_millis(250); 3]);
    }
}
