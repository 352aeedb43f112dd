use anyhow::{Context, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::sleep;
use tracing::warn;

/// Chain id of the local development network that mines instantly
pub const LOCAL_DEV_CHAIN_ID: u64 = 1337;

/// Retry configuration for chain operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay slept after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.exponential_base.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_delay_ms as f64 * factor) as u64;
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Execute async operation with exponential backoff retry.
///
/// Only transient failures are retried; anything else is returned at once.
pub async fn retry_with_backoff<F, Fut, T>(operation: F, config: &RetryConfig) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_transient(&e) => return Err(e),
            Err(e) if attempt >= config.max_attempts => {
                return Err(e).context(format!("failed after {} attempts", attempt));
            }
            Err(e) => {
                let delay = config.delay_for(attempt);
                warn!(
                    "Attempt {}/{} failed, retrying in {:?}: {:#}",
                    attempt, config.max_attempts, delay, e
                );
                sleep(delay).await;
            }
        }
    }
}

const PERMANENT_SIGNATURES: &[&str] = &[
    "execution reverted",
    "revert",
    "invalid argument",
    "insufficient funds",
];

const TRANSIENT_SIGNATURES: &[&str] = &[
    // network
    "network",
    "connection",
    "error sending request",
    "econnreset",
    "econnrefused",
    "broken pipe",
    // timeout
    "timeout",
    "timed out",
    // remote server
    "server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    // nonce contention
    "nonce too low",
    "nonce has already been used",
    "nonce conflict",
    "replacement transaction underpriced",
    "already known",
];

const RETRYABLE_STATUS: &[u16] = &[502, 503, 504];

/// Whether an error matches a recognizable transient failure signature
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(e) = err.chain().find_map(|e| e.downcast_ref::<reqwest::Error>()) {
        if e.is_timeout() || e.is_connect() {
            return true;
        }
        if let Some(status) = e.status() {
            return RETRYABLE_STATUS.contains(&status.as_u16());
        }
    }

    let message = format!("{:#}", err).to_lowercase();

    if PERMANENT_SIGNATURES.iter().any(|s| message.contains(s)) {
        return false;
    }

    TRANSIENT_SIGNATURES.iter().any(|s| message.contains(s)) || names_retryable_status(&message)
}

/// A 502/503/504 written as a status (`HTTP 503`, `status: 502`,
/// `status code 504`). Bare digit runs inside hashes or ids do not count.
fn names_retryable_status(message: &str) -> bool {
    let words: Vec<&str> = message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words.windows(2).any(|pair| {
        matches!(pair[0], "http" | "status" | "code")
            && pair[1]
                .parse::<u16>()
                .map_or(false, |code| RETRYABLE_STATUS.contains(&code))
    })
}

/// Block confirmations required for `chain_id`
pub fn confirmations_for(chain_id: u64) -> usize {
    if chain_id == LOCAL_DEV_CHAIN_ID {
        0
    } else {
        1
    }
}

/// Confirmation count resolved once per client: from the configured chain id
/// when there is one, otherwise from a network lookup.
#[derive(Debug)]
pub struct ConfirmationPolicy {
    configured_chain_id: Option<u64>,
    resolved: OnceCell<usize>,
}

impl ConfirmationPolicy {
    /// A configured id of 0 counts as unconfigured
    pub fn new(configured_chain_id: Option<u64>) -> Self {
        Self {
            configured_chain_id: configured_chain_id.filter(|id| *id != 0),
            resolved: OnceCell::new(),
        }
    }

    pub async fn confirmations<F, Fut>(&self, lookup: F) -> Result<usize>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        if let Some(chain_id) = self.configured_chain_id {
            return Ok(confirmations_for(chain_id));
        }

        let confirmations = self
            .resolved
            .get_or_try_init(|| async move {
                let chain_id = lookup().await.context("chain id lookup failed")?;
                Ok::<_, anyhow::Error>(confirmations_for(chain_id))
            })
            .await?;

        Ok(*confirmations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            exponential_base: 2.0,
        }
    }

    #[test]
    fn classifies_failure_signatures() {
        assert!(is_transient(&anyhow!("request timed out after 30s")));
        assert!(is_transient(&anyhow!("(code: -32000, message: nonce too low)")));
        assert!(is_transient(&anyhow!("HTTP 503 Service Unavailable")));
        assert!(is_transient(&anyhow!("network unreachable")));

        assert!(!is_transient(&anyhow!("invalid argument 0: hex string has odd length")));
        assert!(!is_transient(&anyhow!("execution reverted: order already completed")));
        assert!(!is_transient(&anyhow!("something odd happened")));
    }

    #[test]
    fn status_codes_must_be_named_as_statuses() {
        assert!(is_transient(&anyhow!("sink returned HTTP 502")));
        assert!(is_transient(&anyhow!("request failed with status: 504")));
        assert!(is_transient(&anyhow!("unexpected status code 503 from rpc")));

        assert!(!is_transient(&anyhow!(
            "abi decode failed for order 0x9f3c5021aa: invalid data"
        )));
        assert!(!is_transient(&anyhow!("unknown order 503")));
        assert!(!is_transient(&anyhow!("HTTP 500 while decoding block 50412")));
    }

    #[test]
    fn backoff_grows_until_cap() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            exponential_base: 2.0,
        };
        let delays: Vec<u64> = (1..=6).map(|a| config.delay_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_retry_with_increasing_delay() {
        let calls = Mutex::new(Vec::new());
        let config = fast();

        let result: Result<()> = retry_with_backoff(
            || {
                calls.lock().unwrap().push(Instant::now());
                async { Err(anyhow!("network timeout")) }
            },
            &config,
        )
        .await;

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("failed after 4 attempts"));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[1] > g[0]), "{:?}", gaps);
        assert_eq!(gaps[0], Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("invalid argument: bad order id")) }
            },
            &fast(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);

        let value = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow!("connection reset by peer"))
                    } else {
                        Ok(n)
                    }
                }
            },
            &fast(),
        )
        .await
        .unwrap();

        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn local_dev_chain_needs_no_confirmations() {
        let policy = ConfirmationPolicy::new(Some(LOCAL_DEV_CHAIN_ID));
        let n = policy
            .confirmations(|| async { Err::<u64, _>(anyhow!("configured chain must not be looked up")) })
            .await
            .unwrap();
        assert_eq!(n, 0);

        let policy = ConfirmationPolicy::new(Some(42161));
        let n = policy
            .confirmations(|| async { Err::<u64, _>(anyhow!("configured chain must not be looked up")) })
            .await
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn unconfigured_chain_is_looked_up_once() {
        let lookups = AtomicU32::new(0);
        let policy = ConfirmationPolicy::new(None);

        for _ in 0..3 {
            let n = policy
                .confirmations(|| async {
                    lookups.fetch_add(1, Ordering::SeqCst);
                    Ok(LOCAL_DEV_CHAIN_ID)
                })
                .await
                .unwrap();
            assert_eq!(n, 0);
        }
        assert_eq!(lookups.load(Ordering::SeqCst), 1);

        let policy = ConfirmationPolicy::new(Some(0));
        let n = policy.confirmations(|| async { Ok(10u64) }).await.unwrap();
        assert_eq!(n, 1);
    }
}
