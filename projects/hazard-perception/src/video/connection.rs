// Device connection with bounded, fixed-interval retries

use anyhow::{anyhow, Result};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionPolicy {
    pub timeout: Duration,
    pub retry_interval: Duration,
    pub max_attempts: u32,
    pub wait_for_device: bool,
}

/// Call `attempt` until it succeeds or the policy gives up.
///
/// Without `wait_for_device` there is exactly one attempt. Otherwise each
/// failure is followed by a wait of `retry_interval` (cut short at the
/// timeout), and the loop ends once the timeout is reached or
/// `max_attempts` have failed. The argument passed to `attempt` is the
/// 1-based attempt number.
pub fn connect_with_retry<T>(
    policy: &ConnectionPolicy,
    mut attempt: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    if !policy.wait_for_device {
        return attempt(1);
    }

    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for n in 1..=max_attempts {
        match attempt(n) {
            Ok(value) => {
                if n > 1 {
                    tracing::info!("Connected on attempt {}/{}", n, max_attempts);
                }
                return Ok(value);
            }
            Err(e) => {
                tracing::warn!("Connection attempt {}/{} failed: {}", n, max_attempts, e);
                last_error = Some(e);
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            break;
        }
        thread::sleep(policy.retry_interval.min(policy.timeout - elapsed));
    }

    let cause = last_error.unwrap_or_else(|| anyhow!("no attempts made"));
    Err(cause.context(format!(
        "Device unavailable after {:.1}s",
        started.elapsed().as_secs_f64()
    )))
}
