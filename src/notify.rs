use anyhow::{bail, Result};
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::redact;

pub const MAX_RETRIES: u32 = 3;
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum backoff duration (60 seconds)
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Messaging APIs commonly cap a text message at 4096 characters
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Placeholder replaced by the local display time
pub const HHMM_PLACEHOLDER: &str = "{HHMM}";

pub const DEFAULT_TEMPLATE: &str = "Good morning! The meeting starts at {HHMM}, ahead of sunset.";

/// One message handed to the delivery collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<'a> {
    pub identity: &'a str,
    pub hhmm: &'a str,
    pub message: &'a str,
}

/// Delivery collaborator. `Ok` means the message was accepted; only then
/// is the rule recorded as fired.
pub trait Notifier {
    fn deliver(&self, delivery: &Delivery<'_>) -> impl Future<Output = Result<()>>;
}

/// Fill the rule's template (or the default) with the display time
pub fn render_message(template: Option<&str>, hhmm: &str) -> String {
    let message = template
        .unwrap_or(DEFAULT_TEMPLATE)
        .replace(HHMM_PLACEHOLDER, hhmm);
    truncate_message(&message)
}

/// Truncate message to fit the length limit
/// Returns the original message if it fits, or a truncated version with "..." suffix
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_LENGTH {
        return message.to_string();
    }

    // Leave room for "..." (3 chars)
    let keep = MAX_MESSAGE_LENGTH - 3;
    let truncated: String = message.chars().take(keep).collect();

    // Try to truncate at word boundary for cleaner output
    let truncated = match truncated.rfind(' ') {
        Some(pos) if pos > truncated.len() / 2 => &truncated[..pos],
        _ => truncated.as_str(),
    };

    format!("{}...", truncated)
}

/// Calculate backoff duration for a given attempt (0-indexed)
/// Attempt 0: no backoff, Attempt 1: 1s, Attempt 2: 2s, etc.
/// Capped at MAX_BACKOFF_MS to prevent overflow and excessive waits.
#[inline]
pub fn calculate_backoff(attempt: u32) -> Duration {
    if attempt == 0 {
        Duration::ZERO
    } else {
        // Cap shift to prevent overflow (max safe shift for u64 is 63)
        let shift = (attempt - 1).min(30);
        let backoff_ms = INITIAL_BACKOFF_MS.saturating_mul(1u64 << shift);
        Duration::from_millis(backoff_ms.min(MAX_BACKOFF_MS))
    }
}

/// Delivery error types for retry decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeliveryErrorKind {
    /// Transient error - safe to retry
    Transient,
    /// Permanent error - don't retry
    Permanent,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("cannot start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to pass message on stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("delivery command timed out after {0:?}")]
    Timeout(Duration),
    #[error("delivery command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("failed waiting for delivery command: {0}")]
    Wait(#[source] std::io::Error),
}

impl DeliveryError {
    pub fn kind(&self) -> DeliveryErrorKind {
        match self {
            // a missing or non-executable program will not fix itself
            DeliveryError::Spawn { .. } => DeliveryErrorKind::Permanent,
            _ => DeliveryErrorKind::Transient,
        }
    }
}

/// Hands each message to an external program.
///
/// The program receives `DUSKBELL_TARGET`, `DUSKBELL_HHMM` and
/// `DUSKBELL_MESSAGE` in its environment and the message on stdin.
/// Exit status 0 means delivered.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    max_attempts: u32,
}

impl CommandNotifier {
    /// Build from a whitespace-separated command line (no shell)
    pub fn new(command_line: &str, timeout: Duration) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            bail!("Delivery command is empty");
        };
        Ok(Self::from_parts(program, parts.collect(), timeout))
    }

    pub fn from_parts(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
            max_attempts: MAX_RETRIES,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn try_deliver(&self, delivery: &Delivery<'_>) -> Result<(), DeliveryError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("DUSKBELL_TARGET", delivery.identity)
            .env("DUSKBELL_HHMM", delivery.hhmm)
            .env("DUSKBELL_MESSAGE", delivery.message)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeliveryError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(delivery.message.as_bytes()).await {
                Ok(()) => {}
                // the program may legitimately ignore stdin and exit early
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("Delivery command closed stdin early");
                }
                Err(e) => return Err(DeliveryError::Stdin(e)),
            }
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(DeliveryError::Wait)?,
            Err(_) => return Err(DeliveryError::Timeout(self.timeout)),
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(DeliveryError::Failed {
                status: output.status.to_string(),
                stderr,
            })
        }
    }
}

impl Notifier for CommandNotifier {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<()> {
        let target = redact::identity(delivery.identity);
        info!("Delivering {} to {} via {}", delivery.hhmm, target, self.program);

        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let backoff = calculate_backoff(attempt);
                warn!("Delivery attempt {} failed, retrying in {:?}...", attempt, backoff);
                sleep(backoff).await;
            }

            match self.try_deliver(delivery).await {
                Ok(()) => {
                    info!("Delivered to {}", target);
                    return Ok(());
                }
                Err(e) => {
                    if e.kind() == DeliveryErrorKind::Permanent {
                        error!("Permanent delivery error, not retrying: {}", e);
                        return Err(e.into());
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(err) => {
                error!("Failed to deliver after {} attempts: {}", self.max_attempts, err);
                Err(err.into())
            }
            None => bail!("Delivery was never attempted"),
        }
    }
}

/// Logs the message instead of delivering it (dry runs)
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<()> {
        info!(
            "[dry-run] would send to {}: {}",
            redact::identity(delivery.identity),
            delivery.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery<'a>(message: &'a str) -> Delivery<'a> {
        Delivery {
            identity: "-1001234567890",
            hhmm: "18:01",
            message,
        }
    }

    #[test]
    fn test_render_message_default() {
        let msg = render_message(None, "19:02");
        assert!(msg.contains("19:02"));
        assert!(!msg.contains(HHMM_PLACEHOLDER));
    }

    #[test]
    fn test_render_message_custom_template() {
        assert_eq!(
            render_message(Some("Meeting at {HHMM}. Doors open {HHMM}."), "07:05"),
            "Meeting at 07:05. Doors open 07:05."
        );
        assert_eq!(render_message(Some("No placeholder"), "07:05"), "No placeholder");
    }

    #[test]
    fn test_calculate_backoff() {
        assert_eq!(calculate_backoff(0), Duration::ZERO);
        assert_eq!(calculate_backoff(1), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(2), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_calculate_backoff_caps_at_max() {
        assert_eq!(calculate_backoff(10), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(calculate_backoff(u32::MAX), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_truncate_short_message() {
        assert_eq!(truncate_message("Hello world"), "Hello world");
        let exact = "a".repeat(MAX_MESSAGE_LENGTH);
        assert_eq!(truncate_message(&exact), exact);
    }

    #[test]
    fn test_truncate_long_message() {
        let long = "word ".repeat(2000);
        let result = truncate_message(&long);
        assert!(result.chars().count() <= MAX_MESSAGE_LENGTH);
        assert!(result.ends_with("..."));
        assert!(long.starts_with(result.trim_end_matches("...")));
    }

    #[test]
    fn test_truncate_multibyte() {
        let long = "закат".repeat(1000);
        let result = truncate_message(&long);
        assert!(result.chars().count() <= MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn test_command_notifier_rejects_empty() {
        assert!(CommandNotifier::new("   ", Duration::from_secs(1)).is_err());
        let n = CommandNotifier::new("notify-send --urgency low", Duration::from_secs(1)).unwrap();
        assert_eq!(n.program(), "notify-send");
        assert_eq!(n.args, vec!["--urgency", "low"]);
    }

    #[test]
    fn test_spawn_error_is_permanent() {
        let err = DeliveryError::Spawn {
            program: "x".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.kind(), DeliveryErrorKind::Permanent);
        assert_eq!(DeliveryError::Timeout(Duration::from_secs(1)).kind(), DeliveryErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_command_success() {
        let n = CommandNotifier::new("true", Duration::from_secs(5)).unwrap();
        assert!(n.deliver(&delivery("hello")).await.is_ok());
    }

    #[tokio::test]
    async fn test_command_receives_env_and_stdin() {
        let script = r#"test "$DUSKBELL_HHMM" = "18:01" && test "$DUSKBELL_TARGET" = "-1001234567890" && grep -q "at 18:01""#;
        let n = CommandNotifier::from_parts(
            "sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
        .with_max_attempts(1);
        n.deliver(&delivery("Meeting at 18:01")).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_failure_reports_error() {
        let n = CommandNotifier::new("false", Duration::from_secs(5))
            .unwrap()
            .with_max_attempts(1);
        let err = n.deliver(&delivery("hello")).await.unwrap_err();
        assert!(err.to_string().contains("exited"), "{}", err);
    }

    #[tokio::test]
    async fn test_missing_program_not_retried() {
        let n = CommandNotifier::new("/nonexistent/duskbell-hook", Duration::from_secs(5)).unwrap();
        let started = std::time::Instant::now();
        let err = n.deliver(&delivery("hello")).await.unwrap_err();
        assert!(err.to_string().contains("cannot start"));
        // permanent errors skip the backoff sleeps
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let n = CommandNotifier::new("sleep 5", Duration::from_millis(100))
            .unwrap()
            .with_max_attempts(1);
        let err = n.deliver(&delivery("hello")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
    }

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        assert!(LogNotifier.deliver(&delivery("hello")).await.is_ok());
    }
}
