//! Credential manager (§4.2 "Credential manager"): keeps a short-lived
//! cloud access token warm under a single-writer refresh discipline.
//! Readers call [`CredentialManager::current_token`], which returns a
//! live token or waits up to a bounded deadline while a refresh is in
//! flight; it never blocks indefinitely.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("token mint deadline exceeded")]
    DeadlineExceeded,
    #[error("token mint failed: {0}")]
    MintFailed(String),
}

/// Implemented by whatever actually talks to the cloud provider's STS
/// equivalent. A trait rather than a concrete client so tests can mint
/// synthetic tokens without network access.
#[async_trait::async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint(&self) -> Result<MintedToken, String>;
}

#[derive(Clone, Debug)]
pub struct MintedToken {
    pub token: String,
    pub lifetime: Duration,
}

#[derive(Clone, Debug)]
struct CurrentToken {
    token: String,
    minted_at: Instant,
    lifetime: Duration,
}

impl CurrentToken {
    fn remaining_fraction(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.minted_at);
        if self.lifetime.is_zero() {
            return 0.0;
        }
        1.0 - (elapsed.as_secs_f64() / self.lifetime.as_secs_f64()).min(1.0)
    }
}

pub struct CredentialManager {
    minter: Arc<dyn TokenMinter>,
    refresh_fraction: f64,
    mint_deadline: Duration,
    current: Mutex<Option<CurrentToken>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl CredentialManager {
    pub fn new(minter: Arc<dyn TokenMinter>, refresh_fraction: f64, mint_deadline: Duration) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            minter,
            refresh_fraction,
            mint_deadline,
            current: Mutex::new(None),
            ready_tx,
            ready_rx,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Mints (or re-mints, if needed) and returns the current token.
    /// Bounded by `mint_deadline`: a caller that calls this concurrently
    /// with an in-flight refresh waits on the same mutex rather than
    /// triggering a second mint.
    pub async fn current_token(&self) -> Result<String, CredentialError> {
        tokio::time::timeout(self.mint_deadline, self.current_token_inner())
            .await
            .map_err(|_| CredentialError::DeadlineExceeded)?
    }

    async fn current_token_inner(&self) -> Result<String, CredentialError> {
        let mut guard = self.current.lock().await;
        let now = Instant::now();
        let needs_refresh = match &*guard {
            Some(current) => current.remaining_fraction(now) < self.refresh_fraction,
            None => true,
        };

        if needs_refresh {
            match self.minter.mint().await {
                Ok(minted) => {
                    *guard = Some(CurrentToken {
                        token: minted.token.clone(),
                        minted_at: now,
                        lifetime: minted.lifetime,
                    });
                    let _ = self.ready_tx.send(true);
                }
                Err(reason) => {
                    let _ = self.ready_tx.send(false);
                    return Err(CredentialError::MintFailed(reason));
                }
            }
        }

        Ok(guard.as_ref().expect("just minted or already present").token.clone())
    }

    /// Runs the scheduled background refresh loop: wakes up when roughly
    /// `refresh_fraction` of the token's remaining lifetime is left and
    /// re-mints pre-emptively, so `current_token` rarely blocks on the
    /// network path. Intended to be spawned once at startup.
    pub async fn run_refresh_loop(self: Arc<Self>) {
        loop {
            let sleep_for = {
                let guard = self.current.lock().await;
                match &*guard {
                    Some(current) => {
                        let target_elapsed = current.lifetime.mul_f64(1.0 - self.refresh_fraction);
                        let elapsed = Instant::now().saturating_duration_since(current.minted_at);
                        if target_elapsed > elapsed {
                            target_elapsed - elapsed
                        } else {
                            Duration::from_millis(0)
                        }
                    }
                    None => Duration::from_millis(0),
                }
            };
            tokio::time::sleep(sleep_for.max(Duration::from_millis(50))).await;
            if let Err(err) = self.current_token().await {
                tracing::warn!(error = %err, "background credential refresh failed");
            }
        }
    }
}

/// Reads the read-only cloud identity the on-host provisioner deposits
/// at a well-known path (§1 Non-goals: "authenticating as anything but a
/// read-only identity to the cloud provider" — minting itself is the
/// provisioner's job, not the engine's).
pub struct FileTokenMinter {
    token_file: std::path::PathBuf,
    lifetime: Duration,
}

impl FileTokenMinter {
    pub fn new(token_file: std::path::PathBuf, lifetime: Duration) -> Self {
        Self { token_file, lifetime }
    }
}

#[async_trait::async_trait]
impl TokenMinter for FileTokenMinter {
    async fn mint(&self) -> Result<MintedToken, String> {
        let token = tokio::fs::read_to_string(&self.token_file)
            .await
            .map_err(|e| format!("reading {}: {e}", self.token_file.display()))?;
        Ok(MintedToken {
            token: token.trim().to_string(),
            lifetime: self.lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMinter {
        calls: AtomicUsize,
        lifetime: Duration,
    }

    #[async_trait::async_trait]
    impl TokenMinter for CountingMinter {
        async fn mint(&self) -> Result<MintedToken, String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MintedToken {
                token: format!("token-{n}"),
                lifetime: self.lifetime,
            })
        }
    }

    struct FailingMinter;

    #[async_trait::async_trait]
    impl TokenMinter for FailingMinter {
        async fn mint(&self) -> Result<MintedToken, String> {
            Err("upstream unreachable".to_string())
        }
    }

    #[tokio::test]
    async fn first_call_mints_and_marks_ready() {
        let manager = CredentialManager::new(
            Arc::new(CountingMinter {
                calls: AtomicUsize::new(0),
                lifetime: Duration::from_secs(3600),
            }),
            0.2,
            Duration::from_millis(500),
        );
        assert!(!manager.is_ready());
        let token = manager.current_token().await.unwrap();
        assert_eq!(token, "token-0");
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn fresh_token_is_not_reminted() {
        let manager = CredentialManager::new(
            Arc::new(CountingMinter {
                calls: AtomicUsize::new(0),
                lifetime: Duration::from_secs(3600),
            }),
            0.2,
            Duration::from_millis(500),
        );
        let first = manager.current_token().await.unwrap();
        let second = manager.current_token().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn failed_mint_leaves_manager_not_ready() {
        let manager = CredentialManager::new(Arc::new(FailingMinter), 0.2, Duration::from_millis(500));
        let result = manager.current_token().await;
        assert!(result.is_err());
        assert!(!manager.is_ready());
    }
}
