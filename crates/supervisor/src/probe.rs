//! Bounded readiness polling.
//!
//! A probe keeps attempting at `poll_interval` until one attempt succeeds or
//! the overall budget runs out. Each attempt is itself capped at the smaller
//! of the per-attempt timeout and the time left, so a hung endpoint can never
//! push the probe past its deadline.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::{ProbeTarget, SupervisorError};

/// Cap for a single readiness attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of one [`HealthProbe::probe`] run. Individual failed attempts are
/// never surfaced; only the overall outcome is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready { attempts: u32, elapsed: Duration },
    TimedOut { attempts: u32, elapsed: Duration },
    /// Shutdown was requested while probing.
    Cancelled { attempts: u32 },
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Performs readiness checks over HTTP or TCP.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    attempt_timeout: Duration,
}

impl HealthProbe {
    /// # Errors
    /// [`SupervisorError::Http`] if the HTTP client cannot be built.
    pub fn new(attempt_timeout: Duration) -> Result<Self, SupervisorError> {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()?;
        Ok(Self { client, attempt_timeout })
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Poll `target` until ready or `timeout` has elapsed.
    pub async fn probe(
        &self,
        target: &ProbeTarget,
        timeout: Duration,
        poll_interval: Duration,
    ) -> ProbeOutcome {
        let (_keep_open, mut never) = watch::channel(false);
        self.probe_cancellable(target, timeout, poll_interval, &mut never).await
    }

    /// Like [`HealthProbe::probe`], but gives up as soon as `cancel` turns `true`.
    pub async fn probe_cancellable(
        &self,
        target: &ProbeTarget,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> ProbeOutcome {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts = 0u32;

        loop {
            if *cancel.borrow() {
                return ProbeOutcome::Cancelled { attempts };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ProbeOutcome::TimedOut { attempts, elapsed: started.elapsed() };
            }

            attempts += 1;
            let limit = self.attempt_timeout.min(remaining);
            let ready = tokio::select! {
                ready = self.attempt(target, limit) => ready,
                _ = cancelled(cancel) => return ProbeOutcome::Cancelled { attempts },
            };
            if ready {
                debug!(%target, attempts, "ready");
                return ProbeOutcome::Ready { attempts, elapsed: started.elapsed() };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ProbeOutcome::TimedOut { attempts, elapsed: started.elapsed() };
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval.min(remaining)) => {}
                _ = cancelled(cancel) => return ProbeOutcome::Cancelled { attempts },
            }
        }
    }

    async fn attempt(&self, target: &ProbeTarget, limit: Duration) -> bool {
        match target {
            ProbeTarget::Http { url } => {
                match tokio::time::timeout(limit, self.client.get(url).send()).await {
                    Ok(Ok(response)) => {
                        let status = response.status();
                        if !status.is_success() {
                            debug!(%url, %status, "not ready");
                        }
                        status.is_success()
                    }
                    Ok(Err(e)) => {
                        debug!(%url, "attempt failed: {e}");
                        false
                    }
                    Err(_) => {
                        debug!(%url, "attempt timed out after {limit:?}");
                        false
                    }
                }
            }
            ProbeTarget::Tcp { addr } => {
                matches!(
                    tokio::time::timeout(limit, TcpStream::connect(addr.as_str())).await,
                    Ok(Ok(_))
                )
            }
        }
    }
}

/// Resolves once `rx` holds `true`. Never resolves if the sender is gone.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn probe() -> HealthProbe {
        HealthProbe::new(DEFAULT_ATTEMPT_TIMEOUT).unwrap()
    }

    /// A port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn ready_endpoint_succeeds_on_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let target = ProbeTarget::Http { url: format!("{}/health", server.uri()) };
        let outcome = probe()
            .probe(&target, Duration::from_secs(5), Duration::from_millis(100))
            .await;

        assert!(matches!(outcome, ProbeOutcome::Ready { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn non_success_status_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let target = ProbeTarget::Http { url: server.uri() };
        let outcome = probe()
            .probe(&target, Duration::from_secs(5), Duration::from_millis(50))
            .await;

        assert!(matches!(outcome, ProbeOutcome::Ready { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn hung_endpoint_times_out_on_budget() {
        // Accepts connections but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let target = ProbeTarget::Http { url: format!("http://{addr}/health") };
        let started = std::time::Instant::now();
        let outcome = probe()
            .probe(&target, Duration::from_secs(3), Duration::from_secs(1))
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, ProbeOutcome::TimedOut { .. }));
        assert!(elapsed >= Duration::from_millis(2950), "gave up early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "overran budget: {elapsed:?}");
    }

    #[tokio::test]
    async fn refused_endpoint_keeps_polling_until_deadline() {
        let target = ProbeTarget::Http { url: format!("http://127.0.0.1:{}", closed_port().await) };
        let started = std::time::Instant::now();
        let outcome = probe()
            .probe(&target, Duration::from_secs(1), Duration::from_millis(200))
            .await;

        match outcome {
            ProbeOutcome::TimedOut { attempts, .. } => assert!(attempts >= 4, "{attempts} attempts"),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(950));
    }

    #[tokio::test]
    async fn cancellation_interrupts_probe() {
        let target = ProbeTarget::Http { url: format!("http://127.0.0.1:{}", closed_port().await) };
        let (tx, mut rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send_replace(true);
            // Keep the sender alive past the probe.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let started = std::time::Instant::now();
        let outcome = probe()
            .probe_cancellable(&target, Duration::from_secs(10), Duration::from_secs(1), &mut rx)
            .await;

        assert!(matches!(outcome, ProbeOutcome::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn tcp_target_is_ready_once_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = ProbeTarget::Tcp { addr: listener.local_addr().unwrap().to_string() };

        let outcome = probe()
            .probe(&target, Duration::from_secs(2), Duration::from_millis(100))
            .await;

        assert!(outcome.is_ready());
    }
}
