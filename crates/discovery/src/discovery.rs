//! Finds the workload's interface once it is running.
//!
//! Each [`InterfaceDiscovery::begin`] starts a new sequence that walks the
//! retry schedule. Starting a sequence, or calling `cancel`, makes every
//! earlier sequence stale: its task stops at the next checkpoint and never
//! publishes anything. Publication and the staleness check happen under the
//! same lock.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    podvisor_common::{EventLog, EventSource},
    podvisor_config::DiscoveryConfig,
    serde::Serialize,
    tokio::sync::{broadcast, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    error::{DiscoveryError, Result},
    probe::{EndpointProbe, HttpProbe, LoadedContent},
    schedule::{AttemptPlan, EndpointSlot, MAX_ATTEMPTS, schedule},
};

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Extra wait before loading an endpoint that failed its precheck.
const UNREACHABLE_GRACE: Duration = Duration::from_secs(1);

/// A configured interface address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceEndpoint {
    pub label: String,
    pub url: Url,
}

/// How a successful attempt was judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Verification {
    /// The page had real content.
    Content { bytes: usize },
    /// The page could not be inspected; loading without error is taken as ready.
    Assumed,
}

/// One attempt about to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryAttempt {
    pub sequence: u64,
    pub attempt: usize,
    pub endpoint: InterfaceEndpoint,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum DiscoveryStatus {
    Idle,
    Probing {
        attempt: usize,
        endpoint: InterfaceEndpoint,
    },
    Ready {
        endpoint: InterfaceEndpoint,
        verification: Verification,
    },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum DiscoveryEvent {
    Started { sequence: u64 },
    Attempt(DiscoveryAttempt),
    AttemptFailed {
        sequence: u64,
        attempt: usize,
        reason: String,
    },
    Ready {
        sequence: u64,
        attempt: usize,
        endpoint: InterfaceEndpoint,
        verification: Verification,
    },
    Exhausted { sequence: u64, attempts: usize },
    Cancelled { sequence: u64 },
}

mod duration_ms {
    use {serde::Serializer, std::time::Duration};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Delays applied around each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryTimings {
    pub initial_delay: Duration,
    pub content_check_delay: Duration,
    pub precheck_timeout: Duration,
    pub min_content_bytes: usize,
}

impl From<&DiscoveryConfig> for DiscoveryTimings {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            content_check_delay: Duration::from_millis(config.content_check_delay_ms),
            precheck_timeout: Duration::from_millis(config.precheck_timeout_ms),
            min_content_bytes: config.min_content_bytes,
        }
    }
}

#[derive(Default)]
struct Run {
    sequence: u64,
    token: Option<CancellationToken>,
}

struct Inner {
    probe: Arc<dyn EndpointProbe>,
    endpoints: Vec<InterfaceEndpoint>,
    timings: DiscoveryTimings,
    run: Mutex<Run>,
    status_tx: watch::Sender<DiscoveryStatus>,
    events_tx: broadcast::Sender<DiscoveryEvent>,
    log: EventLog,
}

#[derive(Clone)]
pub struct InterfaceDiscovery {
    inner: Arc<Inner>,
}

impl InterfaceDiscovery {
    pub fn new(
        probe: Arc<dyn EndpointProbe>,
        config: &DiscoveryConfig,
        log: EventLog,
    ) -> Result<Self> {
        let endpoints = config
            .endpoints
            .iter()
            .map(|e| {
                Url::parse(&e.url)
                    .map(|url| InterfaceEndpoint {
                        label: e.label.clone(),
                        url,
                    })
                    .map_err(|source| DiscoveryError::InvalidUrl {
                        url: e.url.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(DiscoveryError::NoEndpoints);
        }

        let (status_tx, _) = watch::channel(DiscoveryStatus::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                probe,
                endpoints,
                timings: DiscoveryTimings::from(config),
                run: Mutex::new(Run::default()),
                status_tx,
                events_tx,
                log,
            }),
        })
    }

    /// Discovery over HTTP.
    pub fn from_config(config: &DiscoveryConfig, log: EventLog) -> Result<Self> {
        Self::new(Arc::new(HttpProbe::new()?), config, log)
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DiscoveryStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Start a new discovery sequence, superseding any in progress.
    /// Returns the new sequence number.
    pub fn begin(&self) -> u64 {
        let (sequence, token) = {
            let mut run = self.inner.run.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = run.token.take() {
                previous.cancel();
            }
            run.sequence += 1;
            let token = CancellationToken::new();
            run.token = Some(token.clone());

            self.inner.status_tx.send_replace(DiscoveryStatus::Idle);
            let _ = self.inner.events_tx.send(DiscoveryEvent::Started {
                sequence: run.sequence,
            });
            (run.sequence, token)
        };

        info!(sequence, "interface discovery started");
        self.inner
            .log
            .info(EventSource::Discovery, "Looking for the workload interface");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drive(sequence, token).await });
        sequence
    }

    /// Abandon the current sequence. Nothing it does afterwards is reported.
    pub fn cancel(&self) {
        let mut run = self.inner.run.lock().unwrap_or_else(|e| e.into_inner());
        let Some(token) = run.token.take() else {
            return;
        };
        token.cancel();
        let cancelled = run.sequence;
        run.sequence += 1;

        self.inner.status_tx.send_replace(DiscoveryStatus::Idle);
        let _ = self
            .inner
            .events_tx
            .send(DiscoveryEvent::Cancelled { sequence: cancelled });
        debug!(sequence = cancelled, "interface discovery cancelled");
    }
}

impl Inner {
    fn endpoint(&self, slot: EndpointSlot) -> &InterfaceEndpoint {
        self.endpoints
            .get(slot.index())
            .unwrap_or(&self.endpoints[0])
    }

    /// Run `f` only if `sequence` is still current.
    fn publish(&self, sequence: u64, f: impl FnOnce(&Self)) -> bool {
        let run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        if run.sequence != sequence {
            return false;
        }
        f(self);
        true
    }

    /// Sleep unless cancelled. `false` means the sequence is over.
    async fn pause(&self, sequence: u64, token: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            () = token.cancelled() => false,
            () = tokio::time::sleep(delay) => self.publish(sequence, |_| {}),
        }
    }

    async fn drive(&self, sequence: u64, token: CancellationToken) {
        if !self.timings.initial_delay.is_zero()
            && !self.pause(sequence, &token, self.timings.initial_delay).await
        {
            return;
        }

        for plan in schedule() {
            let endpoint = self.endpoint(plan.slot).clone();
            let attempt = DiscoveryAttempt {
                sequence,
                attempt: plan.attempt,
                endpoint: endpoint.clone(),
                timeout: plan.timeout,
            };
            let announced = self.publish(sequence, |inner| {
                inner.status_tx.send_replace(DiscoveryStatus::Probing {
                    attempt: plan.attempt,
                    endpoint: endpoint.clone(),
                });
                let _ = inner.events_tx.send(DiscoveryEvent::Attempt(attempt));
            });
            if !announced {
                return;
            }
            debug!(
                sequence,
                attempt = plan.attempt,
                endpoint = %endpoint.url,
                timeout_ms = plan.timeout.as_millis() as u64,
                "discovery attempt"
            );

            let outcome = tokio::select! {
                () = token.cancelled() => return,
                outcome = self.attempt(sequence, &token, &plan, &endpoint) => outcome,
            };

            match outcome {
                Ok(verification) => {
                    self.publish(sequence, |inner| inner.ready(sequence, &plan, endpoint, verification));
                    return;
                },
                Err(reason) => {
                    let still_current = self.publish(sequence, |inner| {
                        let _ = inner.events_tx.send(DiscoveryEvent::AttemptFailed {
                            sequence,
                            attempt: plan.attempt,
                            reason: reason.to_string(),
                        });
                    });
                    if !still_current {
                        return;
                    }
                    debug!(sequence, attempt = plan.attempt, %reason, "discovery attempt failed");
                },
            }

            if let Some(backoff) = plan.backoff
                && !self.pause(sequence, &token, backoff).await
            {
                return;
            }
        }

        self.publish(sequence, |inner| {
            warn!(sequence, attempts = MAX_ATTEMPTS, "interface discovery exhausted");
            inner.status_tx.send_replace(DiscoveryStatus::Exhausted);
            let _ = inner.events_tx.send(DiscoveryEvent::Exhausted {
                sequence,
                attempts: MAX_ATTEMPTS,
            });
            inner.log.error(
                EventSource::Discovery,
                format!(
                    "Workload interface did not respond after {MAX_ATTEMPTS} attempts. Restart the workload to try again."
                ),
            );
        });
    }

    async fn attempt(
        &self,
        sequence: u64,
        token: &CancellationToken,
        plan: &AttemptPlan,
        endpoint: &InterfaceEndpoint,
    ) -> Result<Verification> {
        // Both deadlines are enforced here; a probe may not honour its own.
        let precheck_timeout = self.timings.precheck_timeout;
        if plan.precheck
            && !tokio::time::timeout(
                precheck_timeout,
                self.probe.reachable(&endpoint.url, precheck_timeout),
            )
            .await
            .unwrap_or(false)
        {
            debug!(endpoint = %endpoint.url, "endpoint not reachable yet, loading anyway");
            if !self.pause(sequence, token, UNREACHABLE_GRACE).await {
                return Err(DiscoveryError::Unreachable {
                    url: endpoint.url.to_string(),
                });
            }
        }

        let content = tokio::time::timeout(
            plan.timeout,
            self.probe.load(&endpoint.url, plan.timeout),
        )
        .await
        .map_err(|_| DiscoveryError::Timeout {
            url: endpoint.url.to_string(),
            timeout: plan.timeout,
        })??;
        tokio::time::sleep(self.timings.content_check_delay).await;

        match content {
            LoadedContent::Inspectable { bytes } if bytes > self.timings.min_content_bytes => {
                Ok(Verification::Content { bytes })
            },
            LoadedContent::Inspectable { bytes } => Err(DiscoveryError::TrivialContent {
                url: endpoint.url.to_string(),
                bytes,
            }),
            LoadedContent::Opaque => Ok(Verification::Assumed),
        }
    }

    fn ready(
        &self,
        sequence: u64,
        plan: &AttemptPlan,
        endpoint: InterfaceEndpoint,
        verification: Verification,
    ) {
        info!(
            sequence,
            attempt = plan.attempt,
            endpoint = %endpoint.url,
            ?verification,
            "workload interface ready"
        );
        let message = match verification {
            Verification::Content { .. } => {
                format!("Workload interface ready at {} ({})", endpoint.url, endpoint.label)
            },
            Verification::Assumed => format!(
                "Workload interface loaded at {} ({}); content could not be verified",
                endpoint.url, endpoint.label
            ),
        };
        self.log.success(EventSource::Discovery, message);
        self.status_tx.send_replace(DiscoveryStatus::Ready {
            endpoint: endpoint.clone(),
            verification,
        });
        let _ = self.events_tx.send(DiscoveryEvent::Ready {
            sequence,
            attempt: plan.attempt,
            endpoint,
            verification,
        });
    }
}
