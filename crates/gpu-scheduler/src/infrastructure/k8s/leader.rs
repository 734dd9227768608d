use std::future::Future;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use super::is_conflict;
use super::KubernetesError;
use crate::config::LEADER_LEASE_DURATION;
use crate::config::LEADER_RENEW_DEADLINE;
use crate::config::LEADER_RETRY_PERIOD;

/// What a candidate may do with the lock it just read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    /// We already hold it.
    Renew,
    /// Free or expired.
    Takeover,
    /// Someone else holds a live lock.
    Held,
}

/// Decides whether `identity` may write the lock described by `spec`.
pub fn can_acquire(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LockDecision {
    let Some(spec) = spec else {
        return LockDecision::Takeover;
    };
    match spec.holder_identity.as_deref() {
        Some(holder) if holder == identity => return LockDecision::Renew,
        None | Some("") => return LockDecision::Takeover,
        Some(_) => {}
    }
    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    match &spec.renew_time {
        Some(MicroTime(renewed)) if now.signed_duration_since(*renewed) <= duration => {
            LockDecision::Held
        }
        _ => LockDecision::Takeover,
    }
}

/// Lease based leader election so only one replica runs the lifecycle
/// monitor at a time.
pub struct LeaderElector {
    leases: Api<Lease>,
    lock_name: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lock_name: &str, identity: String) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            lock_name: lock_name.to_string(),
            identity,
            lease_duration: LEADER_LEASE_DURATION,
            renew_deadline: LEADER_RENEW_DEADLINE,
            retry_period: LEADER_RETRY_PERIOD,
        }
    }

    /// Tries to take or renew the lock once. Returns whether we hold it.
    async fn try_acquire_or_renew(&self) -> Result<bool, Report<KubernetesError>> {
        let now = Utc::now();
        let request_failed = |e: kube::Error| KubernetesError::LeaderElection {
            message: format!("lock {}: {e}", self.lock_name),
        };

        let existing = self.leases.get_opt(&self.lock_name).await.map_err(request_failed)?;
        let decision = can_acquire(
            existing.as_ref().and_then(|lease| lease.spec.as_ref()),
            &self.identity,
            now,
        );
        if decision == LockDecision::Held {
            return Ok(false);
        }

        let duration_secs = i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX);
        let result = match existing {
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                if decision == LockDecision::Takeover {
                    spec.holder_identity = Some(self.identity.clone());
                    spec.acquire_time = Some(MicroTime(now));
                    spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
                }
                spec.lease_duration_seconds = Some(duration_secs);
                spec.renew_time = Some(MicroTime(now));
                self.leases
                    .replace(&self.lock_name, &PostParams::default(), &lease)
                    .await
            }
            None => {
                let mut lease = Lease::default();
                lease.metadata.name = Some(self.lock_name.clone());
                lease.spec = Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(duration_secs),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(0),
                });
                self.leases.create(&PostParams::default(), &lease).await
            }
        };

        match result {
            Ok(_) => Ok(true),
            // another candidate wrote first
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(Report::new(request_failed(e))),
        }
    }

    /// Clears the holder so another replica can take over without waiting
    /// for the lease to expire.
    async fn release(&self) {
        let Ok(Some(mut lease)) = self.leases.get_opt(&self.lock_name).await else {
            return;
        };
        let Some(spec) = lease.spec.as_mut() else {
            return;
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return;
        }
        spec.holder_identity = None;
        if let Err(e) = self
            .leases
            .replace(&lease.name_any(), &PostParams::default(), &lease)
            .await
        {
            warn!(lock = %self.lock_name, "failed to release leadership: {e}");
        }
    }

    /// Campaigns for the lock until cancelled. While leading, `on_leading`
    /// runs with a child token that is cancelled when leadership is lost.
    #[tracing::instrument(skip_all, fields(lock = %self.lock_name, identity = %self.identity))]
    pub async fn run<F, Fut>(self, cancellation_token: CancellationToken, mut on_leading: F)
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!("Starting leader election");
        loop {
            if !self.acquire(&cancellation_token).await {
                break;
            }
            info!("Became leader");

            let leading = cancellation_token.child_token();
            let work: JoinHandle<()> = tokio::spawn(on_leading(leading.clone()));
            self.renew_until_lost(&cancellation_token).await;

            leading.cancel();
            if let Err(e) = work.await {
                warn!("leader work panicked: {e}");
            }
            if cancellation_token.is_cancelled() {
                self.release().await;
                break;
            }
            warn!("Lost leadership, campaigning again");
        }
        info!("Leader election stopped");
    }

    /// Returns `false` when cancelled before acquiring.
    async fn acquire(&self, cancellation_token: &CancellationToken) -> bool {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("failed to acquire leadership: {e:?}"),
            }
            tokio::select! {
                _ = cancellation_token.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    async fn renew_until_lost(&self, cancellation_token: &CancellationToken) {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => return,
                _ = tokio::time::sleep(self.retry_period) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => return,
                Err(e) => warn!("failed to renew leadership: {e:?}"),
            }
            if last_renewed.elapsed() > self.renew_deadline {
                warn!("renew deadline exceeded");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn spec(holder: Option<&str>, renewed: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(renewed)),
            ..Default::default()
        }
    }

    #[test]
    fn missing_lock_can_be_taken() {
        assert_eq!(can_acquire(None, "a", Utc::now()), LockDecision::Takeover);
    }

    #[test]
    fn own_lock_is_renewed() {
        let now = Utc::now();

        assert_eq!(can_acquire(Some(&spec(Some("a"), now)), "a", now), LockDecision::Renew);
    }

    #[test]
    fn live_foreign_lock_is_respected() {
        let now = Utc::now();
        let lock = spec(Some("b"), now - chrono::Duration::seconds(5));

        assert_eq!(can_acquire(Some(&lock), "a", now), LockDecision::Held);
    }

    #[test]
    fn expired_or_released_lock_is_taken_over() {
        let now = Utc::now();
        let expired = spec(Some("b"), now - chrono::Duration::seconds(30));
        let released = spec(None, now);

        assert_eq!(can_acquire(Some(&expired), "a", now), LockDecision::Takeover);
        assert_eq!(can_acquire(Some(&released), "a", now), LockDecision::Takeover);
    }
}
