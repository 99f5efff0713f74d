//! Leader election over a `coordination.k8s.io/v1` Lease.
//!
//! Every write carries the resourceVersion that was read, so two replicas racing
//! for an expired lease cannot both win: the loser gets a 409 and waits.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Error;

pub const LEASE_NAME: &str = "628f2987.cluster-registration.io";

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// What a replica may do with the lease as last read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseClaim {
    /// No lease exists yet.
    Create,
    /// We hold it.
    Renew,
    /// The holder stopped renewing.
    TakeOver { transitions: i32 },
    /// Someone else holds it.
    Held { holder: String },
}

/// Decide how `identity` can claim `lease` at `now`.
pub fn claim(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseClaim {
    let Some(lease) = lease else {
        return LeaseClaim::Create;
    };
    let spec = lease.spec.clone().unwrap_or_default();
    let holder = spec.holder_identity.unwrap_or_default();
    if holder == identity {
        return LeaseClaim::Renew;
    }

    let expired = match (spec.renew_time, spec.lease_duration_seconds) {
        (Some(renewed), Some(seconds)) => now > renewed.0 + chrono::Duration::seconds(seconds.into()),
        _ => true,
    };
    if holder.is_empty() || expired {
        LeaseClaim::TakeOver {
            transitions: spec.lease_transitions.unwrap_or(0),
        }
    } else {
        LeaseClaim::Held { holder }
    }
}

pub struct LeaderElector {
    client: Client,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
            identity: identity.to_owned(),
        }
    }

    fn leases(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Wait until this replica holds the lease, then keep renewing it in the
    /// background.
    pub async fn acquire(self) -> Result<Leadership, Error> {
        info!(identity = %self.identity, lease = LEASE_NAME, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(identity = %self.identity, error = %e, "failed to claim lease"),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
        info!(identity = %self.identity, "acquired leadership");

        let elector = Arc::new(self);
        let (lost_tx, lost_rx) = oneshot::channel();
        let renewal = tokio::spawn({
            let elector = elector.clone();
            async move { elector.renew_until_lost(lost_tx).await }
        });
        Ok(Leadership {
            elector,
            renewal,
            lost: Some(lost_rx),
        })
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api = self.leases();
        let existing = api.get_opt(LEASE_NAME).await?;
        let now = Utc::now();

        let lease = match claim(existing.as_ref(), &self.identity, now) {
            LeaseClaim::Held { holder } => {
                debug!(identity = %self.identity, %holder, "lease held elsewhere");
                return Ok(false);
            }
            LeaseClaim::Create => {
                let lease = self.lease(None, now, now, 0);
                return match api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                };
            }
            LeaseClaim::Renew => {
                let mut lease = existing.unwrap_or_default();
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                lease
            }
            LeaseClaim::TakeOver { transitions } => {
                let version = existing.and_then(|l| l.metadata.resource_version);
                self.lease(version, now, now, transitions + 1)
            }
        };

        match api.replace(LEASE_NAME, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn lease(
        &self,
        resource_version: Option<String>,
        acquired: DateTime<Utc>,
        renewed: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_owned()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(acquired)),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(transitions),
                ..LeaseSpec::default()
            }),
        }
    }

    async fn renew_until_lost(&self, lost: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "failed to renew lease");
                    break;
                }
            }
        }
        warn!(identity = %self.identity, "lost leadership");
        let _ = lost.send(());
    }

    /// Hand the lease over by clearing its holder.
    async fn release(&self) -> Result<(), Error> {
        let api = self.leases();
        let Some(mut lease) = api.get_opt(LEASE_NAME).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        api.replace(LEASE_NAME, &PostParams::default(), &lease).await?;
        info!(identity = %self.identity, "released leadership");
        Ok(())
    }
}

/// A held lease, renewed until dropped or lost.
pub struct Leadership {
    elector: Arc<LeaderElector>,
    renewal: JoinHandle<()>,
    lost: Option<oneshot::Receiver<()>>,
}

impl Leadership {
    /// Resolves once another replica may have taken over.
    pub async fn lost(&mut self) {
        if let Some(lost) = self.lost.take() {
            let _ = lost.await;
        }
    }

    /// Stop renewing and let a standby take over without waiting for expiry.
    pub async fn release(self) {
        self.renewal.abort();
        if let Err(e) = self.elector.release().await {
            warn!(error = %e, "failed to release lease");
        }
    }
}

impl Drop for Leadership {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_owned),
                lease_duration_seconds: Some(15),
                renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
                lease_transitions: Some(transitions),
                ..LeaseSpec::default()
            }),
        }
    }

    #[test]
    fn missing_lease_is_created() {
        assert_eq!(claim(None, "a", Utc::now()), LeaseClaim::Create);
    }

    #[test]
    fn own_lease_is_renewed() {
        assert_eq!(claim(Some(&lease(Some("a"), 30, 2)), "a", Utc::now()), LeaseClaim::Renew);
    }

    #[test]
    fn live_lease_of_another_replica_is_respected() {
        assert_eq!(
            claim(Some(&lease(Some("b"), 1, 2)), "a", Utc::now()),
            LeaseClaim::Held { holder: "b".to_owned() }
        );
    }

    #[test]
    fn expired_or_released_lease_is_taken_over() {
        assert_eq!(
            claim(Some(&lease(Some("b"), 60, 2)), "a", Utc::now()),
            LeaseClaim::TakeOver { transitions: 2 }
        );
        assert_eq!(
            claim(Some(&lease(None, 1, 3)), "a", Utc::now()),
            LeaseClaim::TakeOver { transitions: 3 }
        );
    }
}
