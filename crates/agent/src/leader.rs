//! Kubernetes Lease based leader election
//!
//! In daemon mode every node runs an agent, but only the holder of the
//! Lease discovers services and the API server. Followers keep polling
//! until the leader's lease expires.

use async_trait::async_trait;
use chrono::Utc;
use discovery_lib::{Elector, Leadership};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one election round
#[derive(Debug, Clone, PartialEq)]
enum Round {
    Leading,
    Following(String),
}

pub struct LeaseElector {
    lease_api: Api<Lease>,
    lease_name: String,
    identity: String,
}

impl LeaseElector {
    pub fn new(client: Client, namespace: &str, lease_name: &str, identity: &str) -> Self {
        info!(identity = %identity, namespace = %namespace, lease = %lease_name, "initialized leader elector");
        Self {
            lease_api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
        }
    }

    async fn round(&self) -> Result<Round, kube::Error> {
        let now = MicroTime(Utc::now());
        let existing = match self.lease_api.get_opt(&self.lease_name).await? {
            Some(existing) => existing,
            None => return self.create(&now).await,
        };

        let spec = existing.spec.as_ref();
        let holder = spec
            .and_then(|s| s.holder_identity.clone())
            .unwrap_or_default();
        if holder == self.identity {
            self.update(&existing, &now, false).await
        } else if holder.is_empty() || is_expired(spec) {
            self.update(&existing, &now, true).await
        } else {
            Ok(Round::Following(holder))
        }
    }

    async fn create(&self, now: &MicroTime) -> Result<Round, kube::Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now.clone()),
                lease_transitions: Some(0),
            }),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(Round::Leading),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(Round::Following(String::new())),
            Err(e) => Err(e),
        }
    }

    async fn update(
        &self,
        existing: &Lease,
        now: &MicroTime,
        takeover: bool,
    ) -> Result<Round, kube::Error> {
        let prev = existing.spec.as_ref();
        let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);

        let mut updated = existing.clone();
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: if takeover {
                Some(now.clone())
            } else {
                prev.and_then(|s| s.acquire_time.clone())
            },
            renew_time: Some(now.clone()),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
        });

        match self
            .lease_api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(Round::Leading),
            // someone else won the race
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(Round::Following(String::new())),
            Err(e) => Err(e),
        }
    }

    /// Clear the holder so a follower can take over without waiting for expiry
    async fn release(&self) {
        let lease = match self.lease_api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "failed to read lease for release");
                return;
            }
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return;
        }

        let mut updated = lease.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => info!("released leader lease"),
            Err(e) => warn!(error = %e, "failed to release leader lease"),
        }
    }
}

#[async_trait]
impl Elector for LeaseElector {
    async fn run(
        &self,
        leadership: Arc<Leadership>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(RENEW_INTERVAL);
        let mut leading = false;
        let mut renewed = Instant::now();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }

            match self.round().await {
                Ok(Round::Leading) => {
                    leading = true;
                    renewed = Instant::now();
                    leadership.set_leading(true, self.identity.clone());
                }
                Ok(Round::Following(holder)) => {
                    if leading {
                        info!(leader = %holder, "lost leader lease");
                    }
                    leading = false;
                    leadership.set_leading(false, holder);
                }
                // missing RBAC is not going to fix itself
                Err(kube::Error::Api(ae)) if ae.code == 401 || ae.code == 403 => {
                    anyhow::bail!("leader election not permitted: {}", ae.message);
                }
                Err(e) => {
                    warn!(error = %e, "leader election round failed, retrying");
                    // others may take over once our lease has expired
                    if leading && renewed.elapsed() > lease_duration() {
                        leading = false;
                        leadership.set_leading(false, "");
                    }
                }
            }
            debug!(leading, "leader election round complete");
        }

        if leading {
            self.release().await;
            leadership.set_leading(false, "");
        }
        Ok(())
    }
}

fn lease_duration() -> Duration {
    Duration::from_secs(LEASE_DURATION_SECS as u64)
}

fn is_expired(spec: Option<&LeaseSpec>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;

    match renew_time {
        Some(MicroTime(t)) => Utc::now().signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(renewed_secs_ago: i64) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("node-2".to_string()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
            ..Default::default()
        }
    }

    #[test]
    fn test_lease_expiry() {
        assert!(!is_expired(Some(&spec(1))));
        assert!(is_expired(Some(&spec(60))));
        assert!(is_expired(None));
        assert!(is_expired(Some(&LeaseSpec::default())));
    }
}
