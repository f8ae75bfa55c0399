//! Thin HTTP/JSON client for the control plane: scheduling strategies,
//! metrics egress, and pod/PID lookups.

use serde::{Deserialize, Serialize};

use kernel_bridge::BssSnapshot;
use strategy::Strategy;

use crate::auth::AuthClient;
use crate::Error;

/// A single process entry reported for a pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodProcess {
    /// Process id.
    pub pid: i32,
    /// Parent process id.
    pub ppid: i32,
    /// Command line, as reported by the node agent.
    pub command: String,
    /// Container id the process belongs to.
    pub container_id: String,
}

/// The set of processes running inside a pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodPidEntry {
    /// Pod name.
    pub pod_name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Processes belonging to the pod.
    pub processes: Vec<PodProcess>,
}

#[derive(Debug, Deserialize)]
struct StrategiesResponse {
    success: bool,
    scheduling: Vec<Strategy>,
}

#[derive(Debug, Deserialize)]
struct PodPidsResponse {
    success: bool,
    pods: Vec<PodPidEntry>,
}

#[derive(Debug, Serialize)]
struct MetricsRequest {
    #[serde(flatten)]
    snapshot: MetricsPayload,
}

#[derive(Debug, Serialize)]
struct MetricsPayload {
    usersched_last_run_at: u64,
    nr_queued: u64,
    nr_scheduled: u64,
    nr_running: u64,
    nr_online_cpus: u64,
    nr_user_dispatches: u64,
    nr_kernel_dispatches: u64,
    nr_cancel_dispatches: u64,
    nr_bounce_dispatches: u64,
    nr_failed_dispatches: u64,
    nr_sched_congested: u64,
}

impl From<BssSnapshot> for MetricsPayload {
    fn from(s: BssSnapshot) -> Self {
        Self {
            usersched_last_run_at: s.usersched_last_run_at,
            nr_queued: s.nr_queued,
            nr_scheduled: s.nr_scheduled,
            nr_running: s.nr_running,
            nr_online_cpus: s.nr_online_cpus,
            nr_user_dispatches: s.nr_user_dispatches,
            nr_kernel_dispatches: s.nr_kernel_dispatches,
            nr_cancel_dispatches: s.nr_cancel_dispatches,
            nr_bounce_dispatches: s.nr_bounce_dispatches,
            nr_failed_dispatches: s.nr_failed_dispatches,
            nr_sched_congested: s.nr_sched_congested,
        }
    }
}

/// Client for the control plane's scheduling-strategy, metrics, and pod/PID
/// endpoints. Authentication, if enabled, is delegated to an
/// [`AuthClient`].
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    auth: Option<AuthClient>,
}

impl Client {
    /// Creates a client talking to `base_url`, optionally authenticating
    /// every request via `auth`.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, auth: Option<AuthClient>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            auth,
        }
    }

    async fn authorize(&self, builder: reqwest::RequestBuilder, now_unix: i64) -> Result<reqwest::RequestBuilder, Error> {
        match &self.auth {
            Some(auth) => {
                let token = auth.token(now_unix).await?;
                Ok(builder.bearer_auth(token.expose()))
            }
            None => Ok(builder),
        }
    }

    /// Fetches the full set of scheduling strategies currently published by
    /// the control plane.
    pub async fn fetch_strategies(&self, now_unix: i64) -> Result<Vec<Strategy>, Error> {
        let url = format!("{}/api/v1/scheduling/strategies", self.base_url);
        let request = self.authorize(self.http.get(&url), now_unix).await?;
        let response = request
            .send()
            .await
            .map_err(|source| Error::Http { url: url.clone(), source })?
            .error_for_status()
            .map_err(|source| Error::Http { url: url.clone(), source })?;

        let body: StrategiesResponse = response
            .json()
            .await
            .map_err(|source| Error::Http { url: url.clone(), source })?;

        if !body.success {
            return Err(Error::MalformedResponse {
                url,
                reason: "success=false".to_string(),
            });
        }
        Ok(body.scheduling)
    }

    /// Publishes (creates or replaces) a scheduling strategy for one PID.
    pub async fn create_strategy(&self, strategy: &Strategy, now_unix: i64) -> Result<(), Error> {
        let url = format!("{}/api/v1/scheduling/strategies", self.base_url);
        let request = self.authorize(self.http.post(&url), now_unix).await?;
        let _ = request
            .json(strategy)
            .send()
            .await
            .map_err(|source| Error::Http { url: url.clone(), source })?
            .error_for_status()
            .map_err(|source| Error::Http { url, source })?;
        Ok(())
    }

    /// Removes the scheduling strategy for `pid`.
    pub async fn delete_strategy(&self, pid: i32, now_unix: i64) -> Result<(), Error> {
        let url = format!("{}/api/v1/scheduling/strategies/{pid}", self.base_url);
        let request = self.authorize(self.http.delete(&url), now_unix).await?;
        let _ = request
            .send()
            .await
            .map_err(|source| Error::Http { url: url.clone(), source })?
            .error_for_status()
            .map_err(|source| Error::Http { url, source })?;
        Ok(())
    }

    /// Posts a metrics snapshot to the control plane.
    pub async fn post_metrics(&self, snapshot: BssSnapshot, now_unix: i64) -> Result<(), Error> {
        let url = format!("{}/api/v1/metrics", self.base_url);
        let request = self.authorize(self.http.post(&url), now_unix).await?;
        let _ = request
            .json(&MetricsRequest {
                snapshot: snapshot.into(),
            })
            .send()
            .await
            .map_err(|source| Error::Http { url: url.clone(), source })?
            .error_for_status()
            .map_err(|source| Error::Http { url, source })?;
        Ok(())
    }

    /// Fetches the PID map for every pod on this node.
    pub async fn fetch_pod_pids(&self, now_unix: i64) -> Result<Vec<PodPidEntry>, Error> {
        let url = format!("{}/api/v1/pods/pids", self.base_url);
        self.fetch_pod_pids_at(&url, now_unix).await
    }

    /// Fetches the PID map for every pod on a specific node.
    pub async fn fetch_node_pod_pids(&self, node_id: &str, now_unix: i64) -> Result<Vec<PodPidEntry>, Error> {
        let url = format!("{}/api/v1/nodes/{node_id}/pods/pids", self.base_url);
        self.fetch_pod_pids_at(&url, now_unix).await
    }

    async fn fetch_pod_pids_at(&self, url: &str, now_unix: i64) -> Result<Vec<PodPidEntry>, Error> {
        let request = self.authorize(self.http.get(url), now_unix).await?;
        let response = request
            .send()
            .await
            .map_err(|source| Error::Http { url: url.to_string(), source })?
            .error_for_status()
            .map_err(|source| Error::Http { url: url.to_string(), source })?;

        let body: PodPidsResponse = response
            .json()
            .await
            .map_err(|source| Error::Http { url: url.to_string(), source })?;

        if !body.success {
            return Err(Error::MalformedResponse {
                url: url.to_string(),
                reason: "success=false".to_string(),
            });
        }
        Ok(body.pods)
    }
}
