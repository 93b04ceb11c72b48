//! Delegated job runner: long-running searches executed on one compute node.
//!
//! The idle-value search creates a scratch project with a single router on
//! the node, asks the node to compute the value, and closes the project
//! again. The whole procedure runs in its own task, so a caller that stops
//! waiting never interrupts the node-side work or the cleanup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hive_proto::{ComputeId, IdlePcRequest};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::error::{ComputeError, Result};
use crate::forward::decode_payload;
use crate::transport::{NodeRequest, NodeSession};

/// Name of the scratch project and router used by the idle-value search.
const SCRATCH_NAME: &str = "AUTOIDLEPC";

/// Runs delegated jobs on compute nodes.
#[derive(Debug, Clone)]
pub struct JobRunner {
    connections: Arc<ConnectionManager>,
    job_timeout: Duration,
}

impl JobRunner {
    /// Create a job runner.
    #[must_use]
    pub const fn new(connections: Arc<ConnectionManager>, job_timeout: Duration) -> Self {
        Self {
            connections,
            job_timeout,
        }
    }

    /// Timeout of the long-running step of a job.
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    /// Start an idle-value search on a compute node.
    ///
    /// The request is validated and the compute connected before the job is
    /// spawned.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an invalid request, `NotFound`, or the
    /// connection error of a failed connect.
    pub async fn submit(&self, id: &ComputeId, request: IdlePcRequest) -> Result<IdlePcJob> {
        request.validate()?;
        let session = self.connections.session(id).await?;

        let job = IdlePcSearch {
            compute_id: id.clone(),
            connections: Arc::clone(&self.connections),
            session,
            request,
            job_timeout: self.job_timeout,
        };
        info!(compute_id = %id, platform = %job.request.platform, "starting idle-pc search");
        Ok(IdlePcJob {
            compute_id: id.clone(),
            handle: tokio::spawn(job.run()),
        })
    }

    /// Find the idle value for a router image on a compute node.
    ///
    /// # Errors
    ///
    /// Returns `Remote` if the node finds no feasible value, `Unreachable` if
    /// the session drops while waiting, and the errors of
    /// [`submit`](Self::submit).
    pub async fn find_idle_value(
        &self,
        id: &ComputeId,
        platform: &str,
        image: &str,
        ram: u32,
    ) -> Result<String> {
        self.submit(id, IdlePcRequest::new(platform, image, ram))
            .await?
            .await
    }
}

/// Handle of a running idle-value search.
///
/// Awaiting it yields the idle value. Dropping it detaches the job: the
/// search and its cleanup keep running on the node.
#[derive(Debug)]
pub struct IdlePcJob {
    compute_id: ComputeId,
    handle: JoinHandle<Result<String>>,
}

impl IdlePcJob {
    /// Compute the job runs on.
    #[must_use]
    pub const fn compute_id(&self) -> &ComputeId {
        &self.compute_id
    }

    /// Check whether the job has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for IdlePcJob {
    type Output = Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let compute_id = self.compute_id.clone();
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(ComputeError::unreachable(&compute_id, format!("job aborted: {e}"))),
        })
    }
}

/// The node-side steps of one search.
struct IdlePcSearch {
    compute_id: ComputeId,
    connections: Arc<ConnectionManager>,
    session: Arc<dyn NodeSession>,
    request: IdlePcRequest,
    job_timeout: Duration,
}

impl IdlePcSearch {
    async fn run(self) -> Result<String> {
        let project_id = Uuid::new_v4();
        self.send(NodeRequest::post(
            "projects",
            json!({"name": SCRATCH_NAME, "project_id": project_id}),
        ))
        .await?;

        let result = self.search(project_id).await;

        let close = NodeRequest::post(format!("projects/{project_id}/close"), json!({}));
        if let Err(e) = self.send(close).await {
            warn!(
                compute_id = %self.compute_id,
                project_id = %project_id,
                error = %e,
                "failed to close idle-pc project"
            );
        }

        match &result {
            Ok(value) => info!(compute_id = %self.compute_id, idlepc = %value, "idle-pc found"),
            Err(e) => warn!(compute_id = %self.compute_id, error = %e, "idle-pc search failed"),
        }
        result
    }

    async fn search(&self, project_id: Uuid) -> Result<String> {
        let node_id = Uuid::new_v4();
        self.send(NodeRequest::post(
            format!("projects/{project_id}/dynamips/nodes"),
            json!({
                "node_id": node_id,
                "name": SCRATCH_NAME,
                "platform": self.request.platform,
                "image": self.request.image,
                "ram": self.request.ram,
            }),
        ))
        .await?;
        debug!(compute_id = %self.compute_id, node_id = %node_id, "scratch router created");

        let payload = self
            .send(
                NodeRequest::get(format!(
                    "projects/{project_id}/dynamips/nodes/{node_id}/auto_idlepc"
                ))
                .with_timeout(self.job_timeout),
            )
            .await?;

        match payload.get("idlepc").and_then(Value::as_str) {
            Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
            _ => Err(ComputeError::remote(
                &self.compute_id,
                200,
                "no idle-pc value found for this image",
            )),
        }
    }

    async fn send(&self, request: NodeRequest) -> Result<Value> {
        let response = self
            .connections
            .request(&self.compute_id, &self.session, request)
            .await?;
        decode_payload(&self.compute_id, &response)
    }
}
