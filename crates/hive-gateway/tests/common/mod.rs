//! Scripted in-process compute nodes for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use hive_gateway::{
    Connector, Controller, ControllerConfig, MemoryRepository, NodeRequest, NodeResponse,
    NodeSession, TransportError,
};
use hive_proto::{ComputeId, ComputeSpec, Endpoint, ForwardMethod};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// Canned reply of a mock node.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Status with a JSON body.
    Json(u16, Value),
    /// Status with a text body.
    Text(u16, String),
    /// The connection drops mid-request.
    Drop,
    /// Wait, then answer.
    Delay(Duration, Box<MockReply>),
}

/// A scripted compute node.
#[derive(Debug)]
pub struct MockNode {
    reachable: AtomicBool,
    routes: Mutex<HashMap<(ForwardMethod, String), Vec<MockReply>>>,
    suffix_routes: Mutex<Vec<(ForwardMethod, String, MockReply)>>,
    requests: Mutex<Vec<NodeRequest>>,
    opens: AtomicUsize,
}

impl Default for MockNode {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            routes: Mutex::new(HashMap::new()),
            suffix_routes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
        }
    }
}

impl MockNode {
    /// Make the node (un)reachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Answer `method path` with `reply` from now on.
    pub fn route(&self, method: ForwardMethod, path: &str, reply: MockReply) {
        self.routes
            .lock()
            .insert((method, path.to_string()), vec![reply]);
    }

    /// Answer `method path` with `replies` in order; the last one repeats.
    pub fn route_sequence(&self, method: ForwardMethod, path: &str, replies: Vec<MockReply>) {
        self.routes.lock().insert((method, path.to_string()), replies);
    }

    /// Answer `method` on any path ending in `suffix` with `reply`.
    pub fn route_suffix(&self, method: ForwardMethod, suffix: &str, reply: MockReply) {
        self.suffix_routes
            .lock()
            .push((method, suffix.to_string(), reply));
    }

    /// Requests for `method` on paths ending in `suffix`.
    pub fn requests_ending(&self, method: ForwardMethod, suffix: &str) -> Vec<NodeRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path.ends_with(suffix))
            .cloned()
            .collect()
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<NodeRequest> {
        self.requests.lock().clone()
    }

    /// Requests received for `method path`.
    pub fn count(&self, method: ForwardMethod, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    /// Number of sessions opened to this node.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &NodeRequest) -> MockReply {
        let key = (request.method, request.path.clone());
        let mut routes = self.routes.lock();
        if let Some(replies) = routes.get_mut(&key) {
            if replies.len() > 1 {
                return replies.remove(0);
            }
            if let Some(reply) = replies.first() {
                return reply.clone();
            }
        }
        drop(routes);
        let suffixed = self
            .suffix_routes
            .lock()
            .iter()
            .find(|(method, suffix, _)| *method == request.method && request.path.ends_with(suffix.as_str()))
            .map(|(_, _, reply)| reply.clone());
        if let Some(reply) = suffixed {
            return reply;
        }
        if request.method == ForwardMethod::Get && request.path == "capabilities" {
            return MockReply::Json(200, json!({"version": "3.0.0", "cpus": 4}));
        }
        MockReply::Json(404, json!({"message": format!("no route for {}", request.path)}))
    }
}

#[derive(Debug)]
struct MockSession {
    node: Arc<MockNode>,
}

impl MockSession {
    async fn answer(&self, request: NodeRequest) -> Result<NodeResponse, TransportError> {
        if !self.node.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Dropped("connection reset by peer".to_string()));
        }
        let mut reply = self.node.next_reply(&request);
        self.node.requests.lock().push(request);

        loop {
            match reply {
                MockReply::Json(status, body) => return Ok(NodeResponse::json_body(status, &body)),
                MockReply::Text(status, body) => return Ok(NodeResponse::new(status, body)),
                MockReply::Drop => {
                    return Err(TransportError::Dropped("connection reset by peer".to_string()));
                }
                MockReply::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }
}

impl NodeSession for MockSession {
    fn send(&self, request: NodeRequest) -> BoxFuture<'_, Result<NodeResponse, TransportError>> {
        Box::pin(self.answer(request))
    }
}

/// Connector routing endpoints to [`MockNode`]s by host and port.
#[derive(Debug, Default)]
pub struct MockConnector {
    nodes: Mutex<HashMap<(String, u16), Arc<MockNode>>>,
}

impl MockConnector {
    /// Create a connector with no nodes.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The node listening on `host:port`, created on first use.
    pub fn node(&self, host: &str, port: u16) -> Arc<MockNode> {
        Arc::clone(
            self.nodes
                .lock()
                .entry((host.to_string(), port))
                .or_default(),
        )
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        endpoint: &Endpoint,
        _connect_timeout: Duration,
    ) -> Result<Arc<dyn NodeSession>, TransportError> {
        let node = self.node(&endpoint.host, endpoint.port);
        node.opens.fetch_add(1, Ordering::SeqCst);
        if !node.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!(
                "{}:{}: connection refused",
                endpoint.host, endpoint.port
            )));
        }
        Ok(Arc::new(MockSession { node }))
    }
}

/// Controller with an in-memory repository on top of `connector`.
pub fn controller(connector: &Arc<MockConnector>) -> Controller {
    controller_with(connector, ControllerConfig::default())
}

/// Controller with `config` on top of `connector`.
pub fn controller_with(connector: &Arc<MockConnector>, config: ControllerConfig) -> Controller {
    Controller::new(
        config,
        Arc::new(MemoryRepository::new()),
        Arc::clone(connector) as Arc<dyn Connector>,
    )
}

/// Register `host:port` under `id` without connecting.
pub async fn add_compute(controller: &Controller, id: &str, host: &str, port: u16) -> ComputeId {
    let id = ComputeId::parse(id).expect("valid id");
    controller
        .create_compute(ComputeSpec::new(host, port).with_id(id.clone()), false)
        .await
        .expect("create compute");
    id
}
