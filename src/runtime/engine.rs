use crate::config::ReconcilerConfig;
use crate::error::{ProviderError, ReconcileError};
use crate::providers::script::{ScriptInvocation, ScriptRunner};
use crate::providers::{CreateRequest, ProviderAdapter, ProviderRegistry, ResourceHandle};
use crate::runtime::blueprint::LifecycleOperation;
use crate::runtime::plan::{Graph, Phase, PlannedNode};
use crate::runtime::report::{ExecutionReport, ExecutionSummary, RunStatus};
use crate::runtime::retry::{RetryPolicy, with_retry};
use crate::runtime::state::{InvalidTransition, NodeState};
use crate::runtime::storage::{Deployment, NodeInstance};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Drives a deployment through the install or uninstall phase.
pub struct Engine {
    providers: ProviderRegistry,
    scripts: ScriptRunner,
    config: ReconcilerConfig,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(providers: ProviderRegistry, config: ReconcilerConfig) -> Self {
        Self {
            providers,
            scripts: ScriptRunner::new(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling stops new dispatch for the rest of this engine's life.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs `phase` over the deployment and records the resulting node states
    /// in it. A failed or cancelled run is reported in the summary; only a
    /// node without a provider adapter is an error, and then nothing runs.
    pub async fn execute(&self, deployment: &mut Deployment, phase: Phase) -> Result<ExecutionSummary, ReconcileError> {
        let mut adapters = HashMap::with_capacity(deployment.graph.len());
        for node in deployment.graph.nodes() {
            let adapter = self.providers.resolve(node).ok_or_else(|| ReconcileError::NoAdapter {
                node: node.name.clone(),
                node_type: node.node_type.clone(),
            })?;
            adapters.insert(node.name.clone(), adapter);
        }

        let order = deployment.graph.order();
        let report = ExecutionReport::new(&deployment.id, phase, order.iter().map(|n| (*n, deployment.state(n))));
        let instances: DashMap<String, NodeInstance> = order
            .iter()
            .map(|n| (n.to_string(), deployment.instance(n).cloned().unwrap_or_default()))
            .collect();

        let run = Arc::new(Run {
            deployment_id: deployment.id.clone(),
            graph: deployment.graph.clone(),
            adapters,
            scripts: self.scripts.clone(),
            retry: self.config.retry.clone(),
            timeout: self.config.operation_timeout(),
            limiter: Semaphore::new(self.config.max_concurrency.max(1)),
            instances,
            report,
            created: Mutex::new(Vec::new()),
            started: Mutex::new(HashSet::new()),
        });

        info!(deployment = %run.deployment_id, %phase, nodes = run.graph.len(), "Starting run");
        let outcome = run.dispatch(phase, &self.cancel).await;
        if phase == Phase::Install && outcome != Outcome::Completed {
            run.rollback().await;
        }

        let status = match outcome {
            Outcome::Cancelled => RunStatus::Cancelled,
            Outcome::Halted => RunStatus::Failed,
            Outcome::Completed if run.report.has_failures() => RunStatus::Failed,
            Outcome::Completed => RunStatus::Succeeded,
        };
        let summary = run.report.finish(status);

        deployment.instances = run
            .graph
            .order()
            .into_iter()
            .map(|n| {
                let instance = run.instances.get(n).map(|i| i.value().clone()).unwrap_or_default();
                (n.to_string(), instance)
            })
            .collect();
        deployment.last_plan = Some(run.graph.plan(phase));
        deployment.last_run = Some(summary.clone());
        deployment.updated_at = Utc::now();

        match status {
            RunStatus::Succeeded => info!(deployment = %deployment.id, %phase, "Run succeeded"),
            _ => error!(
                deployment = %deployment.id,
                %phase,
                %status,
                failed = summary.failed_nodes().count(),
                "Run did not complete"
            ),
        }
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Halted,
    Cancelled,
}

/// Why a node did not reach its target state.
#[derive(Debug, Clone)]
struct NodeFailure {
    code: String,
    message: String,
}

impl NodeFailure {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<ProviderError> for NodeFailure {
    fn from(e: ProviderError) -> Self {
        Self {
            code: e.code,
            message: e.message,
        }
    }
}

impl From<InvalidTransition> for NodeFailure {
    fn from(e: InvalidTransition) -> Self {
        Self::new("invalid_transition", e.to_string())
    }
}

/// Shared state of one run; every node task holds an `Arc` of it.
struct Run {
    deployment_id: String,
    graph: Graph,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    scripts: ScriptRunner,
    retry: RetryPolicy,
    timeout: Duration,
    limiter: Semaphore,
    instances: DashMap<String, NodeInstance>,
    report: ExecutionReport,
    /// Nodes whose resource this run created, in creation order.
    created: Mutex<Vec<String>>,
    started: Mutex<HashSet<String>>,
}

impl Run {
    async fn dispatch(self: &Arc<Self>, phase: Phase, cancel: &CancellationToken) -> Outcome {
        let graph = &self.graph;
        let order: Vec<&str> = match phase {
            Phase::Install => graph.order(),
            Phase::Uninstall => graph.order().into_iter().rev().collect(),
        };
        let mut blockers: HashMap<&str, usize> = order.iter().map(|n| (*n, self.upstream(phase, n).len())).collect();
        let mut ready: VecDeque<&str> = order.iter().copied().filter(|n| blockers[n] == 0).collect();
        let mut tasks = JoinSet::new();
        let mut outcome = Outcome::Completed;

        loop {
            if outcome == Outcome::Completed && cancel.is_cancelled() {
                warn!(deployment = %self.deployment_id, "Run cancelled, no further nodes will be dispatched");
                outcome = Outcome::Cancelled;
            }
            if outcome == Outcome::Completed {
                while let Some(name) = ready.pop_front() {
                    let run = Arc::clone(self);
                    let name = name.to_string();
                    tasks.spawn(async move {
                        let result = run.execute_node(phase, &name).await;
                        (name, result)
                    });
                }
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if outcome == Outcome::Completed => {
                    warn!(deployment = %self.deployment_id, "Run cancelled, waiting for in-flight nodes");
                    outcome = Outcome::Cancelled;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((name, Ok(())))) => {
                        for next in self.downstream(phase, &name) {
                            if let Some(count) = blockers.get_mut(next.as_str()) {
                                *count -= 1;
                                if *count == 0 {
                                    ready.push_back(next.as_str());
                                }
                            }
                        }
                    }
                    Some(Ok((_, Err(_)))) => {
                        if outcome == Outcome::Completed {
                            outcome = Outcome::Halted;
                        }
                    }
                    Some(Err(e)) => {
                        error!(deployment = %self.deployment_id, error = %e, "Node task aborted");
                        if outcome == Outcome::Completed {
                            outcome = Outcome::Halted;
                        }
                    }
                    None => break,
                }
            }
        }

        // Nodes still waiting on an upstream that never finished.
        if outcome == Outcome::Completed {
            for name in order.iter().copied().filter(|n| blockers[n] > 0) {
                error!(deployment = %self.deployment_id, node = name, "Node can never be dispatched");
                self.report.fail(name, "unreachable", "waits on nodes that never completed");
                outcome = Outcome::Halted;
            }
        }
        outcome
    }

    /// Nodes that must finish before `name` runs in this phase.
    fn upstream(&self, phase: Phase, name: &str) -> &[String] {
        match phase {
            Phase::Install => self.graph.dependencies(name),
            Phase::Uninstall => self.graph.dependents(name),
        }
    }

    fn downstream(&self, phase: Phase, name: &str) -> &[String] {
        match phase {
            Phase::Install => self.graph.dependents(name),
            Phase::Uninstall => self.graph.dependencies(name),
        }
    }

    async fn execute_node(&self, phase: Phase, name: &str) -> Result<(), NodeFailure> {
        let Some(node) = self.graph.node(name) else {
            return Err(NodeFailure::new("unknown_node", format!("node '{}' is not in the graph", name)));
        };
        self.report.begin(name);
        let result = match phase {
            Phase::Install => self.install_node(node).await,
            Phase::Uninstall => self.uninstall_node(node).await,
        };
        match &result {
            Ok(()) => {
                self.report.succeed(name);
                info!(deployment = %self.deployment_id, node = name, state = %self.state(name), "Node done");
            }
            Err(failure) => {
                if self.state(name).is_transient() {
                    self.force_state(name, NodeState::Failed);
                }
                self.report.fail(name, &failure.code, &failure.message);
                error!(deployment = %self.deployment_id, node = name, error = %failure, "Node failed");
            }
        }
        result
    }

    async fn install_node(&self, node: &PlannedNode) -> Result<(), NodeFailure> {
        let name = node.name.as_str();
        let adapter = self.adapter(name)?;
        let state = self.state(name);
        if state == NodeState::Started {
            info!(deployment = %self.deployment_id, node = name, "Already started, skipping");
            return Ok(());
        }

        // A failed node can still hold the resource of an earlier run.
        let state = if state == NodeState::Failed && self.instance(name).handle.is_some() {
            self.discard_stale(node, &adapter).await?;
            self.state(name)
        } else {
            state
        };

        // create
        if !state.reached(NodeState::Created) && state != NodeState::Stopped {
            let external = node.uses_external_resource();
            if external && node.property_str("resource_id").is_none_or(str::is_empty) {
                return Err(NodeFailure::new(
                    "external_resource_id_missing",
                    format!("node '{}' uses an external resource but sets no resource_id", name),
                ));
            }
            let resource_id = self.resource_id(node);
            let request = CreateRequest {
                deployment_id: &self.deployment_id,
                resource_id: &resource_id,
                node,
            };

            self.transition(name, NodeState::Creating)?;
            let handle = if external {
                self.call(name, "adopt", || adapter.adopt(&request)).await?
            } else {
                let handle = self.call(name, "create", || adapter.create(&request)).await?;
                lock(&self.created).push(name.to_string());
                handle
            };
            self.record_handle(name, handle, &resource_id, external);
            self.run_script(node, LifecycleOperation::Create).await?;
            self.transition(name, NodeState::Created)?;
        }

        // configure
        let state = self.state(name);
        if !state.reached(NodeState::Configured) && state != NodeState::Stopped {
            self.transition(name, NodeState::Configuring)?;
            self.run_script(node, LifecycleOperation::Configure).await?;
            self.transition(name, NodeState::Configured)?;
        }

        // start
        self.transition(name, NodeState::Starting)?;
        let instance = self.instance(name);
        if !instance.external {
            let handle = self.require_handle(name, &instance)?;
            self.call(name, "start", || adapter.start(handle)).await?;
            lock(&self.started).insert(name.to_string());
        }
        self.run_script(node, LifecycleOperation::Start).await?;
        self.transition(name, NodeState::Started)?;
        Ok(())
    }

    async fn uninstall_node(&self, node: &PlannedNode) -> Result<(), NodeFailure> {
        let name = node.name.as_str();
        let adapter = self.adapter(name)?;
        let state = self.state(name);
        if matches!(state, NodeState::Uninitialized | NodeState::Deleted) {
            info!(deployment = %self.deployment_id, node = name, %state, "Nothing to tear down, skipping");
            return Ok(());
        }
        if state.is_transient() {
            warn!(deployment = %self.deployment_id, node = name, %state, "Node was left mid-operation, treating as failed");
            self.force_state(name, NodeState::Failed);
        }

        let instance = self.instance(name);
        // Hooks only run against a resource that exists.
        let has_resource = instance.external || instance.handle.is_some();
        if self.state(name) == NodeState::Started {
            self.transition(name, NodeState::Stopping)?;
            if !instance.external
                && let Some(handle) = &instance.handle
            {
                self.call(name, "stop", || adapter.stop(handle)).await?;
            }
            if has_resource {
                self.run_script(node, LifecycleOperation::Stop).await?;
            }
            self.transition(name, NodeState::Stopped)?;
        }

        self.transition(name, NodeState::Deleting)?;
        if !instance.external
            && let Some(handle) = &instance.handle
        {
            self.call(name, "delete", || adapter.delete(handle)).await?;
        }
        if has_resource {
            self.run_script(node, LifecycleOperation::Delete).await?;
        }
        self.release(name);
        self.transition(name, NodeState::Deleted)?;
        Ok(())
    }

    /// Deletes the resource left behind by a failed node so it is created afresh.
    async fn discard_stale(&self, node: &PlannedNode, adapter: &Arc<dyn ProviderAdapter>) -> Result<(), NodeFailure> {
        let name = node.name.as_str();
        let instance = self.instance(name);
        warn!(deployment = %self.deployment_id, node = name, "Failed node still holds a resource, deleting it first");
        self.transition(name, NodeState::Deleting)?;
        if !instance.external
            && let Some(handle) = &instance.handle
        {
            self.call(name, "delete", || adapter.delete(handle)).await?;
        }
        self.release(name);
        self.transition(name, NodeState::Deleted)?;
        Ok(())
    }

    /// Tears down, newest first, every resource this run created.
    async fn rollback(&self) {
        let created = lock(&self.created).clone();
        if created.is_empty() {
            return;
        }
        warn!(deployment = %self.deployment_id, nodes = created.len(), "Rolling back");

        for name in created.iter().rev() {
            let Some(node) = self.graph.node(name) else {
                continue;
            };
            match self.roll_back_node(node).await {
                Ok(()) => {
                    self.report.rolled_back(name);
                    info!(deployment = %self.deployment_id, node = %name, "Rolled back");
                }
                Err(failure) => {
                    if self.state(name).is_transient() {
                        self.force_state(name, NodeState::Failed);
                    }
                    self.report
                        .fail(name, &failure.code, &format!("rollback failed: {}", failure.message));
                    error!(deployment = %self.deployment_id, node = %name, error = %failure, "Rollback failed");
                }
            }
        }
    }

    async fn roll_back_node(&self, node: &PlannedNode) -> Result<(), NodeFailure> {
        let name = node.name.as_str();
        let adapter = self.adapter(name)?;
        let instance = self.instance(name);
        let was_started = lock(&self.started).contains(name);

        self.transition(name, NodeState::RollingBack)?;
        if let Some(handle) = &instance.handle {
            if was_started {
                self.call(name, "stop", || adapter.stop(handle)).await?;
                self.run_script(node, LifecycleOperation::Stop).await?;
            }
            self.call(name, "delete", || adapter.delete(handle)).await?;
            self.run_script(node, LifecycleOperation::Delete).await?;
        }
        self.release(name);
        self.transition(name, NodeState::Deleted)?;
        Ok(())
    }

    /// One provider or script call under the concurrency cap, the operation
    /// timeout and the retry policy.
    async fn call<T, F, Fut>(&self, node: &str, operation: &str, mut f: F) -> Result<T, NodeFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let label = format!("{}.{}", node, operation);
        let outcome = with_retry(&self.retry, &label, |_| {
            let fut = f();
            async move {
                let _permit = self
                    .limiter
                    .acquire()
                    .await
                    .map_err(|_| ProviderError::fatal("shutdown", "executor is shutting down"))?;
                match tokio::time::timeout(self.timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout(operation, self.timeout)),
                }
            }
        })
        .await;
        self.report.add_retries(node, outcome.retries());
        outcome.result.map_err(NodeFailure::from)
    }

    async fn run_script(&self, node: &PlannedNode, operation: LifecycleOperation) -> Result<(), NodeFailure> {
        let Some(script) = node.script(operation) else {
            return Ok(());
        };
        let resource_id = self.instance(&node.name).handle.map(|h| h.id);
        let invocation = ScriptInvocation {
            deployment_id: &self.deployment_id,
            node,
            operation,
            script,
            inputs: self.graph.inputs(),
            resource_id: resource_id.as_deref(),
            base_dir: self.graph.base_dir(),
        };
        info!(
            deployment = %self.deployment_id,
            node = %node.name,
            %operation,
            script = %script.implementation,
            "Running lifecycle script"
        );
        self.call(&node.name, operation.as_str(), || self.scripts.run(&invocation))
            .await
            .map(|_| ())
    }

    fn adapter(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>, NodeFailure> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| NodeFailure::new("no_adapter", format!("no adapter resolved for node '{}'", name)))
    }

    /// `resource_id` when set, otherwise `<deployment>-<node>`.
    fn resource_id(&self, node: &PlannedNode) -> String {
        match node.property_str("resource_id") {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("{}-{}", self.deployment_id, node.name),
        }
    }

    fn state(&self, name: &str) -> NodeState {
        self.instances.get(name).map(|i| i.state).unwrap_or_default()
    }

    fn instance(&self, name: &str) -> NodeInstance {
        self.instances.get(name).map(|i| i.value().clone()).unwrap_or_default()
    }

    fn require_handle<'a>(&self, name: &str, instance: &'a NodeInstance) -> Result<&'a ResourceHandle, NodeFailure> {
        instance
            .handle
            .as_ref()
            .ok_or_else(|| NodeFailure::new("missing_handle", format!("node '{}' has no resource handle", name)))
    }

    fn transition(&self, name: &str, to: NodeState) -> Result<(), NodeFailure> {
        let from = {
            let mut instance = self.instances.entry(name.to_string()).or_default();
            let from = instance.state;
            if !from.can_transition_to(to) {
                return Err(InvalidTransition { from, to }.into());
            }
            instance.state = to;
            from
        };
        self.report.set_state(name, to);
        info!(deployment = %self.deployment_id, node = name, %from, %to, "State transition");
        Ok(())
    }

    fn force_state(&self, name: &str, to: NodeState) {
        if let Some(mut instance) = self.instances.get_mut(name) {
            instance.state = to;
        }
        self.report.set_state(name, to);
    }

    fn record_handle(&self, name: &str, handle: ResourceHandle, resource_id: &str, external: bool) {
        if let Some(mut instance) = self.instances.get_mut(name) {
            let props = &mut instance.runtime_properties;
            props.insert("external_id".to_string(), Value::String(handle.id.clone()));
            props.insert("resource_id".to_string(), Value::String(resource_id.to_string()));
            for (key, value) in &handle.attributes {
                props.entry(key.clone()).or_insert_with(|| value.clone());
            }
            instance.external = external;
            instance.handle = Some(handle);
        }
    }

    fn release(&self, name: &str) {
        if let Some(mut instance) = self.instances.get_mut(name) {
            instance.handle = None;
            instance.external = false;
            instance.runtime_properties.clear();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
