//! The control loop that drives one run to a terminal state.
//!
//! A single loop owns every graph and store mutation. Producer calls are
//! the only work that suspends; up to `max_parallel` of them run at once
//! and their results are applied one at a time as they arrive. Gate
//! decisions, bundle audits and dispute verdicts are turned into graph
//! mutations here and nowhere else.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::pipeline::{consumer_bundle, declared_categories, expected_outputs, PipelinePlan};
use super::producer::{ProduceRequest, Producer, ProducerOutput};
use super::recovery::{
    insert_detection_pass, insert_fix_cycle, meta_u32, open_dispute, rerun_dispute, retry_node,
    META_ATTEMPT, META_FEEDBACK, META_FIX_ITERATION, META_HINT, META_REGENERATION,
};
use super::run::{
    BlockedNode, Escalation, EscalationKind, RunDirectory, RunMetadata, RunReport, RunStatus,
};
use crate::artifact::{
    Artifact, ArtifactDraft, ArtifactKind, ArtifactRef, ArtifactStore, Category, RunId,
};
use crate::blindness::{BlindnessPartitioner, Bundle, BundleKind, BundleManifest};
use crate::config::PipelineConfig;
use crate::core::graph::{shared, SharedGraph, TaskGraph};
use crate::core::task::{StageKind, TaskId, TaskKind, TaskNode, TaskStatus};
use crate::coverage::{CoverageRecord, CoverageTracker, HintDirective};
use crate::dispute::{Dispute, DisputeId, DisputeResolver, Resolution, Reviewer};
use crate::finding::{candidates_from_report, CandidateInput, FindingLedger, FindingUpdate};
use crate::gate::{Decision, GateValidator};
use crate::util::with_timeout;
use crate::{Error, Result};

/// Artifact store shared between the control loop and the caller.
pub type SharedStore = Arc<RwLock<ArtifactStore>>;

/// Name of the ledger artifact rewritten after every ledger change.
pub const LEDGER_ARTIFACT: &str = "finding_ledger";
/// Name of the run-level coverage artifact written after each detection pass.
pub const COVERAGE_ARTIFACT: &str = "coverage.run";

const META_MANIFEST: &str = "manifest";
const META_MANIFEST_VERSION: &str = "manifest_version";

type InFlight = BoxFuture<'static, (TaskId, Result<ProducerOutput>)>;

/// Terminal result of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub report: RunReport,
    /// The final graph, every blocked and superseded node included.
    pub graph: SharedGraph,
    pub store: SharedStore,
}

/// Drives runs of a pipeline plan against one producer.
///
/// The orchestrator itself holds only configuration; all per-run state
/// lives in the run, so one orchestrator can drive several runs.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use gatekeep::config::PipelineConfig;
/// use gatekeep::orchestration::Orchestrator;
///
/// let orchestrator = Orchestrator::new(PipelineConfig::default(), Arc::new(producer))?
///     .persist_to("/tmp/gatekeep");
/// let outcome = orchestrator.run(seeds).await?;
/// println!("{}: {}", outcome.run_id, outcome.status);
/// ```
pub struct Orchestrator {
    config: PipelineConfig,
    producer: Arc<dyn Producer>,
    gate: GateValidator,
    partitioner: BlindnessPartitioner,
    resolver: DisputeResolver,
    plan: PipelinePlan,
    /// Root for artifacts and run records; `None` keeps everything in memory.
    state_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Build an orchestrator with the standard plan, gate and blindness
    /// policy.
    ///
    /// # Errors
    /// `Config` when the configuration fails validation, `Policy` when
    /// the standard policy table is inconsistent.
    pub fn new(config: PipelineConfig, producer: Arc<dyn Producer>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolver: DisputeResolver::new(config.max_rounds),
            config,
            producer,
            gate: GateValidator::standard(),
            partitioner: BlindnessPartitioner::standard()?,
            plan: PipelinePlan::standard(),
            state_dir: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_plan(mut self, plan: PipelinePlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_gate(mut self, gate: GateValidator) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_partitioner(mut self, partitioner: BlindnessPartitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Persist artifacts, run metadata and graph snapshots under `dir`.
    pub fn persist_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Persist under the configured state directory.
    pub fn persist_default(self) -> Result<Self> {
        let dir = self.config.state_dir()?;
        Ok(self.persist_to(dir))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Token that stops every run of this orchestrator when cancelled.
    ///
    /// Nodes in flight at cancellation are blocked, and the run ends
    /// `blocked`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a run with a fresh id. `seeds` are the caller's inputs and
    /// must carry their content categories.
    pub async fn run(&self, seeds: Vec<ArtifactDraft>) -> Result<RunOutcome> {
        self.run_with_id(RunId::new(), seeds).await
    }

    /// Start a run under `run_id`.
    ///
    /// # Errors
    /// Structural failures abort the run: a cycle, an invalid transition,
    /// a closed finding without its evidence, or an IO error while
    /// persisting. Gate blocks, blindness violations, producer failures
    /// and dispute escalations do not; they end up in the outcome.
    pub async fn run_with_id(&self, run_id: RunId, seeds: Vec<ArtifactDraft>) -> Result<RunOutcome> {
        let mut store = match &self.state_dir {
            Some(dir) => ArtifactStore::open(dir)?,
            None => ArtifactStore::in_memory(),
        };
        for seed in seeds {
            store.put(run_id, seed, None)?;
        }
        let mut graph = TaskGraph::new();
        self.plan.instantiate(&mut graph)?;
        tracing::info!(
            run_id = %run_id.short(),
            nodes = graph.len(),
            seeds = store.len(run_id),
            "run started"
        );

        let mut run = Run::new(self, run_id, graph, store);
        let driven = run.drive().await;
        match driven {
            Ok(()) => run.finish().await,
            Err(err) => {
                tracing::error!(
                    run_id = %run_id.short(),
                    class = ?err.class(),
                    error = %err,
                    "run aborted"
                );
                if let Err(persist) = run.persist(RunStatus::Blocked).await {
                    tracing::error!(run_id = %run_id.short(), error = %persist, "failed to persist aborted run");
                }
                Err(err)
            }
        }
    }
}

fn node_of(graph: &TaskGraph, id: &TaskId) -> Result<TaskNode> {
    graph.get(id).cloned().ok_or(Error::TaskNotFound(*id))
}

fn dispatch(producer: Arc<dyn Producer>, timeout: Duration, request: ProduceRequest) -> InFlight {
    let task = request.task;
    async move {
        let result = with_timeout(timeout, producer.produce(request)).await;
        (task, result)
    }
    .boxed()
}

fn gate_meta(decision: &Decision, outputs: &BTreeSet<String>) -> BTreeMap<String, Value> {
    let mut meta = BTreeMap::new();
    meta.insert(
        "gate".to_string(),
        json!(if decision.is_pass() { "pass" } else { "block" }),
    );
    if let Some(reason) = decision.reason() {
        meta.insert("gate_reason".to_string(), json!(reason));
    }
    meta.insert("outputs".to_string(), json!(outputs));
    meta
}

/// State of one run.
struct Run<'a> {
    orch: &'a Orchestrator,
    run_id: RunId,
    started_at: DateTime<Utc>,
    graph: SharedGraph,
    store: SharedStore,
    ledger: FindingLedger,
    coverage: CoverageTracker,
    disputes: BTreeMap<DisputeId, Dispute>,
    /// Artifact names produced for each gated node, fix output included.
    outputs: HashMap<TaskId, BTreeSet<String>>,
    escalations: Vec<Escalation>,
    blocked: Vec<BlockedNode>,
    producer_exhausted: bool,
    cancelled: bool,
    dir: Option<RunDirectory>,
}

impl<'a> Run<'a> {
    fn new(orch: &'a Orchestrator, run_id: RunId, graph: TaskGraph, store: ArtifactStore) -> Self {
        Self {
            orch,
            run_id,
            started_at: Utc::now(),
            graph: shared(graph),
            store: Arc::new(RwLock::new(store)),
            ledger: FindingLedger::new(),
            coverage: CoverageTracker::new(run_id),
            disputes: BTreeMap::new(),
            outputs: HashMap::new(),
            escalations: Vec::new(),
            blocked: Vec::new(),
            producer_exhausted: false,
            cancelled: false,
            dir: orch
                .state_dir
                .as_deref()
                .map(|dir| RunDirectory::new(dir, run_id)),
        }
    }

    /// Claim and dispatch until nothing is runnable and nothing is in
    /// flight, or the run is cancelled.
    async fn drive(&mut self) -> Result<()> {
        let shared_graph = Arc::clone(&self.graph);
        let shared_store = Arc::clone(&self.store);
        let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();

        loop {
            if self.orch.cancel.is_cancelled() {
                self.cancelled = true;
                break;
            }

            {
                let mut graph = shared_graph.write().await;
                let mut store = shared_store.write().await;
                while in_flight.len() < self.orch.config.max_parallel {
                    let Some(id) = graph.claim_next() else {
                        break;
                    };
                    let node = node_of(&graph, &id)?;
                    tracing::debug!(
                        run_id = %self.run_id.short(),
                        task = %id,
                        kind = %node.kind.label(),
                        "node claimed"
                    );
                    if node.kind.is_internal() {
                        self.run_internal(&mut graph, &mut store, &node)?;
                    } else if let Some(request) = self.prepare(&mut graph, &mut store, &node)? {
                        in_flight.push(dispatch(
                            Arc::clone(&self.orch.producer),
                            self.orch.config.node_timeout(),
                            request,
                        ));
                    }
                }
                self.persist_locked(&graph, RunStatus::Running)?;
            }

            if in_flight.is_empty() {
                break;
            }

            let finished = tokio::select! {
                biased;
                _ = self.orch.cancel.cancelled() => None,
                next = in_flight.next() => next,
            };
            let Some((id, result)) = finished else {
                self.cancelled = self.orch.cancel.is_cancelled();
                break;
            };

            let mut graph = shared_graph.write().await;
            let mut store = shared_store.write().await;
            match result {
                Ok(output) => self.on_output(&mut graph, &mut store, id, output)?,
                Err(err) => self.on_failure(&mut graph, id, err)?,
            }
        }

        if self.cancelled {
            drop(in_flight);
            let mut graph = shared_graph.write().await;
            let stuck: Vec<TaskId> = graph
                .nodes()
                .into_iter()
                .filter(|n| n.status == TaskStatus::InProgress)
                .map(|n| n.id)
                .collect();
            for id in &stuck {
                graph.block(id, "run cancelled")?;
            }
            tracing::warn!(run_id = %self.run_id.short(), in_flight = stuck.len(), "run cancelled");
        }
        Ok(())
    }

    fn run_internal(
        &mut self,
        graph: &mut TaskGraph,
        store: &mut ArtifactStore,
        node: &TaskNode,
    ) -> Result<()> {
        match &node.kind {
            TaskKind::Bundle { target } => self.build_bundle(graph, store, node, *target),
            TaskKind::Consolidate => self.consolidate(graph, store, node),
            TaskKind::Revalidate { origin } => {
                let origin = node_of(graph, origin)?;
                self.settle(graph, store, node.id, &origin, meta_u32(node, META_FIX_ITERATION))
            }
            other => Err(Error::InvariantViolation(format!(
                "{} is not run inside the control loop",
                other.label()
            ))),
        }
    }

    /// Build the producer request for `node`, or `None` when its bundle
    /// failed the audit and the node was regenerated instead.
    fn prepare(
        &mut self,
        graph: &mut TaskGraph,
        store: &mut ArtifactStore,
        node: &TaskNode,
    ) -> Result<Option<ProduceRequest>> {
        let (inputs, origin) = match &node.kind {
            TaskKind::Fix { origin } => {
                let origin_node = node_of(graph, origin)?;
                let Some(mut inputs) = self.inputs_for(graph, store, &origin_node, node)? else {
                    return Ok(None);
                };
                for name in self.outputs.get(origin).into_iter().flatten() {
                    if inputs.iter().any(|a| &a.name == name) {
                        continue;
                    }
                    if let Ok(artifact) = store.get(self.run_id, name) {
                        inputs.push(artifact.clone());
                    }
                }
                (inputs, Some(origin_node.kind))
            }
            _ => match self.inputs_for(graph, store, node, node)? {
                Some(inputs) => (inputs, None),
                None => return Ok(None),
            },
        };

        let hint = node
            .metadata
            .get(META_HINT)
            .and_then(|v| serde_json::from_value::<HintDirective>(v.clone()).ok());
        tracing::trace!(
            run_id = %self.run_id.short(),
            task = %node.id,
            inputs = ?inputs.iter().map(|a| a.reference().to_string()).collect::<Vec<_>>(),
            "dispatching to producer"
        );
        Ok(Some(ProduceRequest {
            run_id: self.run_id,
            task: node.id,
            title: node.title.clone(),
            kind: node.kind.clone(),
            origin,
            inputs,
            feedback: node.meta_str(META_FEEDBACK).map(str::to_string),
            hint,
            attempt: meta_u32(node, META_ATTEMPT),
            metadata: node.metadata.clone(),
        }))
    }

    /// Inputs visible to a node of `consumer`'s kind. `claimed` is the
    /// node regenerated if a fresh bundle fails its audit.
    fn inputs_for(
        &mut self,
        graph: &mut TaskGraph,
        store: &mut ArtifactStore,
        consumer: &TaskNode,
        claimed: &TaskNode,
    ) -> Result<Option<Vec<Artifact>>> {
        let Some(kind) = consumer_bundle(&consumer.kind) else {
            return Ok(Some(
                store
                    .latest_all(self.run_id)
                    .into_iter()
                    .filter(|a| a.kind != ArtifactKind::BundleManifest)
                    .cloned()
                    .collect(),
            ));
        };

        let bundle = match self.built_bundle(graph, store, consumer, kind)? {
            Some(bundle) => bundle,
            None => {
                let bundle = self.orch.partitioner.materialize(kind, store, self.run_id)?;
                let decision = self.orch.partitioner.audit(&bundle, kind, store, self.run_id);
                if !decision.is_pass() {
                    self.regenerate(graph, claimed, &decision)?;
                    return Ok(None);
                }
                store.put(self.run_id, bundle.manifest_draft()?, Some(claimed.id))?;
                bundle
            }
        };
        bundle
            .included
            .iter()
            .map(|reference| store.get_ref(self.run_id, reference).cloned())
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// The audited bundle of a completed bundle node `consumer` waits on.
    fn built_bundle(
        &self,
        graph: &TaskGraph,
        store: &ArtifactStore,
        consumer: &TaskNode,
        kind: BundleKind,
    ) -> Result<Option<Bundle>> {
        for dep in graph.dependencies(&consumer.id) {
            let Some(node) = graph.get(&dep) else {
                continue;
            };
            if node.kind != (TaskKind::Bundle { target: kind }) || !node.is_completed() {
                continue;
            }
            let version = node
                .metadata
                .get(META_MANIFEST_VERSION)
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok());
            let (Some(name), Some(version)) = (node.meta_str(META_MANIFEST), version) else {
                continue;
            };
            let stored = store.get_ref(self.run_id, &ArtifactRef::new(name, version))?;
            let manifest: BundleManifest =
                serde_json::from_value(stored.json().cloned().unwrap_or(Value::Null))?;
            return Ok(Some(Bundle::from_manifest(manifest)));
        }
        Ok(None)
    }

    fn build_bundle(
        &mut self,
        graph: &mut TaskGraph,
        store: &mut ArtifactStore,
        node: &TaskNode,
        target: BundleKind,
    ) -> Result<()> {
        let bundle = self.orch.partitioner.materialize(target, store, self.run_id)?;
        let decision = self.orch.partitioner.audit(&bundle, target, store, self.run_id);
        if !decision.is_pass() {
            return self.regenerate(graph, node, &decision);
        }
        let manifest = store.put(self.run_id, bundle.manifest_draft()?, Some(node.id))?;
        let mut meta = BTreeMap::new();
        meta.insert(META_MANIFEST.to_string(), json!(manifest.name));
        meta.insert(META_MANIFEST_VERSION.to_string(), json!(manifest.version));
        meta.insert("artifacts".to_string(), json!(bundle.included.len()));
        graph.complete(&node.id, meta)
    }

    /// Supersede a node whose bundle failed its audit. Its consumers stay
    /// halted until a regenerated bundle passes.
    fn regenerate(&mut self, graph: &mut TaskGraph, node: &TaskNode, decision: &Decision) -> Result<()> {
        let reason = decision.to_string();
        let regenerations = meta_u32(node, META_REGENERATION);
        if regenerations < self.orch.config.max_fix_iterations {
            let replacement = retry_node(graph, node, META_REGENERATION, &reason)?;
            tracing::warn!(
                run_id = %self.run_id.short(),
                task = %node.id,
                %replacement,
                reason = %reason,
                "blindness violation, regenerating"
            );
        } else {
            graph.block(&node.id, &reason)?;
            tracing::warn!(
                run_id = %self.run_id.short(),
                task = %node.id,
                regenerations,
                reason = %reason,
                "blindness violation, regeneration budget spent"
            );
            self.blocked.push(BlockedNode {
                task: node.id,
                title: node.title.clone(),
                reason,
            });
        }
        Ok(())
    }

    fn on_output(
        &mut self,
        graph: &mut TaskGraph,
        store: &mut ArtifactStore,
        id: TaskId,
        output: ProducerOutput,
    ) -> Result<()> {
        let node = node_of(graph, &id)?;
        let origin = match &node.kind {
            TaskKind::Fix { origin } => node_of(graph, origin)?,
            _ => node.clone(),
        };

        let stamp = declared_categories(&origin.kind);
        let mut names = BTreeSet::new();
        for mut draft in output.artifacts {
            draft.categories.extend(stamp.iter().copied());
            names.insert(draft.name.clone());
            store.put(self.run_id, draft, Some(id))?;
        }
        tracing::debug!(
            run_id = %self.run_id.short(),
            task = %id,
            artifacts = names.len(),
            "producer output stored"
        );
        self.outputs
            .entry(origin.id)
            .or_default()
            .extend(names.iter().cloned());

        if matches!(node.kind, TaskKind::Fix { .. }) {
            let mut meta = BTreeMap::new();
            meta.insert("outputs".to_string(), json!(names));
            return graph.complete(&id, meta);
        }
        self.settle(graph, store, id, &origin, meta_u32(&node, META_FIX_ITERATION))
    }

    fn on_failure(&mut self, graph: &mut TaskGraph, id: TaskId, err: Error) -> Result<()> {
        let node = node_of(graph, &id)?;
        let reason = format!("producer failed: {}", err);
        let attempt = meta_u32(&node, META_ATTEMPT);
        if attempt < self.orch.config.max_producer_retries {
            let retry = retry_node(graph, &node, META_ATTEMPT, &reason)?;
            tracing::warn!(
                run_id = %self.run_id.short(),
                task = %id,
                %retry,
                attempt = attempt + 1,
                error = %err,
                "producer failed, retry inserted"
            );
            return Ok(());
        }

        graph.block(&id, &reason)?;
        tracing::error!(
            run_id = %self.run_id.short(),
            task = %id,
            attempts = attempt + 1,
            error = %err,
            "producer retries exhausted"
        );
        self.blocked.push(BlockedNode {
            task: id,
            title: node.title.clone(),
            reason: reason.clone(),
        });
        self.escalations.push(Escalation {
            kind: EscalationKind::Producer,
            task: id,
            subject: node.title,
            reason,
        });
        self.producer_exhausted = true;
        Ok(())
    }

    /// Gate the outputs of `origin` and move on: complete `gated` on pass,
    /// insert a fix cycle on block, or block `gated` once the fix budget
    /// is spent.
    fn settle(
        &mut self,
        graph: &mut TaskGraph,
        store: &mut ArtifactStore,
        gated: TaskId,
        origin: &TaskNode,
        iteration: u32,
    ) -> Result<()> {
        let names = self.outputs.get(&origin.id).cloned().unwrap_or_default();
        let produced: Vec<Artifact> = names
            .iter()
            .filter_map(|name| store.get(self.run_id, name).ok().cloned())
            .collect();

        let mut decision = {
            let related = store.latest_all(self.run_id);
            let refs: Vec<&Artifact> = produced.iter().collect();
            self.orch.gate.validate_bundle(&refs, &related)
        };
        let absent: Vec<String> = expected_outputs(&origin.kind)
            .iter()
            .filter(|kind| !produced.iter().any(|a| a.kind == **kind))
            .map(|kind| format!("{} artifact", kind))
            .collect();
        if !absent.is_empty() {
            decision = decision.merge(Decision::block(
                format!("{} returned no {}", origin.title, absent.join(", ")),
                absent,
            ));
        }

        if decision.is_pass() {
            for record in produced
                .iter()
                .filter(|a| a.kind == ArtifactKind::CoverageRecord)
                .filter_map(|a| a.json())
                .filter_map(|doc| serde_json::from_value::<CoverageRecord>(doc.clone()).ok())
            {
                self.coverage.absorb(&record);
            }
            if let TaskKind::Stage { stage } = origin.kind {
                decision = self
                    .orch
                    .config
                    .coverage_policy(stage)
                    .check(stage.as_str(), self.coverage.ratio());
            }
        }
        if decision.is_pass() {
            decision = self.after_gate(graph, store, gated, origin, &produced)?;
        }

        if decision.is_pass() {
            tracing::debug!(
                run_id = %self.run_id.short(),
                task = %gated,
                origin = %origin.id,
                "gate passed"
            );
            return graph.complete(&gated, gate_meta(&decision, &names));
        }

        let reason = decision.to_string();
        tracing::warn!(
            run_id = %self.run_id.short(),
            task = %gated,
            origin = %origin.id,
            iteration,
            reason = %reason,
            "gate blocked"
        );
        if iteration < self.orch.config.max_fix_iterations {
            insert_fix_cycle(graph, gated, origin, iteration + 1, &reason)?;
            graph.complete(&gated, gate_meta(&decision, &names))
        } else {
            graph.block(&gated, &reason)?;
            self.blocked.push(BlockedNode {
                task: gated,
                title: origin.title.clone(),
                reason,
            });
            Ok(())
        }
    }

    /// Kind-specific work once the gate has passed. A block here goes
    /// through the same fix cycle as a gate block.
    fn after_gate(
        &mut self,
        graph: &mut TaskGraph,
        store: &mut ArtifactStore,
        gated: TaskId,
        origin: &TaskNode,
        produced: &[Artifact],
    ) -> Result<Decision> {
        match &origin.kind {
            TaskKind::Stage {
                stage: StageKind::Detection,
            } => {
                self.close_detection_pass(graph, store, gated)?;
                Ok(Decision::Pass)
            }
            TaskKind::Stage {
                stage: StageKind::VerifyFixes,
            } => self.apply_updates(store, gated, produced),
            TaskKind::DisputeReview { dispute, reviewer } => {
                self.record_argument(dispute, *reviewer, produced)
            }
            TaskKind::DisputeResolve { dispute } => {
                self.adjudicate(graph, store, gated, dispute, produced)
            }
            _ => Ok(Decision::Pass),
        }
    }

    fn close_detection_pass(
        &mut self,
        graph: &mut TaskGraph,
        store: &mut ArtifactStore,
        gated: TaskId,
    ) -> Result<()> {
        let outcome = self.coverage.finish_pass();
        store.put(
            self.run_id,
            ArtifactDraft::new(
                COVERAGE_ARTIFACT,
                ArtifactKind::CoverageRecord,
                serde_json::to_value(self.coverage.record())?,
                &[Category::TestResults],
            ),
            Some(gated),
        )?;

        match outcome.directive {
            Some(directive) if outcome.pass < self.orch.config.max_detection_passes => {
                let next = insert_detection_pass(graph, gated, outcome.pass + 1, &directive)?;
                tracing::info!(
                    run_id = %self.run_id.short(),
                    task = %next,
                    pass = outcome.pass + 1,
                    level = %directive.level,
                    "detection pass inserted"
                );
            }
            Some(directive) => tracing::warn!(
                run_id = %self.run_id.short(),
                pass = outcome.pass,
                level = %directive.level,
                "detection pass budget spent"
            ),
            None if outcome.exhausted => tracing::warn!(
                run_id = %self.run_id.short(),
                pass = outcome.pass,
                "hint ladder exhausted"
            ),
            None => {}
        }
        Ok(())
    }

    fn apply_updates(
        &mut self,
        store: &mut ArtifactStore,
        gated: TaskId,
        produced: &[Artifact],
    ) -> Result<Decision> {
        let Some(doc) = produced
            .iter()
            .find(|a| a.kind == ArtifactKind::FindingUpdates)
            .and_then(|a| a.json())
        else {
            return Ok(Decision::Pass);
        };
        let updates = match doc
            .get("updates")
            .cloned()
            .map(serde_json::from_value::<Vec<FindingUpdate>>)
            .transpose()
        {
            Ok(updates) => updates.unwrap_or_default(),
            Err(err) => {
                return Ok(Decision::block(
                    format!("finding_updates: unreadable updates: {}", err),
                    Vec::new(),
                ))
            }
        };

        // All or nothing: a rejected transition leaves the ledger untouched.
        let mut next = self.ledger.clone();
        for update in &updates {
            if let Err(err) = next.apply(update) {
                return Ok(Decision::block(err.to_string(), vec![update.finding_id.clone()]));
            }
        }
        self.ledger = next;
        self.write_ledger(store, gated)?;
        tracing::info!(
            run_id = %self.run_id.short(),
            task = %gated,
            updates = updates.len(),
            "finding updates applied"
        );
        Ok(Decision::Pass)
    }

    fn record_argument(
        &mut self,
        id: &DisputeId,
        reviewer: Reviewer,
        produced: &[Artifact],
    ) -> Result<Decision> {
        let dispute = self
            .disputes
            .get_mut(id)
            .ok_or_else(|| Error::InvariantViolation(format!("unknown dispute {}", id)))?;
        let Some(argument) = produced
            .iter()
            .find(|a| a.kind == ArtifactKind::DisputeArgument)
        else {
            return Ok(Decision::block(
                format!("{} returned no argument for {}", reviewer, id),
                vec![dispute.argument_name(reviewer)],
            ));
        };
        match reviewer {
            Reviewer::Opus => dispute.opus_argument = Some(argument.reference()),
            Reviewer::Codex => dispute.codex_argument = Some(argument.reference()),
        }
        Ok(Decision::Pass)
    }

    fn adjudicate(
        &mut self,
        graph: &mut TaskGraph,
        store: &mut ArtifactStore,
        gated: TaskId,
        id: &DisputeId,
        produced: &[Artifact],
    ) -> Result<Decision> {
        let mut dispute = self
            .disputes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::InvariantViolation(format!("unknown dispute {}", id)))?;
        let (Some(opus_ref), Some(codex_ref)) =
            (dispute.opus_argument.clone(), dispute.codex_argument.clone())
        else {
            return Ok(Decision::block(
                format!("{} is missing an argument", id),
                Reviewer::both()
                    .iter()
                    .filter(|r| dispute.argument(**r).is_none())
                    .map(|r| dispute.argument_name(*r))
                    .collect(),
            ));
        };
        let Some(verdict) = produced
            .iter()
            .find(|a| a.kind == ArtifactKind::DisputeVerdict)
        else {
            return Ok(Decision::block(
                format!("{} has no verdict", id),
                vec![dispute.verdict_name()],
            ));
        };
        let opus = store.get_ref(self.run_id, &opus_ref)?.clone();
        let codex = store.get_ref(self.run_id, &codex_ref)?.clone();

        match self.orch.resolver.resolve(&mut dispute, &opus, &codex, verdict) {
            Resolution::Incomplete(decision) => return Ok(decision),
            Resolution::Confirm {
                finding_id,
                reproduction_ref,
            } => {
                self.ledger.confirm(&finding_id, &reproduction_ref)?;
                let mut observed = self.coverage.record();
                observed.validated_high_med = self.ledger.confirmed_ids().len() as u64;
                self.coverage.absorb(&observed);
                self.write_ledger(store, gated)?;
            }
            Resolution::Disprove {
                finding_id,
                refutation_ref,
            } => {
                tracing::info!(
                    run_id = %self.run_id.short(),
                    finding = %finding_id,
                    refutation = %refutation_ref,
                    "finding disproven"
                );
            }
            Resolution::Rerun { next } => {
                let title = self
                    .ledger
                    .candidate(&next.subject_finding_id)
                    .map(|c| c.title.clone())
                    .unwrap_or_else(|| next.subject_finding_id.clone());
                rerun_dispute(graph, gated, &dispute.id, &next, &title)?;
                self.disputes.insert(next.id.clone(), next);
            }
            Resolution::Escalate {
                finding_id,
                round,
                reason,
            } => {
                tracing::warn!(
                    run_id = %self.run_id.short(),
                    finding = %finding_id,
                    round,
                    "dispute escalated"
                );
                self.escalations.push(Escalation {
                    kind: EscalationKind::Dispute,
                    task: gated,
                    subject: finding_id,
                    reason,
                });
            }
        }

        store.put(
            self.run_id,
            ArtifactDraft::new(
                dispute.record_name(),
                ArtifactKind::Dispute,
                serde_json::to_value(&dispute)?,
                // Carries the round's verdict, so it is sealed like one.
                &[Category::Findings, Category::ReviewOpus, Category::ReviewCodex],
            ),
            Some(gated),
        )?;
        self.disputes.insert(dispute.id.clone(), dispute);
        Ok(Decision::Pass)
    }

    /// Merge every review report into the ledger and open a dispute for
    /// each new HIGH/MED candidate. Nodes waiting on consolidation also
    /// wait on every dispute's resolution.
    fn consolidate(
        &mut self,
        graph: &mut TaskGraph,
        store: &mut ArtifactStore,
        node: &TaskNode,
    ) -> Result<()> {
        let reports: Vec<(String, Vec<CandidateInput>)> = store
            .latest_all(self.run_id)
            .into_iter()
            .filter(|a| a.kind == ArtifactKind::ReviewReport)
            .filter_map(|a| a.json().map(|doc| (a.name.clone(), candidates_from_report(doc))))
            .collect();
        let summary = self.ledger.consolidate(reports);

        let mut observed = self.coverage.record();
        observed.high_med_candidates = self
            .ledger
            .candidates()
            .filter(|c| c.severity.is_high_or_med())
            .count() as u64;
        self.coverage.absorb(&observed);

        let downstream = graph.dependents(&node.id);
        let subjects: Vec<(String, String)> = self
            .ledger
            .disputable(&summary.new)
            .map(|c| (c.id.clone(), c.title.clone()))
            .collect();
        for (finding_id, title) in &subjects {
            let dispute = Dispute::open(finding_id);
            open_dispute(graph, node.id, &downstream, &dispute, title)?;
            self.disputes.insert(dispute.id.clone(), dispute);
        }
        self.write_ledger(store, node.id)?;

        tracing::info!(
            run_id = %self.run_id.short(),
            task = %node.id,
            candidates = summary.new.len(),
            merged = summary.merged,
            recorded = summary.recorded.len(),
            disputes = subjects.len(),
            "findings consolidated"
        );
        let mut meta = BTreeMap::new();
        meta.insert("candidates".to_string(), json!(summary.new));
        meta.insert("recorded".to_string(), json!(summary.recorded));
        meta.insert("disputes".to_string(), json!(subjects.len()));
        graph.complete(&node.id, meta)
    }

    fn write_ledger(&self, store: &mut ArtifactStore, task: TaskId) -> Result<()> {
        let document = self.ledger.to_document()?;
        store.put(
            self.run_id,
            ArtifactDraft::new(
                LEDGER_ARTIFACT,
                ArtifactKind::FindingLedger,
                document,
                &[Category::Findings],
            ),
            Some(task),
        )?;
        Ok(())
    }

    fn status(&self, graph: &TaskGraph) -> RunStatus {
        let counts = graph.counts();
        if self.cancelled {
            RunStatus::Blocked
        } else if self.producer_exhausted {
            RunStatus::Escalated
        } else if !self.blocked.is_empty() || counts.pending > 0 || counts.in_progress > 0 {
            RunStatus::Blocked
        } else if !self.escalations.is_empty() {
            RunStatus::Escalated
        } else {
            RunStatus::Complete
        }
    }

    fn persist_locked(&self, graph: &TaskGraph, status: RunStatus) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        dir.write_graph(&graph.snapshot())?;
        dir.write_metadata(&RunMetadata::capture(
            self.run_id,
            self.started_at,
            status,
            graph,
            &self.orch.config,
        ))
    }

    async fn persist(&self, status: RunStatus) -> Result<()> {
        let graph = self.graph.read().await;
        self.persist_locked(&graph, status)
    }

    async fn finish(self) -> Result<RunOutcome> {
        let graph = self.graph.read().await;
        let status = self.status(&graph);
        let report = RunReport {
            run_id: self.run_id,
            status,
            findings: self.ledger.findings().cloned().collect(),
            disputes: self.disputes.values().cloned().collect(),
            escalations: self.escalations.clone(),
            blocked: self.blocked.clone(),
            coverage: self.coverage.record(),
            hint_escalations: self.coverage.escalations().to_vec(),
            counts: graph.counts(),
        };
        self.persist_locked(&graph, status)?;
        if let Some(dir) = &self.dir {
            dir.write_report(&report)?;
        }
        tracing::info!(
            run_id = %self.run_id.short(),
            %status,
            findings = report.findings.len(),
            escalations = report.escalations.len(),
            blocked = report.blocked.len(),
            "run finished"
        );
        drop(graph);
        Ok(RunOutcome {
            run_id: self.run_id,
            status,
            report,
            graph: self.graph,
            store: self.store,
        })
    }
}
