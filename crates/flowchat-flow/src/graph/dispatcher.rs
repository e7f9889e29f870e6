use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use flowchat_core::error::Result;
use flowchat_core::traits::Transport;
use flowchat_core::types::{DispatchContext, NodeOutput};

use super::accumulator::{DispatchOutcome, ResultAccumulator};
use super::module::ModuleDefinition;
use super::runtime::{load_modules, RuntimeGraph};
use crate::registry::ExecutorRegistry;

/// Inputs of one dispatch.
pub struct DispatchRequest<'a> {
    pub modules: &'a [ModuleDefinition],
    /// Values for `{{name}}` tokens in static inputs.
    pub variables: Map<String, Value>,
    /// Bound onto entry modules when the dispatch starts.
    pub params: Map<String, Value>,
    pub stream: bool,
    pub transport: Arc<dyn Transport>,
}

type Pending = BoxFuture<'static, Result<(usize, NodeOutput)>>;

/// Per-dispatch state. Owned by the driving loop; nothing here outlives
/// the request.
struct RunState {
    graph: RuntimeGraph,
    accumulator: ResultAccumulator,
    ctx: DispatchContext,
    pending: FuturesUnordered<Pending>,
}

/// Runs module graphs against an executor registry.
///
/// Modules run as soon as all their connected inputs are bound, at most
/// once each. Running executors are polled concurrently by a single
/// driver, which alone mutates the runtime graph between completions.
#[derive(Clone)]
pub struct FlowDispatcher {
    registry: Arc<ExecutorRegistry>,
}

impl FlowDispatcher {
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Run a flow to completion.
    ///
    /// Resolves once every launched module has settled. The first executor
    /// error aborts the dispatch: modules still running are dropped and
    /// the error is returned as is.
    pub async fn dispatch(&self, request: DispatchRequest<'_>) -> Result<DispatchOutcome> {
        let start = Instant::now();
        let mut run = RunState {
            graph: load_modules(request.modules, &request.variables),
            accumulator: ResultAccumulator::new(),
            ctx: DispatchContext {
                stream: request.stream,
                transport: request.transport,
            },
            pending: FuturesUnordered::new(),
        };

        info!(
            modules = run.graph.len(),
            stream = run.ctx.stream,
            "Dispatching flow"
        );

        for idx in run.graph.entry_nodes() {
            let bindings = request.params.iter().map(|(k, v)| (k.as_str(), v));
            self.try_run(&mut run, idx, bindings);
        }

        let mut executed = 0usize;
        while let Some(settled) = run.pending.next().await {
            let (idx, output) = settled?;
            executed += 1;
            self.propagate(&mut run, idx, output);
        }

        let outcome = run.accumulator.finish();
        info!(
            executed,
            answer_len = outcome.answer_text.len(),
            traces = outcome.response_data.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Flow dispatch complete"
        );
        Ok(outcome)
    }

    /// Apply bindings to a node and launch it if it became ready.
    fn try_run<'v>(
        &self,
        run: &mut RunState,
        idx: usize,
        bindings: impl IntoIterator<Item = (&'v str, &'v Value)>,
    ) {
        let node = run.graph.node_mut(idx);
        for (key, value) in bindings {
            node.bind(key, value.clone());
        }

        if !node.is_ready() {
            debug!(module_id = %node.module_id, "Module waiting for inputs");
            return;
        }
        if !node.claim() {
            return;
        }
        self.execute(run, idx);
    }

    /// Launch the executor for a claimed node.
    fn execute(&self, run: &mut RunState, idx: usize) {
        let node = run.graph.node(idx);

        if run.ctx.transport.is_closed() {
            debug!(module_id = %node.module_id, "Transport closed, skipping module");
            return;
        }

        let module_id = node.module_id.clone();
        let flow_type = node.flow_type.clone();
        debug!(module_id = %module_id, flow_type = %flow_type, "Running module");

        let running = self
            .registry
            .invoke(&flow_type, node.params(), run.ctx.clone());

        run.pending.push(Box::pin(async move {
            let started = Instant::now();
            match running.await {
                Ok(output) => {
                    debug!(
                        module_id = %module_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        outputs = output.values.len(),
                        "Module complete"
                    );
                    Ok((idx, output))
                }
                Err(e) => {
                    error!(module_id = %module_id, flow_type = %flow_type, error = %e, "Module failed");
                    Err(e)
                }
            }
        }));
    }

    /// Record a node's result and feed its outputs to downstream inputs.
    fn propagate(&self, run: &mut RunState, idx: usize, output: NodeOutput) {
        let NodeOutput { values, trace } = output;
        if let Some(record) = trace {
            run.accumulator.push_trace(record);
        }

        let mut deliveries = Vec::new();
        for slot in run.graph.node_mut(idx).outputs.iter_mut() {
            let Some(value) = values.get(&slot.key) else {
                continue;
            };
            if !slot.store(value) {
                continue;
            }
            if slot.answer {
                run.accumulator.push_answer(value);
            }
            for target in &slot.targets {
                deliveries.push((target.clone(), value.clone()));
            }
        }

        for (target, value) in deliveries {
            match run.graph.find(&target.module_id) {
                Some(target_idx) => {
                    self.try_run(run, target_idx, [(target.key.as_str(), &value)]);
                }
                None => {
                    debug!(target = %target.module_id, "Edge target missing, dropping value");
                }
            }
        }
    }
}
