pub mod graph;
pub mod nodes;
pub mod registry;
pub mod service;

pub use graph::{
    interpolate, load_modules, AppDefinition, DispatchOutcome, DispatchRequest, EdgeTarget,
    FlowDispatcher, ModuleDefinition, ModuleInput, ModuleOutput, ResultAccumulator, RuntimeGraph,
    RuntimeNode,
};
pub use nodes::BuiltinDeps;
pub use registry::ExecutorRegistry;
pub use service::{ChatRequest, ChatResponse, ChatService};
