//! Dataflow engine: readiness-driven execution of a module graph.
//!
//! A flow is a list of `ModuleDefinition`s whose outputs target inputs of
//! other modules. Per request the definitions are loaded into a
//! `RuntimeGraph`; the `FlowDispatcher` seeds the entry modules with the
//! request parameters and runs every module once all of its connected
//! inputs are bound, propagating output values along edges until nothing
//! else becomes ready.

pub mod accumulator;
pub mod dispatcher;
pub mod interpolate;
pub mod module;
pub mod runtime;

pub use accumulator::{DispatchOutcome, ResultAccumulator};
pub use dispatcher::{DispatchRequest, FlowDispatcher};
pub use interpolate::interpolate;
pub use module::{AppDefinition, EdgeTarget, ModuleDefinition, ModuleInput, ModuleOutput};
pub use runtime::{load_modules, RuntimeGraph, RuntimeInput, RuntimeNode, RuntimeOutput};
