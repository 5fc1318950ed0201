//! Worker-facing side of the coordinator: the registry of live workers,
//! the worker RPC client, and the map/reduce execution engine.

pub mod engine;
pub mod error;
pub mod registry;
pub mod worker;

pub use engine::{Engine, EngineConfig, QueryContext};
pub use error::Error;
pub use registry::{Registry, RegistryConfig, WorkerRef};
pub use worker::{ExecError, HttpWorker, WorkerApi};
