//! Runs user-supplied model programs as isolated worker processes and
//! exposes a synchronous request/response interface to each one.
//!
//! [`descriptor`] parses the model configuration; [`provision`] creates the
//! per-model virtual environment and spawns the worker; [`channel`] carries
//! framed JSON between supervisor and worker; [`dispatcher`] is the
//! in-worker request loop; [`supervisor`] drives one worker's lifecycle;
//! [`registry`] and [`monitor`] multiplex many supervisors with liveness
//! probing and automatic restart.

pub mod channel;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod provision;
pub mod registry;
pub mod supervisor;

pub use descriptor::ModelDescriptor;
pub use dispatcher::{HandlerArgError, HandlerFn, ModelWorker, WorkerApp};
pub use error::{Result, SupervisorError};
pub use monitor::{HealthStatus, Monitor};
pub use registry::{ModelStatus, Registry};
pub use supervisor::{Supervisor, SupervisorState};
