//! Session and pipeline lifecycle engine of the rk8s workbench.
//!
//! [`session::SessionService`] provisions interactive tool sessions through a
//! [`liboperator::Operator`], assembling each session from the hooks of a
//! [`hooks::HookRegistry`]. [`pipeline::PipelineEngine`] schedules and tracks
//! backup jobs. [`alerting::AlertingLoop`] and [`idle::IdleSweep`] watch the
//! running sessions in the background.

pub mod alerting;
pub mod catalog;
pub mod env;
pub mod error;
pub mod hooks;
pub mod idle;
pub mod model;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod user;

pub use catalog::{StaticToolCatalog, ToolCatalog};
pub use error::{HookError, PipelineError, SessionError, StoreError};
pub use hooks::{HookRegistry, HookSettings};
pub use pipeline::{PipelineEngine, PipelineEngineConfig};
pub use session::{RequestSession, SessionOutcome, SessionService, SessionServiceConfig};
pub use user::{CurrentUser, Role};
