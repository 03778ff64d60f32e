//! Module runtime: lifecycle, per-module execution contexts and
//! cross-context call dispatch.

pub mod error;
pub mod handle;
pub mod module;
pub mod registry;

pub use error::ModuleError;
pub use futures_util::future::LocalBoxFuture;
pub use handle::{ModuleHandle, ModuleState};
pub use module::{Deferrer, Field, Module, ModuleContext};
pub use registry::{ModuleControl, ModuleRegistry, ModuleStatus};
