use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use crate::error::ModuleError;
use crate::handle::{ModuleHandle, ModuleState};
use crate::module::Module;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    pub name: String,
    pub state: ModuleState,
    pub start_count: u32,
    pub last_state_change: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Type-erased lifecycle control, what the command layer needs to drive any module.
pub trait ModuleControl: Send + Sync {
    fn name(&self) -> &str;
    fn start(&self) -> Result<(), ModuleError>;
    fn stop(&self) -> Result<(), ModuleError>;
    fn state(&self) -> ModuleState;
    fn status(&self) -> ModuleStatus;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<M: Module> ModuleControl for ModuleHandle<M> {
    fn name(&self) -> &str {
        ModuleHandle::name(self)
    }

    fn start(&self) -> Result<(), ModuleError> {
        ModuleHandle::start(self)
    }

    fn stop(&self) -> Result<(), ModuleError> {
        ModuleHandle::stop(self)
    }

    fn state(&self) -> ModuleState {
        ModuleHandle::state(self)
    }

    fn status(&self) -> ModuleStatus {
        let info = self.info();
        ModuleStatus {
            name: self.name().to_string(),
            state: info.state,
            start_count: info.starts,
            last_state_change: info.last_state_change,
            error: info.last_error,
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Registre des modules, construit et passé explicitement
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<BTreeMap<String, Arc<dyn ModuleControl>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: Module>(&self, handle: Arc<ModuleHandle<M>>) -> Result<(), ModuleError> {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        let name = handle.name().to_string();
        if modules.contains_key(&name) {
            return Err(ModuleError::Duplicate(name));
        }
        modules.insert(name, handle);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModuleControl>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Typed handle, to call module-specific operations.
    pub fn typed<M: Module>(&self, name: &str) -> Option<Arc<ModuleHandle<M>>> {
        self.get(name)?.into_any().downcast::<ModuleHandle<M>>().ok()
    }

    pub fn names(&self) -> Vec<String> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn statuses(&self) -> Vec<ModuleStatus> {
        self.snapshot().iter().map(|m| m.status()).collect()
    }

    /// Stop every running module. Failures are logged, the others still stop.
    pub fn stop_all(&self) {
        for module in self.snapshot() {
            if module.state() != ModuleState::Running {
                continue;
            }
            match module.stop() {
                Ok(()) => info!("{} stopped", module.name()),
                Err(e) => warn!("Failed to stop {}: {e}", module.name()),
            }
        }
    }

    // Lock released before calling into modules
    fn snapshot(&self) -> Vec<Arc<dyn ModuleControl>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
