use std::ops::Deref;
use std::sync::Arc;

use crate::pipeline::PipelineDeps;

/// Shared application state handed to every route. Thin wrapper around the
/// same capability bundle the orchestrator runs from (`PipelineDeps`) so
/// routes and the pipeline always see the same registry/bus/config
/// instances — there is exactly one of each per process.
#[derive(Clone)]
pub struct AppState(pub Arc<PipelineDeps>);

impl AppState {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self(deps)
    }

    pub fn deps(&self) -> Arc<PipelineDeps> {
        self.0.clone()
    }
}

impl Deref for AppState {
    type Target = PipelineDeps;

    fn deref(&self) -> &PipelineDeps {
        &self.0
    }
}
