use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use strum::IntoEnumIterator;

use crate::pipeline::types::{GenerateError, JobKind, JobSpec, PipelineError};

/// External capability that performs the actual generation for one content
/// kind.
///
/// A call may take seconds to minutes and may fail transiently; the
/// dispatcher bounds it with a per-kind timeout and applies the retry
/// policy. Implementations must not assume they are called at most once
/// per job.
#[async_trait]
pub trait GenerationBackend: Send + Sync + 'static {
    /// Produce an artifact reference (URL or path) for `spec`.
    async fn generate(&self, spec: &JobSpec) -> Result<String, GenerateError>;
}

/// Maps each job kind to the backend that executes it.
///
/// The dispatcher checks completeness at startup via
/// [`BackendRegistry::ensure_complete`], so a missing kind fails fast
/// instead of at job-execution time.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<JobKind, Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register (or replace) the backend for `kind`.
    pub fn register(&mut self, kind: JobKind, backend: Arc<dyn GenerationBackend>) {
        self.backends.insert(kind, backend);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(&kind).cloned()
    }

    /// Verify every kind has a backend.
    pub fn ensure_complete(&self) -> Result<(), PipelineError> {
        for kind in JobKind::iter() {
            if !self.backends.contains_key(&kind) {
                return Err(PipelineError::BackendMissing { kind });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self.backends.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("BackendRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}
