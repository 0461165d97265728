//! Hooks (C10, first half): staged, priority-ordered hooks with per-hook
//! timeout and cancellation. Replaces the `IBidirectionalHook` + implicit
//! ordering pattern called out in spec.md §9 with a sorted slice per stage
//! and an explicit `CancellationToken`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PipelinePreprocessing,
    RequestPreprocessing,
    ResponsePostprocessing,
    ResponseValidation,
    ErrorHandling,
    Finalization,
}

impl Stage {
    /// Debug hooks never abort the request on error; critical stages do.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Stage::RequestPreprocessing | Stage::ResponseValidation
        )
    }
}

/// Mutable data handle passed through a stage's hooks; hooks may transform it
/// in place or signal abort by returning `Err`.
#[derive(Debug, Clone, Default)]
pub struct HookData {
    pub payload: serde_json::Value,
    pub aborted: bool,
    pub abort_reason: Option<String>,
}

pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

pub trait Hook: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }
    /// Debug hooks are best-effort: a timeout or error is logged but never
    /// aborts the stage, even when the stage itself is critical.
    fn is_debug(&self) -> bool {
        false
    }
    fn run<'a>(&'a self, data: &'a mut HookData, cancel: &'a CancellationToken) -> HookFuture<'a>;
}

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct HookRegistry {
    stages: std::collections::HashMap<u8, Vec<Arc<dyn Hook>>>,
}

fn stage_key(stage: Stage) -> u8 {
    stage as u8
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Stage, hook: Arc<dyn Hook>) {
        let hooks = self.stages.entry(stage_key(stage)).or_default();
        hooks.push(hook);
        hooks.sort_by_key(|h| h.priority());
    }

    /// Runs all hooks registered for `stage` in priority order. Returns
    /// `Err` only if a critical, non-debug hook aborted or timed out.
    pub async fn run_stage(&self, stage: Stage, data: &mut HookData) -> Result<(), String> {
        self.run_stage_with_timeout(stage, data, DEFAULT_HOOK_TIMEOUT).await
    }

    pub async fn run_stage_with_timeout(
        &self,
        stage: Stage,
        data: &mut HookData,
        timeout: Duration,
    ) -> Result<(), String> {
        let Some(hooks) = self.stages.get(&stage_key(stage)) else {
            return Ok(());
        };
        for hook in hooks {
            let cancel = CancellationToken::new();
            let result = tokio::time::timeout(timeout, hook.run(data, &cancel)).await;
            cancel.cancel();

            let outcome = match result {
                Ok(inner) => inner,
                Err(_) => Err(format!("hook '{}' timed out after {:?}", hook.name(), timeout)),
            };

            if let Err(reason) = outcome {
                if hook.is_debug() || !stage.is_critical() {
                    tracing::warn!(hook = hook.name(), stage = ?stage, error = %reason, "hook failed, continuing");
                    continue;
                }
                data.aborted = true;
                data.abort_reason = Some(reason.clone());
                return Err(reason);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOk;
    impl Hook for AlwaysOk {
        fn name(&self) -> &str {
            "always-ok"
        }
        fn run<'a>(&'a self, _data: &'a mut HookData, _cancel: &'a CancellationToken) -> HookFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    struct AlwaysFail {
        debug: bool,
    }
    impl Hook for AlwaysFail {
        fn name(&self) -> &str {
            "always-fail"
        }
        fn is_debug(&self) -> bool {
            self.debug
        }
        fn run<'a>(&'a self, _data: &'a mut HookData, _cancel: &'a CancellationToken) -> HookFuture<'a> {
            Box::pin(async { Err("boom".to_string()) })
        }
    }

    #[tokio::test]
    async fn critical_stage_aborts_on_non_debug_failure() {
        let mut registry = HookRegistry::new();
        registry.register(Stage::RequestPreprocessing, Arc::new(AlwaysFail { debug: false }));
        let mut data = HookData::default();
        let result = registry.run_stage(Stage::RequestPreprocessing, &mut data).await;
        assert!(result.is_err());
        assert!(data.aborted);
    }

    #[tokio::test]
    async fn debug_hook_never_aborts() {
        let mut registry = HookRegistry::new();
        registry.register(Stage::RequestPreprocessing, Arc::new(AlwaysFail { debug: true }));
        registry.register(Stage::RequestPreprocessing, Arc::new(AlwaysOk));
        let mut data = HookData::default();
        let result = registry.run_stage(Stage::RequestPreprocessing, &mut data).await;
        assert!(result.is_ok());
        assert!(!data.aborted);
    }

    #[tokio::test]
    async fn non_critical_stage_never_aborts() {
        let mut registry = HookRegistry::new();
        registry.register(Stage::PipelinePreprocessing, Arc::new(AlwaysFail { debug: false }));
        let mut data = HookData::default();
        let result = registry.run_stage(Stage::PipelinePreprocessing, &mut data).await;
        assert!(result.is_ok());
    }
}
