use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::types::{HookAction, HookContext, HookDefinition, HookTiming};

/// Central registry and dispatcher for all hooks in the process.
///
/// Share a single instance as `Arc<HookEngine>`.
pub struct HookEngine {
    /// Sorted by priority ascending after every registration.
    hooks: RwLock<Vec<HookDefinition>>,
}

impl HookEngine {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a hook. Re-sorts so priority order is always correct.
    pub fn register(&self, hook: HookDefinition) {
        let mut hooks = self.hooks.write().expect("hook registry poisoned");
        hooks.push(hook);
        hooks.sort_by_key(|h| h.priority);
        debug!(count = hooks.len(), "hook registered");
    }

    /// Remove a hook by name. Silent no-op if the name is not found.
    pub fn unregister(&self, name: &str) {
        let mut hooks = self.hooks.write().expect("hook registry poisoned");
        let before = hooks.len();
        hooks.retain(|h| h.name != name);
        if hooks.len() < before {
            debug!(name, "hook unregistered");
        }
    }

    /// Run Before hooks inline (stopping at the first Block), then spawn
    /// After hooks. Returns the combined decision.
    pub fn emit(&self, ctx: HookContext) -> HookAction {
        let action = self.emit_before(&ctx);
        if matches!(action, HookAction::Block { .. }) {
            return action;
        }
        self.emit_after(ctx);
        HookAction::Allow
    }

    /// Run all Before hooks for the event in priority order.
    pub fn emit_before(&self, ctx: &HookContext) -> HookAction {
        let hooks = self.hooks.read().expect("hook registry poisoned");
        for hook in hooks
            .iter()
            .filter(|h| h.event == ctx.event && h.timing == HookTiming::Before)
        {
            let t = Instant::now();
            let action = hook.handler.handle(ctx);
            debug!(
                hook = %hook.name,
                duration_ms = t.elapsed().as_millis() as u64,
                "before hook completed"
            );
            if let HookAction::Block { ref reason } = action {
                warn!(hook = %hook.name, reason, "hook blocked event");
                return action;
            }
        }
        HookAction::Allow
    }

    /// Spawn all After hooks — results are logged, never propagated.
    pub fn emit_after(&self, ctx: HookContext) {
        let hooks = self.hooks.read().expect("hook registry poisoned");
        for hook in hooks
            .iter()
            .filter(|h| h.event == ctx.event && h.timing == HookTiming::After)
        {
            let ctx_clone = ctx.clone();
            let handler = Arc::clone(&hook.handler);
            let hook_name = hook.name.clone();
            tokio::spawn(async move {
                if let HookAction::Block { reason } = handler.handle(&ctx_clone) {
                    // After hooks cannot block — log the misconfiguration.
                    error!(
                        hook = %hook_name,
                        reason,
                        "after hook returned Block — ignored (use Before timing to block)"
                    );
                }
            });
        }
    }
}

impl Default for HookEngine {
    fn default() -> Self {
        Self::new()
    }
}
