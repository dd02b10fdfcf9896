//! Synchronous facade over the async engine.
//!
//! Hook transports that cannot await call through this bridge. The rules:
//! inside a multi-thread runtime worker, block in place and drive the
//! engine; on a current-thread runtime (where blocking would deadlock the
//! only executor thread), degrade to allow with a warning; with no ambient
//! runtime at all, run on a lazily created private runtime. A configured
//! timeout returns allow plus an error log on expiry: already-executed
//! actions are not rolled back.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{error, warn};

use gobby_types::{HookEvent, HookResponse};

use crate::engine::WorkflowEngine;

/// Wraps the async [`WorkflowEngine`] for synchronous hook callers.
pub struct WorkflowHookHandler {
    engine: Arc<WorkflowEngine>,
    /// None means wait forever.
    timeout: Option<Duration>,
    enabled: bool,
    private_runtime: OnceLock<Option<tokio::runtime::Runtime>>,
}

impl WorkflowHookHandler {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self {
            engine,
            timeout: None,
            enabled: true,
            private_runtime: OnceLock::new(),
        }
    }

    /// Cap how long a hook call may wait for the engine. Zero disables the
    /// timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Handle a hook event against the session's active step workflow.
    pub fn handle(&self, event: &HookEvent) -> HookResponse {
        if !self.enabled {
            return HookResponse::allow();
        }
        let engine = self.engine.clone();
        let event = event.clone();
        self.bridge(async move { engine.handle_event(&event).await })
    }

    /// Discover and evaluate all lifecycle workflows for the event.
    pub fn handle_all_lifecycles(&self, event: &HookEvent) -> HookResponse {
        if !self.enabled {
            return HookResponse::allow();
        }
        let engine = self.engine.clone();
        let event = event.clone();
        self.bridge(async move { engine.evaluate_all_lifecycle_workflows(&event, None).await })
    }

    /// Evaluate one named lifecycle workflow's triggers.
    pub fn handle_lifecycle(
        &self,
        workflow_name: &str,
        event: &HookEvent,
        context_data: Option<Map<String, Value>>,
    ) -> HookResponse {
        if !self.enabled {
            return HookResponse::allow();
        }
        let engine = self.engine.clone();
        let event = event.clone();
        let workflow_name = workflow_name.to_string();
        self.bridge(async move {
            engine
                .evaluate_lifecycle_triggers(&workflow_name, &event, context_data)
                .await
        })
    }

    fn bridge<F>(&self, future: F) -> HookResponse
    where
        F: std::future::Future<Output = HookResponse> + Send + 'static,
    {
        let timeout = self.timeout;
        let wrapped = async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, future).await {
                    Ok(response) => response,
                    Err(_) => {
                        error!("hook handling timed out, allowing");
                        HookResponse::allow()
                    }
                },
                None => future.await,
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                match handle.runtime_flavor() {
                    tokio::runtime::RuntimeFlavor::MultiThread => {
                        // Worker thread of a running runtime: hand the core
                        // back to the scheduler and block this thread only.
                        tokio::task::block_in_place(|| handle.block_on(wrapped))
                    }
                    _ => {
                        // Blocking the only executor thread would deadlock.
                        warn!(
                            "sync hook call on a current-thread runtime; returning allow"
                        );
                        HookResponse::allow()
                    }
                }
            }
            Err(_) => {
                let runtime = self.private_runtime.get_or_init(|| {
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .map_err(|e| error!(error = %e, "failed to build private runtime"))
                        .ok()
                });
                match runtime {
                    Some(runtime) => runtime.block_on(wrapped),
                    None => HookResponse::allow(),
                }
            }
        }
    }
}
