//! Local RPC dispatch.
//!
//! Looks the method up on the target entity, checks its declared authority
//! against the call's [`RpcType`](mesh_core::rpc::RpcType), runs it with
//! panics contained, and turns the outcome into an optional callback.
//!
//! Failure handling:
//! - authority violations are warned about and dropped, never answered
//! - missing methods, handler errors and panics are logged as errors; the
//!   caller only hears back when error reporting is enabled

use crate::entity::LocalEntity;
use futures::FutureExt;
use mesh_core::rpc::{EntityRpc, EntityRpcCallBack, RpcResult};
use mesh_core::RpcError;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDispatcher {
    report_errors: bool,
}

impl LocalDispatcher {
    /// # Arguments
    ///
    /// * `report_errors` - Answer failed awaited calls with an error callback
    pub fn new(report_errors: bool) -> Self {
        Self { report_errors }
    }

    /// Invokes `rpc` on `entity`.
    ///
    /// # Returns
    ///
    /// The callback to send back, or `None` for notify-only calls, rejected
    /// calls, and unreported failures.
    pub async fn dispatch(&self, entity: Arc<LocalEntity>, rpc: EntityRpc) -> Option<EntityRpcCallBack> {
        let method = match entity.methods().get(&rpc.method_name) {
            Some(method) => method.clone(),
            None => {
                let err = RpcError::MethodNotFound(rpc.method_name.clone());
                error!("❌ {} on {}", err, entity.mailbox);
                return self.failure(&rpc, err);
            }
        };

        if let Err(err) = method.authority.check(&rpc.method_name, rpc.rpc_type) {
            warn!("🔒 {} from {}, dropping", err, rpc.sender);
            return None;
        }

        debug!("📨 {} -> {}::{}", rpc.sender, entity.id(), rpc.method_name);
        let reply_template = rpc.reply(RpcResult::Ok(serde_json::Value::Null));
        let notify_only = rpc.notify_only;
        let method_name = rpc.method_name.clone();

        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| method.invoke(entity, rpc))) {
            Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        let result = match outcome {
            Ok(Ok(value)) => RpcResult::Ok(value),
            Ok(Err(err)) => {
                error!("❌ RPC '{}' failed: {}", method_name, err);
                if !self.report_errors {
                    return None;
                }
                RpcResult::Error(err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("💥 RPC '{}' panicked: {}", method_name, message);
                if !self.report_errors {
                    return None;
                }
                RpcResult::Error(format!("{method_name} panicked: {message}"))
            }
        };

        if notify_only {
            return None;
        }
        Some(EntityRpcCallBack {
            result,
            ..reply_template
        })
    }

    fn failure(&self, rpc: &EntityRpc, err: RpcError) -> Option<EntityRpcCallBack> {
        if self.report_errors && !rpc.notify_only {
            Some(rpc.reply(RpcResult::Error(err.to_string())))
        } else {
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
