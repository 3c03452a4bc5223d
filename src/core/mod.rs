//! 核心执行层：错误类型、执行守卫、资源生命周期、会话监管

pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod session_supervisor;

pub use error::{LimitKind, OrchestrationError, Result};
pub use guard::{ExecutionContext, ExecutionGuard, GuardLimits, RecursionScope};
pub use lifecycle::{
    CancellationResource, FnResource, ManagedResource, ReleaseKind, ReleaseOutcome, ReleaseReport, Resource,
    ResourceLifecycleManager,
};
pub use session_supervisor::SessionSupervisor;
