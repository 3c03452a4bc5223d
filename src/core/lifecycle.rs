//! 资源生命周期管理（组合释放器）
//!
//! 按获取顺序登记资源（连接、取消句柄、嵌套的管理器），关闭时逆序逐个释放：
//! - 单个资源失败或 panic 只记录，不影响其余资源
//! - 重复释放为空操作
//! - 同步释放路径对需要等待的资源施加有界超时

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;

use crate::core::error::{OrchestrationError, Result};

/// 可释放资源：统一的异步释放能力
#[async_trait]
pub trait Resource: Send + Sync {
    /// 释放资源，返回是否成功
    async fn release(&self) -> anyhow::Result<()>;

    /// 资源名称（用于日志）
    fn name(&self) -> &str;
}

/// 释放方式标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    /// 释放不需要等待（首次 poll 即完成）
    Immediate,
    /// 释放可能需要等待 I/O，受超时约束
    Deferred,
}

/// 管理器内部的一条资源记录
pub struct ManagedResource {
    pub kind: ReleaseKind,
    pub resource: Arc<dyn Resource>,
}

/// 单个资源的释放结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    Failed(String),
    TimedOut,
    /// 同步路径处于单线程运行时，释放交给运行时在后台完成
    HandedOff,
}

/// 一次 release_all 的汇总（按实际释放顺序）
#[derive(Debug, Clone, Default)]
pub struct ReleaseReport {
    pub outcomes: Vec<(String, ReleaseOutcome)>,
}

impl ReleaseReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// 释放顺序（资源名）
    pub fn order(&self) -> Vec<String> {
        self.outcomes.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                ReleaseOutcome::Failed(e) => Some((name.clone(), e.clone())),
                ReleaseOutcome::TimedOut => Some((name.clone(), "timed out".to_string())),
                _ => None,
            })
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failures().is_empty()
    }
}

struct Inner {
    resources: Vec<ManagedResource>,
    closed: bool,
}

/// 组合释放器：自身也是 Resource，可嵌套
pub struct ResourceLifecycleManager {
    name: String,
    inner: Mutex<Inner>,
    /// Deferred 资源的等待上限
    release_timeout: Duration,
}

impl ResourceLifecycleManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_timeout(name, Duration::from_secs(5))
    }

    pub fn with_timeout(name: impl Into<String>, release_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                resources: Vec::new(),
                closed: false,
            }),
            release_timeout,
        }
    }

    /// 登记需要等待释放的资源
    pub fn add(&self, resource: Arc<dyn Resource>) -> Result<()> {
        self.push(ReleaseKind::Deferred, resource)
    }

    /// 登记可立即释放的资源
    pub fn add_immediate(&self, resource: Arc<dyn Resource>) -> Result<()> {
        self.push(ReleaseKind::Immediate, resource)
    }

    fn push(&self, kind: ReleaseKind, resource: Arc<dyn Resource>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(OrchestrationError::AlreadyClosed);
        }
        tracing::debug!(manager = %self.name, resource = %resource.name(), ?kind, "Resource acquired");
        inner.resources.push(ManagedResource { kind, resource });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    // 锁内只做标记与取出，释放在锁外进行
    fn drain(&self) -> Option<Vec<ManagedResource>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.closed = true;
        Some(std::mem::take(&mut inner.resources))
    }

    /// 逆序释放全部资源
    pub async fn release_all(&self) -> ReleaseReport {
        let Some(resources) = self.drain() else {
            return ReleaseReport::default();
        };
        tracing::info!(manager = %self.name, "Releasing {} resources...", resources.len());

        let mut report = ReleaseReport::default();
        for managed in resources.into_iter().rev() {
            let wait = match managed.kind {
                ReleaseKind::Immediate => None,
                ReleaseKind::Deferred => Some(self.release_timeout),
            };
            let outcome = release_guarded(managed.resource.as_ref(), wait).await;
            self.log_outcome(managed.resource.name(), &outcome);
            report
                .outcomes
                .push((managed.resource.name().to_string(), outcome));
        }
        report
    }

    /// 同步释放：Immediate 资源只 poll 一次，Deferred 资源有界等待
    pub fn release_all_blocking(&self) -> ReleaseReport {
        let Some(resources) = self.drain() else {
            return ReleaseReport::default();
        };
        tracing::info!(manager = %self.name, "Releasing {} resources (blocking)...", resources.len());

        let mut report = ReleaseReport::default();
        for managed in resources.into_iter().rev() {
            let outcome = match managed.kind {
                ReleaseKind::Immediate => {
                    let fut = AssertUnwindSafe(managed.resource.release()).catch_unwind();
                    match fut.now_or_never() {
                        Some(result) => outcome_of(result),
                        None => {
                            tracing::warn!(
                                resource = %managed.resource.name(),
                                "Immediate resource did not release synchronously"
                            );
                            ReleaseOutcome::TimedOut
                        }
                    }
                }
                ReleaseKind::Deferred => {
                    block_on_release(Arc::clone(&managed.resource), self.release_timeout)
                }
            };
            self.log_outcome(managed.resource.name(), &outcome);
            report
                .outcomes
                .push((managed.resource.name().to_string(), outcome));
        }
        report
    }

    fn log_outcome(&self, resource: &str, outcome: &ReleaseOutcome) {
        match outcome {
            ReleaseOutcome::Released => {
                tracing::debug!(manager = %self.name, resource, "Resource released");
            }
            ReleaseOutcome::Failed(e) => {
                tracing::warn!(manager = %self.name, resource, "Resource release failed: {}", e);
            }
            ReleaseOutcome::TimedOut => {
                tracing::warn!(
                    manager = %self.name,
                    resource,
                    "Resource release timed out after {}ms",
                    self.release_timeout.as_millis()
                );
            }
            ReleaseOutcome::HandedOff => {
                tracing::debug!(manager = %self.name, resource, "Resource release handed to runtime");
            }
        }
    }
}

impl Drop for ResourceLifecycleManager {
    fn drop(&mut self) {
        let pending = {
            let inner = self.inner.get_mut();
            !inner.closed && !inner.resources.is_empty()
        };
        if pending {
            self.release_all_blocking();
        }
    }
}

#[async_trait]
impl Resource for ResourceLifecycleManager {
    async fn release(&self) -> anyhow::Result<()> {
        let report = self.release_all().await;
        let failures = report.failures();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} nested resources failed to release",
                failures.len()
            ))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn release_guarded(resource: &dyn Resource, wait: Option<Duration>) -> ReleaseOutcome {
    let fut = AssertUnwindSafe(resource.release()).catch_unwind();
    let result = match wait {
        Some(wait) => match tokio::time::timeout(wait, fut).await {
            Ok(result) => result,
            Err(_) => return ReleaseOutcome::TimedOut,
        },
        None => fut.await,
    };
    outcome_of(result)
}

fn outcome_of(result: std::thread::Result<anyhow::Result<()>>) -> ReleaseOutcome {
    match result {
        Ok(Ok(())) => ReleaseOutcome::Released,
        Ok(Err(e)) => ReleaseOutcome::Failed(e.to_string()),
        Err(_) => ReleaseOutcome::Failed("release panicked".to_string()),
    }
}

fn block_on_release(resource: Arc<dyn Resource>, wait: Duration) -> ReleaseOutcome {
    match Handle::try_current() {
        Ok(handle) => match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| {
                handle.block_on(release_guarded(resource.as_ref(), Some(wait)))
            }),
            // 单线程运行时不能阻塞，交给运行时后台完成
            _ => {
                handle.spawn(async move {
                    let outcome = release_guarded(resource.as_ref(), Some(wait)).await;
                    if outcome != ReleaseOutcome::Released {
                        tracing::warn!(resource = %resource.name(), ?outcome, "Background release did not succeed");
                    }
                });
                ReleaseOutcome::HandedOff
            }
        },
        Err(_) => match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt.block_on(release_guarded(resource.as_ref(), Some(wait))),
            Err(e) => ReleaseOutcome::Failed(format!("no runtime for release: {e}")),
        },
    }
}

/// 闭包形式的资源（同步清理动作）
pub struct FnResource<F>
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    name: String,
    release_fn: F,
}

impl<F> FnResource<F>
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, release_fn: F) -> Self {
        Self {
            name: name.into(),
            release_fn,
        }
    }
}

#[async_trait]
impl<F> Resource for FnResource<F>
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    async fn release(&self) -> anyhow::Result<()> {
        (self.release_fn)()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 取消句柄资源：释放即触发 CancellationToken
pub struct CancellationResource {
    name: String,
    token: CancellationToken,
}

impl CancellationResource {
    pub fn new(name: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            name: name.into(),
            token,
        }
    }
}

#[async_trait]
impl Resource for CancellationResource {
    async fn release(&self) -> anyhow::Result<()> {
        self.token.cancel();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(name: &str, log: &Log) -> Arc<dyn Resource> {
        let log = Arc::clone(log);
        let label = name.to_string();
        Arc::new(FnResource::new(name, move || {
            log.lock().push(label.clone());
            Ok(())
        }))
    }

    fn failing(name: &str) -> Arc<dyn Resource> {
        Arc::new(FnResource::new(name, || Err(anyhow::anyhow!("boom"))))
    }

    struct SlowResource {
        delay: Duration,
    }

    #[async_trait]
    impl Resource for SlowResource {
        async fn release(&self) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    struct PanickingResource;

    #[async_trait]
    impl Resource for PanickingResource {
        async fn release(&self) -> anyhow::Result<()> {
            panic!("release exploded");
        }

        fn name(&self) -> &str {
            "panicky"
        }
    }

    #[tokio::test]
    async fn test_releases_in_reverse_order() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let manager = ResourceLifecycleManager::new("test");
        manager.add(recording("a", &log)).unwrap();
        manager.add_immediate(recording("b", &log)).unwrap();
        manager.add(recording("c", &log)).unwrap();

        let report = manager.release_all().await;
        assert_eq!(*log.lock(), vec!["c", "b", "a"]);
        assert_eq!(report.order(), vec!["c", "b", "a"]);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_failure_in_middle_does_not_block_others() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let manager = ResourceLifecycleManager::new("test");
        manager.add(recording("first", &log)).unwrap();
        manager.add(failing("broken")).unwrap();
        manager.add(Arc::new(PanickingResource)).unwrap();
        manager.add(recording("last", &log)).unwrap();

        let report = manager.release_all().await;
        assert_eq!(*log.lock(), vec!["last", "first"]);
        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].0, "panicky");
        assert_eq!(failures[1], ("broken".to_string(), "boom".to_string()));
    }

    #[tokio::test]
    async fn test_second_release_is_noop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let manager = ResourceLifecycleManager::new("test");
        manager
            .add(Arc::new(FnResource::new("counted", move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .unwrap();

        assert_eq!(manager.release_all().await.outcomes.len(), 1);
        assert!(manager.release_all().await.is_empty());
        assert!(manager.release_all_blocking().is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_after_release_fails() {
        let manager = ResourceLifecycleManager::new("test");
        manager.release_all().await;
        assert!(manager.is_closed());
        let err = manager.add(failing("late")).unwrap_err();
        assert!(matches!(err, OrchestrationError::AlreadyClosed));
    }

    #[tokio::test]
    async fn test_deferred_release_is_bounded() {
        let manager = ResourceLifecycleManager::with_timeout("test", Duration::from_millis(20));
        manager
            .add(Arc::new(SlowResource {
                delay: Duration::from_secs(10),
            }))
            .unwrap();
        let report = manager.release_all().await;
        assert_eq!(report.outcomes[0].1, ReleaseOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_nested_manager_releases_children() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let child = Arc::new(ResourceLifecycleManager::new("child"));
        child.add(recording("child-a", &log)).unwrap();
        child.add(recording("child-b", &log)).unwrap();

        let parent = ResourceLifecycleManager::new("parent");
        parent.add(recording("parent-a", &log)).unwrap();
        parent.add(child.clone()).unwrap();

        parent.release_all().await;
        assert_eq!(*log.lock(), vec!["child-b", "child-a", "parent-a"]);
        assert!(child.is_closed());
    }

    #[test]
    fn test_blocking_release_without_runtime() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let manager = ResourceLifecycleManager::with_timeout("test", Duration::from_millis(50));
        manager.add(recording("deferred", &log)).unwrap();
        manager.add_immediate(recording("immediate", &log)).unwrap();
        manager
            .add(Arc::new(SlowResource {
                delay: Duration::from_secs(10),
            }))
            .unwrap();

        let report = manager.release_all_blocking();
        assert_eq!(report.order(), vec!["slow", "immediate", "deferred"]);
        assert_eq!(report.outcomes[0].1, ReleaseOutcome::TimedOut);
        assert_eq!(*log.lock(), vec!["immediate", "deferred"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_release_inside_multi_thread_runtime() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let manager = ResourceLifecycleManager::new("test");
        manager.add(recording("a", &log)).unwrap();
        manager.add(recording("b", &log)).unwrap();

        let report = manager.release_all_blocking();
        assert!(report.is_clean());
        assert_eq!(*log.lock(), vec!["b", "a"]);
    }

    #[test]
    fn test_drop_releases_pending_resources() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        {
            let manager = ResourceLifecycleManager::new("scoped");
            manager.add_immediate(recording("x", &log)).unwrap();
            manager.add(recording("y", &log)).unwrap();
        }
        assert_eq!(*log.lock(), vec!["y", "x"]);
    }

    #[tokio::test]
    async fn test_cancellation_resource_cancels_token() {
        let token = CancellationToken::new();
        let manager = ResourceLifecycleManager::new("cancel");
        manager
            .add_immediate(Arc::new(CancellationResource::new("turns", token.clone())))
            .unwrap();
        assert!(manager.release_all().await.is_clean());
        assert!(token.is_cancelled());
    }
}
