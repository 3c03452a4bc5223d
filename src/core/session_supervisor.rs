//! 会话监管：取消令牌
//!
//! 持有会话级 CancellationToken；每一轮对话从它派生子 token，取消当前轮不影响后续轮次。
//! 作为 Resource 登记到生命周期管理器，释放时取消整个会话。

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::lifecycle::Resource;

/// 会话级取消句柄
#[derive(Debug)]
pub struct SessionSupervisor {
    /// 会话关闭时触发
    cancel_token: CancellationToken,
    /// 当前轮次的子 token
    turn_token: Mutex<Option<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            turn_token: Mutex::new(None),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 取消整个会话
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 开始新一轮：派生子 token 并记为当前轮
    pub fn begin_turn(&self) -> CancellationToken {
        let token = self.cancel_token.child_token();
        *self.turn_token.lock() = Some(token.clone());
        token
    }

    /// 取消当前轮（用户 Stop generating），返回是否有正在进行的轮次
    pub fn cancel_turn(&self) -> bool {
        match self.turn_token.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 本轮结束
    pub fn end_turn(&self) {
        self.turn_token.lock().take();
    }

    /// 创建子 token（用于单个任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resource for SessionSupervisor {
    async fn release(&self) -> anyhow::Result<()> {
        self.cancel();
        Ok(())
    }

    fn name(&self) -> &str {
        "session-supervisor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_turn_does_not_cancel_session() {
        let supervisor = SessionSupervisor::new();
        let turn = supervisor.begin_turn();
        assert!(supervisor.cancel_turn());
        assert!(turn.is_cancelled());
        assert!(!supervisor.is_cancelled());
        assert!(!supervisor.cancel_turn());

        let next = supervisor.begin_turn();
        assert!(!next.is_cancelled());
    }

    #[tokio::test]
    async fn test_release_cancels_session_and_turns() {
        let supervisor = SessionSupervisor::new();
        let turn = supervisor.begin_turn();
        supervisor.release().await.unwrap();
        assert!(supervisor.is_cancelled());
        assert!(turn.is_cancelled());
    }
}
