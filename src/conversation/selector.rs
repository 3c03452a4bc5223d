//! Agent 选择策略
//!
//! 每轮开始时由选择器决定本轮由谁回答。所有策略都是确定性的，只在活跃参与者中选择；
//! 同分时按优先级（高者优先）再按注册顺序。选择结果与当前 Agent 不同时，编排器立即交接。

use std::collections::HashSet;

use regex::Regex;

use crate::conversation::participant::ParticipantInfo;
use crate::core::{OrchestrationError, Result};

/// 选择器的输入
#[derive(Debug, Clone, Copy)]
pub struct SelectionInput<'a> {
    pub current: Option<&'a str>,
    /// 按注册顺序
    pub participants: &'a [ParticipantInfo],
    pub user_message: &'a str,
}

impl SelectionInput<'_> {
    fn is_active(&self, name: &str) -> bool {
        self.participants.iter().any(|p| p.active && p.name == name)
    }

    /// 活跃参与者中优先级最高者（同优先级取先注册者）
    fn highest_priority(&self) -> Option<&ParticipantInfo> {
        self.participants
            .iter()
            .enumerate()
            .filter(|(_, p)| p.active)
            .max_by_key(|(idx, p)| (p.priority, std::cmp::Reverse(*idx)))
            .map(|(_, p)| p)
    }
}

pub trait AgentSelector: Send + Sync {
    fn name(&self) -> &str;

    /// 返回本轮 Agent 名称；没有活跃参与者时返回 None
    fn select(&self, input: &SelectionInput<'_>) -> Option<String>;
}

/// 保持当前 Agent；当前 Agent 不可用时退回优先级最高的活跃参与者
#[derive(Debug, Default, Clone, Copy)]
pub struct StickySelector;

impl AgentSelector for StickySelector {
    fn name(&self) -> &str {
        "sticky"
    }

    fn select(&self, input: &SelectionInput<'_>) -> Option<String> {
        match input.current {
            Some(current) if input.is_active(current) => Some(current.to_string()),
            _ => input.highest_priority().map(|p| p.name.clone()),
        }
    }
}

/// 按注册顺序轮流：选当前 Agent 之后的下一个活跃参与者
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinSelector;

impl AgentSelector for RoundRobinSelector {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn select(&self, input: &SelectionInput<'_>) -> Option<String> {
        let n = input.participants.len();
        let start = input
            .current
            .and_then(|c| input.participants.iter().position(|p| p.name == c))
            .map(|i| i + 1)
            .unwrap_or(0);
        (0..n)
            .map(|offset| &input.participants[(start + offset) % n])
            .find(|p| p.active)
            .map(|p| p.name.clone())
    }
}

/// 按擅长领域关键词与用户消息的重合度选择；无命中时保持当前 Agent
#[derive(Debug, Clone)]
pub struct KeywordSelector {
    tokenizer: Regex,
}

impl KeywordSelector {
    pub fn new() -> Result<Self> {
        Self::with_pattern(r"[\p{L}\p{N}_]+")
    }

    /// 自定义分词正则（每个匹配为一个词）
    pub fn with_pattern(pattern: &str) -> Result<Self> {
        let tokenizer = Regex::new(pattern)
            .map_err(|e| OrchestrationError::Validation(format!("invalid token pattern: {e}")))?;
        Ok(Self { tokenizer })
    }

    fn tokens(&self, text: &str) -> HashSet<String> {
        self.tokenizer
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect()
    }

    fn score(&self, words: &HashSet<String>, participant: &ParticipantInfo) -> usize {
        participant
            .expertise
            .iter()
            .filter(|kw| {
                let kw_tokens = self.tokens(kw);
                !kw_tokens.is_empty() && kw_tokens.is_subset(words)
            })
            .count()
    }
}

impl AgentSelector for KeywordSelector {
    fn name(&self) -> &str {
        "keyword"
    }

    fn select(&self, input: &SelectionInput<'_>) -> Option<String> {
        let words = self.tokens(input.user_message);
        let best = input
            .participants
            .iter()
            .enumerate()
            .filter(|(_, p)| p.active)
            .map(|(idx, p)| (self.score(&words, p), p.priority, std::cmp::Reverse(idx), p))
            .filter(|(score, ..)| *score > 0)
            .max_by_key(|(score, priority, idx, _)| (*score, *priority, *idx));

        match best {
            Some((score, .., p)) => {
                tracing::debug!(agent = %p.name, score, "Keyword selector matched");
                Some(p.name.clone())
            }
            None => StickySelector.select(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, expertise: &[&str], priority: i32, active: bool) -> ParticipantInfo {
        ParticipantInfo {
            name: name.into(),
            description: String::new(),
            expertise: expertise.iter().map(|s| s.to_string()).collect(),
            active,
            priority,
            last_activity: None,
            message_count: 0,
        }
    }

    fn roster() -> Vec<ParticipantInfo> {
        vec![
            info("Sales", &["pricing", "discount", "buy"], 0, true),
            info("Support", &["error", "bug", "printer jam"], 0, true),
            info("Billing", &["invoice", "refund"], 5, false),
        ]
    }

    fn input<'a>(current: Option<&'a str>, roster: &'a [ParticipantInfo], msg: &'a str) -> SelectionInput<'a> {
        SelectionInput {
            current,
            participants: roster,
            user_message: msg,
        }
    }

    #[test]
    fn test_sticky_keeps_current_or_falls_back() {
        let r = roster();
        assert_eq!(StickySelector.select(&input(Some("Support"), &r, "hi")).as_deref(), Some("Support"));
        assert_eq!(StickySelector.select(&input(Some("Billing"), &r, "hi")).as_deref(), Some("Sales"));
        assert_eq!(StickySelector.select(&input(None, &r, "hi")).as_deref(), Some("Sales"));
        assert!(StickySelector.select(&input(None, &[], "hi")).is_none());
    }

    #[test]
    fn test_round_robin_skips_inactive() {
        let r = roster();
        assert_eq!(RoundRobinSelector.select(&input(Some("Sales"), &r, "")).as_deref(), Some("Support"));
        assert_eq!(RoundRobinSelector.select(&input(Some("Support"), &r, "")).as_deref(), Some("Sales"));
        assert_eq!(RoundRobinSelector.select(&input(None, &r, "")).as_deref(), Some("Sales"));
    }

    #[test]
    fn test_keyword_matches_expertise() {
        let r = roster();
        let selector = KeywordSelector::new().unwrap();
        assert_eq!(
            selector.select(&input(Some("Sales"), &r, "I have a Printer jam!")).as_deref(),
            Some("Support")
        );
        assert_eq!(
            selector.select(&input(Some("Support"), &r, "Any discount if I buy two?")).as_deref(),
            Some("Sales")
        );
        // 非活跃参与者即使命中也不会被选中
        assert_eq!(
            selector.select(&input(Some("Support"), &r, "where is my refund")).as_deref(),
            Some("Support")
        );
    }

    #[test]
    fn test_keyword_tie_breaks_by_priority_then_order() {
        let r = vec![
            info("A", &["help"], 0, true),
            info("B", &["help"], 1, true),
            info("C", &["help"], 1, true),
        ];
        let selector = KeywordSelector::new().unwrap();
        assert_eq!(selector.select(&input(Some("A"), &r, "help me")).as_deref(), Some("B"));
    }

    #[test]
    fn test_invalid_pattern_is_validation_error() {
        assert!(matches!(
            KeywordSelector::with_pattern("("),
            Err(OrchestrationError::Validation(_))
        ));
    }
}
