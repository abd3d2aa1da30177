//! Fixed texts the bot speaks or sends upstream.
//!
//! Built-in defaults can be overridden field by field from a TOML file named
//! by `RELAY_PROMPTS_FILE`.

use serde::Deserialize;
use std::path::Path;

const SYSTEM_PROMPT: &str = "請扮演的PMP助教，以親切且專業的語氣，搭配有記憶點的emoji，回答 PMP 考試的答題邏輯解釋專案管理概念。\n\
• 在回答 PMP 相關問題時，請參考 PMBOK 指南（最新版），並以 PMP 考試的標準來解釋，確保符合 PMI 的最佳實踐。\n\
• 優先定義，再提供使用情境式解釋\n\
• 提供 PMP 答題思維，與練習題目\n\
請生成詳細的回應，確保內容足夠具體，並請確保你的回應完整，不要中斷。\n\n\
例如：\n\
如果我問：「在專案執行過程中發現需求變更，應該怎麼辦？」\n\
你可以回答：\n\
\x20 • 情境分析：當需求變更發生時，專案經理應該依循變更管理流程，而不是直接修改專案範疇。\n\
\x20 • PMBOK 指南：根據 PMBOK（第六版，第 4 章），變更請求應該透過整合變更控制流程進行評估。\n\
\x20 • 正確的做法：\n\
\x20   1. 提交變更請求（Change Request）。\n\
\x20   2. 透過變更控制委員會（CCB）審查變更的影響。\n\
\x20   3. 若批准，更新專案文件（如專案管理計畫與範疇說明書）。\n\
開始對話";

const SUPPLEMENT_BLOCK: &str = "PMP 答題思維\n\
- 是否應該遵循 PMBOK 的流程？是的，PDM 是 PMBOK 第 6 版第 6 章《專案時間管理》的一部分，特別是在活動排序過程中使用。\n\
- 這個選項是否與 PMP 最佳實踐相符？是的，使用 PDM 繪製活動之間的邏輯關係是符合 PMI 的最佳實踐。\n\
- 是否需要與利害關係人協商，或遵循變更管理流程？在繪製 PDM 的階段，通常不需要與利害關係人協商，但如果活動之間的依賴關係變更，可能需要啟動變更管理流程。\n\n\
【PMBOK 章節參考】：PMBOK 第 6 版，第 6 章《專案時間管理》。";

const SUPPLEMENT_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Prompts {
    pub system_prompt: String,
    /// Appended to the answer when the user's text contains `supplement_trigger`.
    pub supplement_block: String,
    pub supplement_trigger: String,
    /// Exact (trimmed) texts answered with `shortcut_reply` without generation.
    pub shortcut_queries: Vec<String>,
    pub shortcut_reply: String,
    pub busy_reply: String,
    /// Upstream answered with a non-success status.
    pub upstream_error_reply: String,
    /// Upstream could not be reached or its body could not be read.
    pub upstream_exception_reply: String,
    /// The generation task itself died.
    pub task_failure_reply: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            system_prompt: SYSTEM_PROMPT.to_string(),
            supplement_block: SUPPLEMENT_BLOCK.to_string(),
            supplement_trigger: "定義".to_string(),
            shortcut_queries: vec![
                "查詢原因".to_string(),
                "為什麼沒有回應".to_string(),
                "無回應原因".to_string(),
            ],
            shortcut_reply: "可能原因包括：系統繁忙、API 回應延遲或網絡問題。請稍後再試或聯繫我們。"
                .to_string(),
            busy_reply: "低成本維運中😅 目前系統繁忙，等等在試試吧！".to_string(),
            upstream_error_reply: "對不起，生成回應時發生錯誤。可能原因包括：系統繁忙、API 回應延遲或網絡問題，請稍後再試。"
                .to_string(),
            upstream_exception_reply: "對不起，生成回應時發生例外。可能原因包括：系統繁忙、API 回應延遲或網絡問題，請稍後再試。"
                .to_string(),
            task_failure_reply: "生成回應時發生錯誤，請稍後再試。".to_string(),
        }
    }
}

impl Prompts {
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read prompts {}: {e}", path.display()))?;
        let prompts = Self::from_toml(&contents)
            .map_err(|e| anyhow::anyhow!("parse prompts {}: {e}", path.display()))?;
        tracing::info!(path = %path.display(), "prompt overrides loaded");
        Ok(prompts)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let prompts: Prompts = toml::from_str(contents)?;
        prompts.validate()?;
        Ok(prompts)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.system_prompt.trim().is_empty() {
            return Err(anyhow::anyhow!("system_prompt must not be empty"));
        }
        for (name, value) in [
            ("shortcut_reply", &self.shortcut_reply),
            ("busy_reply", &self.busy_reply),
            ("upstream_error_reply", &self.upstream_error_reply),
            ("upstream_exception_reply", &self.upstream_exception_reply),
            ("task_failure_reply", &self.task_failure_reply),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow::anyhow!("{name} must not be empty"));
            }
        }
        Ok(())
    }

    pub fn is_shortcut(&self, text: &str) -> bool {
        let text = text.trim();
        self.shortcut_queries.iter().any(|q| q.trim() == text)
    }

    /// Appends the supplementary block when the user's text asks for it.
    pub fn augment(&self, user_text: &str, mut answer: String) -> String {
        let trigger = self.supplement_trigger.as_str();
        if !trigger.is_empty() && user_text.contains(trigger) && !self.supplement_block.is_empty()
        {
            answer.push_str(SUPPLEMENT_SEPARATOR);
            answer.push_str(&self.supplement_block);
        }
        answer
    }
}
