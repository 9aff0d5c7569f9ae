//! Web-search grounded generation.

use super::{ChunkStream, WebSearchGrounding};
use crate::error::ApiError;
use crate::provider::{ChatMessage, CompletionOptions, ModelProviderClient};
use crate::types::GameContext;
use async_trait::async_trait;
use std::sync::Arc;

pub struct ProviderGrounding {
    client: Arc<dyn ModelProviderClient>,
}

impl ProviderGrounding {
    pub fn new(client: Arc<dyn ModelProviderClient>) -> Self {
        Self { client }
    }
}

fn is_cjk(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

fn grounding_prompt(query: &str, rewritten_query: &str, context: Option<&GameContext>) -> String {
    let chinese = is_cjk(query);
    let mut prompt = if chinese {
        format!("请帮我搜索并回答关于游戏的问题。\n\n用户问题：{}", query)
    } else {
        format!("Please search and answer this gaming question.\n\nUser question: {}", query)
    };
    if !rewritten_query.trim().is_empty() && rewritten_query != query {
        prompt.push_str(if chinese { "\n优化后的搜索查询：" } else { "\nOptimized search query: " });
        prompt.push_str(rewritten_query);
    }
    if let Some(ctx) = context {
        prompt.push_str(if chinese { "\n游戏背景：" } else { "\nGame context: " });
        prompt.push_str(ctx.as_str());
    }
    prompt.push_str(if chinese {
        "\n\n请基于最新的网络资料给出准确、简洁的回答，并注明信息来源。"
    } else {
        "\n\nAnswer accurately and concisely from current web sources, and name your sources."
    });
    prompt
}

#[async_trait]
impl WebSearchGrounding for ProviderGrounding {
    async fn search_and_generate_stream(
        &self,
        query: &str,
        rewritten_query: &str,
        context: Option<&GameContext>,
    ) -> Result<ChunkStream, ApiError> {
        let messages = vec![ChatMessage::user(grounding_prompt(query, rewritten_query, context))];
        self.client.stream(messages, CompletionOptions::default()).await
    }
}
