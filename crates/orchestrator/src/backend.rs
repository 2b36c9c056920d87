use std::sync::Arc;

use async_trait::async_trait;

use gatehouse_core_types::GateError;

/// Prompt plus attached context sent to a model backend.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub prompt: String,
    pub context: Vec<String>,
}

/// Generated content with token-usage metadata.
#[derive(Clone, Debug)]
pub struct Generation {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Abstraction over LLM backends so multiple vendors can sit behind one
/// worker; the orchestrator is agnostic to which backend a worker uses.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, GateError>;
}

/// Deterministic backend used for tests and offline development.
#[derive(Clone, Copy, Debug, Default)]
pub struct MockModelBackend;

impl MockModelBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl ModelBackend for MockModelBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, GateError> {
        if request.prompt.is_empty() {
            return Err(GateError::new("empty prompt"));
        }
        let prompt_tokens =
            (request.prompt.split_whitespace().count()
                + request
                    .context
                    .iter()
                    .map(|ctx| ctx.split_whitespace().count())
                    .sum::<usize>()) as u32;
        let content = format!(
            "[mock] {} (context: {})",
            request.prompt,
            request.context.len()
        );
        let completion_tokens = content.split_whitespace().count() as u32;
        Ok(Generation {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_backend_reports_usage() {
        let backend = MockModelBackend::new();
        let generation = backend
            .generate(GenerationRequest {
                prompt: "draft the weekly report".into(),
                context: vec!["last week's numbers".into()],
            })
            .await
            .unwrap();
        assert!(generation.content.contains("weekly report"));
        assert_eq!(generation.prompt_tokens, 7);
        assert!(generation.completion_tokens > 0);
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let backend = MockModelBackend::new();
        assert!(backend
            .generate(GenerationRequest {
                prompt: String::new(),
                context: Vec::new(),
            })
            .await
            .is_err());
    }
}
