use super::{GenerationRequest, ReplyGenerator};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;

/// Answers from the persona's offline template without any network call.
pub struct TemplateGenerator;

#[async_trait]
impl ReplyGenerator for TemplateGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> PipelineResult<String> {
        if request.text.trim().is_empty() {
            return Err(PipelineError::Generation("nothing to reply to".to_string()));
        }
        Ok(request.persona.render_template(request.text))
    }

    fn name(&self) -> &str {
        "template"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Persona;

    #[tokio::test]
    async fn test_template_reply_mentions_user_text() {
        let persona = Persona {
            id: "einstein".to_string(),
            display_name: "Einstein".to_string(),
            system_prompt: String::new(),
            template: "Time is relative, even for \"{text}\"".to_string(),
            voice: None,
        };
        let request = GenerationRequest {
            text: "What is time?",
            persona: &persona,
            history: &[],
        };

        let reply = TemplateGenerator.generate(request).await.unwrap();
        assert_eq!(reply, "Time is relative, even for \"What is time?\"");

        let empty = GenerationRequest { text: "  ", ..request };
        assert!(TemplateGenerator.generate(empty).await.is_err());
    }
}
