//! A stage that sends one prompt per item to the Messages API.
//!
//! The prompt is a template: `{id}` becomes the item id and `{payload}` the
//! item payload (strings verbatim, anything else as JSON). The reply text is
//! the stage output and, when an output directory is set, is also written to
//! `<output_dir>/<stage>/<item_id>.md`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest};
use crate::config::{LlmSettings, StageSettings};
use crate::items::is_path_safe;
use crate::retry::ErrorClass;
use crate::stage::{StageFailure, StageHandler, StageResult, WorkItem};

pub struct LlmStage<C> {
    name: String,
    prompt: String,
    model: String,
    max_tokens: u32,
    client: Arc<C>,
    output_dir: Option<PathBuf>,
}

impl<C: MessageSender> LlmStage<C> {
    pub fn new(stage: &StageSettings, llm: &LlmSettings, client: Arc<C>) -> Self {
        Self {
            name: stage.name.clone(),
            prompt: stage.prompt.clone(),
            model: llm.model.clone(),
            max_tokens: llm.max_tokens,
            client,
            output_dir: llm.output_dir.clone(),
        }
    }

    pub fn render_prompt(&self, item: &WorkItem) -> String {
        let payload = match &item.payload {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        self.prompt
            .replace("{id}", &item.id)
            .replace("{payload}", &payload)
    }

    async fn write_output(&self, item: &WorkItem, text: &str) -> Result<(), StageFailure> {
        let Some(root) = &self.output_dir else {
            return Ok(());
        };
        if !is_path_safe(&item.id) {
            return Err(
                StageFailure::new(format!("item id {:?} is not a valid file name", item.id))
                    .with_class(ErrorClass::Permanent),
            );
        }
        let dir = root.join(&self.name);
        let path = dir.join(format!("{}.md", item.id));
        let failed = |e: std::io::Error| {
            StageFailure::new(format!("cannot write stage output {}: {e}", path.display()))
        };
        tokio::fs::create_dir_all(&dir).await.map_err(failed)?;
        tokio::fs::write(&path, text).await.map_err(failed)?;
        debug!(stage = %self.name, item = %item.id, path = %path.display(), "stage output written");
        Ok(())
    }
}

#[async_trait]
impl<C: MessageSender> StageHandler for LlmStage<C> {
    async fn run(&self, item: &WorkItem) -> StageResult {
        let request =
            MessagesRequest::user(&self.model, self.max_tokens, self.render_prompt(item));
        let response = self
            .client
            .send_message(&request)
            .await
            .map_err(StageFailure::from)?;
        let text = response.text();
        if text.trim().is_empty() {
            return Err(StageFailure::from(AnthropicError::ApiError {
                status: 502,
                message: format!("empty response for {}", item.id),
            }));
        }
        self.write_output(item, &text).await?;
        Ok(Some(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::{AnthropicClient, ContentBlock, MessagesResponse, Usage};
    use crate::retry::classify;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder {
        prompts: Mutex<Vec<String>>,
        reply: String,
    }

    #[async_trait]
    impl MessageSender for Recorder {
        async fn send_message(
            &self,
            req: &MessagesRequest,
        ) -> Result<MessagesResponse, AnthropicError> {
            self.prompts
                .lock()
                .unwrap()
                .push(req.messages[0].content.clone());
            Ok(MessagesResponse {
                id: "msg".into(),
                content: vec![ContentBlock {
                    content_type: "text".into(),
                    text: self.reply.clone(),
                }],
                model: req.model.clone(),
                stop_reason: Some("end_turn".into()),
                usage: Usage {
                    input_tokens: 1,
                    output_tokens: 1,
                },
            })
        }
    }

    fn settings(output_dir: Option<PathBuf>) -> (StageSettings, LlmSettings) {
        (
            StageSettings {
                name: "extract".into(),
                prompt: "Paper {id}: {payload}".into(),
            },
            LlmSettings {
                output_dir,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn renders_prompt_and_returns_text() {
        let (stage, llm) = settings(None);
        let client = Arc::new(Recorder {
            reply: "three claims".into(),
            ..Default::default()
        });
        let handler = LlmStage::new(&stage, &llm, client.clone());

        let out = handler
            .run(&WorkItem::new("p1", json!("Attention is all you need")))
            .await
            .unwrap();

        assert_eq!(out, Some(Value::String("three claims".into())));
        assert_eq!(
            client.prompts.lock().unwrap()[0],
            "Paper p1: Attention is all you need"
        );
    }

    #[test]
    fn structured_payload_is_rendered_as_json() {
        let (stage, llm) = settings(None);
        let handler = LlmStage::new(&stage, &llm, Arc::new(Recorder::default()));
        let prompt = handler.render_prompt(&WorkItem::new("p2", json!({"year": 2017})));
        assert_eq!(prompt, r#"Paper p2: {"year":2017}"#);
    }

    #[tokio::test]
    async fn writes_output_file_per_stage_and_item() {
        let dir = tempfile::tempdir().unwrap();
        let (stage, llm) = settings(Some(dir.path().to_path_buf()));
        let client = Arc::new(Recorder {
            reply: "summary".into(),
            ..Default::default()
        });
        let handler = LlmStage::new(&stage, &llm, client);

        handler.run(&WorkItem::new("p3", Value::Null)).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("extract").join("p3.md")).unwrap();
        assert_eq!(written, "summary");
    }

    #[tokio::test]
    async fn ids_with_path_components_never_leave_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let (stage, llm) = settings(Some(out));
        let client = Arc::new(Recorder {
            reply: "summary".into(),
            ..Default::default()
        });
        let handler = LlmStage::new(&stage, &llm, client);

        let err = handler
            .run(&WorkItem::new("../../escaped", Value::Null))
            .await
            .unwrap_err();

        assert_eq!(classify(&err), ErrorClass::Permanent);
        assert!(!dir.path().join("escaped.md").exists());
        assert!(!dir.path().join("out").join("escaped.md").exists());
    }

    #[tokio::test]
    async fn empty_reply_is_a_transient_failure() {
        let (stage, llm) = settings(None);
        let handler = LlmStage::new(&stage, &llm, Arc::new(Recorder::default()));
        let err = handler.run(&WorkItem::new("p4", Value::Null)).await.unwrap_err();
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn rate_limit_from_api_carries_retry_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;
        let client =
            Arc::new(AnthropicClient::with_base_url("sk-test".into(), server.uri()).unwrap());
        let (stage, llm) = settings(None);
        let handler = LlmStage::new(&stage, &llm, client);

        let err = handler.run(&WorkItem::new("p5", Value::Null)).await.unwrap_err();

        assert_eq!(err.status, Some(429));
        assert_eq!(err.retry_after, Some(std::time::Duration::from_secs(2)));
        assert_eq!(classify(&err), ErrorClass::Transient);
    }
}
