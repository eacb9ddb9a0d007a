//! Task handlers of the documentation-healing pipeline.
//!
//! Each handler checks its arguments and logs what it would act on. Arguments
//! may be passed positionally or by keyword; a keyword wins over a position.

use std::sync::Arc;

use async_trait::async_trait;
use mender_core::{HandlerError, HandlerRegistry, RegistryError, TaskHandler};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub const PROCESS_GITHUB_WEBHOOK: &str = "process_github_webhook";
pub const PROCESS_GITLAB_WEBHOOK: &str = "process_gitlab_webhook";
pub const VALIDATE_CODE_SNIPPET: &str = "validate_code_snippet";
pub const VALIDATE_DOCUMENTATION_FILE: &str = "validate_documentation_file";
pub const HEAL_CODE_SNIPPET: &str = "heal_code_snippet";
pub const HEAL_DOCUMENTATION_FILE: &str = "heal_documentation_file";

/// Registry with every handler of the pipeline.
pub fn registry() -> Result<HandlerRegistry, RegistryError> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(WebhookHandler::github()))?;
    registry.register(Arc::new(WebhookHandler::gitlab()))?;
    registry.register(Arc::new(ValidateCodeSnippet))?;
    registry.register(Arc::new(ValidateDocumentationFile))?;
    registry.register(Arc::new(HealCodeSnippet))?;
    registry.register(Arc::new(HealDocumentationFile))?;
    Ok(registry)
}

struct Params<'a> {
    args: &'a [Value],
    kwargs: &'a Map<String, Value>,
}

impl<'a> Params<'a> {
    fn new(args: &'a [Value], kwargs: &'a Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    fn raw(&self, position: usize, name: &str) -> Option<&'a Value> {
        self.kwargs
            .get(name)
            .or_else(|| self.args.get(position))
            .filter(|v| !v.is_null())
    }

    fn required<T: DeserializeOwned>(&self, position: usize, name: &str) -> Result<T, HandlerError> {
        let raw = self
            .raw(position, name)
            .ok_or_else(|| HandlerError::invalid(format!("`{name}` is required")))?;
        serde_json::from_value(raw.clone())
            .map_err(|e| HandlerError::invalid(format!("`{name}`: {e}")))
    }

    fn text(&self, position: usize, name: &str) -> Result<String, HandlerError> {
        let value: String = self.required(position, name)?;
        if value.trim().is_empty() {
            return Err(HandlerError::invalid(format!("`{name}` must not be empty")));
        }
        Ok(value)
    }

    fn object(&self, position: usize, name: &str) -> Result<Map<String, Value>, HandlerError> {
        match self.raw(position, name) {
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(_) => Err(HandlerError::invalid(format!("`{name}` must be an object"))),
            None => Err(HandlerError::invalid(format!("`{name}` is required"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Forge {
    GitHub,
    GitLab,
}

/// Webhook deliveries from GitHub or GitLab.
struct WebhookHandler {
    forge: Forge,
}

impl WebhookHandler {
    fn github() -> Self {
        Self { forge: Forge::GitHub }
    }

    fn gitlab() -> Self {
        Self { forge: Forge::GitLab }
    }

    /// Payload field naming the event.
    fn event_field(&self) -> &'static str {
        match self.forge {
            Forge::GitHub => "event_type",
            Forge::GitLab => "object_kind",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PushSummary {
    #[serde(rename = "ref", default)]
    git_ref: Option<String>,
    #[serde(default)]
    commits: Vec<Value>,
}

#[async_trait]
impl TaskHandler for WebhookHandler {
    fn name(&self) -> &str {
        match self.forge {
            Forge::GitHub => PROCESS_GITHUB_WEBHOOK,
            Forge::GitLab => PROCESS_GITLAB_WEBHOOK,
        }
    }

    async fn handle(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), HandlerError> {
        let payload = Params::new(args, kwargs).object(0, "payload")?;
        let forge = format!("{:?}", self.forge);
        let field = self.event_field();

        let event = payload.get(field).and_then(Value::as_str);
        if event.is_none() {
            warn!(%forge, field, "webhook payload has no event type");
        }
        let push: PushSummary =
            serde_json::from_value(Value::Object(payload.clone())).unwrap_or_default();

        info!(
            %forge,
            event = event.unwrap_or("unknown"),
            git_ref = push.git_ref.as_deref().unwrap_or("-"),
            commits = push.commits.len(),
            "processed webhook"
        );
        Ok(())
    }
}

struct ValidateCodeSnippet;

#[async_trait]
impl TaskHandler for ValidateCodeSnippet {
    fn name(&self) -> &str {
        VALIDATE_CODE_SNIPPET
    }

    async fn handle(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), HandlerError> {
        let params = Params::new(args, kwargs);
        let file_path = params.text(0, "file_path")?;
        let snippet_id = params.text(1, "snippet_id")?;
        let code = params.text(2, "code")?;
        let language = params.text(3, "language")?;

        debug!(%language, code_len = code.len(), "validating snippet");
        info!(%file_path, %snippet_id, valid = true, "code snippet validated");
        Ok(())
    }
}

struct ValidateDocumentationFile;

#[async_trait]
impl TaskHandler for ValidateDocumentationFile {
    fn name(&self) -> &str {
        VALIDATE_DOCUMENTATION_FILE
    }

    async fn handle(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), HandlerError> {
        let params = Params::new(args, kwargs);
        let file_path = params.text(0, "file_path")?;
        let content = params.text(1, "content")?;

        let fences = content.lines().filter(|l| l.trim_start().starts_with("```")).count();
        info!(%file_path, snippets_found = fences / 2, "documentation file validated");
        Ok(())
    }
}

struct HealCodeSnippet;

#[async_trait]
impl TaskHandler for HealCodeSnippet {
    fn name(&self) -> &str {
        HEAL_CODE_SNIPPET
    }

    async fn handle(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), HandlerError> {
        let params = Params::new(args, kwargs);
        let file_path = params.text(0, "file_path")?;
        let snippet_id = params.text(1, "snippet_id")?;
        let code = params.text(2, "code")?;
        let language = params.text(3, "language")?;
        let errors: Vec<Value> = match params.raw(4, "errors") {
            Some(_) => params.required(4, "errors")?,
            None => Vec::new(),
        };

        if errors.is_empty() {
            warn!(%snippet_id, "no validation errors given to heal");
        }
        debug!(%language, code_len = code.len(), errors = errors.len(), "healing snippet");
        info!(%file_path, %snippet_id, healed = false, "code snippet healing finished");
        Ok(())
    }
}

struct HealDocumentationFile;

#[async_trait]
impl TaskHandler for HealDocumentationFile {
    fn name(&self) -> &str {
        HEAL_DOCUMENTATION_FILE
    }

    async fn handle(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), HandlerError> {
        let params = Params::new(args, kwargs);
        let file_path = params.text(0, "file_path")?;
        let results = params.object(1, "validation_results")?;
        if results.is_empty() {
            return Err(HandlerError::invalid("`validation_results` must not be empty"));
        }

        info!(%file_path, result_keys = results.len(), "documentation file healing finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    async fn call(name: &str, args: Vec<Value>, kwargs: Value) -> Result<(), HandlerError> {
        let registry = registry().unwrap();
        let handler = registry.get(name).unwrap();
        let kwargs = kwargs.as_object().cloned().unwrap_or_default();
        handler.handle(&args, &kwargs).await
    }

    #[test]
    fn registers_every_handler_once() {
        let registry = registry().unwrap();
        assert_eq!(
            registry.names(),
            vec![
                HEAL_CODE_SNIPPET,
                HEAL_DOCUMENTATION_FILE,
                PROCESS_GITHUB_WEBHOOK,
                PROCESS_GITLAB_WEBHOOK,
                VALIDATE_CODE_SNIPPET,
                VALIDATE_DOCUMENTATION_FILE,
            ]
        );
    }

    #[tokio::test]
    async fn accepts_positional_arguments() {
        let result = call(
            VALIDATE_CODE_SNIPPET,
            vec![json!("docs/a.md"), json!("s1"), json!("print(1)"), json!("python")],
            json!({}),
        )
        .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn accepts_keyword_arguments() {
        let result = call(
            HEAL_CODE_SNIPPET,
            vec![],
            json!({
                "file_path": "docs/a.md",
                "snippet_id": "s1",
                "code": "fn main() {",
                "language": "rust",
                "errors": ["unclosed delimiter"],
            }),
        )
        .await;
        assert_eq!(result, Ok(()));
    }

    #[rstest]
    #[case::missing(vec![json!("docs/a.md")], "`snippet_id` is required")]
    #[case::empty(vec![json!("docs/a.md"), json!(""), json!("x"), json!("go")], "`snippet_id` must not be empty")]
    #[case::wrong_type(vec![json!("docs/a.md"), json!(7), json!("x"), json!("go")], "`snippet_id`")]
    #[tokio::test]
    async fn rejects_bad_snippet_arguments(#[case] args: Vec<Value>, #[case] expected: &str) {
        let err = call(VALIDATE_CODE_SNIPPET, args, json!({})).await.unwrap_err();
        match err {
            HandlerError::InvalidArguments(message) => assert!(message.contains(expected), "{message}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn webhook_payload_must_be_an_object() {
        let err = call(PROCESS_GITHUB_WEBHOOK, vec![json!("push")], json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidArguments(_)));
    }

    #[rstest]
    #[case(PROCESS_GITHUB_WEBHOOK, json!({"event_type": "push", "ref": "refs/heads/main", "commits": [{}]}))]
    #[case(PROCESS_GITLAB_WEBHOOK, json!({"object_kind": "push"}))]
    #[case(PROCESS_GITLAB_WEBHOOK, json!({}))]
    #[tokio::test]
    async fn webhooks_accept_object_payloads(#[case] name: &str, #[case] payload: Value) {
        assert_eq!(call(name, vec![payload], json!({})).await, Ok(()));
    }

    #[tokio::test]
    async fn documentation_handlers_require_content() {
        assert!(call(VALIDATE_DOCUMENTATION_FILE, vec![json!("docs/a.md")], json!({})).await.is_err());
        assert_eq!(
            call(
                VALIDATE_DOCUMENTATION_FILE,
                vec![json!("docs/a.md"), json!("# Title\n```sh\nls\n```\n")],
                json!({}),
            )
            .await,
            Ok(())
        );
        assert!(
            call(HEAL_DOCUMENTATION_FILE, vec![json!("docs/a.md"), json!({})], json!({}))
                .await
                .is_err()
        );
        assert_eq!(
            call(
                HEAL_DOCUMENTATION_FILE,
                vec![],
                json!({"file_path": "docs/a.md", "validation_results": {"snippets_invalid": 1}}),
            )
            .await,
            Ok(())
        );
    }
}
