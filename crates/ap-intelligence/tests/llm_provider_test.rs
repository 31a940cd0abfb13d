//! Tests for the language-model collaborator types and the scripted mock.

use ap_core::config::LlmConfigSection;
use ap_intelligence::llm::{
    LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse, LlmRole, MockProvider,
};

// ===========================================================================
// Message types
// ===========================================================================

#[test]
fn test_message_constructors() {
    assert_eq!(LlmMessage::system("s").role, LlmRole::System);
    assert_eq!(LlmMessage::user("u").role, LlmRole::User);
    let msg = LlmMessage::assistant("Rust is a systems programming language.");
    assert_eq!(msg.role, LlmRole::Assistant);
    assert_eq!(msg.content, "Rust is a systems programming language.");
}

#[test]
fn test_role_display_and_serde() {
    assert_eq!(LlmRole::System.to_string(), "system");
    assert_eq!(LlmRole::Assistant.to_string(), "assistant");
    assert_eq!(serde_json::to_string(&LlmRole::User).unwrap(), "\"user\"");
}

// ===========================================================================
// LlmConfig
// ===========================================================================

#[test]
fn test_config_from_section() {
    let section = LlmConfigSection {
        model: "gpt-4o-mini".into(),
        max_tokens: 512,
        temperature: 0.1,
        ..LlmConfigSection::default()
    };
    let cfg = LlmConfig::from(&section);
    assert_eq!(cfg.model, "gpt-4o-mini");
    assert_eq!(cfg.max_tokens, 512);
    assert!(cfg.system_prompt.is_none());

    let cfg = cfg.with_system_prompt("you are a planner");
    assert_eq!(cfg.system_prompt.as_deref(), Some("you are a planner"));
}

#[test]
fn test_error_display() {
    let err = LlmError::Api {
        status: 500,
        message: "boom".into(),
    };
    assert_eq!(err.to_string(), "API error (status 500): boom");
    assert_eq!(LlmError::Timeout.to_string(), "request timed out");
}

// ===========================================================================
// MockProvider
// ===========================================================================

#[tokio::test]
async fn test_mock_default_fallback() {
    let mock = MockProvider::new();
    let resp = mock
        .complete(&[LlmMessage::user("hello")], &LlmConfig::default())
        .await
        .unwrap();
    assert_eq!(resp.content, "Mock response");
}

#[tokio::test]
async fn test_mock_captures_system_prompt() {
    let mock = MockProvider::new().with_response(LlmResponse {
        content: "done".into(),
        model: "m".into(),
        input_tokens: 3,
        output_tokens: 1,
        finish_reason: "stop".into(),
    });
    let cfg = LlmConfig::default().with_system_prompt("persona");
    let resp = mock.complete(&[LlmMessage::user("go")], &cfg).await.unwrap();
    assert_eq!(resp.input_tokens, 3);

    let captured = mock.captured_requests();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].1.system_prompt.as_deref(), Some("persona"));
}

#[tokio::test]
async fn test_mock_usable_as_trait_object() {
    let provider: std::sync::Arc<dyn LlmProvider> =
        std::sync::Arc::new(MockProvider::new().with_error(LlmError::RateLimited {
            retry_after_secs: Some(5),
        }));
    let err = provider
        .complete(&[LlmMessage::user("x")], &LlmConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LlmError::RateLimited {
            retry_after_secs: Some(5)
        }
    ));
}
