use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::util::ServiceExt;

use super::types::{ErrorResponse, GenerateResponse, HealthResponse};
use super::routes::FINISH_REASON_HEADER;
use super::{create_router, AppState};
use crate::config::GenerationConfig;
use crate::model::LanguageModel;
use crate::test_support::{
    greedy_config, test_service, EchoModel, Fault, FaultyModel, ScriptedModel, EOS, HELLO, WORLD,
};

fn app(model: Box<dyn LanguageModel>, config: GenerationConfig) -> Router {
    let service = test_service(model, config);
    create_router(Arc::new(AppState { service }))
}

fn post_json(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/generate")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_generate_returns_full_decoded_sequence() {
    let app = app(Box::new(ScriptedModel::new(vec![WORLD, EOS])), greedy_config(16));

    let response = app
        .oneshot(post_json(r#"{"prompt": "hello"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[FINISH_REASON_HEADER], "stop");
    let body: GenerateResponse = body_json(response).await;
    assert_eq!(body.response, "<s> [INST] hello [/INST] world </s>");
}

#[tokio::test]
async fn test_missing_prompt_is_empty_prompt() {
    let app = app(Box::new(ScriptedModel::new(vec![WORLD, EOS])), greedy_config(16));

    let response = app.oneshot(post_json("{}")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: GenerateResponse = body_json(response).await;
    assert_eq!(body.response, "<s> [INST] [/INST] world </s>");
}

#[tokio::test]
async fn test_empty_and_null_prompt_are_served() {
    for body in [r#"{"prompt": ""}"#, r#"{"prompt": null}"#] {
        let app = app(Box::new(ScriptedModel::new(vec![EOS])), greedy_config(16));
        let response = app.oneshot(post_json(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_unknown_fields_are_ignored() {
    let app = app(Box::new(ScriptedModel::new(vec![EOS])), greedy_config(16));
    let response = app
        .oneshot(post_json(r#"{"prompt": "hello", "max_tokens": 5}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_json_is_client_error() {
    let app = app(Box::new(ScriptedModel::new(vec![EOS])), greedy_config(16));

    let response = app
        .oneshot(post_json(r#"{"prompt": "hello""#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = body_json(response).await;
    assert_eq!(body.error.r#type, "invalid_request_error");
    assert!(!body.error.message.is_empty());
}

#[tokio::test]
async fn test_wrong_prompt_type_is_unprocessable() {
    let app = app(Box::new(ScriptedModel::new(vec![EOS])), greedy_config(16));
    let response = app.oneshot(post_json(r#"{"prompt": 42}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_missing_content_type_is_rejected() {
    let app = app(Box::new(ScriptedModel::new(vec![EOS])), greedy_config(16));

    let request = Request::builder()
        .method("POST")
        .uri("/generate")
        .body(Body::from(r#"{"prompt": "hello"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let body: ErrorResponse = body_json(response).await;
    assert_eq!(body.error.r#type, "invalid_request_error");
}

#[tokio::test]
async fn test_token_budget_reported_as_length() {
    let app = app(Box::new(ScriptedModel::new(vec![HELLO; 32])), greedy_config(3));

    let response = app
        .oneshot(post_json(r#"{"prompt": "world"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[FINISH_REASON_HEADER], "length");
    let body: GenerateResponse = body_json(response).await;
    assert_eq!(body.response, "<s> [INST] world [/INST] hello hello hello");
}

#[tokio::test]
async fn test_requests_do_not_share_state() {
    let app = app(Box::new(EchoModel::new()), greedy_config(16));

    let first = app
        .clone()
        .oneshot(post_json(r#"{"prompt": "alpha"}"#))
        .await
        .unwrap();
    let second = app
        .oneshot(post_json(r#"{"prompt": "beta"}"#))
        .await
        .unwrap();

    let first: GenerateResponse = body_json(first).await;
    let second: GenerateResponse = body_json(second).await;
    assert_eq!(first.response, "<s> [INST] alpha [/INST] alpha </s>");
    assert_eq!(second.response, "<s> [INST] beta [/INST] beta </s>");
}

#[tokio::test]
async fn test_health() {
    let app = app(Box::new(ScriptedModel::new(vec![EOS])), greedy_config(4));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: HealthResponse = body_json(response).await;
    assert_eq!(body.status, "ok");
    assert_eq!(body.model, "test/base");
    assert_eq!(body.adapter, "test/adapter");
    assert_eq!(body.device, "CPU");
}

#[tokio::test]
async fn test_get_generate_not_allowed() {
    let app = app(Box::new(ScriptedModel::new(vec![EOS])), greedy_config(4));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/generate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_generation_failure_is_server_error_and_serving_continues() {
    let app = app(
        Box::new(FaultyModel::new([Fault::Panic, Fault::Error])),
        greedy_config(4),
    );

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json(r#"{"prompt": "hello"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.error.r#type, "server_error");
        assert!(!body.error.message.is_empty());
    }

    let response = app
        .oneshot(post_json(r#"{"prompt": "hello"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: GenerateResponse = body_json(response).await;
    assert_eq!(body.response, "<s> [INST] hello [/INST] </s>");
}
