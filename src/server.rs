//! HTTP ingress: routes, handlers, and outcome-to-response conversion.
//!
//! Two ingress dialects share one dispatcher: OpenAI-style
//! `POST /v1/chat/completions` and Bedrock-style `POST /model/{id}/invoke`
//! (+ `invoke-with-response-stream`). Streaming outcomes become chunked
//! response bodies; error outcomes render the standard error body.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::dispatcher::{DispatchOutcome, Dispatcher, IngressRequest, OutcomeBody};
use crate::error::Result;
use crate::types::ProviderKind;

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/model/{model_id}/invoke", post(bedrock_invoke))
        .route(
            "/model/{model_id}/invoke-with-response-stream",
            post(bedrock_invoke_stream),
        )
        .route("/healthz", get(healthz))
        .with_state(dispatcher)
}

async fn chat_completions(
    State(dispatcher): State<Arc<Dispatcher>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(
        dispatcher
            .dispatch(IngressRequest {
                provider: ProviderKind::OpenAi,
                headers,
                body,
                path_model: None,
                force_stream: false,
            })
            .await,
    )
}

async fn bedrock_invoke(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(model_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(
        dispatcher
            .dispatch(IngressRequest {
                provider: ProviderKind::Bedrock,
                headers,
                body,
                path_model: Some(model_id),
                force_stream: false,
            })
            .await,
    )
}

async fn bedrock_invoke_stream(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(model_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(
        dispatcher
            .dispatch(IngressRequest {
                provider: ProviderKind::Bedrock,
                headers,
                body,
                path_model: Some(model_id),
                force_stream: true,
            })
            .await,
    )
}

async fn healthz() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

fn respond(result: Result<DispatchOutcome>) -> Response {
    match result {
        Ok(outcome) => outcome_response(outcome),
        Err(err) => err.into_response(),
    }
}

fn outcome_response(outcome: DispatchOutcome) -> Response {
    let mut response = match outcome.body {
        OutcomeBody::Full(bytes) => Response::new(Body::from(bytes)),
        OutcomeBody::Stream(stream) => Response::new(Body::from_stream(stream)),
    };
    *response.status_mut() = outcome.status;
    *response.headers_mut() = outcome.headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{ConfigStore, MemoryConfigStore};
    use crate::types::test_support::{api_key, backend, model};
    use crate::upstream::{MockReply, MockUpstream};
    use serde_json::Value;

    async fn serve(upstream: MockUpstream) -> String {
        let config = Arc::new(
            ConfigStore::load(Arc::new(MemoryConfigStore::seeded(
                vec![model("gpt-4", vec![backend("b1")])],
                vec![api_key("sk-client")],
            )))
            .await
            .unwrap(),
        );
        let dispatcher = Arc::new(
            Dispatcher::builder(config)
                .upstream(Arc::new(upstream))
                .build(),
        );
        let app = router(dispatcher);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn chat_body(stream: bool) -> Value {
        json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": stream,
        })
    }

    #[tokio::test]
    async fn test_healthz() {
        let base = serve(MockUpstream::new()).await;
        let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_chat_completion_end_to_end() {
        let base = serve(
            MockUpstream::new().on("b1.test", MockReply::ok_json(r#"{"choices":[]}"#)),
        )
        .await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth("sk-client")
            .json(&chat_body(false))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"choices": []}));
    }

    #[tokio::test]
    async fn test_missing_key_yields_error_body() {
        let base = serve(MockUpstream::new()).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/v1/chat/completions"))
            .json(&chat_body(false))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "invalid_api_key");
        assert_eq!(body["error"]["type"], "authentication_error");
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_streaming_response_passes_through() {
        let base = serve(MockUpstream::new().on(
            "b1.test",
            MockReply::stream(&["data: {\"delta\":\"hi\"}\n\n", "data: [DONE]\n\n"]),
        ))
        .await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth("sk-client")
            .json(&chat_body(true))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let text = resp.text().await.unwrap();
        assert!(text.contains("data: {\"delta\":\"hi\"}"));
        assert!(text.contains("data: [DONE]"));
    }

    #[tokio::test]
    async fn test_unknown_model_maps_to_503() {
        let base = serve(MockUpstream::new()).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth("sk-client")
            .json(&json!({
                "model": "nope",
                "messages": [{"role": "user", "content": "hi"}],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 503);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "model_not_found");
    }
}
