//! HTTP contract of `POST /mutate`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use kube::core::DynamicObject;
use serde_json::json;
use tower::ServiceExt;

use vault_webhook::bindings::BindingEvent;

use crate::fixtures::*;

// ============================================================================
// Transport checks
// ============================================================================

#[tokio::test]
async fn test_empty_body_is_bad_request() {
    let webhook = TestWebhook::new();

    let (status, _) = webhook.post(Some("application/json"), Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let metrics = webhook.metrics.encode();
    assert!(metrics.contains("vault_webhook_admission_requests_total{outcome=\"rejected\"} 1"));
}

#[tokio::test]
async fn test_wrong_content_type_is_unsupported() {
    let webhook = TestWebhook::new();
    let body = serde_json::to_vec(&create_review("ns1", pod("sa1"))).unwrap();

    for content_type in [Some("text/plain"), Some("application/json; charset=utf-8"), None] {
        let (status, _) = webhook.post(content_type, body.clone()).await;
        assert_eq!(
            status,
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "content type {content_type:?}"
        );
    }
}

#[tokio::test]
async fn test_empty_body_checked_before_content_type() {
    let webhook = TestWebhook::new();

    let (status, _) = webhook.post(Some("text/plain"), Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_healthz() {
    let webhook = TestWebhook::new();
    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();

    let response = webhook.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Review handling
// ============================================================================

#[tokio::test]
async fn test_undecodable_review_is_denied_with_message() {
    let webhook = TestWebhook::new();

    let (status, body) = webhook
        .post(Some("application/json"), b"{\"apiVersion\": 42}".to_vec())
        .await;
    assert_eq!(status, StatusCode::OK);

    let result = AdmissionResult::from_body(&body);
    assert!(!result.allowed());
    assert!(result.message().is_some());
    assert!(result.patch().is_none());
}

#[tokio::test]
async fn test_undecodable_pod_is_denied() {
    let webhook = TestWebhook::with_bindings(&[binding("ns1", "foo", "bar", "sa1")]);
    let object = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": "app"},
        "spec": {"containers": {"name": "not-a-list"}}
    });

    let result = webhook.review(create_review("ns1", object)).await;
    assert!(!result.allowed());
    assert_eq!(result.response()["uid"], REQUEST_UID);
    assert!(result.message().unwrap().contains("could not decode pod"));
}

#[tokio::test]
async fn test_non_create_operations_pass_through() {
    let webhook = TestWebhook::with_bindings(&[binding("ns1", "foo", "bar", "sa1")]);

    for operation in ["UPDATE", "DELETE", "CONNECT"] {
        let review = admission_review("admission.k8s.io/v1", operation, "ns1", pod("sa1"));
        let result = webhook.review(review).await;
        assert!(result.allowed(), "{operation}");
        assert!(result.patch().is_none(), "{operation}");
    }
}

#[tokio::test]
async fn test_no_matching_binding_is_allowed_without_patch() {
    let webhook = TestWebhook::with_bindings(&[
        binding("ns1", "foo", "bar", "other"),
        binding("ns2", "foo", "bar", "sa1"),
    ]);

    let result = webhook.review(create_review("ns1", pod("sa1"))).await;
    assert!(result.allowed());
    assert!(result.patch().is_none());
    assert_eq!(result.response()["uid"], REQUEST_UID);

    let metrics = webhook.metrics.encode();
    assert!(metrics.contains("vault_webhook_admission_requests_total{outcome=\"skipped\"} 1"));
}

#[tokio::test]
async fn test_pod_without_service_account_is_not_mutated() {
    let webhook = TestWebhook::with_bindings(&[binding("ns1", "foo", "bar", "sa1")]);
    let object = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": "app"},
        "spec": {"containers": [{"name": "app"}]}
    });

    let result = webhook.review(create_review("ns1", object)).await;
    assert!(result.allowed());
    assert!(result.patch().is_none());
}

#[tokio::test]
async fn test_response_echoes_api_version() {
    let webhook = TestWebhook::with_bindings(&[binding("ns1", "foo", "bar", "sa1")]);

    let review = admission_review("admission.k8s.io/v1beta1", "CREATE", "ns1", pod("sa1"));
    let result = webhook.review(review).await;

    assert_eq!(result.review["apiVersion"], "admission.k8s.io/v1beta1");
    assert_eq!(result.review["kind"], "AdmissionReview");
    assert!(result.allowed());
    assert!(result.patch().is_some());
}

#[tokio::test]
async fn test_corrupt_binding_fails_admission() {
    let webhook = TestWebhook::with_bindings(&[binding("ns1", "foo", "bar", "sa1")]);
    let broken: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "vaultwebhook.uswitch.com/v1",
        "kind": "DatabaseCredentialBinding",
        "metadata": {"name": "broken", "namespace": "ns1"},
        "spec": {"database": 42}
    }))
    .unwrap();
    webhook.cache.apply(BindingEvent::Added(broken));

    let result = webhook.review(create_review("ns1", pod("sa1"))).await;
    assert!(!result.allowed());
    assert!(result.message().unwrap().contains("ns1/broken"));

    let metrics = webhook.metrics.encode();
    assert!(metrics.contains("vault_webhook_admission_requests_total{outcome=\"failed\"} 1"));
}
