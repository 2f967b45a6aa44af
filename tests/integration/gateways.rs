use flowcast::config::{EndpointConfig, WhatsAppConfig};
use flowcast::flow::IntegrationKind;
use flowcast::gateway::{ContentGenerator, IntegrationGateway, MessagingGateway};
use flowcast::integrations::{HttpContentGenerator, HttpCrmGateway};
use flowcast::channels::whatsapp::WhatsAppSidecar;
use flowcast::types::{Contact, SendPayload};
use serde_json::{json, Map};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sidecar(server: &MockServer) -> WhatsAppSidecar {
    WhatsAppSidecar::new(&WhatsAppConfig {
        sidecar_url: server.uri(),
        timeout_seconds: 5,
        ..WhatsAppConfig::default()
    })
    .unwrap()
}

fn endpoint(url: String, token: Option<&str>) -> EndpointConfig {
    EndpointConfig {
        url,
        api_token: token.map(str::to_string),
        timeout_seconds: 5,
    }
}

#[tokio::test]
async fn test_sidecar_send_posts_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/accounts/alpha/messages"))
        .and(body_partial_json(json!({
            "to": "5511900000001@c.us",
            "phone": "5511900000001",
            "message": {"type": "text", "text": "hi"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "wamid-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let sent = sidecar(&server)
        .send_message(
            "alpha",
            "5511900000001",
            &SendPayload::Text { text: "hi".to_string() },
            Some("5511900000001@c.us"),
        )
        .await
        .unwrap();
    assert_eq!(sent.id, "wamid-1");
}

#[tokio::test]
async fn test_sidecar_send_accepts_message_id_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/accounts/alpha/messages"))
        .and(body_partial_json(json!({"to": "5511900000001"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m-7"})))
        .mount(&server)
        .await;

    let payload = SendPayload::Image {
        url: "http://img/1.png".to_string(),
        caption: None,
    };
    let sent = sidecar(&server)
        .send_message("alpha", "5511900000001", &payload, None)
        .await
        .unwrap();
    assert_eq!(sent.id, "m-7");
}

#[tokio::test]
async fn test_sidecar_error_status_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/accounts/alpha/messages"))
        .respond_with(ResponseTemplate::new(503).set_body_string("session not ready"))
        .mount(&server)
        .await;

    let err = sidecar(&server)
        .send_message("alpha", "5511", &SendPayload::Text { text: "x".to_string() }, None)
        .await
        .unwrap_err();
    let text = err.to_string();
    assert!(text.contains("503"), "{text}");
    assert!(text.contains("session not ready"), "{text}");
}

#[tokio::test]
async fn test_sidecar_contact_check() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/accounts/alpha/contacts/check"))
        .and(body_partial_json(json!({"phone": "5511900000001"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"exists": true, "jid": "5511900000001@c.us"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/accounts/alpha/contacts/check"))
        .and(body_partial_json(json!({"phone": "5511900000002"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"exists": false})))
        .mount(&server)
        .await;

    let gateway = sidecar(&server);
    let found = gateway.check_contact_exists("alpha", "5511900000001").await.unwrap();
    assert!(found.exists);
    assert_eq!(found.chat_id.as_deref(), Some("5511900000001@c.us"));

    let missing = gateway.check_contact_exists("alpha", "5511900000002").await.unwrap();
    assert!(!missing.exists);
    assert!(missing.chat_id.is_none());
}

#[tokio::test]
async fn test_crm_action_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/actions"))
        .and(header("authorization", "Bearer crm-secret"))
        .and(body_partial_json(json!({
            "tenant_id": "tenant-1",
            "phone": "5511900000001",
            "action": "add_tag",
            "payload": {"tag": "lead"}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let crm = HttpCrmGateway::new(IntegrationKind::CrmA, &endpoint(server.uri(), Some("crm-secret"))).unwrap();
    let accepted = crm
        .execute("tenant-1", "5511900000001", "add_tag", &json!({"tag": "lead"}))
        .await
        .unwrap();
    assert!(accepted);
}

#[tokio::test]
async fn test_crm_refusal_and_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/actions"))
        .and(body_partial_json(json!({"action": "refuse"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": false})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/actions"))
        .and(body_partial_json(json!({"action": "boom"})))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let crm = HttpCrmGateway::new(IntegrationKind::CrmB, &endpoint(format!("{}/", server.uri()), None)).unwrap();
    assert!(!crm.execute("t", "5511", "refuse", &json!({})).await.unwrap());
    let err = crm.execute("t", "5511", "boom", &json!({})).await.unwrap_err();
    assert!(err.to_string().contains("crm_b"));
}

#[tokio::test]
async fn test_content_generator_posts_contact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_partial_json(json!({
            "tenant_id": "tenant-1",
            "prompt": {"prompt": "greet"},
            "contact": {"id": "c1", "name": "Ana"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "message": "Hello Ana"})))
        .mount(&server)
        .await;

    let generator = HttpContentGenerator::new(&endpoint(format!("{}/generate", server.uri()), None)).unwrap();
    let contact = Contact {
        id: "c1".to_string(),
        tenant_id: "tenant-1".to_string(),
        phone: "5511900000001".to_string(),
        name: Some("Ana".to_string()),
        email: None,
        categories: vec![],
        fields: Map::new(),
    };
    let generated = generator
        .generate(&json!({"prompt": "greet"}), &contact, "tenant-1")
        .await
        .unwrap();
    assert!(generated.success);
    assert_eq!(generated.message.as_deref(), Some("Hello Ana"));
}
