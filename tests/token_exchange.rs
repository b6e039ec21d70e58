//! Service account token exchange against a mock token endpoint.

use iap_proxy::auth::{
    import_credentials, AuthError, FileSecretStore, SecretStore, ServiceAccountKey,
    ServiceAccountTokenProvider, TokenProvider,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PRIVATE_KEY: &str = include_str!("fixtures/service_account_key.pem");
const CLIENT_ID: &str = "1234-gateway.apps.googleusercontent.com";

fn key_json(token_uri: &str) -> serde_json::Value {
    json!({
        "type": "service_account",
        "client_email": "proxy@project.iam.gserviceaccount.com",
        "private_key_id": "kid-1",
        "private_key": PRIVATE_KEY,
        "token_uri": token_uri,
    })
}

fn provider(token_uri: &str) -> ServiceAccountTokenProvider {
    let key = ServiceAccountKey::from_json(key_json(token_uri).to_string().as_bytes()).unwrap();
    ServiceAccountTokenProvider::new(key, CLIENT_ID).unwrap()
}

#[tokio::test]
async fn exchanges_assertion_for_id_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer",
        ))
        .and(body_string_contains("assertion="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id_token": "minted-id-token"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let token = provider(&format!("{}/token", server.uri()))
        .fetch_token()
        .await
        .unwrap();

    assert_eq!(token.as_str(), "minted-id-token");
}

#[tokio::test]
async fn rejected_assertion_is_an_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;

    let err = provider(&format!("{}/token", server.uri()))
        .fetch_token()
        .await
        .unwrap_err();

    match err {
        AuthError::Rejected { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "invalid_grant");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn response_without_id_token_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ya29.not-an-id-token",
            "expires_in": 3599
        })))
        .mount(&server)
        .await;

    let err = provider(&format!("{}/token", server.uri()))
        .fetch_token()
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::MissingIdToken));
}

#[tokio::test]
async fn unreachable_token_endpoint_is_a_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = provider(&format!("http://{}/token", addr))
        .fetch_token()
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::Transport(_)));
}

#[tokio::test]
async fn imported_credentials_feed_the_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id_token": "from-store"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let key_file = dir.path().join("sa.json");
    std::fs::write(&key_file, key_json(&format!("{}/token", server.uri())).to_string()).unwrap();

    let store = FileSecretStore::new(dir.path().join("IAP_Proxy"));
    import_credentials(&store, "Proxy_Credentials", &key_file).unwrap();
    assert!(store.get("Proxy_Credentials").unwrap().is_some());

    let provider =
        ServiceAccountTokenProvider::from_store(&store, "Proxy_Credentials", CLIENT_ID).unwrap();
    assert_eq!(provider.fetch_token().await.unwrap().as_str(), "from-store");
}

#[test]
fn garbage_in_store_is_an_invalid_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSecretStore::new(dir.path());
    store.put("Proxy_Credentials", b"not json").unwrap();

    let err = ServiceAccountTokenProvider::from_store(&store, "Proxy_Credentials", CLIENT_ID)
        .err()
        .unwrap();
    assert!(matches!(err, AuthError::InvalidKey(_)));
}
