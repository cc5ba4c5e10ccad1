//! Wiremock integration tests for HaciendaClient.
//!
//! These tests verify the HTTP contract of the public lookup, the identity
//! provider and the document reception API.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{TimeZone, Utc};
use cedula::{
    CedulaError, CompanyKind, DocumentSubmission, Environment, HaciendaClient, HaciendaUrls,
    RegistryProvider, RetryConfig, TaxId, TaxStatus, TenantCredentials, TenantId,
};
use wiremock::matchers::{
    body_partial_json, body_string_contains, header, method, path, query_param,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Helpers
// ============================================================================

fn tenant() -> TenantId {
    TenantId::from("acme")
}

fn client(server: &MockServer) -> HaciendaClient {
    let credentials = HashMap::from([(
        tenant(),
        TenantCredentials {
            username: "cpj-3-101-123456@stag.comprobanteselectronicos.go.cr".into(),
            password: "secret".into(),
            environment: Environment::Sandbox,
        },
    )]);
    HaciendaClient::with_urls(credentials, HaciendaUrls::single_host(&server.uri()))
        .with_retry_config(RetryConfig::new().initial_delay(Duration::from_millis(1)))
}

fn clave() -> String {
    "50601012400310112345600100001010000000001100000001".to_string()
}

async fn mount_token(server: &MockServer, token: &str, expect: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=password"))
        .and(body_string_contains("client_id=api-stag"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": token,
            "expires_in": 300,
            "refresh_token": "refresh-1",
            "refresh_expires_in": 36000
        })))
        .expect(expect)
        .mount(server)
        .await;
}

// ============================================================================
// Public lookup
// ============================================================================

#[tokio::test]
async fn test_lookup_success() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fe/ae"))
        .and(query_param("identificacion", "3101123456"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "nombre": "GIMNASIO FITNESS CR SOCIEDAD ANONIMA",
            "tipoIdentificacion": "02",
            "regimen": {"codigo": 1, "descripcion": "Sociedad Anónima - Régimen General"},
            "situacion": {"moroso": "NO", "omiso": "NO", "estado": "Inscrito"},
            "actividades": [
                {"estado": "A", "tipo": "P", "codigo": "931101", "descripcion": "GIMNASIOS"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let record = client(&server)
        .lookup(&tenant(), &TaxId::parse("3-101-123456").unwrap())
        .await
        .expect("lookup should succeed");

    assert_eq!(record.name, "GIMNASIO FITNESS CR SOCIEDAD ANONIMA");
    assert_eq!(record.tax_status, TaxStatus::Inscrito);
    assert_eq!(record.company_kind, CompanyKind::Company);
    assert_eq!(record.primary_activity.as_deref(), Some("931101"));
    assert!(record.raw_response.is_some());
}

#[tokio::test]
async fn test_lookup_inactive_taxpayer() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fe/ae"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "nombre": "JUAN PEREZ",
            "regimen": {"descripcion": "Persona Física"},
            "situacion": {"estado": "No inscrito"}
        })))
        .mount(&server)
        .await;

    let record = client(&server)
        .lookup(&tenant(), &TaxId::parse("102340567").unwrap())
        .await
        .unwrap();
    assert_eq!(record.tax_status, TaxStatus::Inactivo);
    assert_eq!(record.company_kind, CompanyKind::Person);
    assert!(record.economic_activities.is_empty());
}

#[tokio::test]
async fn test_lookup_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fe/ae"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client(&server)
        .lookup(&tenant(), &TaxId::parse("999999999").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, CedulaError::NotFound { ref tax_id } if tax_id == "999999999"));
}

#[tokio::test]
async fn test_lookup_bad_request_carries_error_cause() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fe/ae"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("X-Error-Cause", "Invalid identification")
                .set_body_json(serde_json::json!({"mensaje": "solicitud invalida"})),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .lookup(&tenant(), &TaxId::parse("999999999").unwrap())
        .await
        .unwrap_err();
    match err {
        CedulaError::Validation { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("solicitud invalida"));
            assert!(message.contains("cause: Invalid identification"));
        }
        other => panic!("expected Validation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_lookup_rate_limited_hint() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fe/ae"))
        .respond_with(ResponseTemplate::new(429).insert_header("X-Ratelimit-Reset", "7"))
        .mount(&server)
        .await;

    let err = client(&server)
        .lookup(&tenant(), &TaxId::parse("3101123456").unwrap())
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_lookup_server_error_is_transient() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fe/ae"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = client(&server)
        .lookup(&tenant(), &TaxId::parse("3101123456").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, CedulaError::Api { status: 503, ref message } if message == "maintenance"));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_lookup_malformed_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fe/ae"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = client(&server)
        .lookup(&tenant(), &TaxId::parse("3101123456").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, CedulaError::MalformedResponse(_)));
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_authenticate_caches_token() {
    let server = MockServer::start().await;
    mount_token(&server, "tok-1", 1).await;

    let client = client(&server);
    assert_eq!(client.authenticate(&tenant()).await.unwrap(), "tok-1");
    assert_eq!(client.authenticate(&tenant()).await.unwrap(), "tok-1");
}

#[tokio::test]
async fn test_authenticate_invalid_credentials() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "Invalid user credentials"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).authenticate(&tenant()).await.unwrap_err();
    assert!(matches!(err, CedulaError::AuthenticationFailed(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_authenticate_unknown_tenant() {
    let server = MockServer::start().await;

    let err = client(&server)
        .authenticate(&TenantId::from("nobody"))
        .await
        .unwrap_err();
    assert!(matches!(err, CedulaError::Configuration(_)));
}

#[tokio::test]
async fn test_expired_token_uses_refresh_grant() {
    let server = MockServer::start().await;

    // expires_in within the safety margin: the token is stale immediately.
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok-1",
            "expires_in": 10,
            "refresh_token": "refresh-1",
            "refresh_expires_in": 36000
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok-2",
            "expires_in": 300
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    assert_eq!(client.authenticate(&tenant()).await.unwrap(), "tok-1");
    assert_eq!(client.authenticate(&tenant()).await.unwrap(), "tok-2");
    assert_eq!(client.authenticate(&tenant()).await.unwrap(), "tok-2");
}

// ============================================================================
// Document reception
// ============================================================================

#[tokio::test]
async fn test_submit_document_accepted_for_processing() {
    let server = MockServer::start().await;
    mount_token(&server, "tok-1", 1).await;

    let xml = "<FacturaElectronica>...</FacturaElectronica>";
    Mock::given(method("POST"))
        .and(path("/recepcion/v1/recepcion"))
        .and(header("Authorization", "Bearer tok-1"))
        .and(body_partial_json(serde_json::json!({
            "clave": clave(),
            "fecha": "2024-01-01T06:00:00-06:00",
            "emisor": {"tipoIdentificacion": "02", "numeroIdentificacion": "3101123456"},
            "receptor": {"tipoIdentificacion": "01", "numeroIdentificacion": "102340567"},
            "comprobanteXml": STANDARD.encode(xml),
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let doc = DocumentSubmission {
        clave: clave(),
        fecha: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        emisor: TaxId::parse("3101123456").unwrap(),
        receptor: Some(TaxId::parse("102340567").unwrap()),
        signed_xml: xml.to_string(),
    };
    let status = client(&server).submit_document(&tenant(), &doc).await.unwrap();

    assert_eq!(status.estado, "recibido");
    assert!(status.is_processing());
}

#[tokio::test]
async fn test_document_status_rejected_with_detail() {
    let server = MockServer::start().await;
    mount_token(&server, "tok-1", 1).await;

    let message = "<MensajeHacienda><Mensaje>3</Mensaje><DetalleMensaje>Firma invalida</DetalleMensaje></MensajeHacienda>";
    Mock::given(method("GET"))
        .and(path(format!("/recepcion/v1/recepcion/{}", clave())))
        .and(header("Authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "clave": clave(),
            "fecha": "2024-01-01T06:00:00-06:00",
            "ind-estado": "Rechazado",
            "respuesta-xml": STANDARD.encode(message)
        })))
        .mount(&server)
        .await;

    let status = client(&server)
        .document_status(&tenant(), &clave())
        .await
        .unwrap();

    assert!(status.is_rejected());
    assert_eq!(status.clave.as_deref(), Some(clave().as_str()));
    assert_eq!(status.rejection_detail().as_deref(), Some("Firma invalida"));
}

#[tokio::test]
async fn test_unauthorized_reauthenticates_once() {
    let server = MockServer::start().await;
    mount_token(&server, "tok-1", 2).await;

    Mock::given(method("GET"))
        .and(path(format!("/recepcion/v1/recepcion/{}", clave())))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/recepcion/v1/recepcion/{}", clave())))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"ind-estado": "aceptado"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let status = client(&server)
        .document_status(&tenant(), &clave())
        .await
        .unwrap();
    assert!(status.is_accepted());
}

#[tokio::test]
async fn test_unauthorized_twice_fails() {
    let server = MockServer::start().await;
    mount_token(&server, "tok-1", 2).await;

    Mock::given(method("GET"))
        .and(path(format!("/recepcion/v1/recepcion/{}", clave())))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let err = client(&server)
        .document_status(&tenant(), &clave())
        .await
        .unwrap_err();
    assert!(matches!(err, CedulaError::AuthenticationFailed(_)));
}

#[tokio::test]
async fn test_document_status_retries_server_errors() {
    let server = MockServer::start().await;
    mount_token(&server, "tok-1", 1).await;

    Mock::given(method("GET"))
        .and(path(format!("/recepcion/v1/recepcion/{}", clave())))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/recepcion/v1/recepcion/{}", clave())))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"ind-estado": "procesando"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let status = client(&server)
        .document_status(&tenant(), &clave())
        .await
        .unwrap();
    assert!(status.is_processing());
}

#[tokio::test]
async fn test_invalid_clave_rejected_locally() {
    let server = MockServer::start().await;

    let err = client(&server)
        .document_status(&tenant(), "12345")
        .await
        .unwrap_err();
    assert!(matches!(err, CedulaError::InvalidDocumentKey(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}
