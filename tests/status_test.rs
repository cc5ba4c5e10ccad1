use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cedula::DocumentStatus;

#[test]
fn parses_reception_body() {
    let body = r#"{
        "clave": "50601012400310112345600100001010000000001100000001",
        "fecha": "2024-01-01T06:00:00-06:00",
        "ind-estado": "aceptado"
    }"#;
    let status = DocumentStatus::parse(body);
    assert!(status.is_accepted());
    assert!(!status.is_rejected());
    assert_eq!(status.fecha.as_deref(), Some("2024-01-01T06:00:00-06:00"));
    assert_eq!(status.rejection_detail(), None);
}

#[test]
fn status_comparison_ignores_case_and_whitespace() {
    let status = DocumentStatus::parse(r#"{"ind-estado": " RECHAZADO "}"#);
    assert!(status.is_rejected());
    let status = DocumentStatus::parse(r#"{"ind-estado": "Procesando"}"#);
    assert!(status.is_processing());
}

#[test]
fn received_counts_as_processing() {
    let status = DocumentStatus::received();
    assert_eq!(status.estado, "recibido");
    assert!(status.is_processing());
    assert!(!status.is_error());
}

#[test]
fn invalid_json_becomes_error_status() {
    let status = DocumentStatus::parse("<html>502 Bad Gateway</html>");
    assert!(status.is_error());
    assert_eq!(
        status.respuesta_xml.as_deref(),
        Some("<html>502 Bad Gateway</html>")
    );
    assert!(
        status
            .detalle_mensaje
            .as_deref()
            .unwrap()
            .starts_with("invalid JSON response")
    );
}

#[test]
fn rejection_detail_prefers_explicit_field() {
    let xml = STANDARD.encode("<MensajeHacienda><DetalleMensaje>from xml</DetalleMensaje></MensajeHacienda>");
    let body = serde_json::json!({
        "ind-estado": "rechazado",
        "respuesta-xml": xml,
        "detalle-mensaje": "from field"
    })
    .to_string();
    let status = DocumentStatus::parse(&body);
    assert_eq!(status.rejection_detail().as_deref(), Some("from field"));
}

#[test]
fn rejection_detail_from_decoded_xml() {
    let xml = "<MensajeHacienda><DetalleMensaje>Este comprobante fue rechazado</DetalleMensaje></MensajeHacienda>";
    let body = serde_json::json!({
        "ind-estado": "rechazado",
        "respuesta-xml": STANDARD.encode(xml),
    })
    .to_string();
    let status = DocumentStatus::parse(&body);
    assert_eq!(status.decoded_response().as_deref(), Some(xml));
    assert_eq!(
        status.rejection_detail().as_deref(),
        Some("Este comprobante fue rechazado")
    );
}

#[test]
fn undecodable_response_has_no_detail() {
    let status = DocumentStatus::parse(r#"{"ind-estado": "rechazado", "respuesta-xml": "%%%"}"#);
    assert_eq!(status.decoded_response(), None);
    assert_eq!(status.rejection_detail(), None);
}

#[test]
fn rejection_detail_from_real_world_message() {
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<MensajeHacienda xmlns="https://cdn.comprobanteselectronicos.go.cr/xml-schemas/v4.3/mensajeHacienda">
  <Clave>50601012400310112345600100001010000000001100000001</Clave>
  <DetalleMensaje xml:lang="es">Receptor &amp; emisor no pueden ser iguales</DetalleMensaje>
</MensajeHacienda>"#;
    let body = serde_json::json!({
        "ind-estado": "rechazado",
        "respuesta-xml": STANDARD.encode(xml),
    })
    .to_string();
    let status = DocumentStatus::parse(&body);
    assert_eq!(
        status.rejection_detail().as_deref(),
        Some("Receptor & emisor no pueden ser iguales")
    );
}
