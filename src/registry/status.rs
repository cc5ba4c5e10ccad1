//! Document reception status as reported by Hacienda.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};

/// Parsed body of a `/recepcion` response.
///
/// The status token (`ind-estado`) is compared case-insensitively by all
/// helpers; it is stored as received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clave: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha: Option<String>,
    #[serde(rename = "ind-estado", default)]
    pub estado: String,
    /// Base64-encoded response message (`MensajeHacienda` XML).
    #[serde(rename = "respuesta-xml", default, skip_serializing_if = "Option::is_none")]
    pub respuesta_xml: Option<String>,
    #[serde(rename = "detalle-mensaje", default, skip_serializing_if = "Option::is_none")]
    pub detalle_mensaje: Option<String>,
}

impl DocumentStatus {
    /// Parse a response body. Never fails: a body that is not valid JSON
    /// yields an `error` status carrying the raw text.
    pub fn parse(body: &str) -> Self {
        match serde_json::from_str::<DocumentStatus>(body) {
            Ok(status) => status,
            Err(e) => DocumentStatus {
                estado: "error".to_string(),
                respuesta_xml: Some(body.to_string()),
                detalle_mensaje: Some(format!("invalid JSON response: {e}")),
                ..DocumentStatus::default()
            },
        }
    }

    /// Status for a `202 Accepted` with an empty body.
    pub fn received() -> Self {
        DocumentStatus {
            estado: "recibido".to_string(),
            ..DocumentStatus::default()
        }
    }

    fn estado_is(&self, candidates: &[&str]) -> bool {
        let estado = self.estado.trim();
        candidates.iter().any(|c| estado.eq_ignore_ascii_case(c))
    }

    pub fn is_accepted(&self) -> bool {
        self.estado_is(&["aceptado"])
    }

    pub fn is_rejected(&self) -> bool {
        self.estado_is(&["rechazado"])
    }

    /// Received but not yet decided.
    pub fn is_processing(&self) -> bool {
        self.estado_is(&["procesando", "recibido"])
    }

    pub fn is_error(&self) -> bool {
        self.estado_is(&["error"])
    }

    /// `respuesta-xml` decoded from base64, if it is valid base64 UTF-8.
    pub fn decoded_response(&self) -> Option<String> {
        let encoded = self.respuesta_xml.as_deref()?.trim();
        let bytes = STANDARD.decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Human-readable rejection detail: `detalle-mensaje` if present,
    /// otherwise the `<DetalleMensaje>` element of the decoded response.
    pub fn rejection_detail(&self) -> Option<String> {
        if let Some(detail) = self
            .detalle_mensaje
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            return Some(detail.to_string());
        }
        let xml = self.decoded_response()?;
        extract_element(&xml, "DetalleMensaje")
    }
}

/// Unescaped text content of the first element whose local name is `tag`.
///
/// Namespace prefixes and attributes on the element are ignored.
fn extract_element(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if depth > 0 || e.local_name().as_ref() == tag.as_bytes() {
                    depth += 1;
                }
            }
            Ok(Event::Text(ref e)) if depth > 0 => {
                text.push_str(&e.unescape().ok()?);
            }
            Ok(Event::CData(e)) if depth > 0 => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::End(_)) if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let text = text.trim();
                    return (!text.is_empty()).then(|| text.to_string());
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}
