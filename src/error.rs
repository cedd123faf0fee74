//! Error types for the WS-Security message engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the security engine.
///
/// The taxonomy is deliberate: decode and validation errors are fatal to the
/// current message, capacity errors indicate systemic load and map to a
/// server-side "too busy" fault, and usage errors are programming errors that
/// must never be treated as attacker input.
#[derive(Error, Debug)]
pub enum WsSecurityError {
    /// Malformed XML or an unexpected element. Fatal to the message.
    #[error("message decode error: {0}")]
    Decode(String),

    /// A security check failed. Messages carry limited detail on purpose so
    /// that rejections cannot be used as an oracle.
    #[error("message security validation failed: {0}")]
    Validation(&'static str),

    /// A cache quota was exceeded. Distinct from validation so operators can
    /// alert on load separately from attack traffic.
    #[error("security cache capacity exceeded: {0}")]
    Capacity(String),

    /// Engine misuse: missing required parameters, out-of-order writes.
    #[error("invalid engine usage: {0}")]
    Usage(String),
}

impl WsSecurityError {
    /// Whether this error rejects the current message without poisoning the
    /// pipeline. Usage errors are excluded: they indicate a caller bug and
    /// must propagate unchanged.
    pub fn is_message_rejectable(&self) -> bool {
        match self {
            Self::Decode(_) | Self::Validation(_) | Self::Capacity(_) => true,
            Self::Usage(_) => false,
        }
    }

    /// The fault kind a transport should report for this error.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Self::Decode(_) | Self::Validation(_) => FaultKind::Sender,
            Self::Capacity(_) => FaultKind::TooBusy,
            Self::Usage(_) => FaultKind::Receiver,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn fault_code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "INVALID_MESSAGE",
            Self::Validation(_) => "INVALID_SECURITY",
            Self::Capacity(_) => "SERVER_TOO_BUSY",
            Self::Usage(_) => "INVALID_OPERATION",
        }
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, WsSecurityError>;

/// Fault classification for transport-level mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// The sender produced an invalid or unauthenticated message.
    Sender,
    /// The receiver is overloaded; retry later.
    TooBusy,
    /// Internal misuse of the engine.
    Receiver,
}

/// SOAP version to render a fault for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapFaultVersion {
    Soap11,
    Soap12,
}

/// Generate a SOAP Fault response for a rejected message.
pub fn security_fault_response(error: &WsSecurityError, version: SoapFaultVersion) -> String {
    match version {
        SoapFaultVersion::Soap11 => soap_11_fault(error),
        SoapFaultVersion::Soap12 => soap_12_fault(error),
    }
}

fn soap_11_fault(error: &WsSecurityError) -> String {
    let fault_code = match error.fault_kind() {
        FaultKind::Sender => "soap:Client",
        FaultKind::TooBusy | FaultKind::Receiver => "soap:Server",
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <soap:Fault>
      <faultcode>{}</faultcode>
      <faultstring>{}</faultstring>
      <detail>
        <wss:fault xmlns:wss="urn:wss-engine:fault" code="{}"/>
      </detail>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
        fault_code,
        xml_escape(&error.to_string()),
        error.fault_code()
    )
}

fn soap_12_fault(error: &WsSecurityError) -> String {
    let fault_code = match error.fault_kind() {
        FaultKind::Sender => "soap:Sender",
        FaultKind::TooBusy | FaultKind::Receiver => "soap:Receiver",
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <soap:Fault>
      <soap:Code>
        <soap:Value>{}</soap:Value>
      </soap:Code>
      <soap:Reason>
        <soap:Text xml:lang="en">{}</soap:Text>
      </soap:Reason>
      <soap:Detail>
        <wss:fault xmlns:wss="urn:wss-engine:fault" code="{}"/>
      </soap:Detail>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
        fault_code,
        xml_escape(&error.to_string()),
        error.fault_code()
    )
}

/// Escape text for inclusion in XML content or attribute values.
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
