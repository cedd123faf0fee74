//! Security header parsing and classification.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand
//! entities); a string-level pre-scan rejects DOCTYPE/ENTITY payloads
//! outright before any parsing happens.

use crate::config::InferenceMode;
use crate::error::{Result, WsSecurityError};
use crate::token::KeyIdentifierClause;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use uuid::Uuid;

/// SOAP and WS-* namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const WSC_NS: &str = "http://schemas.xmlsoap.org/ws/2005/02/sc";

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapVersion {
    Soap11,
    Soap12,
}

impl SoapVersion {
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Soap11 => SOAP_11_NS,
            Self::Soap12 => SOAP_12_NS,
        }
    }
}

/// Structural role of a signature or token within the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    Primary,
    Endorsing,
    Signed,
    SignedEndorsing,
    Basic,
}

impl BindingMode {
    /// Wire name used by the strict inference engine's role attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Endorsing => "endorsing",
            Self::Signed => "signed",
            Self::SignedEndorsing => "signed-endorsing",
            Self::Basic => "basic",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Self::Primary),
            "endorsing" => Some(Self::Endorsing),
            "signed" => Some(Self::Signed),
            "signed-endorsing" => Some(Self::SignedEndorsing),
            "basic" => Some(Self::Basic),
            _ => None,
        }
    }
}

/// A wsu:Timestamp header element.
#[derive(Debug, Clone, Default)]
pub struct TimestampElement {
    pub id: Option<String>,
    pub created: Option<String>,
    pub expires: Option<String>,
}

/// A ds:Signature header element.
#[derive(Debug, Clone, Default)]
pub struct SignatureElement {
    pub id: Option<String>,
    /// Reference target without the leading `#`.
    pub reference: String,
    pub algorithm: String,
    pub signature_value: Vec<u8>,
    /// Replay nonce attached to the signature.
    pub nonce: Option<Vec<u8>>,
    pub key_info: Option<KeyIdentifierClause>,
    /// Role attribute consumed by the strict inference engine.
    pub declared_role: Option<String>,
}

/// An xenc:EncryptedData header element (or encrypted body content).
#[derive(Debug, Clone, Default)]
pub struct EncryptedDataElement {
    pub id: Option<String>,
    /// Header element this ciphertext replaces, without the leading `#`.
    pub target: Option<String>,
    /// EncryptedKey carrying the decryption key, without the leading `#`.
    pub key_ref: Option<String>,
    pub algorithm: String,
    pub ciphertext: Vec<u8>,
}

/// An xenc:EncryptedKey header element wrapping a symmetric key.
#[derive(Debug, Clone, Default)]
pub struct EncryptedKeyElement {
    pub id: Option<String>,
    pub algorithm: String,
    /// Key-encryption-key reference, without the leading `#`.
    pub kek_ref: Option<String>,
    pub ciphertext: Vec<u8>,
}

/// A wsc:DerivedKeyToken header element.
#[derive(Debug, Clone, Default)]
pub struct DerivedKeyTokenElement {
    pub id: Option<String>,
    pub algorithm: String,
    pub source: Option<KeyIdentifierClause>,
    pub generation: u32,
    pub offset: usize,
    pub length: usize,
    pub label: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// A wsc:SecurityContextToken header element.
#[derive(Debug, Clone)]
pub struct ContextTokenElement {
    pub id: Option<String>,
    pub context_id: Uuid,
    pub key_generation: Option<Uuid>,
}

/// A header element the engine does not interpret. Preserved, and fatal
/// when it demands understanding.
#[derive(Debug, Clone)]
pub struct UnknownElement {
    pub local_name: String,
    pub must_understand: bool,
}

/// Tagged union over the recognized header element kinds.
#[derive(Debug, Clone)]
pub enum HeaderElementKind {
    Timestamp(TimestampElement),
    Signature(SignatureElement),
    EncryptedData(EncryptedDataElement),
    EncryptedKey(EncryptedKeyElement),
    DerivedKeyToken(DerivedKeyTokenElement),
    ContextToken(ContextTokenElement),
    Unknown(UnknownElement),
}

/// One classified child of `<wsse:Security>`, with its original position
/// and the binding mode assigned during inference.
#[derive(Debug, Clone)]
pub struct SecurityHeaderElement {
    pub position: usize,
    pub binding_mode: Option<BindingMode>,
    pub kind: HeaderElementKind,
}

/// Envelope-level parse result: version, header security subtree, and the
/// body captured as raw bytes for canonical reuse.
#[derive(Debug, Clone)]
pub struct ParsedEnvelope {
    pub version: SoapVersion,
    pub body_id: Option<String>,
    pub body_inner: String,
    pub security_inner: Option<String>,
}

/// Parse raw bytes as a SOAP envelope carrying an optional security header.
///
/// The Body and Security subtrees are captured as byte spans recorded while
/// the event parser sits at their validated positions (depth 2 under the
/// envelope, depth 3 under the header), so a look-alike element smuggled
/// elsewhere in the document can never displace them.
pub fn parse_envelope(data: &[u8]) -> Result<ParsedEnvelope> {
    let xml = std::str::from_utf8(data)
        .map_err(|e| WsSecurityError::Decode(format!("invalid UTF-8: {e}")))?;

    check_xxe_patterns(xml)?;

    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut version: Option<SoapVersion> = None;
    let mut in_envelope = false;
    let mut in_header = false;
    let mut depth = 0u32;

    let mut body_id: Option<String> = None;
    let mut body_open: Option<usize> = None;
    let mut body_span: Option<(usize, usize)> = None;
    let mut security_open: Option<usize> = None;
    let mut security_span: Option<(usize, usize)> = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                depth += 1;
                let (ns, local) = resolve_start(&reader, e);
                let soap_ns = version.map(|v| v.namespace());
                match (local.as_str(), depth) {
                    ("Envelope", 1) => {
                        version = match ns.as_deref() {
                            Some(SOAP_11_NS) => Some(SoapVersion::Soap11),
                            Some(SOAP_12_NS) => Some(SoapVersion::Soap12),
                            _ => None,
                        };
                        in_envelope = version.is_some();
                    }
                    ("Header", 2) if in_envelope && ns.as_deref() == soap_ns => {
                        in_header = true;
                    }
                    ("Body", 2) if in_envelope && ns.as_deref() == soap_ns => {
                        if body_open.is_some() || body_span.is_some() {
                            return Err(WsSecurityError::Decode(
                                "multiple SOAP Body elements".to_string(),
                            ));
                        }
                        body_id = attr_value_of(e, "Id");
                        body_open = Some(reader.buffer_position() as usize);
                    }
                    ("Security", 3) if in_header && ns.as_deref() == Some(WSSE_NS) => {
                        if security_open.is_some() || security_span.is_some() {
                            return Err(WsSecurityError::Decode(
                                "multiple security headers".to_string(),
                            ));
                        }
                        security_open = Some(reader.buffer_position() as usize);
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                let (ns, local) = resolve_start(&reader, e);
                let soap_ns = version.map(|v| v.namespace());
                if depth == 1 && local == "Body" && in_envelope && ns.as_deref() == soap_ns {
                    if body_span.is_some() {
                        return Err(WsSecurityError::Decode(
                            "multiple SOAP Body elements".to_string(),
                        ));
                    }
                    body_id = attr_value_of(e, "Id");
                    body_span = Some((0, 0));
                } else if depth == 2
                    && local == "Security"
                    && in_header
                    && ns.as_deref() == Some(WSSE_NS)
                {
                    if security_span.is_some() {
                        return Err(WsSecurityError::Decode(
                            "multiple security headers".to_string(),
                        ));
                    }
                    security_span = Some((0, 0));
                }
            }
            Ok(Event::End(ref e)) => {
                // Position just before `</name>`.
                let close = (reader.buffer_position() as usize)
                    .saturating_sub(e.name().as_ref().len() + 3);
                if depth == 3 {
                    if let Some(start) = security_open.take() {
                        security_span = Some((start, close));
                    }
                } else if depth == 2 {
                    if let Some(start) = body_open.take() {
                        body_span = Some((start, close));
                    }
                    in_header = false;
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(WsSecurityError::Decode(format!("XML parse error: {e}")));
            }
            _ => {}
        }
        buf.clear();
    }

    let version = version.ok_or_else(|| {
        WsSecurityError::Decode("no SOAP envelope with a recognized namespace".to_string())
    })?;
    let (body_start, body_end) = body_span
        .ok_or_else(|| WsSecurityError::Decode("SOAP Body is missing".to_string()))?;

    Ok(ParsedEnvelope {
        version,
        body_id,
        body_inner: xml[body_start..body_end].trim().to_string(),
        security_inner: security_span.map(|(start, end)| xml[start..end].to_string()),
    })
}

/// Check for XXE attack patterns before handing input to the parser.
pub fn check_xxe_patterns(xml: &str) -> Result<()> {
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(WsSecurityError::Decode(
            "DOCTYPE declarations are not allowed".to_string(),
        ));
    }
    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(WsSecurityError::Decode(
            "entity declarations are not allowed".to_string(),
        ));
    }
    if (xml.contains("SYSTEM") || xml.contains("PUBLIC")) && xml.contains("<!") {
        return Err(WsSecurityError::Decode(
            "external entity references are not allowed".to_string(),
        ));
    }
    Ok(())
}

/// Parse the inner XML of `<wsse:Security>` into classified elements,
/// preserving document order. Classification requires both the local name
/// and the resolved namespace; a look-alike element in a foreign namespace
/// falls through to `Unknown`.
pub fn parse_security_header(inner_xml: &str) -> Result<Vec<SecurityHeaderElement>> {
    // Wrap so a sequence of sibling elements parses as one document. The
    // wrapper re-binds the canonical prefixes declared on the envelope the
    // fragment was sliced from.
    let wrapped = format!(
        r#"<x xmlns:wsse="{WSSE_NS}" xmlns:wsu="{WSU_NS}" xmlns:ds="{DS_NS}" xmlns:xenc="{XENC_NS}" xmlns:wsc="{WSC_NS}">{inner_xml}</x>"#
    );
    let mut reader = NsReader::from_str(&wrapped);
    reader.config_mut().trim_text(true);

    let mut elements = Vec::new();
    let mut builder: Option<ElementBuilder> = None;
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut depth = 0u32;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                depth += 1;
                let local_name = local_name_str(e);
                if depth == 2 {
                    let (ns, _) = resolve_start(&reader, e);
                    builder = Some(ElementBuilder::start(&local_name, ns.as_deref(), e));
                } else if depth > 2 {
                    if let Some(b) = builder.as_mut() {
                        b.child_start(&local_name, &path, e);
                    }
                    path.push(local_name);
                }
                text.clear();
            }
            Ok(Event::Empty(ref e)) => {
                let local_name = local_name_str(e);
                if depth + 1 == 2 {
                    let (ns, _) = resolve_start(&reader, e);
                    let b = ElementBuilder::start(&local_name, ns.as_deref(), e);
                    elements.push(b.finish(elements.len())?);
                } else if let Some(b) = builder.as_mut() {
                    b.child_start(&local_name, &path, e);
                }
            }
            Ok(Event::Text(ref e)) => {
                let t = e
                    .unescape()
                    .map_err(|err| WsSecurityError::Decode(format!("bad text content: {err}")))?;
                text.push_str(&t);
            }
            Ok(Event::End(ref e)) => {
                let local_name = std::str::from_utf8(e.local_name().as_ref())
                    .unwrap_or("")
                    .to_string();
                if depth > 2 {
                    path.pop();
                    if let Some(b) = builder.as_mut() {
                        b.child_end(&local_name, &path, &text)?;
                    }
                } else if depth == 2 {
                    if let Some(b) = builder.take() {
                        elements.push(b.finish(elements.len())?);
                    }
                }
                text.clear();
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(WsSecurityError::Decode(format!(
                    "security header parse error: {e}"
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(elements)
}

/// Incrementally assembled header element.
enum ElementBuilder {
    Timestamp(TimestampElement),
    Signature(SignatureElement),
    EncryptedData(EncryptedDataElement),
    EncryptedKey(EncryptedKeyElement),
    DerivedKeyToken(DerivedKeyTokenElement),
    ContextToken {
        id: Option<String>,
        identifier: Option<String>,
        instance: Option<String>,
    },
    Unknown(UnknownElement),
}

impl ElementBuilder {
    fn start(local_name: &str, ns: Option<&str>, e: &BytesStart) -> Self {
        let id = attr_value_of(e, "Id");
        match (local_name, ns) {
            ("Timestamp", Some(WSU_NS)) => Self::Timestamp(TimestampElement {
                id,
                ..Default::default()
            }),
            ("Signature", Some(DS_NS)) => Self::Signature(SignatureElement {
                id,
                declared_role: attr_value_of(e, "Role"),
                ..Default::default()
            }),
            ("EncryptedData", Some(XENC_NS)) => Self::EncryptedData(EncryptedDataElement {
                id,
                target: attr_value_of(e, "Target").map(strip_fragment),
                key_ref: attr_value_of(e, "KeyRef").map(strip_fragment),
                ..Default::default()
            }),
            ("EncryptedKey", Some(XENC_NS)) => Self::EncryptedKey(EncryptedKeyElement {
                id,
                ..Default::default()
            }),
            ("DerivedKeyToken", Some(WSC_NS)) => Self::DerivedKeyToken(DerivedKeyTokenElement {
                id,
                algorithm: attr_value_of(e, "Algorithm").unwrap_or_default(),
                ..Default::default()
            }),
            ("SecurityContextToken", Some(WSC_NS)) => Self::ContextToken {
                id,
                identifier: None,
                instance: None,
            },
            (other, _) => Self::Unknown(UnknownElement {
                local_name: other.to_string(),
                must_understand: must_understand(e),
            }),
        }
    }

    fn child_start(&mut self, local_name: &str, path: &[String], e: &BytesStart) {
        match self {
            Self::Signature(sig) => match local_name {
                "SignatureMethod" => {
                    sig.algorithm = attr_value_of(e, "Algorithm").unwrap_or_default();
                }
                "Reference" if path.iter().any(|p| p == "SignedInfo") => {
                    sig.reference = attr_value_of(e, "URI")
                        .map(strip_fragment)
                        .unwrap_or_default();
                }
                "Reference" if path.iter().any(|p| p == "SecurityTokenReference") => {
                    if let Some(uri) = attr_value_of(e, "URI") {
                        sig.key_info = Some(KeyIdentifierClause::LocalId(strip_fragment(uri)));
                    }
                }
                _ => {}
            },
            Self::EncryptedData(ed) => {
                if local_name == "EncryptionMethod" {
                    ed.algorithm = attr_value_of(e, "Algorithm").unwrap_or_default();
                }
            }
            Self::EncryptedKey(ek) => match local_name {
                "EncryptionMethod" => {
                    ek.algorithm = attr_value_of(e, "Algorithm").unwrap_or_default();
                }
                "Reference" if path.iter().any(|p| p == "SecurityTokenReference") => {
                    ek.kek_ref = attr_value_of(e, "URI").map(strip_fragment);
                }
                _ => {}
            },
            Self::DerivedKeyToken(dkt) => {
                if local_name == "Reference" && path.iter().any(|p| p == "SecurityTokenReference") {
                    if let Some(uri) = attr_value_of(e, "URI") {
                        dkt.source = Some(KeyIdentifierClause::LocalId(strip_fragment(uri)));
                    }
                }
            }
            _ => {}
        }
    }

    fn child_end(&mut self, local_name: &str, path: &[String], text: &str) -> Result<()> {
        match self {
            Self::Timestamp(ts) => match local_name {
                "Created" => ts.created = Some(text.to_string()),
                "Expires" => ts.expires = Some(text.to_string()),
                _ => {}
            },
            Self::Signature(sig) => match local_name {
                "SignatureValue" => sig.signature_value = decode_base64(text)?,
                "Nonce" => sig.nonce = Some(decode_base64(text)?),
                "Identifier" if in_str(path) => {
                    set_context_clause_identifier(&mut sig.key_info, text)?;
                }
                "Instance" if in_str(path) => {
                    set_context_clause_instance(&mut sig.key_info, text)?;
                }
                _ => {}
            },
            Self::EncryptedData(ed) => {
                if local_name == "CipherValue" {
                    ed.ciphertext = decode_base64(text)?;
                }
            }
            Self::EncryptedKey(ek) => {
                if local_name == "CipherValue" {
                    ek.ciphertext = decode_base64(text)?;
                }
            }
            Self::DerivedKeyToken(dkt) => match local_name {
                "Identifier" if in_str(path) => {
                    set_context_clause_identifier(&mut dkt.source, text)?;
                }
                "Instance" if in_str(path) => {
                    set_context_clause_instance(&mut dkt.source, text)?;
                }
                "Generation" => dkt.generation = parse_number(text, "Generation")?,
                "Offset" => dkt.offset = parse_number(text, "Offset")?,
                "Length" => dkt.length = parse_number(text, "Length")?,
                "Label" => dkt.label = text.as_bytes().to_vec(),
                "Nonce" => dkt.nonce = decode_base64(text)?,
                _ => {}
            },
            Self::ContextToken {
                identifier,
                instance,
                ..
            } => match local_name {
                "Identifier" => *identifier = Some(text.to_string()),
                "Instance" => *instance = Some(text.to_string()),
                _ => {}
            },
            Self::Unknown(_) => {}
        }
        Ok(())
    }

    fn finish(self, position: usize) -> Result<SecurityHeaderElement> {
        let kind = match self {
            Self::Timestamp(e) => HeaderElementKind::Timestamp(e),
            Self::Signature(e) => HeaderElementKind::Signature(e),
            Self::EncryptedData(e) => HeaderElementKind::EncryptedData(e),
            Self::EncryptedKey(e) => HeaderElementKind::EncryptedKey(e),
            Self::DerivedKeyToken(e) => HeaderElementKind::DerivedKeyToken(e),
            Self::ContextToken {
                id,
                identifier,
                instance,
            } => {
                let identifier = identifier.ok_or_else(|| {
                    WsSecurityError::Decode("SecurityContextToken without Identifier".to_string())
                })?;
                HeaderElementKind::ContextToken(ContextTokenElement {
                    id,
                    context_id: parse_urn_uuid(&identifier)?,
                    key_generation: instance.as_deref().map(parse_urn_uuid).transpose()?,
                })
            }
            Self::Unknown(e) => HeaderElementKind::Unknown(e),
        };
        Ok(SecurityHeaderElement {
            position,
            binding_mode: None,
            kind,
        })
    }
}

fn in_str(path: &[String]) -> bool {
    path.iter().any(|p| p == "SecurityTokenReference")
}

fn set_context_clause_identifier(
    clause: &mut Option<KeyIdentifierClause>,
    text: &str,
) -> Result<()> {
    let context_id = parse_urn_uuid(text)?;
    match clause {
        Some(KeyIdentifierClause::SecurityContext {
            context_id: existing,
            ..
        }) => *existing = context_id,
        _ => {
            *clause = Some(KeyIdentifierClause::SecurityContext {
                context_id,
                key_generation: None,
            })
        }
    }
    Ok(())
}

fn set_context_clause_instance(clause: &mut Option<KeyIdentifierClause>, text: &str) -> Result<()> {
    let generation = parse_urn_uuid(text)?;
    match clause {
        Some(KeyIdentifierClause::SecurityContext { key_generation, .. }) => {
            *key_generation = Some(generation)
        }
        _ => {
            return Err(WsSecurityError::Decode(
                "Instance without a context Identifier".to_string(),
            ))
        }
    }
    Ok(())
}

/// Parse `urn:uuid:...` or a bare UUID.
pub fn parse_urn_uuid(text: &str) -> Result<Uuid> {
    let raw = text.strip_prefix("urn:uuid:").unwrap_or(text);
    Uuid::parse_str(raw)
        .map_err(|_| WsSecurityError::Decode(format!("invalid context identifier: {text}")))
}

fn parse_number<T: std::str::FromStr>(text: &str, field: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| WsSecurityError::Decode(format!("invalid {field} value: {text}")))
}

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text.trim())
        .map_err(|e| WsSecurityError::Decode(format!("invalid base64 value: {e}")))
}

fn strip_fragment(uri: String) -> String {
    uri.strip_prefix('#').map(str::to_string).unwrap_or(uri)
}

/// Extract local name from element.
fn local_name_str(e: &BytesStart) -> String {
    let name = e.local_name();
    std::str::from_utf8(name.as_ref()).unwrap_or("").to_string()
}

/// Resolved namespace and local name of a start tag.
fn resolve_start(reader: &NsReader<&[u8]>, e: &BytesStart) -> (Option<String>, String) {
    let (result, local) = reader.resolve_element(e.name());
    let ns = match result {
        ResolveResult::Bound(Namespace(ns)) => std::str::from_utf8(ns).ok().map(String::from),
        _ => None,
    };
    (ns, std::str::from_utf8(local.as_ref()).unwrap_or("").to_string())
}

/// Attribute value by local name suffix (matches `Id`, `wsu:Id`, ...).
fn attr_value_of(e: &BytesStart, local: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
        if key == local || key.ends_with(&format!(":{local}")) {
            return std::str::from_utf8(&attr.value).ok().map(String::from);
        }
    }
    None
}

/// Check mustUnderstand attribute.
fn must_understand(e: &BytesStart) -> bool {
    for attr in e.attributes().flatten() {
        let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
        if key.ends_with("mustUnderstand") {
            let value = std::str::from_utf8(&attr.value).unwrap_or("");
            return value == "1" || value == "true";
        }
    }
    false
}

/// Assigns binding modes to classified header elements.
pub trait BindingInferenceEngine: Send + Sync {
    fn assign(&self, elements: &mut [SecurityHeaderElement]) -> Result<()>;
}

/// Select the engine for a configured mode.
pub fn inference_engine(mode: InferenceMode) -> &'static dyn BindingInferenceEngine {
    match mode {
        InferenceMode::Lax => &LaxInferenceEngine,
        InferenceMode::Strict => &StrictInferenceEngine,
    }
}

/// Heuristic role inference from signature reference targets: a signature
/// targeting another signature endorses it; the sole unclaimed signature is
/// primary. A second primary candidate is a hard protocol violation.
pub struct LaxInferenceEngine;

impl BindingInferenceEngine for LaxInferenceEngine {
    fn assign(&self, elements: &mut [SecurityHeaderElement]) -> Result<()> {
        let signature_ids: Vec<Option<String>> = elements
            .iter()
            .map(|el| match &el.kind {
                HeaderElementKind::Signature(sig) => sig.id.clone(),
                _ => None,
            })
            .collect();

        let mut have_primary = false;
        for (i, element) in elements.iter_mut().enumerate() {
            match &element.kind {
                HeaderElementKind::Signature(sig) => {
                    let endorses = !sig.reference.is_empty()
                        && signature_ids
                            .iter()
                            .enumerate()
                            .any(|(j, id)| j != i && id.as_deref() == Some(sig.reference.as_str()));
                    if endorses {
                        element.binding_mode = Some(BindingMode::Endorsing);
                    } else {
                        if have_primary {
                            return Err(WsSecurityError::Validation(
                                "at most one primary signature allowed",
                            ));
                        }
                        have_primary = true;
                        element.binding_mode = Some(BindingMode::Primary);
                    }
                }
                HeaderElementKind::ContextToken(_) => {
                    element.binding_mode = Some(BindingMode::Basic);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Strict inference: the wire format must declare each signature's role
/// explicitly; heuristics are disallowed so wire-layout ordering cannot
/// change the outcome.
pub struct StrictInferenceEngine;

impl BindingInferenceEngine for StrictInferenceEngine {
    fn assign(&self, elements: &mut [SecurityHeaderElement]) -> Result<()> {
        let mut have_primary = false;
        for element in elements.iter_mut() {
            match &element.kind {
                HeaderElementKind::Signature(sig) => {
                    let role = sig
                        .declared_role
                        .as_deref()
                        .and_then(BindingMode::from_str)
                        .ok_or(WsSecurityError::Validation(
                            "signature role not declared",
                        ))?;
                    if role == BindingMode::Primary {
                        if have_primary {
                            return Err(WsSecurityError::Validation(
                                "at most one primary signature allowed",
                            ));
                        }
                        have_primary = true;
                    }
                    element.binding_mode = Some(role);
                }
                HeaderElementKind::ContextToken(_) => {
                    element.binding_mode = Some(BindingMode::Basic);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENVELOPE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header>
    <wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd" soap:mustUnderstand="1">
      <wsu:Timestamp xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd" wsu:Id="TS-1">
        <wsu:Created>2025-01-01T00:00:00Z</wsu:Created>
        <wsu:Expires>2025-01-01T00:05:00Z</wsu:Expires>
      </wsu:Timestamp>
    </wsse:Security>
  </soap:Header>
  <soap:Body wsu:Id="body-1" xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">
    <m:Ping xmlns:m="http://example.org/ops">hello</m:Ping>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_parse_envelope() {
        let parsed = parse_envelope(ENVELOPE.as_bytes()).unwrap();
        assert_eq!(parsed.version, SoapVersion::Soap11);
        assert_eq!(parsed.body_id.as_deref(), Some("body-1"));
        assert!(parsed.body_inner.contains("m:Ping"));
        assert!(parsed.security_inner.is_some());
    }

    #[test]
    fn test_parse_envelope_without_security() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body><Op/></soap:Body>
</soap:Envelope>"#;
        let parsed = parse_envelope(xml.as_bytes()).unwrap();
        assert!(parsed.security_inner.is_none());
        assert!(parsed.body_id.is_none());
    }

    #[test]
    fn test_body_captured_at_envelope_level_only() {
        // A Body-named element earlier in the document must not displace
        // the depth-2 SOAP Body.
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header>
    <decoy:Body xmlns:decoy="urn:decoy" decoy:Id="fake">nope</decoy:Body>
  </soap:Header>
  <soap:Body wsu:Id="real" xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd"><m:Op xmlns:m="urn:m">yes</m:Op></soap:Body>
</soap:Envelope>"#;
        let parsed = parse_envelope(xml.as_bytes()).unwrap();
        assert_eq!(parsed.body_id.as_deref(), Some("real"));
        assert_eq!(parsed.body_inner, r#"<m:Op xmlns:m="urn:m">yes</m:Op>"#);
    }

    #[test]
    fn test_duplicate_body_rejected() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body><A/></soap:Body>
  <soap:Body><B/></soap:Body>
</soap:Envelope>"#;
        let err = parse_envelope(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, WsSecurityError::Decode(_)));
    }

    #[test]
    fn test_unrecognized_envelope_is_decode_error() {
        let xml = r#"<Envelope xmlns="urn:other"><Body/></Envelope>"#;
        let err = parse_envelope(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, WsSecurityError::Decode(_)));
    }

    #[test]
    fn test_xxe_rejected() {
        let xml = r#"<?xml version="1.0"?>
<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>&xxe;</soap:Body>
</soap:Envelope>"#;
        let err = parse_envelope(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, WsSecurityError::Decode(_)));
    }

    #[test]
    fn test_parse_security_header_timestamp() {
        let parsed = parse_envelope(ENVELOPE.as_bytes()).unwrap();
        let elements = parse_security_header(parsed.security_inner.as_deref().unwrap()).unwrap();
        assert_eq!(elements.len(), 1);
        match &elements[0].kind {
            HeaderElementKind::Timestamp(ts) => {
                assert_eq!(ts.id.as_deref(), Some("TS-1"));
                assert_eq!(ts.created.as_deref(), Some("2025-01-01T00:00:00Z"));
                assert_eq!(ts.expires.as_deref(), Some("2025-01-01T00:05:00Z"));
            }
            other => panic!("expected timestamp, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_signature_element() {
        let inner = r##"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#" Id="SIG-1">
  <ds:SignedInfo>
    <ds:SignatureMethod Algorithm="http://www.w3.org/2000/09/xmldsig#hmac-sha1"/>
    <ds:Reference URI="#body-1"/>
  </ds:SignedInfo>
  <ds:SignatureValue>AAEC</ds:SignatureValue>
  <ds:KeyInfo>
    <wsse:SecurityTokenReference>
      <wsc:Identifier>urn:uuid:6ba7b810-9dad-11d1-80b4-00c04fd430c8</wsc:Identifier>
    </wsse:SecurityTokenReference>
  </ds:KeyInfo>
  <wsse:Nonce>QUJDRA==</wsse:Nonce>
</ds:Signature>"##;
        let elements = parse_security_header(inner).unwrap();
        assert_eq!(elements.len(), 1);
        match &elements[0].kind {
            HeaderElementKind::Signature(sig) => {
                assert_eq!(sig.id.as_deref(), Some("SIG-1"));
                assert_eq!(sig.reference, "body-1");
                assert_eq!(sig.algorithm, crate::crypto::algorithms::HMAC_SHA1);
                assert_eq!(sig.signature_value, vec![0u8, 1, 2]);
                assert_eq!(sig.nonce.as_deref(), Some(b"ABCD".as_slice()));
                assert!(matches!(
                    sig.key_info,
                    Some(KeyIdentifierClause::SecurityContext { .. })
                ));
            }
            other => panic!("expected signature, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_derived_key_token() {
        let inner = r#"<wsc:DerivedKeyToken wsu:Id="DKT-1" Algorithm="http://schemas.xmlsoap.org/ws/2005/02/sc/dk/p_sha1">
  <wsse:SecurityTokenReference>
    <wsc:Identifier>urn:uuid:6ba7b810-9dad-11d1-80b4-00c04fd430c8</wsc:Identifier>
  </wsse:SecurityTokenReference>
  <wsc:Generation>1</wsc:Generation>
  <wsc:Offset>0</wsc:Offset>
  <wsc:Length>32</wsc:Length>
  <wsc:Label>WS-SecureConversation</wsc:Label>
  <wsc:Nonce>QUJDRA==</wsc:Nonce>
</wsc:DerivedKeyToken>"#;
        let elements = parse_security_header(inner).unwrap();
        match &elements[0].kind {
            HeaderElementKind::DerivedKeyToken(dkt) => {
                assert_eq!(dkt.id.as_deref(), Some("DKT-1"));
                assert_eq!(dkt.generation, 1);
                assert_eq!(dkt.length, 32);
                assert_eq!(dkt.label, b"WS-SecureConversation");
                assert_eq!(dkt.nonce, b"ABCD");
                assert!(dkt.source.is_some());
            }
            other => panic!("expected derived key token, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_element_preserved() {
        let inner = r#"<custom:Thing xmlns:custom="urn:custom" soap:mustUnderstand="1" xmlns:soap="s"/>"#;
        let elements = parse_security_header(inner).unwrap();
        match &elements[0].kind {
            HeaderElementKind::Unknown(u) => {
                assert_eq!(u.local_name, "Thing");
                assert!(u.must_understand);
            }
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_positions_follow_document_order() {
        let inner = r#"<wsu:Timestamp wsu:Id="TS-1"><wsu:Created>x</wsu:Created></wsu:Timestamp>
<ds:Signature Id="SIG-1"><ds:SignatureValue>AA==</ds:SignatureValue></ds:Signature>"#;
        let elements = parse_security_header(inner).unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].position, 0);
        assert_eq!(elements[1].position, 1);
        assert!(matches!(elements[0].kind, HeaderElementKind::Timestamp(_)));
        assert!(matches!(elements[1].kind, HeaderElementKind::Signature(_)));
    }

    #[test]
    fn test_foreign_namespace_lookalike_is_unknown() {
        // Local name alone does not classify; the namespace must match too.
        let inner = r#"<ds:Signature xmlns:ds="urn:not-dsig"><ds:SignatureValue>AA==</ds:SignatureValue></ds:Signature>
<xenc:EncryptedData xmlns:xenc="urn:not-xenc"/>"#;
        let elements = parse_security_header(inner).unwrap();
        assert_eq!(elements.len(), 2);
        for element in &elements {
            assert!(matches!(element.kind, HeaderElementKind::Unknown(_)));
        }
    }

    fn signature(id: &str, reference: &str, role: Option<&str>) -> SecurityHeaderElement {
        SecurityHeaderElement {
            position: 0,
            binding_mode: None,
            kind: HeaderElementKind::Signature(SignatureElement {
                id: Some(id.to_string()),
                reference: reference.to_string(),
                declared_role: role.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_lax_inference_single_primary() {
        let mut elements = vec![signature("SIG-1", "body-1", None)];
        LaxInferenceEngine.assign(&mut elements).unwrap();
        assert_eq!(elements[0].binding_mode, Some(BindingMode::Primary));
    }

    #[test]
    fn test_lax_inference_endorsing() {
        let mut elements = vec![
            signature("SIG-1", "body-1", None),
            signature("SIG-2", "SIG-1", None),
        ];
        LaxInferenceEngine.assign(&mut elements).unwrap();
        assert_eq!(elements[0].binding_mode, Some(BindingMode::Primary));
        assert_eq!(elements[1].binding_mode, Some(BindingMode::Endorsing));
    }

    #[test]
    fn test_lax_inference_two_primaries_rejected() {
        let mut elements = vec![
            signature("SIG-1", "body-1", None),
            signature("SIG-2", "body-1", None),
        ];
        let err = LaxInferenceEngine.assign(&mut elements).unwrap_err();
        assert!(matches!(err, WsSecurityError::Validation(_)));
    }

    #[test]
    fn test_strict_inference_requires_declared_roles() {
        let mut undeclared = vec![signature("SIG-1", "body-1", None)];
        assert!(StrictInferenceEngine.assign(&mut undeclared).is_err());

        let mut declared = vec![
            signature("SIG-1", "body-1", Some("primary")),
            signature("SIG-2", "SIG-1", Some("endorsing")),
        ];
        StrictInferenceEngine.assign(&mut declared).unwrap();
        assert_eq!(declared[0].binding_mode, Some(BindingMode::Primary));
        assert_eq!(declared[1].binding_mode, Some(BindingMode::Endorsing));
    }

    #[test]
    fn test_strict_inference_duplicate_primary_rejected() {
        let mut elements = vec![
            signature("SIG-1", "body-1", Some("primary")),
            signature("SIG-2", "body-1", Some("primary")),
        ];
        assert!(StrictInferenceEngine.assign(&mut elements).is_err());
    }
}
