//! Outgoing message protection.
//!
//! The body reaches exactly one of four terminal states, determined by the
//! sign/encrypt intent and the configured protection order. The signed bytes
//! bind the timestamp fields and the replay nonce to the canonical body
//! fragment; under encrypt-then-sign that fragment contains the serialized
//! ciphertext element, so a receiver with a mismatched order fails closed on
//! the MAC comparison.

use crate::config::{EngineConfig, InferenceMode, ProtectionOrder};
use crate::crypto::{self, algorithms};
use crate::derived::DerivedKeyDescriptor;
use crate::error::{Result, WsSecurityError};
use crate::header::{BindingMode, SoapVersion};
use crate::token::{KeyIdentifierClause, SecurityToken};
use crate::writer::{canonical_body, signing_input, EnvelopeWriter};
use crate::xml_escape;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rand::RngCore;
use tracing::debug;
use uuid::Uuid;

/// Label bound into every derived key, per WS-SecureConversation.
pub const DERIVATION_LABEL: &[u8] = b"WS-SecureConversation";

const SIGNATURE_NONCE_LEN: usize = 16;
const DERIVATION_NONCE_LEN: usize = 16;

/// Terminal body states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyTransform {
    Plain,
    Signed,
    Encrypted,
    SignedThenEncrypted,
    EncryptedThenSigned,
}

impl BodyTransform {
    /// Resolve the intent and protection order to a terminal state.
    pub fn resolve(sign: bool, encrypt: bool, order: ProtectionOrder) -> Self {
        match (sign, encrypt) {
            (false, false) => Self::Plain,
            (true, false) => Self::Signed,
            (false, true) => Self::Encrypted,
            (true, true) => match order {
                ProtectionOrder::SignThenEncrypt => Self::SignedThenEncrypted,
                ProtectionOrder::EncryptThenSign => Self::EncryptedThenSigned,
            },
        }
    }
}

/// Produces protected envelopes from a body and a protection intent.
pub struct OutgoingHeaderPipeline<'a> {
    config: &'a EngineConfig,
    token: SecurityToken,
    endorsements: Vec<SecurityToken>,
    soap_version: SoapVersion,
    use_derived_keys: bool,
}

impl<'a> OutgoingHeaderPipeline<'a> {
    pub fn new(config: &'a EngineConfig, token: SecurityToken) -> Self {
        Self {
            config,
            token,
            endorsements: Vec::new(),
            soap_version: SoapVersion::Soap11,
            use_derived_keys: false,
        }
    }

    /// Add an endorsing supporting token. Each one produces a signature over
    /// the primary signature's value.
    pub fn with_endorsement(mut self, token: SecurityToken) -> Self {
        self.endorsements.push(token);
        self
    }

    pub fn with_soap_version(mut self, version: SoapVersion) -> Self {
        self.soap_version = version;
        self
    }

    /// Derive per-message keys from the token instead of using its key
    /// directly. Requires a 32-byte token key either way.
    pub fn with_derived_keys(mut self, use_derived: bool) -> Self {
        self.use_derived_keys = use_derived;
        self
    }

    /// Protect `body_content` and emit a complete envelope. `body_id` is
    /// reused when the caller already has one (reply flows keep the inbound
    /// id stable); otherwise a fresh id is generated.
    pub fn secure(
        &self,
        body_id: Option<&str>,
        body_content: &str,
        sign: bool,
        encrypt: bool,
    ) -> Result<String> {
        let transform = BodyTransform::resolve(sign, encrypt, self.config.protection_order);
        let body_id = body_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("id-{}", Uuid::new_v4()));
        debug!(?transform, body_id = %body_id, "securing outgoing message");

        let mut writer = EnvelopeWriter::new(self.soap_version);
        writer.start_envelope()?;
        writer.start_header()?;

        let created = Utc::now();
        let expires = created + ChronoDuration::seconds(self.config.timestamp_ttl_secs as i64);
        let created = created.to_rfc3339_opts(SecondsFormat::Millis, true);
        let expires = expires.to_rfc3339_opts(SecondsFormat::Millis, true);
        let timestamp_id = format!("TS-{}", Uuid::new_v4());
        writer.write_header_element(&emit_timestamp(&timestamp_id, &created, &expires))?;

        if let SecurityToken::Context(sct) = &self.token {
            writer.write_header_element(&emit_context_token(
                &format!("SCT-{}", Uuid::new_v4()),
                sct.context_id,
                sct.key_generation,
            ))?;
        }

        let signing = self.message_key(&mut writer, sign)?;
        let encryption = self.message_key(&mut writer, encrypt)?;

        // Body protection happens on buffered fragments, so signing can see
        // either the plaintext or the ciphertext element as ordered.
        writer.end_header()?;
        writer.start_body(&body_id)?;
        writer.write_body_content(body_content)?;
        writer.end_body()?;

        let mut signature_fragment = None;
        match transform {
            BodyTransform::Plain => {}
            BodyTransform::Signed => {
                let canonical = writer.body_fragment()?;
                signature_fragment =
                    Some(self.sign_fragment(&body_id, &canonical, &created, &expires, &signing)?);
            }
            BodyTransform::Encrypted => {
                let ciphertext = self.encrypt_fragment(body_content, &encryption)?;
                writer.replace_body_content(ciphertext)?;
            }
            BodyTransform::SignedThenEncrypted => {
                let canonical = canonical_body(&body_id, body_content);
                signature_fragment =
                    Some(self.sign_fragment(&body_id, &canonical, &created, &expires, &signing)?);
                let ciphertext = self.encrypt_fragment(body_content, &encryption)?;
                writer.replace_body_content(ciphertext)?;
            }
            BodyTransform::EncryptedThenSigned => {
                let ciphertext = self.encrypt_fragment(body_content, &encryption)?;
                let canonical = canonical_body(&body_id, &ciphertext);
                writer.replace_body_content(ciphertext)?;
                signature_fragment =
                    Some(self.sign_fragment(&body_id, &canonical, &created, &expires, &signing)?);
            }
        }

        // The signature exists only after the body is final, so it is
        // spliced in at the end of the already-closed security header.
        let envelope = writer.finish()?;
        match signature_fragment {
            None => Ok(envelope),
            Some(fragment) => {
                let marker = "</wsse:Security>";
                let at = envelope.find(marker).ok_or_else(|| {
                    WsSecurityError::Usage("security header missing from envelope".to_string())
                })?;
                let mut out = String::with_capacity(envelope.len() + fragment.len());
                out.push_str(&envelope[..at]);
                out.push_str(&fragment);
                out.push_str(&envelope[at..]);
                Ok(out)
            }
        }
    }

    /// Key material for one use, emitting a DerivedKeyToken when derivation
    /// is enabled. `wanted = false` skips the work entirely.
    fn message_key(&self, writer: &mut EnvelopeWriter, wanted: bool) -> Result<MessageKey> {
        if !wanted {
            return Ok(MessageKey {
                key: Vec::new(),
                clause_id: None,
            });
        }
        if !self.use_derived_keys {
            return Ok(MessageKey {
                key: self.token.key().to_vec(),
                clause_id: None,
            });
        }

        let mut nonce = [0u8; DERIVATION_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let dkt_id = format!("DKT-{}", Uuid::new_v4());
        let descriptor = DerivedKeyDescriptor::new(
            0,
            0,
            crypto::KEY_LEN,
            DERIVATION_LABEL,
            &nonce,
            algorithms::P_SHA256,
            self.token.key(),
        )?;
        let key = crypto::derive_key(
            &descriptor.algorithm,
            self.token.key(),
            &descriptor.label,
            &descriptor.nonce,
            descriptor.offset,
            descriptor.length,
        )?;
        writer.write_header_element(&emit_derived_key_token(
            &dkt_id,
            &self.token,
            &descriptor,
        ))?;
        Ok(MessageKey {
            key,
            clause_id: Some(dkt_id),
        })
    }

    fn sign_fragment(
        &self,
        body_id: &str,
        canonical: &str,
        created: &str,
        expires: &str,
        signing: &MessageKey,
    ) -> Result<String> {
        let algorithm = algorithms::HMAC_SHA256;
        let mut nonce = [0u8; SIGNATURE_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        // The MAC covers the timestamp and the nonce along with the body, so
        // a replayed message cannot be refreshed with new header fields.
        let input = signing_input(created, expires, &nonce, canonical);
        let primary_value = crypto::mac(algorithm, &signing.key, &input)?;

        let primary_id = format!("SIG-{}", Uuid::new_v4());
        let mut out = emit_signature(&SignatureParams {
            id: &primary_id,
            reference: body_id,
            algorithm,
            value: &primary_value,
            nonce: Some(&nonce),
            clause: self.key_clause(signing),
            role: self.role_attr(BindingMode::Primary),
        });

        // Endorsing signatures cover the primary's signature value.
        for token in &self.endorsements {
            let value = crypto::mac(algorithm, token.key(), &primary_value)?;
            out.push_str(&emit_signature(&SignatureParams {
                id: &format!("SIG-{}", Uuid::new_v4()),
                reference: &primary_id,
                algorithm,
                value: &value,
                nonce: None,
                clause: token_clause(token),
                role: self.role_attr(BindingMode::Endorsing),
            }));
        }
        Ok(out)
    }

    fn encrypt_fragment(&self, plaintext: &str, encryption: &MessageKey) -> Result<String> {
        let ciphertext = crypto::encrypt(&encryption.key, plaintext.as_bytes())?;
        // Without a derived key the receiver resolves the key out-of-band:
        // by local token id, or through the header's context token.
        let key_ref = encryption.clause_id.as_deref().or(match &self.token {
            SecurityToken::Symmetric { id, .. } => Some(id.as_str()),
            SecurityToken::Context(_) => None,
        });
        Ok(emit_encrypted_data(
            &format!("ED-{}", Uuid::new_v4()),
            None,
            key_ref,
            algorithms::AES256_GCM,
            &ciphertext,
        ))
    }

    fn key_clause(&self, key: &MessageKey) -> KeyIdentifierClause {
        match &key.clause_id {
            Some(id) => KeyIdentifierClause::LocalId(id.clone()),
            None => token_clause(&self.token),
        }
    }

    /// Role attributes are only meaningful to the strict inference engine;
    /// lax receivers ignore them.
    fn role_attr(&self, role: BindingMode) -> Option<&'static str> {
        (self.config.inference_mode == InferenceMode::Strict).then(|| role.as_str())
    }
}

struct MessageKey {
    key: Vec<u8>,
    /// Local id of the DerivedKeyToken that produced this key, when derived.
    clause_id: Option<String>,
}

fn token_clause(token: &SecurityToken) -> KeyIdentifierClause {
    match token {
        SecurityToken::Context(sct) => KeyIdentifierClause::SecurityContext {
            context_id: sct.context_id,
            key_generation: sct.key_generation,
        },
        SecurityToken::Symmetric { id, .. } => KeyIdentifierClause::LocalId(id.clone()),
    }
}

fn emit_timestamp(id: &str, created: &str, expires: &str) -> String {
    format!(
        r#"<wsu:Timestamp wsu:Id="{}"><wsu:Created>{created}</wsu:Created><wsu:Expires>{expires}</wsu:Expires></wsu:Timestamp>"#,
        xml_escape(id),
    )
}

fn emit_context_token(id: &str, context_id: Uuid, key_generation: Option<Uuid>) -> String {
    let instance = key_generation
        .map(|generation| format!("<wsc:Instance>urn:uuid:{generation}</wsc:Instance>"))
        .unwrap_or_default();
    format!(
        r#"<wsc:SecurityContextToken wsu:Id="{}"><wsc:Identifier>urn:uuid:{context_id}</wsc:Identifier>{instance}</wsc:SecurityContextToken>"#,
        xml_escape(id)
    )
}

fn emit_token_reference(clause: &KeyIdentifierClause) -> String {
    let inner = match clause {
        KeyIdentifierClause::LocalId(id) => {
            format!(r##"<wsse:Reference URI="#{}"/>"##, xml_escape(id))
        }
        KeyIdentifierClause::SecurityContext {
            context_id,
            key_generation,
        } => {
            let instance = key_generation
                .map(|generation| format!("<wsc:Instance>urn:uuid:{generation}</wsc:Instance>"))
                .unwrap_or_default();
            format!("<wsc:Identifier>urn:uuid:{context_id}</wsc:Identifier>{instance}")
        }
    };
    format!("<wsse:SecurityTokenReference>{inner}</wsse:SecurityTokenReference>")
}

fn emit_derived_key_token(
    id: &str,
    source: &SecurityToken,
    descriptor: &DerivedKeyDescriptor,
) -> String {
    format!(
        r#"<wsc:DerivedKeyToken wsu:Id="{}" Algorithm="{}">{}<wsc:Generation>{}</wsc:Generation><wsc:Offset>{}</wsc:Offset><wsc:Length>{}</wsc:Length><wsc:Label>{}</wsc:Label><wsc:Nonce>{}</wsc:Nonce></wsc:DerivedKeyToken>"#,
        xml_escape(id),
        xml_escape(&descriptor.algorithm),
        emit_token_reference(&token_clause(source)),
        descriptor.generation,
        descriptor.offset,
        descriptor.length,
        xml_escape(&String::from_utf8_lossy(&descriptor.label)),
        BASE64.encode(&descriptor.nonce),
    )
}

struct SignatureParams<'a> {
    id: &'a str,
    reference: &'a str,
    algorithm: &'a str,
    value: &'a [u8],
    nonce: Option<&'a [u8]>,
    clause: KeyIdentifierClause,
    role: Option<&'static str>,
}

fn emit_signature(params: &SignatureParams) -> String {
    let role = params
        .role
        .map(|r| format!(r#" wsse:Role="{r}""#))
        .unwrap_or_default();
    let nonce = params
        .nonce
        .map(|n| format!("<wsse:Nonce>{}</wsse:Nonce>", BASE64.encode(n)))
        .unwrap_or_default();
    format!(
        r##"<ds:Signature wsu:Id="{}"{role}><ds:SignedInfo><ds:SignatureMethod Algorithm="{}"/><ds:Reference URI="#{}"/></ds:SignedInfo><ds:SignatureValue>{}</ds:SignatureValue><ds:KeyInfo>{}</ds:KeyInfo>{nonce}</ds:Signature>"##,
        xml_escape(params.id),
        xml_escape(params.algorithm),
        xml_escape(params.reference),
        BASE64.encode(params.value),
        emit_token_reference(&params.clause),
    )
}

fn emit_encrypted_data(
    id: &str,
    target: Option<&str>,
    key_ref: Option<&str>,
    algorithm: &str,
    ciphertext: &[u8],
) -> String {
    let target = target
        .map(|t| format!(r##" Target="#{}""##, xml_escape(t)))
        .unwrap_or_default();
    let key_ref = key_ref
        .map(|k| format!(r##" KeyRef="#{}""##, xml_escape(k)))
        .unwrap_or_default();
    format!(
        r#"<xenc:EncryptedData wsu:Id="{}"{target}{key_ref}><xenc:EncryptionMethod Algorithm="{}"/><xenc:CipherData><xenc:CipherValue>{}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedData>"#,
        xml_escape(id),
        xml_escape(algorithm),
        BASE64.encode(ciphertext),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{parse_envelope, parse_security_header, HeaderElementKind};

    fn symmetric_token() -> SecurityToken {
        SecurityToken::Symmetric {
            id: "tok-1".to_string(),
            key: vec![0x11; crypto::KEY_LEN],
        }
    }

    #[test]
    fn test_body_transform_resolution() {
        use BodyTransform::*;
        assert_eq!(
            BodyTransform::resolve(false, false, ProtectionOrder::SignThenEncrypt),
            Plain
        );
        assert_eq!(
            BodyTransform::resolve(true, false, ProtectionOrder::EncryptThenSign),
            Signed
        );
        assert_eq!(
            BodyTransform::resolve(false, true, ProtectionOrder::SignThenEncrypt),
            Encrypted
        );
        assert_eq!(
            BodyTransform::resolve(true, true, ProtectionOrder::SignThenEncrypt),
            SignedThenEncrypted
        );
        assert_eq!(
            BodyTransform::resolve(true, true, ProtectionOrder::EncryptThenSign),
            EncryptedThenSigned
        );
    }

    #[test]
    fn test_signed_envelope_structure() {
        let config = EngineConfig::default();
        let pipeline = OutgoingHeaderPipeline::new(&config, symmetric_token());
        let xml = pipeline
            .secure(Some("body-1"), "<m:Ping>hi</m:Ping>", true, false)
            .unwrap();

        let parsed = parse_envelope(xml.as_bytes()).unwrap();
        assert_eq!(parsed.body_id.as_deref(), Some("body-1"));
        assert_eq!(parsed.body_inner, "<m:Ping>hi</m:Ping>");

        let elements = parse_security_header(parsed.security_inner.as_deref().unwrap()).unwrap();
        let signature = elements
            .iter()
            .find_map(|el| match &el.kind {
                HeaderElementKind::Signature(sig) => Some(sig),
                _ => None,
            })
            .unwrap();
        assert_eq!(signature.reference, "body-1");
        assert!(signature.nonce.is_some());

        // The signature value verifies against the timestamp, the nonce, and
        // the canonical body.
        let ts = elements
            .iter()
            .find_map(|el| match &el.kind {
                HeaderElementKind::Timestamp(ts) => Some(ts),
                _ => None,
            })
            .unwrap();
        let input = signing_input(
            ts.created.as_deref().unwrap(),
            ts.expires.as_deref().unwrap(),
            signature.nonce.as_deref().unwrap(),
            &canonical_body("body-1", "<m:Ping>hi</m:Ping>"),
        );
        let expected =
            crypto::mac(&signature.algorithm, &[0x11; crypto::KEY_LEN], &input).unwrap();
        assert_eq!(signature.signature_value, expected);
    }

    #[test]
    fn test_encrypted_body_replaces_content() {
        let config = EngineConfig::default();
        let pipeline = OutgoingHeaderPipeline::new(&config, symmetric_token());
        let xml = pipeline
            .secure(None, "<m:Secret>42</m:Secret>", false, true)
            .unwrap();

        assert!(!xml.contains("<m:Secret>"));
        let parsed = parse_envelope(xml.as_bytes()).unwrap();
        let body_elements = parse_security_header(&parsed.body_inner).unwrap();
        match &body_elements[0].kind {
            HeaderElementKind::EncryptedData(ed) => {
                let plaintext =
                    crypto::decrypt(&[0x11; crypto::KEY_LEN], &ed.ciphertext).unwrap();
                assert_eq!(plaintext, b"<m:Secret>42</m:Secret>");
            }
            other => panic!("expected encrypted body, got {other:?}"),
        }
    }

    #[test]
    fn test_timestamp_always_present() {
        let config = EngineConfig::default();
        let pipeline = OutgoingHeaderPipeline::new(&config, symmetric_token());
        let xml = pipeline.secure(None, "<Op/>", false, false).unwrap();
        let parsed = parse_envelope(xml.as_bytes()).unwrap();
        let elements = parse_security_header(parsed.security_inner.as_deref().unwrap()).unwrap();
        assert!(elements
            .iter()
            .any(|el| matches!(el.kind, HeaderElementKind::Timestamp(_))));
    }

    #[test]
    fn test_derived_key_token_emitted_and_usable() {
        let config = EngineConfig::default();
        let pipeline =
            OutgoingHeaderPipeline::new(&config, symmetric_token()).with_derived_keys(true);
        let xml = pipeline.secure(Some("b"), "<Op/>", true, false).unwrap();

        let parsed = parse_envelope(xml.as_bytes()).unwrap();
        let elements = parse_security_header(parsed.security_inner.as_deref().unwrap()).unwrap();
        let dkt = elements
            .iter()
            .find_map(|el| match &el.kind {
                HeaderElementKind::DerivedKeyToken(dkt) => Some(dkt),
                _ => None,
            })
            .unwrap();
        let signature = elements
            .iter()
            .find_map(|el| match &el.kind {
                HeaderElementKind::Signature(sig) => Some(sig),
                _ => None,
            })
            .unwrap();
        // The signature's key info points at the derived key token.
        assert_eq!(
            signature.key_info,
            Some(KeyIdentifierClause::LocalId(dkt.id.clone().unwrap()))
        );

        let derived = crypto::derive_key(
            &dkt.algorithm,
            &[0x11; crypto::KEY_LEN],
            &dkt.label,
            &dkt.nonce,
            dkt.offset,
            dkt.length,
        )
        .unwrap();
        let ts = elements
            .iter()
            .find_map(|el| match &el.kind {
                HeaderElementKind::Timestamp(ts) => Some(ts),
                _ => None,
            })
            .unwrap();
        let input = signing_input(
            ts.created.as_deref().unwrap(),
            ts.expires.as_deref().unwrap(),
            signature.nonce.as_deref().unwrap(),
            &canonical_body("b", "<Op/>"),
        );
        let expected = crypto::mac(&signature.algorithm, &derived, &input).unwrap();
        assert_eq!(signature.signature_value, expected);
    }

    #[test]
    fn test_strict_mode_declares_roles() {
        let config = EngineConfig {
            inference_mode: InferenceMode::Strict,
            ..EngineConfig::default()
        };
        let endorser = SecurityToken::Symmetric {
            id: "endorser".to_string(),
            key: vec![0x22; crypto::KEY_LEN],
        };
        let pipeline =
            OutgoingHeaderPipeline::new(&config, symmetric_token()).with_endorsement(endorser);
        let xml = pipeline.secure(Some("b"), "<Op/>", true, false).unwrap();
        assert!(xml.contains(r#"wsse:Role="primary""#));
        assert!(xml.contains(r#"wsse:Role="endorsing""#));
    }

    #[test]
    fn test_endorsing_signature_covers_primary_value() {
        let config = EngineConfig::default();
        let endorser_key = vec![0x22; crypto::KEY_LEN];
        let endorser = SecurityToken::Symmetric {
            id: "endorser".to_string(),
            key: endorser_key.clone(),
        };
        let pipeline =
            OutgoingHeaderPipeline::new(&config, symmetric_token()).with_endorsement(endorser);
        let xml = pipeline.secure(Some("b"), "<Op/>", true, false).unwrap();

        let parsed = parse_envelope(xml.as_bytes()).unwrap();
        let elements = parse_security_header(parsed.security_inner.as_deref().unwrap()).unwrap();
        let signatures: Vec<_> = elements
            .iter()
            .filter_map(|el| match &el.kind {
                HeaderElementKind::Signature(sig) => Some(sig),
                _ => None,
            })
            .collect();
        assert_eq!(signatures.len(), 2);
        let primary = signatures[0];
        let endorsing = signatures[1];
        assert_eq!(endorsing.reference, primary.id.clone().unwrap());
        let expected = crypto::mac(
            &endorsing.algorithm,
            &endorser_key,
            &primary.signature_value,
        )
        .unwrap();
        assert_eq!(endorsing.signature_value, expected);
    }
}
