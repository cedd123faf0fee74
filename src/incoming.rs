//! Incoming message verification.
//!
//! Processing is a staged pipeline where each stage is its own type, so a
//! caller cannot verify protection before subheaders are decrypted or infer
//! bindings before derived-key stubs exist. Every stage consumes its
//! predecessor; there is no way to re-enter an earlier pass.
//!
//! Passes, in order: read and classify, unwrap transported keys, decrypt
//! encrypted subheaders, register derived-key stubs, infer binding modes,
//! process body protection.

use crate::config::{EngineConfig, ProtectionOrder};
use crate::crypto;
use crate::derived::{DerivedKeyCache, DerivedKeyDescriptor};
use crate::error::{Result, WsSecurityError};
use crate::header::{
    inference_engine, parse_envelope, parse_security_header, BindingMode, EncryptedDataElement,
    HeaderElementKind, SecurityHeaderElement, SignatureElement, SoapVersion, TimestampElement,
};
use crate::replay::ReplayNonceCache;
use crate::token::{AuthorizationPolicySet, KeyIdentifierClause, SecurityToken, TokenResolver, TokenValidator};
use crate::writer::{canonical_body, signing_input};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Collaborators shared by every pass.
pub struct IncomingContext<'a> {
    pub config: &'a EngineConfig,
    pub resolver: &'a dyn TokenResolver,
    pub validator: &'a dyn TokenValidator,
    pub derived_keys: &'a DerivedKeyCache,
    pub replay: &'a ReplayNonceCache,
}

/// A verified message: decrypted body plus the authorization produced by
/// validating the signing token.
#[derive(Debug, Clone)]
pub struct VerifiedMessage {
    pub version: SoapVersion,
    pub body_id: Option<String>,
    pub body: String,
    pub policy: Option<AuthorizationPolicySet>,
    pub signed: bool,
    pub encrypted: bool,
}

/// Entry point chaining all passes.
pub struct IncomingHeaderPipeline<'a> {
    ctx: IncomingContext<'a>,
}

impl<'a> IncomingHeaderPipeline<'a> {
    pub fn new(ctx: IncomingContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn process(&self, data: &[u8]) -> Result<VerifiedMessage> {
        ReadMessage::read(data)?
            .decrypt_subheaders(&self.ctx)?
            .resolve_derived_stubs(&self.ctx)?
            .mark_bindings(&self.ctx)?
            .process_protection(&self.ctx)
    }
}

/// Stage 1 output: parsed envelope with classified header elements.
pub struct ReadMessage {
    version: SoapVersion,
    body_id: Option<String>,
    body_inner: String,
    elements: Vec<SecurityHeaderElement>,
    had_security: bool,
}

impl ReadMessage {
    /// Parse and classify. A header element the engine does not understand
    /// is tolerated unless it demands understanding.
    pub fn read(data: &[u8]) -> Result<Self> {
        let envelope = parse_envelope(data)?;
        let (elements, had_security) = match envelope.security_inner.as_deref() {
            Some(inner) => (parse_security_header(inner)?, true),
            None => (Vec::new(), false),
        };

        for element in &elements {
            if let HeaderElementKind::Unknown(unknown) = &element.kind {
                if unknown.must_understand {
                    return Err(WsSecurityError::Decode(format!(
                        "unsupported header element {} requires understanding",
                        unknown.local_name
                    )));
                }
            }
        }

        Ok(Self {
            version: envelope.version,
            body_id: envelope.body_id,
            body_inner: envelope.body_inner,
            elements,
            had_security,
        })
    }

    /// Stages 2 and 3: unwrap transported keys, then decrypt encrypted
    /// subheaders in place. Decrypted fragments are reclassified and take
    /// the position of the ciphertext element that carried them.
    pub fn decrypt_subheaders(self, ctx: &IncomingContext<'_>) -> Result<DecryptedHeader> {
        let mut local_keys: HashMap<String, Vec<u8>> = HashMap::new();
        for element in &self.elements {
            if let HeaderElementKind::EncryptedKey(ek) = &element.kind {
                let kek_ref = ek.kek_ref.as_deref().ok_or(WsSecurityError::Validation(
                    "encrypted key without key reference",
                ))?;
                let kek = ctx
                    .resolver
                    .resolve_key(&KeyIdentifierClause::LocalId(kek_ref.to_string()))
                    .ok_or(WsSecurityError::Validation("key encryption key not found"))?;
                let wrapped = crypto::decrypt(&kek, &ek.ciphertext)?;
                if let Some(id) = &ek.id {
                    local_keys.insert(id.clone(), wrapped);
                }
            }
        }

        let mut elements = Vec::with_capacity(self.elements.len());
        for element in self.elements {
            match element.kind {
                HeaderElementKind::EncryptedData(ed) => {
                    let key = subheader_key(&ed, &elements, &local_keys, ctx)?;
                    let plaintext = crypto::decrypt(&key, &ed.ciphertext)?;
                    let fragment = String::from_utf8(plaintext).map_err(|_| {
                        WsSecurityError::Validation("decrypted subheader is not valid UTF-8")
                    })?;
                    debug!("decrypted security subheader");
                    elements.extend(parse_security_header(&fragment)?);
                }
                kind => elements.push(SecurityHeaderElement {
                    position: 0,
                    binding_mode: element.binding_mode,
                    kind,
                }),
            }
        }
        for (position, element) in elements.iter_mut().enumerate() {
            element.position = position;
        }

        Ok(DecryptedHeader {
            version: self.version,
            body_id: self.body_id,
            body_inner: self.body_inner,
            elements,
            local_keys,
            had_security: self.had_security,
        })
    }
}

/// Key for an encrypted subheader: its key reference resolved against
/// transported keys, derived-key tokens seen so far, or the resolver.
fn subheader_key(
    ed: &EncryptedDataElement,
    seen: &[SecurityHeaderElement],
    local_keys: &HashMap<String, Vec<u8>>,
    ctx: &IncomingContext<'_>,
) -> Result<Vec<u8>> {
    let key_ref = ed.key_ref.as_deref().ok_or(WsSecurityError::Validation(
        "encrypted subheader without key reference",
    ))?;
    if let Some(key) = local_keys.get(key_ref) {
        return Ok(key.clone());
    }
    for element in seen {
        if let HeaderElementKind::DerivedKeyToken(dkt) = &element.kind {
            if dkt.id.as_deref() == Some(key_ref) {
                let source = resolve_source_key(dkt.source.as_ref(), local_keys, ctx)?;
                return crypto::derive_key(
                    &dkt.algorithm,
                    &source,
                    &dkt.label,
                    &dkt.nonce,
                    dkt.offset,
                    dkt.length,
                );
            }
        }
    }
    ctx.resolver
        .resolve_key(&KeyIdentifierClause::LocalId(key_ref.to_string()))
        .ok_or(WsSecurityError::Validation("decryption key not found"))
}

fn resolve_source_key(
    clause: Option<&KeyIdentifierClause>,
    local_keys: &HashMap<String, Vec<u8>>,
    ctx: &IncomingContext<'_>,
) -> Result<Vec<u8>> {
    let clause = clause.ok_or(WsSecurityError::Validation(
        "derived key token without source reference",
    ))?;
    if let KeyIdentifierClause::LocalId(id) = clause {
        if let Some(key) = local_keys.get(id) {
            return Ok(key.clone());
        }
    }
    ctx.resolver
        .resolve_key(clause)
        .ok_or(WsSecurityError::Validation("derivation source key not found"))
}

/// Stage 3 output: fully decrypted header.
pub struct DecryptedHeader {
    version: SoapVersion,
    body_id: Option<String>,
    body_inner: String,
    elements: Vec<SecurityHeaderElement>,
    local_keys: HashMap<String, Vec<u8>>,
    had_security: bool,
}

impl DecryptedHeader {
    /// Stage 4: register a lazy derivation stub for every derived-key token
    /// and cross-check context references against header context tokens.
    pub fn resolve_derived_stubs(self, ctx: &IncomingContext<'_>) -> Result<ResolvedHeader> {
        let header_contexts: Vec<Uuid> = self
            .elements
            .iter()
            .filter_map(|el| match &el.kind {
                HeaderElementKind::ContextToken(sct) => Some(sct.context_id),
                _ => None,
            })
            .collect();
        for element in &self.elements {
            let clause = match &element.kind {
                HeaderElementKind::Signature(sig) => sig.key_info.as_ref(),
                HeaderElementKind::DerivedKeyToken(dkt) => dkt.source.as_ref(),
                _ => None,
            };
            if let Some(KeyIdentifierClause::SecurityContext { context_id, .. }) = clause {
                if !header_contexts.is_empty() && !header_contexts.contains(context_id) {
                    return Err(WsSecurityError::Validation("security context mismatch"));
                }
            }
        }

        let mut derived: HashMap<String, DerivedStub> = HashMap::new();
        for element in &self.elements {
            if let HeaderElementKind::DerivedKeyToken(dkt) = &element.kind {
                let Some(id) = dkt.id.clone() else { continue };
                let source_key = resolve_source_key(dkt.source.as_ref(), &self.local_keys, ctx)?;
                let descriptor = DerivedKeyDescriptor::new(
                    dkt.generation,
                    dkt.offset,
                    dkt.length,
                    &dkt.label,
                    &dkt.nonce,
                    &dkt.algorithm,
                    &source_key,
                )?;
                // Stub only: the key itself is derived on first use.
                ctx.derived_keys.insert(descriptor.clone(), source_key);
                derived.insert(
                    id,
                    DerivedStub {
                        descriptor,
                        source: dkt.source.clone(),
                    },
                );
            }
        }

        Ok(ResolvedHeader {
            version: self.version,
            body_id: self.body_id,
            body_inner: self.body_inner,
            elements: self.elements,
            local_keys: self.local_keys,
            derived,
            had_security: self.had_security,
        })
    }
}

struct DerivedStub {
    descriptor: DerivedKeyDescriptor,
    /// Underlying token reference, kept for authorization of signatures
    /// made with the derived key.
    source: Option<KeyIdentifierClause>,
}

/// Stage 4 output: header with derivation stubs registered.
pub struct ResolvedHeader {
    version: SoapVersion,
    body_id: Option<String>,
    body_inner: String,
    elements: Vec<SecurityHeaderElement>,
    local_keys: HashMap<String, Vec<u8>>,
    derived: HashMap<String, DerivedStub>,
    had_security: bool,
}

impl ResolvedHeader {
    /// Stage 5: assign binding modes with the configured inference engine.
    pub fn mark_bindings(mut self, ctx: &IncomingContext<'_>) -> Result<MarkedHeader> {
        inference_engine(ctx.config.inference_mode).assign(&mut self.elements)?;
        Ok(MarkedHeader {
            version: self.version,
            body_id: self.body_id,
            body_inner: self.body_inner,
            elements: self.elements,
            local_keys: self.local_keys,
            derived: self.derived,
            had_security: self.had_security,
        })
    }
}

/// Stage 5 output: every signature carries a binding mode.
pub struct MarkedHeader {
    version: SoapVersion,
    body_id: Option<String>,
    body_inner: String,
    elements: Vec<SecurityHeaderElement>,
    local_keys: HashMap<String, Vec<u8>>,
    derived: HashMap<String, DerivedStub>,
    had_security: bool,
}

impl MarkedHeader {
    /// Stage 6: timestamp freshness, signature verification in the
    /// configured protection order, replay claim, body decryption, and
    /// token validation.
    pub fn process_protection(self, ctx: &IncomingContext<'_>) -> Result<VerifiedMessage> {
        if !self.had_security {
            if ctx.config.require_primary_signature || ctx.config.require_timestamp {
                return Err(WsSecurityError::Validation("security header required"));
            }
            return Ok(VerifiedMessage {
                version: self.version,
                body_id: self.body_id,
                body: self.body_inner,
                policy: None,
                signed: false,
                encrypted: false,
            });
        }

        self.check_timestamp(ctx)?;

        let primary = self.elements.iter().find_map(|el| match &el.kind {
            HeaderElementKind::Signature(sig)
                if el.binding_mode == Some(BindingMode::Primary) =>
            {
                Some(sig)
            }
            _ => None,
        });
        if primary.is_none() && ctx.config.require_primary_signature {
            return Err(WsSecurityError::Validation("primary signature required"));
        }

        let encrypted_body = encrypted_body_element(&self.body_inner);
        let encrypted = encrypted_body.is_some();

        let mut policy = None;
        let body = match primary {
            Some(primary) => {
                let (signing_key, token) = self.signing_key(primary, ctx)?;
                let body = self.verify_primary(primary, &signing_key, encrypted_body, ctx)?;

                // Nonce is claimed only after the signature holds, so an
                // unauthenticated replay of the bytes cannot burn the slot.
                let nonce = primary.nonce.as_deref().ok_or(WsSecurityError::Validation(
                    "primary signature nonce required",
                ))?;
                if !ctx.replay.claim(nonce)? {
                    return Err(WsSecurityError::Validation("message replay detected"));
                }

                self.verify_endorsements(primary, ctx)?;

                if let Some(token) = token {
                    policy = Some(ctx.validator.validate(&token)?);
                }
                body
            }
            None => match encrypted_body {
                Some(ed) => {
                    let key = self.body_decryption_key(&ed, None, ctx)?;
                    let plaintext = crypto::decrypt(&key, &ed.ciphertext)?;
                    String::from_utf8(plaintext).map_err(|_| {
                        WsSecurityError::Validation("decrypted body is not valid UTF-8")
                    })?
                }
                None => self.body_inner.clone(),
            },
        };

        Ok(VerifiedMessage {
            version: self.version,
            body_id: self.body_id,
            body,
            policy,
            signed: primary.is_some(),
            encrypted,
        })
    }

    fn timestamp(&self) -> Option<&TimestampElement> {
        self.elements.iter().find_map(|el| match &el.kind {
            HeaderElementKind::Timestamp(ts) => Some(ts),
            _ => None,
        })
    }

    fn check_timestamp(&self, ctx: &IncomingContext<'_>) -> Result<()> {
        let Some(timestamp) = self.timestamp() else {
            if ctx.config.require_timestamp {
                return Err(WsSecurityError::Validation("security timestamp required"));
            }
            return Ok(());
        };

        let created = parse_instant(timestamp.created.as_deref(), "Created")?;
        let expires = parse_instant(timestamp.expires.as_deref(), "Expires")?;
        let now = Utc::now();
        let skew = ChronoDuration::seconds(ctx.config.clock_skew_secs as i64);

        if now > expires + skew {
            return Err(WsSecurityError::Validation("security timestamp expired"));
        }
        if created > now + skew {
            warn!("security timestamp from the future");
            return Err(WsSecurityError::Validation(
                "security timestamp not yet valid",
            ));
        }
        let max_age = ChronoDuration::seconds(ctx.config.max_timestamp_age_secs as i64);
        if now - created > max_age + skew {
            return Err(WsSecurityError::Validation("security timestamp too old"));
        }
        Ok(())
    }

    /// Resolve the primary signing key and, when one exists, the token that
    /// authorizes the message.
    fn signing_key(
        &self,
        signature: &SignatureElement,
        ctx: &IncomingContext<'_>,
    ) -> Result<(Vec<u8>, Option<SecurityToken>)> {
        let clause = signature.key_info.as_ref().ok_or(WsSecurityError::Validation(
            "signature key reference missing",
        ))?;
        self.resolve_clause(clause, ctx)
    }

    fn resolve_clause(
        &self,
        clause: &KeyIdentifierClause,
        ctx: &IncomingContext<'_>,
    ) -> Result<(Vec<u8>, Option<SecurityToken>)> {
        if let KeyIdentifierClause::LocalId(id) = clause {
            if let Some(stub) = self.derived.get(id) {
                let key = ctx
                    .derived_keys
                    .lookup(&stub.descriptor)
                    .ok_or(WsSecurityError::Validation("derived key unavailable"))?;
                let token = stub
                    .source
                    .as_ref()
                    .and_then(|source| ctx.resolver.resolve(source));
                return Ok((key, token));
            }
            if let Some(key) = self.local_keys.get(id) {
                return Ok((key.clone(), None));
            }
        }
        let token = ctx
            .resolver
            .resolve(clause)
            .ok_or(WsSecurityError::Validation("security token not found"))?;
        Ok((token.key().to_vec(), Some(token)))
    }

    /// Verify the primary signature in the configured protection order and
    /// return the plaintext body.
    fn verify_primary(
        &self,
        signature: &SignatureElement,
        signing_key: &[u8],
        encrypted_body: Option<EncryptedDataElement>,
        ctx: &IncomingContext<'_>,
    ) -> Result<String> {
        if !crypto::is_supported_mac(&signature.algorithm) {
            return Err(WsSecurityError::Validation(
                "unsupported signature algorithm",
            ));
        }
        let body_id = self
            .body_id
            .as_deref()
            .ok_or(WsSecurityError::Validation("signed body has no id"))?;
        if signature.reference != body_id {
            return Err(WsSecurityError::Validation(
                "primary signature does not cover the body",
            ));
        }

        match (ctx.config.protection_order, encrypted_body) {
            // Signature covers the plaintext: decrypt first, then verify.
            (ProtectionOrder::SignThenEncrypt, Some(ed)) => {
                let key = self.body_decryption_key(&ed, Some(signing_key), ctx)?;
                let plaintext = crypto::decrypt(&key, &ed.ciphertext)?;
                let body = String::from_utf8(plaintext).map_err(|_| {
                    WsSecurityError::Validation("decrypted body is not valid UTF-8")
                })?;
                self.check_mac(signature, signing_key, &canonical_body(body_id, &body))?;
                Ok(body)
            }
            // Signature covers the ciphertext element: verify, then decrypt.
            (ProtectionOrder::EncryptThenSign, Some(ed)) => {
                self.check_mac(
                    signature,
                    signing_key,
                    &canonical_body(body_id, &self.body_inner),
                )?;
                let key = self.body_decryption_key(&ed, Some(signing_key), ctx)?;
                let plaintext = crypto::decrypt(&key, &ed.ciphertext)?;
                String::from_utf8(plaintext).map_err(|_| {
                    WsSecurityError::Validation("decrypted body is not valid UTF-8")
                })
            }
            (_, None) => {
                self.check_mac(
                    signature,
                    signing_key,
                    &canonical_body(body_id, &self.body_inner),
                )?;
                Ok(self.body_inner.clone())
            }
        }
    }

    /// The signed input binds the timestamp fields and the replay nonce to
    /// the canonical body; a message with any of them altered, stripped, or
    /// swapped no longer matches the signature value.
    fn check_mac(
        &self,
        signature: &SignatureElement,
        key: &[u8],
        canonical: &str,
    ) -> Result<()> {
        let (created, expires) = match self.timestamp() {
            Some(ts) => (
                ts.created.as_deref().unwrap_or_default(),
                ts.expires.as_deref().unwrap_or_default(),
            ),
            None => ("", ""),
        };
        let nonce = signature.nonce.as_deref().unwrap_or_default();
        let input = signing_input(created, expires, nonce, canonical);
        let expected = crypto::mac(&signature.algorithm, key, &input)?;
        if !crypto::constant_time_eq(&expected, &signature.signature_value) {
            return Err(WsSecurityError::Validation("signature verification failed"));
        }
        Ok(())
    }

    /// Endorsing signatures cover the primary signature's value bytes.
    fn verify_endorsements(
        &self,
        primary: &SignatureElement,
        ctx: &IncomingContext<'_>,
    ) -> Result<()> {
        for element in &self.elements {
            let HeaderElementKind::Signature(sig) = &element.kind else {
                continue;
            };
            if !matches!(
                element.binding_mode,
                Some(BindingMode::Endorsing | BindingMode::SignedEndorsing)
            ) {
                continue;
            }
            if sig.reference != primary.id.clone().unwrap_or_default() {
                return Err(WsSecurityError::Validation(
                    "endorsing signature does not cover the primary",
                ));
            }
            let clause = sig.key_info.as_ref().ok_or(WsSecurityError::Validation(
                "signature key reference missing",
            ))?;
            let (key, _) = self.resolve_clause(clause, ctx)?;
            let expected = crypto::mac(&sig.algorithm, &key, &primary.signature_value)?;
            if !crypto::constant_time_eq(&expected, &sig.signature_value) {
                return Err(WsSecurityError::Validation(
                    "endorsing signature verification failed",
                ));
            }
        }
        Ok(())
    }

    /// Key for an encrypted body: the key reference when present, the
    /// primary signing key as fallback, then the sole header context token.
    fn body_decryption_key(
        &self,
        ed: &EncryptedDataElement,
        signing_key: Option<&[u8]>,
        ctx: &IncomingContext<'_>,
    ) -> Result<Vec<u8>> {
        if let Some(key_ref) = ed.key_ref.as_deref() {
            let (key, _) =
                self.resolve_clause(&KeyIdentifierClause::LocalId(key_ref.to_string()), ctx)?;
            return Ok(key);
        }
        if let Some(key) = signing_key {
            return Ok(key.to_vec());
        }
        let contexts: Vec<_> = self
            .elements
            .iter()
            .filter_map(|el| match &el.kind {
                HeaderElementKind::ContextToken(sct) => Some(sct),
                _ => None,
            })
            .collect();
        if let [sct] = contexts.as_slice() {
            let clause = KeyIdentifierClause::SecurityContext {
                context_id: sct.context_id,
                key_generation: sct.key_generation,
            };
            let (key, _) = self.resolve_clause(&clause, ctx)?;
            return Ok(key);
        }
        Err(WsSecurityError::Validation(
            "encryption key reference missing",
        ))
    }
}

/// The body content when it is a single encrypted element.
fn encrypted_body_element(body_inner: &str) -> Option<EncryptedDataElement> {
    if !body_inner.contains("EncryptedData") {
        return None;
    }
    let elements = parse_security_header(body_inner).ok()?;
    match elements.into_iter().next() {
        Some(SecurityHeaderElement {
            kind: HeaderElementKind::EncryptedData(ed),
            ..
        }) => Some(ed),
        _ => None,
    }
}

fn parse_instant(value: Option<&str>, field: &str) -> Result<DateTime<Utc>> {
    let value = value.ok_or_else(|| {
        WsSecurityError::Decode(format!("security timestamp missing {field}"))
    })?;
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| WsSecurityError::Decode(format!("invalid timestamp {field}: {value}")))
}
