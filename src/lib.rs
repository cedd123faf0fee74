//! Message-level WS-Security engine.
//!
//! Verifies and produces protected SOAP envelopes: signature verification
//! with replay rejection, body encryption in a configurable protection
//! order, secure-conversation session tokens with per-message derived keys,
//! and the expiring caches backing all of it.
//!
//! The [`MessageSecurityEngine`] facade owns the caches and builds the
//! per-message pipelines; the staged types in [`incoming`] and the
//! [`outgoing::OutgoingHeaderPipeline`] are available directly when finer
//! control is needed.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod derived;
pub mod error;
pub mod header;
pub mod incoming;
pub mod outgoing;
pub mod replay;
pub mod session;
pub mod token;
pub mod writer;

pub use config::{EngineConfig, InferenceMode, ProtectionOrder};
pub use derived::{DerivedKeyCache, DerivedKeyDescriptor};
pub use error::{
    security_fault_response, xml_escape, FaultKind, Result, SoapFaultVersion, WsSecurityError,
};
pub use header::{BindingMode, SoapVersion};
pub use incoming::{IncomingContext, IncomingHeaderPipeline, VerifiedMessage};
pub use outgoing::{BodyTransform, OutgoingHeaderPipeline};
pub use replay::ReplayNonceCache;
pub use session::{SecurityContextToken, SessionTokenCache};
pub use token::{
    AuthorizationPolicySet, KeyIdentifierClause, SecurityToken, SessionTokenResolver,
    StaticKeyResolver, TimeWindowValidator, TokenResolver, TokenValidator,
};

use token::AggregateResolver;
use tracing::error;

/// Owns the long-lived security state and runs the message pipelines.
///
/// One engine per listener. All state is instance-scoped; two engines never
/// share caches.
pub struct MessageSecurityEngine {
    config: EngineConfig,
    sessions: SessionTokenCache,
    derived_keys: DerivedKeyCache,
    replay: ReplayNonceCache,
    validator: TimeWindowValidator,
}

impl MessageSecurityEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            sessions: SessionTokenCache::new(&config.session_cache, config.clock_skew_secs),
            derived_keys: DerivedKeyCache::new(config.derived_key_ring_size),
            replay: ReplayNonceCache::new(&config.replay),
            validator: TimeWindowValidator::new(config.clock_skew_secs),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a secure-conversation session token for later messages.
    pub fn register_session(&self, token: &SecurityContextToken) -> Result<()> {
        self.sessions.add_or_replace(token)
    }

    /// Drop one session generation; with `must_exist`, absence is an error.
    pub fn cancel_session(
        &self,
        context_id: uuid::Uuid,
        key_generation: Option<uuid::Uuid>,
        must_exist: bool,
    ) -> Result<()> {
        self.sessions.remove(context_id, key_generation, must_exist)
    }

    pub fn sessions(&self) -> &SessionTokenCache {
        &self.sessions
    }

    /// Verify an incoming envelope. Session tokens resolve from the engine's
    /// cache; `extra_resolver` supplies out-of-band keys and wins on ties.
    pub fn verify(
        &self,
        data: &[u8],
        extra_resolver: &dyn TokenResolver,
    ) -> Result<VerifiedMessage> {
        let session_resolver = SessionTokenResolver::new(&self.sessions);
        let resolver = AggregateResolver::new()
            .push(extra_resolver)
            .push(&session_resolver);
        let ctx = IncomingContext {
            config: &self.config,
            resolver: &resolver,
            validator: &self.validator,
            derived_keys: &self.derived_keys,
            replay: &self.replay,
        };
        IncomingHeaderPipeline::new(ctx).process(data)
    }

    /// Protect an outgoing body under `token` with the configured order.
    pub fn secure(
        &self,
        token: SecurityToken,
        body_id: Option<&str>,
        body_content: &str,
        sign: bool,
        encrypt: bool,
    ) -> Result<String> {
        OutgoingHeaderPipeline::new(&self.config, token).secure(body_id, body_content, sign, encrypt)
    }

    /// Render a rejected message's fault envelope. Usage errors are caller
    /// bugs, not message faults, and pass back through unchanged.
    pub fn fault_for(
        &self,
        err: WsSecurityError,
        version: SoapVersion,
    ) -> std::result::Result<String, WsSecurityError> {
        if !err.is_message_rejectable() {
            return Err(err);
        }
        error!(error = %err, "rejecting message");
        let fault_version = match version {
            SoapVersion::Soap11 => SoapFaultVersion::Soap11,
            SoapVersion::Soap12 => SoapFaultVersion::Soap12,
        };
        Ok(security_fault_response(&err, fault_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    fn session_token(context_id: Uuid) -> SecurityContextToken {
        let now = Utc::now();
        SecurityContextToken {
            context_id,
            key_generation: None,
            key: vec![0x33; crypto::KEY_LEN],
            valid_from: now - ChronoDuration::seconds(1),
            valid_to: now + ChronoDuration::seconds(600),
            key_effective: now - ChronoDuration::seconds(1),
            key_expiration: now + ChronoDuration::seconds(600),
        }
    }

    #[test]
    fn test_engine_session_round_trip() {
        let engine = MessageSecurityEngine::new(EngineConfig::default());
        let token = session_token(Uuid::new_v4());
        engine.register_session(&token).unwrap();

        let xml = engine
            .secure(
                SecurityToken::Context(token.clone()),
                None,
                "<m:Echo>payload</m:Echo>",
                true,
                true,
            )
            .unwrap();
        let verified = engine
            .verify(xml.as_bytes(), &StaticKeyResolver::new())
            .unwrap();
        assert!(verified.signed);
        assert!(verified.encrypted);
        assert_eq!(verified.body, "<m:Echo>payload</m:Echo>");
        let policy = verified.policy.unwrap();
        assert_eq!(policy.identities, vec![format!("urn:uuid:{}", token.context_id)]);
    }

    #[test]
    fn test_engine_unknown_session_rejected() {
        let engine = MessageSecurityEngine::new(EngineConfig::default());
        let token = session_token(Uuid::new_v4());
        // Not registered with the receiving engine.
        let xml = engine
            .secure(SecurityToken::Context(token), None, "<Op/>", true, false)
            .unwrap();
        let other = MessageSecurityEngine::new(EngineConfig::default());
        let err = other
            .verify(xml.as_bytes(), &StaticKeyResolver::new())
            .unwrap_err();
        assert!(matches!(err, WsSecurityError::Validation(_)));
    }

    #[test]
    fn test_engine_cancel_session() {
        let engine = MessageSecurityEngine::new(EngineConfig::default());
        let token = session_token(Uuid::new_v4());
        engine.register_session(&token).unwrap();
        engine.cancel_session(token.context_id, None, true).unwrap();
        assert!(engine
            .cancel_session(token.context_id, None, true)
            .is_err());
    }

    #[test]
    fn test_fault_for_rejectable_error() {
        let engine = MessageSecurityEngine::new(EngineConfig::default());
        let fault = engine
            .fault_for(
                WsSecurityError::Validation("signature verification failed"),
                SoapVersion::Soap11,
            )
            .unwrap();
        assert!(fault.contains("INVALID_SECURITY"));

        let usage = engine.fault_for(
            WsSecurityError::Usage("bad call".to_string()),
            SoapVersion::Soap11,
        );
        assert!(usage.is_err());
    }
}
