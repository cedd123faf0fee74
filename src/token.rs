//! External token interfaces consumed by the pipelines.
//!
//! Token resolution and validation are collaborators, not part of the core:
//! the pipelines talk to them through these traits, and a per-message
//! resolver is usually an aggregate merged from supporting tokens, session
//! tokens, and out-of-band resolvers.

use crate::error::{Result, WsSecurityError};
use crate::session::{SecurityContextToken, SessionTokenCache};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

/// How a token is referenced from a security header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyIdentifierClause {
    /// Reference by `wsu:Id` within the current message.
    LocalId(String),
    /// Reference by secure-conversation context id and key generation.
    SecurityContext {
        context_id: Uuid,
        key_generation: Option<Uuid>,
    },
}

/// A resolved security token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityToken {
    /// A secure-conversation session token.
    Context(SecurityContextToken),
    /// A bare symmetric key known under a local identifier.
    Symmetric { id: String, key: Vec<u8> },
}

impl SecurityToken {
    /// The symmetric key material carried by this token.
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Context(token) => &token.key,
            Self::Symmetric { key, .. } => key,
        }
    }

    /// The context id, when this is a session token.
    pub fn context_id(&self) -> Option<Uuid> {
        match self {
            Self::Context(token) => Some(token.context_id),
            Self::Symmetric { .. } => None,
        }
    }
}

/// Resolves key identifier clauses to tokens or raw keys.
pub trait TokenResolver: Send + Sync {
    fn resolve(&self, clause: &KeyIdentifierClause) -> Option<SecurityToken>;

    fn resolve_key(&self, clause: &KeyIdentifierClause) -> Option<Vec<u8>> {
        self.resolve(clause).map(|token| token.key().to_vec())
    }
}

/// Validates a resolved token and produces its authorization policies.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &SecurityToken) -> Result<AuthorizationPolicySet>;
}

/// Opaque authorization handle attached to a verified message. Policy
/// evaluation itself happens outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPolicySet {
    pub id: Uuid,
    pub expiration: DateTime<Utc>,
    /// Identities granted by the validated token.
    pub identities: Vec<String>,
}

/// Resolver over a fixed set of symmetric keys, as supplied out-of-band.
#[derive(Default)]
pub struct StaticKeyResolver {
    keys: Vec<(String, Vec<u8>)>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, id: impl Into<String>, key: Vec<u8>) -> Self {
        self.keys.push((id.into(), key));
        self
    }
}

impl TokenResolver for StaticKeyResolver {
    fn resolve(&self, clause: &KeyIdentifierClause) -> Option<SecurityToken> {
        match clause {
            KeyIdentifierClause::LocalId(id) => self
                .keys
                .iter()
                .find(|(known, _)| known == id)
                .map(|(id, key)| SecurityToken::Symmetric {
                    id: id.clone(),
                    key: key.clone(),
                }),
            KeyIdentifierClause::SecurityContext { .. } => None,
        }
    }
}

/// Resolver backed by the session token cache.
pub struct SessionTokenResolver<'a> {
    cache: &'a SessionTokenCache,
}

impl<'a> SessionTokenResolver<'a> {
    pub fn new(cache: &'a SessionTokenCache) -> Self {
        Self { cache }
    }
}

impl TokenResolver for SessionTokenResolver<'_> {
    fn resolve(&self, clause: &KeyIdentifierClause) -> Option<SecurityToken> {
        match clause {
            KeyIdentifierClause::SecurityContext {
                context_id,
                key_generation,
            } => self
                .cache
                .get(*context_id, *key_generation)
                .map(SecurityToken::Context),
            KeyIdentifierClause::LocalId(_) => None,
        }
    }
}

/// Resolver merged from several others; the first hit wins, in order.
#[derive(Default)]
pub struct AggregateResolver<'a> {
    resolvers: Vec<&'a dyn TokenResolver>,
}

impl<'a> AggregateResolver<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, resolver: &'a dyn TokenResolver) -> Self {
        self.resolvers.push(resolver);
        self
    }
}

impl TokenResolver for AggregateResolver<'_> {
    fn resolve(&self, clause: &KeyIdentifierClause) -> Option<SecurityToken> {
        self.resolvers.iter().find_map(|r| r.resolve(clause))
    }
}

/// Default validator: checks time-effectiveness of session tokens and grants
/// a policy handle naming the context.
pub struct TimeWindowValidator {
    skew: ChronoDuration,
}

impl TimeWindowValidator {
    pub fn new(clock_skew_secs: u64) -> Self {
        Self {
            skew: ChronoDuration::seconds(clock_skew_secs as i64),
        }
    }
}

impl TokenValidator for TimeWindowValidator {
    fn validate(&self, token: &SecurityToken) -> Result<AuthorizationPolicySet> {
        match token {
            SecurityToken::Context(sct) => {
                if !sct.is_time_effective(Utc::now(), self.skew) {
                    return Err(WsSecurityError::Validation(
                        "security token validation failed",
                    ));
                }
                Ok(AuthorizationPolicySet {
                    id: Uuid::new_v4(),
                    expiration: sct.valid_to,
                    identities: vec![format!("urn:uuid:{}", sct.context_id)],
                })
            }
            SecurityToken::Symmetric { id, .. } => Ok(AuthorizationPolicySet {
                id: Uuid::new_v4(),
                expiration: Utc::now() + self.skew,
                identities: vec![id.clone()],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sct(context_id: Uuid, valid_secs: i64) -> SecurityContextToken {
        let now = Utc::now();
        SecurityContextToken {
            context_id,
            key_generation: None,
            key: vec![1u8; 32],
            valid_from: now - ChronoDuration::seconds(1),
            valid_to: now + ChronoDuration::seconds(valid_secs),
            key_effective: now - ChronoDuration::seconds(1),
            key_expiration: now + ChronoDuration::seconds(valid_secs),
        }
    }

    #[test]
    fn test_static_key_resolver() {
        let resolver = StaticKeyResolver::new().with_key("kek-1", vec![9u8; 32]);
        let token = resolver
            .resolve(&KeyIdentifierClause::LocalId("kek-1".into()))
            .unwrap();
        assert_eq!(token.key(), &[9u8; 32]);
        assert!(resolver
            .resolve(&KeyIdentifierClause::LocalId("other".into()))
            .is_none());
    }

    #[test]
    fn test_session_resolver_hits_cache() {
        let cache = SessionTokenCache::new(&crate::config::SessionCacheConfig::default(), 300);
        let token = sct(Uuid::new_v4(), 600);
        cache.add_or_replace(&token).unwrap();

        let resolver = SessionTokenResolver::new(&cache);
        let resolved = resolver
            .resolve(&KeyIdentifierClause::SecurityContext {
                context_id: token.context_id,
                key_generation: None,
            })
            .unwrap();
        assert_eq!(resolved.context_id(), Some(token.context_id));
        assert_eq!(resolved.key(), token.key.as_slice());
    }

    #[test]
    fn test_aggregate_first_hit_wins() {
        let a = StaticKeyResolver::new().with_key("k", vec![1u8; 32]);
        let b = StaticKeyResolver::new().with_key("k", vec![2u8; 32]);
        let merged = AggregateResolver::new().push(&a).push(&b);
        let token = merged
            .resolve(&KeyIdentifierClause::LocalId("k".into()))
            .unwrap();
        assert_eq!(token.key(), &[1u8; 32]);
    }

    #[test]
    fn test_time_window_validator() {
        let validator = TimeWindowValidator::new(0);
        let good = SecurityToken::Context(sct(Uuid::new_v4(), 600));
        assert!(validator.validate(&good).is_ok());

        let mut expired = sct(Uuid::new_v4(), 600);
        expired.valid_to = Utc::now() - ChronoDuration::seconds(10);
        let err = validator
            .validate(&SecurityToken::Context(expired))
            .unwrap_err();
        assert!(matches!(err, WsSecurityError::Validation(_)));
    }
}
