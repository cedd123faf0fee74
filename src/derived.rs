//! Ring cache for derived key material.
//!
//! Derived keys live exactly as long as their parent session, so this is a
//! small fixed-size ring rather than an expiring cache. Derivation is lazy:
//! a slot initially holds the source key bytes and computes the derived key
//! on first lookup, after which only the raw derived bytes are retained.

use crate::crypto;
use crate::error::{Result, WsSecurityError};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

/// Identifies one derived key. Two descriptors denote the same key iff all
/// fields are equal, source-key identity included (byte-equal sources have
/// equal fingerprints).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKeyDescriptor {
    pub generation: u32,
    pub offset: usize,
    pub length: usize,
    pub label: Vec<u8>,
    pub nonce: Vec<u8>,
    pub algorithm: String,
    pub source_key_fingerprint: [u8; 32],
}

impl DerivedKeyDescriptor {
    /// Build a descriptor for `source_key`. The algorithm URI is validated
    /// here so that later derivation cannot fail.
    pub fn new(
        generation: u32,
        offset: usize,
        length: usize,
        label: &[u8],
        nonce: &[u8],
        algorithm: &str,
        source_key: &[u8],
    ) -> Result<Self> {
        if !crypto::is_supported_derivation(algorithm) {
            return Err(WsSecurityError::Usage(format!(
                "unsupported derivation algorithm: {algorithm}"
            )));
        }
        if length == 0 {
            return Err(WsSecurityError::Usage(
                "derived key length must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            generation,
            offset,
            length,
            label: label.to_vec(),
            nonce: nonce.to_vec(),
            algorithm: algorithm.to_string(),
            source_key_fingerprint: crypto::fingerprint(source_key),
        })
    }
}

struct SlotState {
    /// Derived key material, computed at most once.
    key: OnceLock<Vec<u8>>,
    /// Source key bytes, held only until the derived key exists. The lock is
    /// slot-local so concurrent derivations of different slots don't block
    /// each other.
    source: Mutex<Option<Vec<u8>>>,
}

struct Slot {
    descriptor: DerivedKeyDescriptor,
    state: Arc<SlotState>,
}

struct Ring {
    slots: Vec<Option<Slot>>,
    write_index: usize,
}

/// Fixed-capacity ring of derived keys. Insert overwrites the next slot
/// unconditionally; lookup takes the first structural match in scan order.
pub struct DerivedKeyCache {
    ring: RwLock<Ring>,
}

impl DerivedKeyCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            ring: RwLock::new(Ring {
                slots,
                write_index: 0,
            }),
        }
    }

    /// Insert a descriptor with its source key, overwriting the slot at the
    /// wrapping write index. No duplicate search is performed; a transient
    /// duplicate is harmless because lookup stops at the first match.
    pub fn insert(&self, descriptor: DerivedKeyDescriptor, source_key: Vec<u8>) {
        let mut ring = self
            .ring
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = ring.write_index % ring.slots.len();
        ring.slots[index] = Some(Slot {
            descriptor,
            state: Arc::new(SlotState {
                key: OnceLock::new(),
                source: Mutex::new(Some(source_key)),
            }),
        });
        ring.write_index = ring.write_index.wrapping_add(1);
    }

    /// Find previously registered key material for `descriptor`, deriving it
    /// on first use. Returns `None` when no slot matches structurally.
    pub fn lookup(&self, descriptor: &DerivedKeyDescriptor) -> Option<Vec<u8>> {
        let state = {
            let ring = self
                .ring
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            ring.slots
                .iter()
                .flatten()
                .find(|slot| &slot.descriptor == descriptor)
                .map(|slot| Arc::clone(&slot.state))?
        };

        if let Some(key) = state.key.get() {
            return Some(key.clone());
        }

        // Slot-local lock: concurrent requests for this key serialize here
        // without touching the ring or other slots.
        let mut source = state
            .source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(key) = state.key.get() {
            return Some(key.clone());
        }
        let source_key = source.as_ref()?;
        let derived = crypto::derive_key(
            &descriptor.algorithm,
            source_key,
            &descriptor.label,
            &descriptor.nonce,
            descriptor.offset,
            descriptor.length,
        )
        .ok()?;
        let _ = state.key.set(derived.clone());
        // Only the derived bytes are retained from here on.
        *source = None;
        Some(derived)
    }

    /// Look up, inserting and deriving when absent.
    pub fn get_or_derive(
        &self,
        descriptor: &DerivedKeyDescriptor,
        source_key: &[u8],
    ) -> Result<Vec<u8>> {
        if let Some(key) = self.lookup(descriptor) {
            return Ok(key);
        }
        self.insert(descriptor.clone(), source_key.to_vec());
        if let Some(key) = self.lookup(descriptor) {
            return Ok(key);
        }
        // Another insert raced ours out of the ring; derive without caching.
        crypto::derive_key(
            &descriptor.algorithm,
            source_key,
            &descriptor.label,
            &descriptor.nonce,
            descriptor.offset,
            descriptor.length,
        )
    }
}
