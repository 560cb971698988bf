//! Container type registry
//!
//! Maps container signatures to the 64-bit type hash stamped into every
//! block header. The registry is populated explicitly: [`TypeRegistry::with_builtin`]
//! at startup, then [`TypeRegistry::register`] for each application type.
//! Creating a container or loading an image fails with `UnknownSignature`
//! for types that were never registered.

use crate::btree::Shape;
use crate::containers::{
    AllocShape, MapShape, MultimapShape, SetShape, VectorShape, WeightedShape,
};
use crate::packed::Fixed;
use crate::{CoreError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// First 8 bytes of the BLAKE3 hash of a signature, little-endian
pub fn type_hash(signature: &str) -> u64 {
    let hash = blake3::hash(signature.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// A container signature with its type hash
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    text: String,
    hash: u64,
}

impl Signature {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let hash = type_hash(&text);
        Self { text, hash }
    }

    /// Signature of a shape
    pub fn of<S: Shape>() -> Self {
        Self::new(S::signature())
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn type_hash(&self) -> u64 {
        self.hash
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} #{:016x})", self.text, self.hash)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Registry of known container types
#[derive(Default)]
pub struct TypeRegistry {
    entries: RwLock<HashMap<u64, Signature>>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("signatures", &self.entries.read().len())
            .finish()
    }
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in container instantiations
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register_builtin();
        registry
    }

    fn register_builtin(&self) {
        let builtin = [
            Signature::of::<MapShape<u64, u64>>(),
            Signature::of::<MapShape<u64, String>>(),
            Signature::of::<MapShape<u64, Vec<u8>>>(),
            Signature::of::<MapShape<String, u64>>(),
            Signature::of::<MapShape<String, String>>(),
            Signature::of::<MapShape<String, Vec<u8>>>(),
            Signature::of::<MapShape<Fixed<u64>, Fixed<u64>>>(),
            Signature::of::<VectorShape<u64>>(),
            Signature::of::<VectorShape<String>>(),
            Signature::of::<VectorShape<Vec<u8>>>(),
            Signature::of::<SetShape<u64>>(),
            Signature::of::<SetShape<String>>(),
            Signature::of::<MultimapShape<u64, u64>>(),
            Signature::of::<MultimapShape<String, String>>(),
            Signature::of::<WeightedShape<u64>>(),
            Signature::of::<WeightedShape<String>>(),
            Signature::of::<AllocShape>(),
        ];
        let mut entries = self.entries.write();
        for signature in builtin {
            entries.insert(signature.type_hash(), signature);
        }
    }

    /// Register the container type described by a shape
    pub fn register<S: Shape>(&self) -> Result<Signature> {
        let signature = Signature::of::<S>();
        self.register_signature(signature.clone())?;
        Ok(signature)
    }

    /// Register a signature by text
    pub fn register_signature(&self, signature: Signature) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.get(&signature.type_hash()) {
            Some(existing) if existing.as_str() != signature.as_str() => {
                Err(CoreError::Configuration(format!(
                    "type hash collision between {} and {}",
                    existing, signature
                )))
            }
            Some(_) => Ok(()),
            None => {
                tracing::debug!(signature = %signature, "registered container type");
                entries.insert(signature.type_hash(), signature);
                Ok(())
            }
        }
    }

    /// Look up a registered signature by text
    pub fn lookup(&self, text: &str) -> Option<Signature> {
        self.entries
            .read()
            .get(&type_hash(text))
            .filter(|s| s.as_str() == text)
            .cloned()
    }

    /// Look up a registered signature by the hash found in a block header
    pub fn lookup_hash(&self, hash: u64) -> Option<Signature> {
        self.entries.read().get(&hash).cloned()
    }

    /// Look up a signature, failing with `UnknownSignature`
    pub fn require(&self, text: &str) -> Result<Signature> {
        self.lookup(text)
            .ok_or_else(|| CoreError::UnknownSignature(text.to_string()))
    }

    pub fn contains(&self, text: &str) -> bool {
        self.lookup(text).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All registered signatures, sorted by text
    pub fn signatures(&self) -> Vec<Signature> {
        let mut all: Vec<_> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| a.text.cmp(&b.text));
        all
    }

    /// Remove every registration
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures_are_stable_text() {
        assert_eq!(
            MapShape::<u64, String>::signature(),
            "map<pairs<var_u64,utf8>>"
        );
        assert_eq!(AllocShape::signature(), "allocmap<bitmap>");
        assert_ne!(
            Signature::of::<MapShape<u64, u64>>().type_hash(),
            Signature::of::<MultimapShape<u64, u64>>().type_hash()
        );
    }

    #[test]
    fn test_builtin_registry() {
        let registry = TypeRegistry::with_builtin();
        assert!(registry.contains("allocmap<bitmap>"));
        assert!(registry.contains(&SetShape::<String>::signature()));
        assert!(!registry.contains(&SetShape::<i64>::signature()));

        let sig = registry.register::<SetShape<i64>>().unwrap();
        assert_eq!(registry.lookup_hash(sig.type_hash()), Some(sig));
    }

    #[test]
    fn test_clear_and_require() {
        let registry = TypeRegistry::with_builtin();
        assert!(!registry.is_empty());
        registry.clear();
        assert!(matches!(
            registry.require("allocmap<bitmap>"),
            Err(CoreError::UnknownSignature(_))
        ));
    }
}
