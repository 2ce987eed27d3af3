use async_trait::async_trait;

use crate::types::Address;

/// Algorithm constant named in §6: ECDSA on secp256k1 over plain bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigningAlgorithm {
    EcdsaSecp256k1,
}

/// Opaque handle returned by `resolve_key`, passed back unexamined into
/// `sign` (§6 `KeyManager`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub String);

#[async_trait]
pub trait KeyManager: Send + Sync {
    async fn resolve_key(
        &self,
        identifier: &str,
        algorithm: SigningAlgorithm,
    ) -> Result<(KeyHandle, Address), String>;

    async fn sign(&self, key: &KeyHandle, unsigned_tx: &[u8]) -> Result<Vec<u8>, String>;
}
