use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::info::ContentId;
use crate::constants::{HASH_LEN, SIGNING_TOKEN_LEN};

/// A signed statement that at `view_length` bytes the data's merkle root is
/// `view_root_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewSignature {
    view_length: u64,
    view_root_hash: [u8; HASH_LEN],
    signature: Signature,
}

impl ViewSignature {
    pub fn new(view_length: u64, view_root_hash: [u8; HASH_LEN], signature: Signature) -> Self {
        Self {
            view_length,
            view_root_hash,
            signature,
        }
    }

    pub fn view_length(&self) -> u64 {
        self.view_length
    }

    pub fn view_root_hash(&self) -> &[u8; HASH_LEN] {
        &self.view_root_hash
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

/// Builds the 48-byte token signed for a view:
/// `content id ‖ view length (big-endian u64) ‖ root hash`.
pub fn signing_token(
    content_id: &ContentId,
    view_length: u64,
    root: &[u8; HASH_LEN],
) -> [u8; SIGNING_TOKEN_LEN] {
    let mut token = [0u8; SIGNING_TOKEN_LEN];
    token[..HASH_LEN].copy_from_slice(content_id.as_bytes());
    token[HASH_LEN..HASH_LEN + 8].copy_from_slice(&view_length.to_be_bytes());
    token[HASH_LEN + 8..].copy_from_slice(root);
    token
}

/// Signs the view `(view_length, root)` of `content_id`.
pub fn sign_view(
    key: &SigningKey,
    content_id: &ContentId,
    view_length: u64,
    root: [u8; HASH_LEN],
) -> ViewSignature {
    let token = signing_token(content_id, view_length, &root);
    ViewSignature::new(view_length, root, key.sign(&token))
}

/// Checks a view signature. Any cryptographic failure is a plain `false`.
pub fn verify_view(
    public_key: &VerifyingKey,
    content_id: &ContentId,
    signature: &ViewSignature,
) -> bool {
    let token = signing_token(
        content_id,
        signature.view_length,
        &signature.view_root_hash,
    );
    public_key.verify(&token, &signature.signature).is_ok()
}
