/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum character length of a conversation's last-message preview
pub const PREVIEW_MAX_CHARS: usize = 50;

/// Maximum attachment size in bytes (50 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 50 * 1024 * 1024;

/// Fixed string substituted for message bodies that cannot be decrypted
pub const DECRYPT_PLACEHOLDER: &str = "[unable to decrypt]";
