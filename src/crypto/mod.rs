//! Cryptographic operations for Web Push delivery.

pub mod aes128gcm;
pub mod vapid;

pub use aes128gcm::encrypt;
pub use vapid::VapidSigner;
