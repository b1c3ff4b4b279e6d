//! Cryptography for guardian keys and their protection at rest.

pub mod envelope;
pub mod keys;
pub mod tx_builder;

pub use envelope::{Envelope, KeyEncryptor};
pub use keys::{GuardianKeyGenerator, address_bytes, address_from_public_key, public_key_from_address};
pub use tx_builder::{Transaction, apply_guardian_signature, sign_message};
