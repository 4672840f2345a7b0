//! Per-run provider credentials: single use, time boxed, encrypted at rest.

pub mod cipher;
pub mod key_source;

pub use cipher::{EncryptedKey, KeyCipher};
pub use key_source::{
    CredentialError, CredentialResolver, KeySourceStore, OpenAiKeySource, PgKeySourceStore,
    RunCredential,
};
