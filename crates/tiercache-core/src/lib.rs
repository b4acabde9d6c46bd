//! Core building blocks for tiercache.
//!
//! This crate holds everything both the orchestrator and the tier
//! implementations agree on:
//!
//! - [`KeyCodec`] / [`CacheKey`]: one canonical key for both tiers
//! - [`EntryOptions`]: independent Tier-1 and Tier-2 expiration policies
//! - [`SerializationGate`]: tagged byte payloads for Tier-2
//! - [`LocalTier`] / [`RemoteTier`]: the store contracts
//! - [`CacheError`] / [`StoreError`]: the error taxonomy

pub mod error;
pub mod key;
pub mod payload;
pub mod policy;
pub mod traits;

pub use error::{CacheError, CacheResult, ErrorCategory, FactoryError, StoreError, Tier};
pub use key::{CacheKey, DEFAULT_MAX_KEY_LEN, KeyCodec};
pub use payload::{
    CacheValue, DecodingError, EncodingError, PayloadFormat, SerializationGate, SerializedPayload,
};
pub use policy::{EntryOptions, Expiration, Priority, Tier1Policy, Tier2Policy};
pub use traits::{LocalTier, LocalValue, NullTier, RemoteTier};
