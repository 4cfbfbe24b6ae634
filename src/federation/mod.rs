//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures (signing and verification)
//! - Actor fetching and public key caching
//! - Activity delivery (outbox workers)
//! - Retry sweeps of failed deliveries

mod delivery;
mod directory;
mod key_cache;
mod retry;
mod signature;
mod verify;

pub use delivery::{ActivityDelivery, DEFAULT_USER_AGENT, DeliveryResult, DeliveryWorker};
pub use directory::{ActorDirectory, HttpActorDirectory, extract_public_key_pem};
pub use key_cache::{CacheStats, KeyResolver, PublicKeyCache};
pub use retry::RetrySweeper;
pub use signature::{
    ALGORITHM, HTTP_DATE_FORMAT, LocalActorKey, ParsedSignature, SignatureHeaders,
    build_signing_string, generate_digest, http_date_now, key_id_matches_actor,
    parse_public_key_pem, parse_signature_header, request_host_and_path, sign, sign_at,
    sign_request,
};
pub use verify::{
    SignatureVerifier, VerifyError, VerifyPolicy, reconstruct_signing_string, verify_with_key,
};
