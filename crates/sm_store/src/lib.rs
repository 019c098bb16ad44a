//! sm_store — Relay key pinning for SprintMate
//!
//! # Trust model
//! Trust-on-first-use: the first relay key seen for a relay address is
//! pinned. Later sessions must present the same key. A different key is
//! either rejected (rotation disabled) or replaces the pin (rotation
//! enabled). The latter accepts the risk of an active man-in-the-middle at
//! rotation time; there is no out-of-band re-verification step.
//!
//! # Persistence
//! Pins are written best-effort to two tiers, durable first then
//! session-scoped. If neither accepts the write the pin still lives in
//! memory for the remainder of the process.

pub mod error;
pub mod paths;
pub mod pin;
pub mod tiers;

pub use error::StoreError;
pub use pin::{namespace_for_host, TrustAnchor, TrustDecision};
pub use tiers::{FilePinStore, PinStore, SessionPinStore};
