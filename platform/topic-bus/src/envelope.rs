//! # Message Envelope
//!
//! Every message on the bus is a JSON object with a single top-level `data`
//! field holding the caller's payload:
//!
//! ```json
//! { "data": { "id": 42, "name": "Acme" } }
//! ```
//!
//! The publisher wraps and the consumer unwraps, so handlers only ever see
//! the payload type they asked for.

use crate::{BusError, BusResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Wire envelope around a payload
///
/// # Examples
///
/// ```rust
/// use topic_bus::Envelope;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct OrganizationCreated {
///     id: u64,
///     name: String,
/// }
///
/// let bytes = topic_bus::encode(&OrganizationCreated { id: 42, name: "Acme".to_string() }).unwrap();
/// assert_eq!(bytes, br#"{"data":{"id":42,"name":"Acme"}}"#.to_vec());
///
/// let decoded: OrganizationCreated = topic_bus::decode(&bytes).unwrap();
/// assert_eq!(decoded.id, 42);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T: ?Sized> {
    data: &'a T,
}

/// Wrap a payload in `{ "data": ... }` and serialize it
pub fn encode<T: Serialize + ?Sized>(data: &T) -> BusResult<Vec<u8>> {
    serde_json::to_vec(&EnvelopeRef { data })
        .map_err(|e| BusError::Serialization(format!("failed to encode envelope: {e}")))
}

/// Parse `{ "data": ... }` and return the payload
///
/// Unknown top-level fields are ignored; a missing `data` field is an error.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> BusResult<T> {
    serde_json::from_slice::<Envelope<T>>(bytes)
        .map(|envelope| envelope.data)
        .map_err(|e| BusError::Serialization(format!("failed to decode envelope: {e}")))
}
