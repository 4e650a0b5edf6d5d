//! The opaque payload type transported through the middleware chain.
//!
//! Typed operation signatures are convenience only — the core transports an
//! untyped value end to end. `serde_json::Value` serves that role directly:
//! typed operations just serialize in and deserialize out at their edges.

/// Opaque input/output/property value flowing through the engine.
pub type Value = serde_json::Value;

/// Serialize a typed value into the opaque transport type.
pub fn to_value<T: serde::Serialize>(value: &T) -> crate::error::Result<Value> {
    serde_json::to_value(value).map_err(|e| crate::error::ForgeError::Serialization(e.to_string()))
}

/// Deserialize the opaque transport type back into a typed value.
pub fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> crate::error::Result<T> {
    serde_json::from_value(value).map_err(|e| crate::error::ForgeError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_value() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            a: i32,
        }
        let v = to_value(&Payload { a: 7 }).unwrap();
        let back: Payload = from_value(v).unwrap();
        assert_eq!(back, Payload { a: 7 });
    }
}
