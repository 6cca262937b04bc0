//! bincode helpers shared by every crate that persists or ships serde values.

use crate::Error;

pub fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, Error> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| Error::Storage(e.to_string()))
}

pub fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, Error> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| Error::Storage(e.to_string()))
}
