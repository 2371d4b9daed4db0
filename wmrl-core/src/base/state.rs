//! Serialized state of stateful objects.
use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Opaque serialized state of a component.
///
/// The payload is `bincode`-encoded. Blobs are nested into the checkpoint
/// and into the messages broadcast between ranks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBlob(Vec<u8>);

impl StateBlob {
    /// Encodes a value.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(bincode::serialize(value)?))
    }

    /// Decodes the payload into a value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.0)?)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The number of bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the blob is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for StateBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Objects whose mutable state is saved in checkpoints.
///
/// `load_state_dict(&state_dict()?)` must restore an equal object.
pub trait Stateful {
    /// Exports the state.
    fn state_dict(&self) -> Result<StateBlob>;

    /// Restores the state.
    fn load_state_dict(&mut self, state: &StateBlob) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_encode_decode() -> Result<()> {
        let value: BTreeMap<i8, usize> = [(-1, 3), (0, 10), (1, 2)].into_iter().collect();
        let blob = StateBlob::encode(&value)?;
        assert!(!blob.is_empty());
        let decoded: BTreeMap<i8, usize> = blob.decode()?;
        assert_eq!(value, decoded);
        Ok(())
    }

    #[test]
    fn test_decode_garbage_fails() {
        let blob = StateBlob::from(vec![1u8]);
        assert!(blob.decode::<(u64, String)>().is_err());
    }
}
