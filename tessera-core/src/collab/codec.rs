//! Update log codec: opaque, mergeable update blobs and version vectors.
//!
//! Everything here is lib0 v1 encoding as produced by `yrs`. Callers treat
//! [`Update`] as bytes; only this module and the replica look inside.

use std::fmt;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact};

/// v1 encoding of an update that carries no structs and no deletions.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Malformed update or version vector bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty update payload")]
    Empty,

    #[error("malformed update: {0}")]
    Update(String),

    #[error("malformed version vector: {0}")]
    VersionVector(String),

    #[error("update could not be integrated: {0}")]
    Integrate(String),
}

/// Binary delta of one or more document operations.
///
/// Updates compose: applying `a` then `b` is equivalent to applying
/// [`merge`]`([a, b])`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Update(Vec<u8>);

impl Update {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The update that changes nothing.
    pub fn empty() -> Self {
        Self(EMPTY_UPDATE.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.0 == EMPTY_UPDATE
    }

    /// Check that the bytes decode, without applying them anywhere.
    pub fn validate(&self) -> Result<(), DecodeError> {
        self.decode().map(|_| ())
    }

    pub(crate) fn decode(&self) -> Result<yrs::Update, DecodeError> {
        if self.0.is_empty() {
            return Err(DecodeError::Empty);
        }
        yrs::Update::decode_v1(&self.0).map_err(|e| DecodeError::Update(e.to_string()))
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Update({} bytes)", self.0.len())
    }
}

impl AsRef<[u8]> for Update {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Update {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Compact summary of every operation a replica has observed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionVector(StateVector);

impl VersionVector {
    pub fn encode(&self) -> Vec<u8> {
        self.0.encode_v1()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        StateVector::decode_v1(bytes)
            .map(Self)
            .map_err(|e| DecodeError::VersionVector(e.to_string()))
    }

    pub(crate) fn from_state_vector(sv: StateVector) -> Self {
        Self(sv)
    }

    pub(crate) fn as_state_vector(&self) -> &StateVector {
        &self.0
    }
}

/// Merge a sequence of updates into one equivalent update.
///
/// Order does not matter for the resulting document state. An empty input
/// yields [`Update::empty`].
pub fn merge<'a, I>(updates: I) -> Result<Update, DecodeError>
where
    I: IntoIterator<Item = &'a Update>,
{
    let decoded = updates
        .into_iter()
        .map(Update::decode)
        .collect::<Result<Vec<_>, _>>()?;

    match decoded.len() {
        0 => Ok(Update::empty()),
        _ => Ok(Update(yrs::Update::merge_updates(decoded).encode_v1())),
    }
}

/// The part of `state` that a replica at `since` has not seen yet.
pub fn diff(state: &Update, since: &VersionVector) -> Result<Update, DecodeError> {
    let doc = scratch_doc(state)?;
    let txn = doc.transact();
    Ok(Update(txn.encode_diff_v1(since.as_state_vector())))
}

/// Version vector of a replica that has applied exactly `state`.
pub fn version_vector_of(state: &Update) -> Result<VersionVector, DecodeError> {
    let doc = scratch_doc(state)?;
    let txn = doc.transact();
    Ok(VersionVector(txn.state_vector()))
}

fn scratch_doc(state: &Update) -> Result<Doc, DecodeError> {
    let doc = Doc::new();
    if state.is_empty() {
        return Ok(doc);
    }
    let decoded = state.decode()?;
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| DecodeError::Integrate(e.to_string()))?;
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::Map;

    fn write(doc: &Doc, key: &str, value: &str) -> Update {
        let map = doc.get_or_insert_map("nodes");
        let mut txn = doc.transact_mut();
        map.insert(&mut txn, key, value.to_string());
        Update(txn.encode_update_v1())
    }

    fn read_all(update: &Update) -> Vec<(String, String)> {
        let doc = scratch_doc(update).unwrap();
        let map = doc.get_or_insert_map("nodes");
        let txn = doc.transact();
        let mut entries: Vec<(String, String)> = map
            .iter(&txn)
            .filter_map(|(k, v)| match v {
                yrs::Out::Any(yrs::Any::String(s)) => Some((k.to_string(), s.to_string())),
                _ => None,
            })
            .collect();
        entries.sort();
        entries
    }

    #[test]
    fn test_empty_update_is_empty() {
        assert!(Update::empty().is_empty());
        assert!(Update::from_bytes(Vec::new()).is_empty());
        assert!(Update::empty().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_garbage() {
        assert_eq!(Update::from_bytes(Vec::new()).validate(), Err(DecodeError::Empty));
        assert!(Update::from_bytes(vec![0xFF, 0xFF, 0xFF, 0xFF]).validate().is_err());
    }

    #[test]
    fn test_merge_equals_sequential_apply() {
        let doc = Doc::new();
        let a = write(&doc, "n1", "one");
        let b = write(&doc, "n2", "two");

        let merged = merge([&a, &b]).unwrap();
        assert_eq!(
            read_all(&merged),
            vec![("n1".into(), "one".into()), ("n2".into(), "two".into())]
        );
    }

    #[test]
    fn test_merge_of_nothing_is_empty() {
        let merged = merge(std::iter::empty()).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn test_merge_propagates_decode_error() {
        let bad = Update::from_bytes(vec![0xFF, 0xFF]);
        assert!(merge([&bad]).is_err());
    }

    #[test]
    fn test_diff_contains_only_missing_ops() {
        let doc = Doc::new();
        let first = write(&doc, "n1", "one");
        let seen = version_vector_of(&first).unwrap();
        let second = write(&doc, "n2", "two");

        let state = merge([&first, &second]).unwrap();
        let missing = diff(&state, &seen).unwrap();

        // Applying only the diff on top of `first` reproduces the full state.
        let rebuilt = merge([&first, &missing]).unwrap();
        assert_eq!(read_all(&rebuilt), read_all(&state));
        assert!(missing.len() < state.len());
    }

    #[test]
    fn test_version_vector_roundtrip() {
        let doc = Doc::new();
        let update = write(&doc, "n1", "one");
        let vv = version_vector_of(&update).unwrap();

        let decoded = VersionVector::decode(&vv.encode()).unwrap();
        assert_eq!(decoded, vv);
        assert_ne!(vv, VersionVector::default());
    }

    #[test]
    fn test_version_vector_decode_error() {
        assert!(VersionVector::decode(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
