use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Dynamically typed, structurally comparable value. Task outputs, factory
/// snapshots and property values are all expressed as CBOR values.
pub use ciborium::Value;

/// A 32-byte BLAKE3 hash used as the content fingerprint of files.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Structural key of a task. Two identifiers are the same task when their
/// names and field maps are equal, regardless of where they were created.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskIdentifier {
    name: Arc<str>,
    fields: Arc<BTreeMap<String, String>>,
}

impl TaskIdentifier {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            fields: Arc::default(),
        }
    }

    /// Returns a copy of this identifier with an additional field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.fields).insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

impl fmt::Display for TaskIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.fields.is_empty() {
            f.write_str("{")?;
            for (i, (key, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TaskIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskIdentifier({self})")
    }
}

impl From<&str> for TaskIdentifier {
    fn from(name: &str) -> Self {
        TaskIdentifier::new(name)
    }
}

/// Sequence number of the build that produced a task result. A consumer that
/// saw the same stamp as the producer currently has knows that the producer was
/// not re-run in between.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildStamp(pub u64);

impl BuildStamp {
    pub(crate) fn next(self) -> Self {
        BuildStamp(self.0 + 1)
    }
}

impl fmt::Display for BuildStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Serializes any value into a [`Value`].
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<Value> {
    Value::serialized(value).map_err(|e| anyhow::anyhow!("Couldn't convert to value: {e}"))
}

/// Deserializes a [`Value`] into a concrete type.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> anyhow::Result<T> {
    value
        .deserialized()
        .map_err(|e| anyhow::anyhow!("Couldn't convert from value: {e}"))
}

pub(crate) fn encode_value(value: &Value) -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|e| e.to_string())?;
    Ok(buffer)
}

pub(crate) fn decode_value(bytes: &[u8]) -> Result<Value, String> {
    ciborium::from_reader(bytes).map_err(|e| e.to_string())
}

/// Locks a mutex, recovering the data of a poisoned lock. Task bodies run
/// under `catch_unwind`, so a panic never leaves engine state half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
