//! The persisted dependency database.
//!
//! Layout: the magic bytes `TSKD`, a little-endian `u32` schema version, then
//! a sequence of frames. Each frame is a little-endian `u32` length followed by
//! a CBOR body. The first frame is the [`Header`], every following frame is
//! one `(TaskIdentifier, TaskRecord)` pair. Frames are decoded one at a time,
//! so a record that fails to decode costs only that task.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::Snapshot;
use crate::content::ContentDescriptor;
use crate::core::{BuildStamp, TaskIdentifier, Value, decode_value, encode_value};
use crate::environment::PropertyOutcome;
use crate::error::DatabaseError;

const MAGIC: &[u8; 4] = b"TSKD";
pub(crate) const SCHEMA_VERSION: u32 = 1;

/// One dependency as recorded for the next delta check: what kind, which
/// target, and the fingerprint observed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum Dependency {
    InputFile {
        path: Utf8PathBuf,
        descriptor: ContentDescriptor,
    },
    OutputFile {
        path: Utf8PathBuf,
        descriptor: ContentDescriptor,
    },
    Addition {
        pattern: String,
        matched: BTreeSet<Utf8PathBuf>,
    },
    Environment {
        property: Snapshot,
        outcome: PropertyOutcome,
    },
    Execution {
        property: Snapshot,
        outcome: PropertyOutcome,
    },
    Qualifier {
        name: String,
        value: Option<Value>,
    },
    TaskOutput {
        task: TaskIdentifier,
        dependency: TaskOutputDependency,
    },
}

/// What a consumer knew about a producer's output when it used it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct TaskOutputDependency {
    /// Stamp of the producer result that was consumed.
    pub stamp: BuildStamp,
    /// The producer's own detector at the time of consumption.
    pub self_detector: Option<Snapshot>,
    /// Consumer detectors. Empty means any rerun of the producer counts as a
    /// change.
    pub detectors: Vec<Snapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum RecordedFailure {
    Execution(String),
    /// Reproduced as long as the qualifiers it was decided on are unchanged.
    EnvironmentSelection(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct DeltaFlags {
    pub output_load_failed: bool,
}

/// Serialized output bytes, stored as a CBOR byte string so that the output is
/// decoded separately from the record around it.
#[derive(Clone, PartialEq)]
pub(crate) struct EncodedOutput(pub Vec<u8>);

impl EncodedOutput {
    pub(crate) fn encode(value: &Value) -> Result<Self, String> {
        encode_value(value).map(EncodedOutput)
    }

    pub(crate) fn decode(&self) -> Result<Value, String> {
        decode_value(&self.0)
    }
}

impl fmt::Debug for EncodedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodedOutput({} bytes)", self.0.len())
    }
}

impl Serialize for EncodedOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for EncodedOutput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = EncodedOutput;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(EncodedOutput(v.to_vec()))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(EncodedOutput(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut bytes = Vec::new();
                while let Some(byte) = seq.next_element::<u8>()? {
                    bytes.push(byte);
                }
                Ok(EncodedOutput(bytes))
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

/// Everything remembered about one task execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct TaskRecord {
    pub factory: Snapshot,
    pub stamp: BuildStamp,
    /// Started directly by the build, never abandoned implicitly.
    #[serde(default)]
    pub root: bool,
    pub output: Option<EncodedOutput>,
    pub failure: Option<RecordedFailure>,
    pub dependencies: Vec<Dependency>,
    pub self_detector: Option<Snapshot>,
    pub children: BTreeMap<TaskIdentifier, Snapshot>,
    #[serde(default)]
    pub created_by: BTreeSet<TaskIdentifier>,
    #[serde(default)]
    pub flags: DeltaFlags,
}

/// A loaded record with its output already decoded.
#[derive(Clone, Debug)]
pub(crate) struct StoredTask {
    pub record: TaskRecord,
    pub output: Option<Value>,
}

impl StoredTask {
    pub(crate) fn new(mut record: TaskRecord) -> Self {
        let output = match &record.output {
            Some(encoded) => match encoded.decode() {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!("Couldn't load a stored task output: {e}");
                    record.flags.output_load_failed = true;
                    None
                }
            },
            None => None,
        };
        Self { record, output }
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    build_counter: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Database {
    pub build_counter: u64,
    pub tasks: HashMap<TaskIdentifier, StoredTask>,
}

impl Database {
    /// Loads the database at `path`. A missing file is an empty database.
    pub(crate) fn load(path: &Utf8Path) -> Result<Self, DatabaseError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        Self::decode(&bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Self, DatabaseError> {
        if bytes.len() < 8 || &bytes[..4] != MAGIC {
            return Err(DatabaseError::BadMagic);
        }

        let version = read_u32(&bytes[4..8]);
        if version > SCHEMA_VERSION {
            return Err(DatabaseError::Version(version));
        }

        let mut frames = Frames { rest: &bytes[8..] };

        let header: Header = match frames.next() {
            Some(frame) => ciborium::from_reader(frame).map_err(|e| DatabaseError::Corrupt(e.to_string()))?,
            None => return Err(DatabaseError::Corrupt("missing header".into())),
        };

        let mut tasks = HashMap::new();
        for frame in frames.by_ref() {
            match ciborium::from_reader::<(TaskIdentifier, TaskRecord), _>(frame) {
                Ok((id, record)) => {
                    tasks.insert(id, StoredTask::new(record));
                }
                Err(e) => tracing::warn!("Skipping unreadable task record: {e}"),
            }
        }

        if frames.truncated() {
            tracing::warn!("Task database is truncated, dropping the tail");
        }

        Ok(Self {
            build_counter: header.build_counter,
            tasks,
        })
    }

    /// Writes the database next to `path` and moves it into place.
    pub(crate) fn save(&self, path: &Utf8Path) -> Result<(), DatabaseError> {
        let mut buffer = Vec::with_capacity(4096);
        buffer.extend_from_slice(MAGIC);
        buffer.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());

        write_frame(
            &mut buffer,
            &Header {
                build_counter: self.build_counter,
            },
        )?;

        let mut ids: Vec<_> = self.tasks.keys().collect();
        ids.sort();
        for id in ids {
            write_frame(&mut buffer, &(id, &self.tasks[id].record))?;
        }

        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let temp = path.with_extension("tmp");
        fs::write(&temp, &buffer)?;
        fs::rename(&temp, path)?;
        Ok(())
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}

fn write_frame<T: Serialize>(buffer: &mut Vec<u8>, item: &T) -> Result<(), DatabaseError> {
    let mut body = Vec::new();
    ciborium::into_writer(item, &mut body).map_err(|e| DatabaseError::Encode(e.to_string()))?;
    let len = u32::try_from(body.len()).map_err(|_| DatabaseError::Encode("record too large".into()))?;
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(&body);
    Ok(())
}

struct Frames<'a> {
    rest: &'a [u8],
}

impl Frames<'_> {
    fn truncated(&self) -> bool {
        !self.rest.is_empty()
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < 4 {
            return None;
        }
        let len = read_u32(self.rest) as usize;
        let body = self.rest.get(4..4 + len)?;
        self.rest = &self.rest[4 + len..];
        Some(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(output: Option<EncodedOutput>) -> TaskRecord {
        TaskRecord {
            factory: Snapshot {
                tag: "test".into(),
                state: Value::Text("a".into()),
            },
            stamp: BuildStamp(3),
            root: true,
            output,
            failure: None,
            dependencies: vec![
                Dependency::InputFile {
                    path: "in.txt".into(),
                    descriptor: ContentDescriptor::Present,
                },
                Dependency::Qualifier {
                    name: "os".into(),
                    value: None,
                },
            ],
            self_detector: None,
            children: BTreeMap::new(),
            created_by: BTreeSet::new(),
            flags: DeltaFlags::default(),
        }
    }

    fn database(tasks: Vec<(&str, TaskRecord)>) -> Database {
        Database {
            build_counter: 3,
            tasks: tasks
                .into_iter()
                .map(|(name, record)| (TaskIdentifier::new(name), StoredTask::new(record)))
                .collect(),
        }
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("nested").join("tasks.db")).unwrap();
        (dir, path)
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, path) = scratch();
        let output = EncodedOutput::encode(&Value::Integer(7.into())).unwrap();
        database(vec![("a", record(Some(output))), ("b", record(None))])
            .save(&path)
            .unwrap();

        let loaded = Database::load(&path).unwrap();
        assert_eq!(loaded.build_counter, 3);
        assert_eq!(loaded.tasks.len(), 2);

        let a = &loaded.tasks[&TaskIdentifier::new("a")];
        assert_eq!(a.output, Some(Value::Integer(7.into())));
        assert_eq!(a.record.dependencies.len(), 2);
        assert!(a.record.root);
        assert!(!a.record.flags.output_load_failed);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_dir, path) = scratch();
        let loaded = Database::load(&path).unwrap();
        assert_eq!(loaded.build_counter, 0);
        assert!(loaded.tasks.is_empty());
    }

    #[test]
    fn test_undecodable_output_is_flagged() {
        let (_dir, path) = scratch();
        database(vec![("a", record(Some(EncodedOutput(vec![0xff, 0xff]))))])
            .save(&path)
            .unwrap();

        let loaded = Database::load(&path).unwrap();
        let a = &loaded.tasks[&TaskIdentifier::new("a")];
        assert!(a.record.flags.output_load_failed);
        assert_eq!(a.output, None);
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let (_dir, path) = scratch();
        database(vec![("a", record(None)), ("b", record(None))])
            .save(&path)
            .unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let loaded = Database::load(&path).unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert!(loaded.tasks.contains_key(&TaskIdentifier::new("a")));
    }

    #[test]
    fn test_rejects_foreign_files() {
        let (_dir, path) = scratch();
        fs::create_dir_all(path.parent().unwrap()).unwrap();

        fs::write(&path, b"not a database").unwrap();
        assert!(matches!(Database::load(&path), Err(DatabaseError::BadMagic)));

        let mut newer = MAGIC.to_vec();
        newer.extend_from_slice(&(SCHEMA_VERSION + 1).to_le_bytes());
        fs::write(&path, &newer).unwrap();
        assert!(matches!(Database::load(&path), Err(DatabaseError::Version(_))));
    }
}
