//! JSON serializer backed by serde_json.

use std::io::{Read, Write};

use keepfile_persistence::{PersistenceError, Result, Serializer};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON format, pretty-printed by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonSerializer {
    pretty: bool,
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self { pretty: true }
    }
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-line output.
    pub fn compact() -> Self {
        Self { pretty: false }
    }

    pub fn is_pretty(&self) -> bool {
        self.pretty
    }
}

impl<T> Serializer<T> for JsonSerializer
where
    T: Serialize + DeserializeOwned,
{
    fn serialize_into(&self, item: &T, writer: &mut dyn Write) -> Result<()> {
        let written = if self.pretty {
            serde_json::to_writer_pretty(writer, item)
        } else {
            serde_json::to_writer(writer, item)
        };
        written.map_err(PersistenceError::serialization)
    }

    fn deserialize_from(&self, reader: &mut dyn Read) -> Result<T> {
        serde_json::from_reader(reader).map_err(PersistenceError::serialization)
    }

    fn structural_equals(&self, a: &T, b: &T) -> bool {
        match (serde_json::to_value(a), serde_json::to_value(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}
