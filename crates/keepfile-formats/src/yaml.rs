//! YAML serializer backed by serde_yaml.

use std::io::{Read, Write};

use keepfile_persistence::{PersistenceError, Result, Serializer};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct YamlSerializer;

impl YamlSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl<T> Serializer<T> for YamlSerializer
where
    T: Serialize + DeserializeOwned,
{
    fn serialize_into(&self, item: &T, writer: &mut dyn Write) -> Result<()> {
        serde_yaml::to_writer(writer, item).map_err(PersistenceError::serialization)
    }

    fn deserialize_from(&self, reader: &mut dyn Read) -> Result<T> {
        serde_yaml::from_reader(reader).map_err(PersistenceError::serialization)
    }

    fn structural_equals(&self, a: &T, b: &T) -> bool {
        match (serde_yaml::to_value(a), serde_yaml::to_value(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}
