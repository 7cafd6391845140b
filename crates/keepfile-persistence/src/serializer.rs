//! The serialization capability the transactions and the dirty tracker use.

use std::io::{Read, Write};

use crate::error::Result;

/// Converts items of type `T` to and from bytes.
///
/// Implementors only provide the streaming pair; byte-buffer helpers,
/// structural cloning and structural equality fall out of them.
pub trait Serializer<T>: Send + Sync {
    /// Writes `item` into `writer`.
    fn serialize_into(&self, item: &T, writer: &mut dyn Write) -> Result<()>;

    /// Reads one item from `reader`.
    fn deserialize_from(&self, reader: &mut dyn Read) -> Result<T>;

    fn serialize(&self, item: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.serialize_into(item, &mut buf)?;
        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        let mut reader = bytes;
        self.deserialize_from(&mut reader)
    }

    /// Deep copy made by a round trip through the format.
    fn clone_item(&self, item: &T) -> Result<T> {
        let bytes = self.serialize(item)?;
        self.deserialize(&bytes)
    }

    /// Two items are equal when they serialize to the same bytes.
    ///
    /// An item that fails to serialize is never equal to anything.
    fn structural_equals(&self, a: &T, b: &T) -> bool {
        match (self.serialize(a), self.serialize(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TestJson;
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_clone_item_is_independent() {
        let original = Sample {
            name: "first".to_string(),
            tags: vec!["a".to_string()],
        };

        let mut copy: Sample = TestJson.clone_item(&original).unwrap();
        copy.tags.push("b".to_string());

        assert_eq!(original.tags, vec!["a".to_string()]);
        assert!(!Serializer::<Sample>::structural_equals(&TestJson, &original, &copy));
    }

    #[test]
    fn test_structural_equals_compares_content() {
        let a = Sample {
            name: "same".to_string(),
            tags: vec![],
        };
        let b = a.clone();

        assert!(TestJson.structural_equals(&a, &b));
    }
}
