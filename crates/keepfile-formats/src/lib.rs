//! Serializers for keepfile.
//!
//! Both formats work for any `T: Serialize + DeserializeOwned` and compare
//! items structurally through the format's value tree, so map ordering does
//! not make two equal items look different.

pub mod json;
pub mod yaml;

pub use json::JsonSerializer;
pub use yaml::YamlSerializer;
