use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::debug;

use crate::ClassResult;

/// Deserialize a value from a bincode file.
pub(crate) fn load<T: DeserializeOwned, P: AsRef<Path>>(file: P) -> ClassResult<T> {
    let mut f = std::fs::File::open(file.as_ref())?;
    let mut buffer: Vec<u8> = Vec::new();
    std::io::Read::read_to_end(&mut f, &mut buffer)?;
    debug!(path = %file.as_ref().display(), bytes = buffer.len(), "Loaded");
    Ok(bincode::deserialize(&buffer)?)
}

/// Serialize a value into a bincode file, replacing any previous content.
pub(crate) fn save<T: Serialize, P: AsRef<Path>>(value: &T, file: P) -> ClassResult<()> {
    let serialized = bincode::serialize(value)?;
    let mut f = std::fs::File::create(file.as_ref())?;
    std::io::Write::write_all(&mut f, &serialized)?;
    debug!(path = %file.as_ref().display(), bytes = serialized.len(), "Saved");
    Ok(())
}
