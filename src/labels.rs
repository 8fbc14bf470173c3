use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::*;

/// Assigns numeric labels to class names in order of first appearance.
///
/// Owned by whoever runs the training, and saved next to the classifier so
/// predicted labels can be turned back into names.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LabelMap {
    names: Vec<String>,
    ids: HashMap<String, Label>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label for `name`, allocating the next free one for an unseen name.
    pub fn get_or_insert(&mut self, name: &str) -> Label {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as Label;
        self.names.push(name.to_owned());
        self.ids.insert(name.to_owned(), id);
        id
    }

    pub fn id(&self, name: &str) -> Option<Label> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, label: Label) -> Option<&str> {
        self.names.get(label as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Load a label map from a file
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> ClassResult<Self> {
        crate::persist::load(file)
    }

    /// Save label map to a file
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> ClassResult<()> {
        crate::persist::save(self, file)
    }
}
