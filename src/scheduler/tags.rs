use crate::error::{JobdError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Per-job tags. Keys are unique; order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagList {
    tags: Vec<Tag>,
}

impl TagList {
    /// Build from (key, value) pairs. A repeated key keeps its last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut list = Self::default();
        for (key, value) in pairs {
            list.set(key, value);
        }
        list
    }

    /// Replace the value of an existing key in place, or append a new tag.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.tags.iter_mut().find(|t| t.key == key) {
            Some(existing) => existing.value = value,
            None => self.tags.push(Tag { key, value }),
        }
    }

    /// Remove a tag, keeping the remaining tags in their relative order.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        let pos = self
            .tags
            .iter()
            .position(|t| t.key == key)
            .ok_or_else(|| JobdError::TagNotFound(key.to_string()))?;
        self.tags.remove(pos);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
