use dashmap::DashSet;

/// Tree keys already accepted by the tree table.
///
/// Shared by every worker for the life of the process. Keys are only added
/// after the upload that carried them succeeded, and are never removed, so
/// memory grows with the size of the metric namespace.
#[derive(Debug, Default)]
pub struct TreeCache {
    keys: DashSet<String>,
}

impl TreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn insert(&self, key: String) -> bool {
        self.keys.insert(key)
    }

    pub fn extend<I>(&self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        for key in keys {
            self.keys.insert(key);
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for TreeCache {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let cache = Self::new();
        cache.extend(iter.into_iter().map(Into::into));
        cache
    }
}
