use std::borrow::Cow;

/// Fixed class id -> class name mapping supplied by a detector at load time.
///
/// Read-only once built. Ids past the end of the label list resolve to
/// `class_{id}` so a short label list never drops detections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassCatalog {
    names: Vec<String>,
}

impl ClassCatalog {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Catalog of `count` generic names (`class_0`, `class_1`, ...).
    pub fn generic(count: usize) -> Self {
        Self::new((0..count).map(|id| format!("class_{id}")))
    }

    pub fn name(&self, class_id: u32) -> Cow<'_, str> {
        match self.names.get(class_id as usize) {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(format!("class_{class_id}")),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Pads the catalog with generic names up to `count` entries.
    pub(crate) fn extended_to(mut self, count: usize) -> Self {
        for id in self.names.len()..count {
            self.names.push(format!("class_{id}"));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_and_unknown_ids() {
        let catalog = ClassCatalog::new(["bug", "level 1"]);
        assert_eq!(catalog.name(0), "bug");
        assert_eq!(catalog.name(1), "level 1");
        assert_eq!(catalog.name(7), "class_7");
    }

    #[test]
    fn extends_with_generic_names() {
        let catalog = ClassCatalog::new(["bug"]).extended_to(3);
        assert_eq!(catalog.names(), &["bug", "class_1", "class_2"]);
        assert_eq!(ClassCatalog::generic(2).names(), &["class_0", "class_1"]);
    }
}
