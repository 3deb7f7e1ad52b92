//! Logical feature namespace.
//!
//! Trackers, buttons and valuators from every device share one index space
//! per category. Indices are handed out during single-threaded setup and the
//! namespace is frozen before any device thread starts; device threads then
//! index the shared state arrays directly.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Tracker,
    Button,
    Valuator,
}

impl std::fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FeatureKind::Tracker => "tracker",
            FeatureKind::Button => "button",
            FeatureKind::Valuator => "valuator",
        })
    }
}

#[derive(Debug, Clone, Default)]
struct FeatureNames {
    names: Vec<Option<String>>,
}

impl FeatureNames {
    fn add(&mut self, name: Option<&str>) -> usize {
        let index = self.names.len();
        self.names.push(name.map(str::to_owned));
        index
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).and_then(|n| n.as_deref())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n.as_deref() == Some(name))
    }
}

/// Allocator for logical tracker, button and valuator indices.
#[derive(Debug, Clone, Default)]
pub struct LogicalNamespace {
    trackers: FeatureNames,
    buttons: FeatureNames,
    valuators: FeatureNames,
    frozen: bool,
}

impl LogicalNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    fn category(&mut self, kind: FeatureKind) -> &mut FeatureNames {
        assert!(
            !self.frozen,
            "cannot add a {} after the feature namespace was frozen",
            kind
        );
        match kind {
            FeatureKind::Tracker => &mut self.trackers,
            FeatureKind::Button => &mut self.buttons,
            FeatureKind::Valuator => &mut self.valuators,
        }
    }

    fn category_ref(&self, kind: FeatureKind) -> &FeatureNames {
        match kind {
            FeatureKind::Tracker => &self.trackers,
            FeatureKind::Button => &self.buttons,
            FeatureKind::Valuator => &self.valuators,
        }
    }

    /// Allocate the next logical index of `kind`.
    ///
    /// # Panics
    /// If the namespace is frozen.
    pub fn add(&mut self, kind: FeatureKind, name: Option<&str>) -> usize {
        self.category(kind).add(name)
    }

    pub fn add_tracker(&mut self, name: Option<&str>) -> usize {
        self.add(FeatureKind::Tracker, name)
    }

    pub fn add_button(&mut self, name: Option<&str>) -> usize {
        self.add(FeatureKind::Button, name)
    }

    pub fn add_valuator(&mut self, name: Option<&str>) -> usize {
        self.add(FeatureKind::Valuator, name)
    }

    /// Number of indices allocated so far; also the index the next `add` returns.
    pub fn count(&self, kind: FeatureKind) -> usize {
        self.category_ref(kind).len()
    }

    pub fn num_trackers(&self) -> usize {
        self.trackers.len()
    }

    pub fn num_buttons(&self) -> usize {
        self.buttons.len()
    }

    pub fn num_valuators(&self) -> usize {
        self.valuators.len()
    }

    pub fn name(&self, kind: FeatureKind, index: usize) -> Option<&str> {
        self.category_ref(kind).name(index)
    }

    /// Look up the logical index registered under `name`, first match wins.
    pub fn index_of(&self, kind: FeatureKind, name: &str) -> Option<usize> {
        self.category_ref(kind).index_of(name)
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_sequential_per_category() {
        let mut ns = LogicalNamespace::new();
        assert_eq!(ns.add_tracker(None), 0);
        assert_eq!(ns.add_button(Some("trigger")), 0);
        assert_eq!(ns.add_tracker(Some("head")), 1);
        assert_eq!(ns.add_button(None), 1);
        assert_eq!(ns.add_valuator(Some("joyX")), 0);

        assert_eq!(ns.num_trackers(), 2);
        assert_eq!(ns.num_buttons(), 2);
        assert_eq!(ns.num_valuators(), 1);
        assert_eq!(ns.count(FeatureKind::Tracker), 2);
    }

    #[test]
    fn test_name_lookup() {
        let mut ns = LogicalNamespace::new();
        ns.add_tracker(None);
        ns.add_tracker(Some("wand"));
        assert_eq!(ns.index_of(FeatureKind::Tracker, "wand"), Some(1));
        assert_eq!(ns.index_of(FeatureKind::Tracker, "head"), None);
        assert_eq!(ns.name(FeatureKind::Tracker, 0), None);
        assert_eq!(ns.name(FeatureKind::Tracker, 1), Some("wand"));
    }

    #[test]
    #[should_panic(expected = "frozen")]
    fn test_add_after_freeze_panics() {
        let mut ns = LogicalNamespace::new();
        ns.add_valuator(None);
        ns.freeze();
        ns.add_valuator(None);
    }
}
