// Feature identifiers
//
// INTENTION:
// A Feature names one unit of optional introspected proxy state (core
// properties, capabilities, roster, ...). Features are declared as `const`
// items on each proxy type, scoped by a class tag so two proxy classes can
// both have a feature 0 without colliding.

use std::collections::BTreeSet;
use std::fmt;

/// One unit of optional proxy state that can be independently requested
/// and introspected.
///
/// Equality and ordering are by `(class, index)`. Instances are cheap,
/// copyable constants; proxies declare them like:
///
/// ```rust
/// use tether::Feature;
///
/// pub const FEATURE_CORE: Feature = Feature::new("Connection", 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Feature {
    class: &'static str,
    index: u32,
}

impl Feature {
    pub const fn new(class: &'static str, index: u32) -> Self {
        Self { class, index }
    }

    /// The owning proxy class tag
    pub fn class(&self) -> &'static str {
        self.class
    }

    /// The per-class discriminator
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class, self.index)
    }
}

/// An ordered set of features.
///
/// A `BTreeSet` keeps iteration deterministic, which matters for the order
/// pending callers observe completion in.
pub type Features = BTreeSet<Feature>;

/// Build a `Features` set from a list of features.
///
/// ```rust
/// use tether::{features, Feature};
///
/// const CORE: Feature = Feature::new("Thing", 0);
/// const CAPS: Feature = Feature::new("Thing", 1);
/// let wanted = features![CORE, CAPS];
/// assert_eq!(wanted.len(), 2);
/// ```
#[macro_export]
macro_rules! features {
    () => {
        $crate::Features::new()
    };
    ($($feature:expr),+ $(,)?) => {{
        let mut set = $crate::Features::new();
        $(set.insert($feature);)+
        set
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Feature = Feature::new("Alpha", 0);
    const B: Feature = Feature::new("Alpha", 1);
    const C: Feature = Feature::new("Beta", 0);

    #[test]
    fn equality_is_by_class_and_index() {
        assert_eq!(A, Feature::new("Alpha", 0));
        assert_ne!(A, B);
        assert_ne!(A, C);
    }

    #[test]
    fn features_macro_builds_a_set() {
        let set = features![A, B, A];
        assert_eq!(set.len(), 2);
        assert!(set.contains(&A));
        assert!(set.contains(&B));
    }

    #[test]
    fn display_names_class_and_index() {
        assert_eq!(A.to_string(), "Alpha/0");
    }
}
