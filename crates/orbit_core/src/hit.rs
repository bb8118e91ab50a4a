use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A phase-space sample with named dynamical variables.
///
/// The closed-orbit machinery only ever reads and writes variables by
/// name, so any record type that can answer `get` and `set` can be
/// tracked.
pub trait HitLike: Clone {
    /// Read a dynamical variable. `None` if the record does not carry it.
    fn get(&self, name: &str) -> Option<f64>;

    /// Write a dynamical variable. Returns `false` if the record refuses
    /// the name.
    fn set(&mut self, name: &str, value: f64) -> bool;
}

/// Map-backed hit storing variables by name in sorted order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapHit {
    variables: BTreeMap<String, f64>,
}

impl MapHit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion, for seeding hits in line.
    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.variables.insert(name.to_owned(), value);
        self
    }

    /// Iterate over `(name, value)` pairs in sorted name order.
    pub fn variables(&self) -> impl Iterator<Item = (&str, f64)> {
        self.variables.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

impl HitLike for MapHit {
    fn get(&self, name: &str) -> Option<f64> {
        self.variables.get(name).copied()
    }

    fn set(&mut self, name: &str, value: f64) -> bool {
        self.variables.insert(name.to_owned(), value);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{HitLike, MapHit};

    #[test]
    fn get_and_set_round_trip() {
        let mut hit = MapHit::new().with("x", 10.0).with("px", 7.0);
        assert_eq!(hit.get("x"), Some(10.0));
        assert_eq!(hit.get("y"), None);
        assert!(hit.set("x", 11.0));
        assert_eq!(hit.get("x"), Some(11.0));
    }

    #[test]
    fn variables_iterate_in_sorted_order() {
        let hit = MapHit::new().with("px", 7.0).with("energy", 1000.0).with("x", 10.0);
        let names: Vec<&str> = hit.variables().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["energy", "px", "x"]);
    }
}
