use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::common::Map;

pub type Quantity = i64;

pub const MEMORY: &str = "memory";
pub const VCORE: &str = "vcore";

/// Named-quantity resource vector.
///
/// Add/sub are pointwise; names missing on one side count as zero. Quantities
/// are signed and there is no floor at zero; callers that must not go
/// negative check with [`Resource::has_negative`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resource {
    resources: Map<String, Quantity>,
}

/// Pointwise equality; an explicit zero entry equals an absent name.
impl PartialEq for Resource {
    fn eq(&self, other: &Resource) -> bool {
        self.resources
            .iter()
            .all(|(name, quantity)| other.get(name) == *quantity)
            && other
                .resources
                .iter()
                .all(|(name, quantity)| self.get(name) == *quantity)
    }
}

impl Eq for Resource {}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<N: Into<String>>(pairs: impl IntoIterator<Item = (N, Quantity)>) -> Self {
        Resource {
            resources: pairs.into_iter().map(|(n, q)| (n.into(), q)).collect(),
        }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Quantity {
        self.resources.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, quantity: Quantity) {
        self.resources.insert(name.to_string(), quantity);
    }

    pub fn add(&mut self, other: &Resource) {
        for (name, quantity) in &other.resources {
            *self.resources.entry_ref(name.as_str()).or_insert(0) += quantity;
        }
    }

    pub fn sub(&mut self, other: &Resource) {
        for (name, quantity) in &other.resources {
            *self.resources.entry_ref(name.as_str()).or_insert(0) -= quantity;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.resources.values().all(|q| *q == 0)
    }

    pub fn has_negative(&self) -> bool {
        self.resources.values().any(|q| *q < 0)
    }

    /// Pointwise multiple, used to expand a per-ask resource into the total
    /// of a repeated ask.
    pub fn multiply(&self, factor: Quantity) -> Resource {
        Resource {
            resources: self
                .resources
                .iter()
                .map(|(name, quantity)| (name.clone(), quantity * factor))
                .collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(|n| n.as_str())
    }
}

impl Add<&Resource> for Resource {
    type Output = Resource;

    fn add(mut self, rhs: &Resource) -> Resource {
        Resource::add(&mut self, rhs);
        self
    }
}

impl Sub<&Resource> for Resource {
    type Output = Resource;

    fn sub(mut self, rhs: &Resource) -> Resource {
        Resource::sub(&mut self, rhs);
        self
    }
}

impl AddAssign<&Resource> for Resource {
    fn add_assign(&mut self, rhs: &Resource) {
        self.add(rhs);
    }
}

impl SubAssign<&Resource> for Resource {
    fn sub_assign(&mut self, rhs: &Resource) {
        self.sub(rhs);
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut entries: Vec<_> = self.resources.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        write!(f, "[")?;
        for (idx, (name, quantity)) in entries.into_iter().enumerate() {
            if idx > 0 {
                write!(f, " ")?;
            }
            write!(f, "{name}:{quantity}")?;
        }
        write!(f, "]")
    }
}
