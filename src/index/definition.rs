//! Compound index definitions

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{IndexError, IndexResult};

/// Sort direction of an index field or an order-by clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexField {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

impl IndexField {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }
}

/// A compound index over one collection.
///
/// Field order is significant: a query can use the index only when its
/// clauses line up with a prefix of `fields`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub collection: String,
    pub fields: Vec<IndexField>,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.fields.push(IndexField::new(field, direction));
        self
    }

    pub fn asc(self, field: impl Into<String>) -> Self {
        self.field(field, Direction::Asc)
    }

    pub fn desc(self, field: impl Into<String>) -> Self {
        self.field(field, Direction::Desc)
    }

    /// Validate and put the tenant field first.
    ///
    /// A definition that names the tenant field anywhere but position 0 is
    /// rejected rather than silently reordered.
    pub fn normalized(mut self, tenant_field: &str) -> IndexResult<Self> {
        if self.name.trim().is_empty() {
            return Err(IndexError::InvalidDefinition("index name is empty".into()));
        }
        if self.collection.trim().is_empty() || self.collection.contains('/') {
            return Err(IndexError::InvalidDefinition(format!(
                "'{}' is not a collection name",
                self.collection
            )));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.field.is_empty() {
                return Err(IndexError::InvalidDefinition(format!(
                    "index '{}' has an empty field name",
                    self.name
                )));
            }
            if !seen.insert(field.field.as_str()) {
                return Err(IndexError::InvalidDefinition(format!(
                    "field '{}' appears twice in index '{}'",
                    field.field, self.name
                )));
            }
        }

        match self.fields.iter().position(|f| f.field == tenant_field) {
            Some(0) => {}
            Some(pos) => {
                return Err(IndexError::InvalidDefinition(format!(
                    "tenant field '{}' must be first in index '{}', found at position {}",
                    tenant_field, self.name, pos
                )))
            }
            None => self
                .fields
                .insert(0, IndexField::new(tenant_field, Direction::Asc)),
        }

        Ok(self)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.field.as_str())
    }
}

impl fmt::Display for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} (", self.name, self.collection)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", field.field, field.direction)?;
        }
        f.write_str(")")
    }
}
