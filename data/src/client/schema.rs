//! Space and index metadata.

use rmpv::Value;

/// A field in the format of a space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMetadata {
    /// The name of the field.
    pub name: String,
    /// The Tarantool type of the field (`unsigned`, `string`, `any`, ...).
    pub ty: String,
    /// Whether the field accepts `nil`.
    pub is_nullable: bool,
}

impl FieldMetadata {
    /// A non-nullable field.
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            is_nullable: false,
        }
    }

    /// A field which accepts `nil`.
    pub fn nullable(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            is_nullable: true,
            ..Self::new(name, ty)
        }
    }
}

/// An index on a space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexMetadata {
    /// The index ID. The primary index always has ID 0.
    pub id: u32,
    /// The name of the index.
    pub name: String,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// Zero-based positions of the indexed fields, in index order.
    pub parts: Vec<usize>,
}

impl IndexMetadata {
    /// Create an index.
    pub fn new(id: u32, name: impl Into<String>, unique: bool, parts: Vec<usize>) -> Self {
        Self {
            id,
            name: name.into(),
            unique,
            parts,
        }
    }

    /// Extract the key of this index from a tuple.
    pub fn key_of(&self, tuple: &[Value]) -> Vec<Value> {
        self.parts
            .iter()
            .map(|&i| tuple.get(i).cloned().unwrap_or(Value::Nil))
            .collect()
    }
}

/// The schema of a space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceMetadata {
    /// The space ID.
    pub id: u32,
    /// The name of the space.
    pub name: String,
    /// The fields of the space, in tuple order.
    pub format: Vec<FieldMetadata>,
    /// The indexes of the space.
    pub indexes: Vec<IndexMetadata>,
}

impl SpaceMetadata {
    /// Create metadata for a space with no indexes.
    pub fn new(id: u32, name: impl Into<String>, format: Vec<FieldMetadata>) -> Self {
        Self {
            id,
            name: name.into(),
            format,
            indexes: vec![],
        }
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexMetadata) -> Self {
        self.indexes.push(index);
        self
    }

    /// The position of the field called `name` in this space's tuples.
    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.format.iter().position(|f| f.name == name)
    }

    /// The primary index of this space.
    pub fn primary_index(&self) -> Option<&IndexMetadata> {
        self.indexes.iter().find(|i| i.id == 0)
    }

    /// Look up an index by name.
    ///
    /// The name `primary` always resolves to the primary index, even if it has a different name.
    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indexes
            .iter()
            .find(|i| i.name == name)
            .or_else(|| (name == "primary").then(|| self.primary_index()).flatten())
    }

    /// The names of the fields in this space, in tuple order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.format.iter().map(|f| f.name.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn users() -> SpaceMetadata {
        SpaceMetadata::new(
            512,
            "users",
            vec![
                FieldMetadata::new("id", "unsigned"),
                FieldMetadata::new("name", "string"),
                FieldMetadata::nullable("age", "unsigned"),
            ],
        )
        .with_index(IndexMetadata::new(0, "pk", true, vec![0]))
        .with_index(IndexMetadata::new(1, "by_name", false, vec![1]))
    }

    #[test]
    fn test_index_lookup() {
        let space = users();
        assert_eq!(space.primary_index().unwrap().name, "pk");
        assert_eq!(space.index("primary").unwrap().id, 0);
        assert_eq!(space.index("by_name").unwrap().id, 1);
        assert!(space.index("missing").is_none());
        assert_eq!(space.field_position("age"), Some(2));
    }

    #[test]
    fn test_key_of_short_tuple() {
        let index = IndexMetadata::new(1, "composite", true, vec![0, 3]);
        assert_eq!(
            index.key_of(&[Value::from(1), Value::from("x")]),
            vec![Value::from(1), Value::Nil]
        );
    }
}
