//! Logical type tree and the supertype lattice.
//!
//! Provides:
//!
//! - [`FieldType`] — the closed set of column types a stream may declare
//! - [`FieldSchema`] / [`ObjectSchema`] — a declared column and an ordered
//!   set of columns
//! - [`find_super_type`] — narrowest lossless common type for a pair,
//!   symmetric and deterministic
//! - [`nesting_depth`] — how deep a type nests (at most one level is
//!   loadable)

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// The closed set of logical column types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    /// True/false.
    Boolean,
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    Long,
    /// 32-bit floating point.
    Float,
    /// 64-bit floating point.
    Double,
    /// Unicode text.
    String,
    /// Calendar date without time.
    Date,
    /// Time of day with a UTC offset.
    TimeWithTz,
    /// Time of day without an offset.
    TimeWithoutTz,
    /// Instant with a UTC offset.
    TimestampWithTz,
    /// Wall-clock timestamp without an offset.
    TimestampWithoutTz,
    /// Arbitrary JSON document.
    Json,
    /// Single-level record of named columns.
    Struct {
        /// The nested columns, in declared order.
        fields: Vec<(String, FieldSchema)>,
    },
    /// Homogeneous list.
    Array {
        /// Element schema.
        element: Box<FieldSchema>,
    },
    /// Raw bytes. Never promoted.
    Binary,
    /// Fixed-precision decimal. Never promoted.
    Decimal {
        /// Total significant digits.
        precision: u8,
        /// Digits after the point.
        scale: u8,
    },
    /// Fixed-length byte array. Never promoted.
    Fixed {
        /// Length in bytes.
        length: u32,
    },
    /// RFC 4122 UUID. Never promoted.
    Uuid,
    /// Homogeneous string-keyed map. Never promoted.
    Map {
        /// Value schema.
        value: Box<FieldSchema>,
    },
    /// Nanosecond-precision timestamp. Never promoted.
    TimestampNanos,
}

impl FieldType {
    /// Returns `true` if this type sits in the disallowed-for-promotion set.
    ///
    /// A type change involving any of these always raises a schema error,
    /// even against an identical partner — promotion semantics for them are
    /// backend-defined and lossy in the general case.
    #[must_use]
    pub fn promotion_disallowed(&self) -> bool {
        matches!(
            self,
            FieldType::Binary
                | FieldType::Decimal { .. }
                | FieldType::Fixed { .. }
                | FieldType::Uuid
                | FieldType::Map { .. }
                | FieldType::TimestampNanos
        )
    }

    /// Returns `true` if `self` and `other` share a top-level type ID,
    /// ignoring nested structure and parameters.
    #[must_use]
    pub fn same_kind(&self, other: &FieldType) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// One declared column: its type and nullability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// The column type.
    pub data_type: FieldType,
    /// Whether null values are accepted.
    pub nullable: bool,
}

impl FieldSchema {
    /// Creates a non-nullable column schema.
    #[must_use]
    pub fn required(data_type: FieldType) -> Self {
        Self {
            data_type,
            nullable: false,
        }
    }

    /// Creates a nullable column schema.
    #[must_use]
    pub fn optional(data_type: FieldType) -> Self {
        Self {
            data_type,
            nullable: true,
        }
    }
}

/// An ordered set of named columns. Declaration order is preserved; lookups
/// are by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectSchema {
    fields: Vec<(String, FieldSchema)>,
}

impl ObjectSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a schema from `(name, schema)` pairs, keeping their order.
    #[must_use]
    pub fn from_fields(fields: Vec<(String, FieldSchema)>) -> Self {
        Self { fields }
    }

    /// Appends a column. A duplicate name replaces the existing entry
    /// in place, preserving its position.
    pub fn insert(&mut self, name: impl Into<String>, schema: FieldSchema) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = schema;
        } else {
            self.fields.push((name, schema));
        }
    }

    /// Removes a column by name. Returns the removed schema, if present.
    pub fn remove(&mut self, name: &str) -> Option<FieldSchema> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Returns `true` if a column with the given name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates columns in declared order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSchema)> {
        self.fields.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the schema has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Measures how deep a type nests.
///
/// Scalars are depth 0; a struct, array, or map of scalars is depth 1.
/// Destination columns support at most depth 1 — anything deeper fails
/// schema synchronization.
#[must_use]
pub fn nesting_depth(data_type: &FieldType) -> usize {
    match data_type {
        FieldType::Struct { fields } => {
            1 + fields
                .iter()
                .map(|(_, f)| nesting_depth(&f.data_type))
                .max()
                .unwrap_or(0)
        }
        FieldType::Array { element } => 1 + nesting_depth(&element.data_type),
        FieldType::Map { value } => 1 + nesting_depth(&value.data_type),
        _ => 0,
    }
}

/// Resolves the narrowest lossless common type for a changed column.
///
/// Symmetric: `find_super_type(a, b) == find_super_type(b, a)` for every
/// supported pair. Identical top-level type IDs resolve to the existing
/// side unchanged.
///
/// # Errors
///
/// - [`SchemaError::PromotionDisallowed`] if either side never participates
///   in promotion (binary, decimal, fixed, uuid, map, nanosecond timestamp)
/// - [`SchemaError::NoSuperType`] if no lossless promotion exists
pub fn find_super_type(left: &FieldType, right: &FieldType) -> Result<FieldType, SchemaError> {
    if left.promotion_disallowed() {
        return Err(SchemaError::PromotionDisallowed(left.clone()));
    }
    if right.promotion_disallowed() {
        return Err(SchemaError::PromotionDisallowed(right.clone()));
    }
    if left.same_kind(right) {
        return Ok(left.clone());
    }
    match (left, right) {
        // Integer widens losslessly into Long.
        (FieldType::Integer, FieldType::Long) | (FieldType::Long, FieldType::Integer) => {
            Ok(FieldType::Long)
        }
        // Float widens losslessly into Double.
        (FieldType::Float, FieldType::Double) | (FieldType::Double, FieldType::Float) => {
            Ok(FieldType::Double)
        }
        // A 32-bit integer fits exactly in a 64-bit float; a 64-bit integer
        // does not, so Long never promotes toward the float side.
        (FieldType::Integer, FieldType::Float | FieldType::Double)
        | (FieldType::Float | FieldType::Double, FieldType::Integer) => Ok(FieldType::Double),
        _ => Err(SchemaError::NoSuperType {
            left: left.clone(),
            right: right.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_promotable() -> Vec<FieldType> {
        vec![
            FieldType::Boolean,
            FieldType::Integer,
            FieldType::Long,
            FieldType::Float,
            FieldType::Double,
            FieldType::String,
            FieldType::Date,
            FieldType::TimeWithTz,
            FieldType::TimeWithoutTz,
            FieldType::TimestampWithTz,
            FieldType::TimestampWithoutTz,
            FieldType::Json,
        ]
    }

    fn disallowed() -> Vec<FieldType> {
        vec![
            FieldType::Binary,
            FieldType::Decimal {
                precision: 38,
                scale: 9,
            },
            FieldType::Fixed { length: 16 },
            FieldType::Uuid,
            FieldType::Map {
                value: Box::new(FieldSchema::optional(FieldType::String)),
            },
            FieldType::TimestampNanos,
        ]
    }

    #[test]
    fn test_identical_kinds_kept_as_is() {
        for ty in all_promotable() {
            assert_eq!(find_super_type(&ty, &ty).unwrap(), ty);
        }
    }

    #[test]
    fn test_integer_promotes_to_long() {
        assert_eq!(
            find_super_type(&FieldType::Integer, &FieldType::Long).unwrap(),
            FieldType::Long
        );
    }

    #[test]
    fn test_float_promotes_to_double() {
        assert_eq!(
            find_super_type(&FieldType::Float, &FieldType::Double).unwrap(),
            FieldType::Double
        );
    }

    #[test]
    fn test_integer_and_float_meet_at_double() {
        assert_eq!(
            find_super_type(&FieldType::Integer, &FieldType::Float).unwrap(),
            FieldType::Double
        );
        assert_eq!(
            find_super_type(&FieldType::Integer, &FieldType::Double).unwrap(),
            FieldType::Double
        );
    }

    #[test]
    fn test_long_never_meets_float_side() {
        assert!(find_super_type(&FieldType::Long, &FieldType::Float).is_err());
        assert!(find_super_type(&FieldType::Long, &FieldType::Double).is_err());
    }

    #[test]
    fn test_symmetric_over_all_pairs() {
        let types = all_promotable();
        for a in &types {
            for b in &types {
                let ab = find_super_type(a, b);
                let ba = find_super_type(b, a);
                match (ab, ba) {
                    (Ok(x), Ok(y)) => assert_eq!(x, y, "asymmetric for {a:?}/{b:?}"),
                    (Err(_), Err(_)) => {}
                    (x, y) => panic!("asymmetric verdict for {a:?}/{b:?}: {x:?} vs {y:?}"),
                }
            }
        }
    }

    #[test]
    fn test_disallowed_set_always_errors() {
        for bad in disallowed() {
            for other in all_promotable() {
                assert!(
                    matches!(
                        find_super_type(&bad, &other),
                        Err(SchemaError::PromotionDisallowed(_))
                    ),
                    "{bad:?} vs {other:?} should be disallowed"
                );
            }
            // Even against itself.
            assert!(find_super_type(&bad, &bad).is_err());
        }
    }

    #[test]
    fn test_unrelated_pair_is_schema_error() {
        assert!(matches!(
            find_super_type(&FieldType::Boolean, &FieldType::String),
            Err(SchemaError::NoSuperType { .. })
        ));
        assert!(matches!(
            find_super_type(&FieldType::Date, &FieldType::TimestampWithTz),
            Err(SchemaError::NoSuperType { .. })
        ));
    }

    #[test]
    fn test_nesting_depth() {
        assert_eq!(nesting_depth(&FieldType::String), 0);
        let flat_struct = FieldType::Struct {
            fields: vec![("a".into(), FieldSchema::optional(FieldType::Long))],
        };
        assert_eq!(nesting_depth(&flat_struct), 1);
        let nested = FieldType::Array {
            element: Box::new(FieldSchema::optional(flat_struct)),
        };
        assert_eq!(nesting_depth(&nested), 2);
        assert_eq!(
            nesting_depth(&FieldType::Struct { fields: vec![] }),
            1
        );
    }

    #[test]
    fn test_object_schema_order_and_lookup() {
        let mut schema = ObjectSchema::new();
        schema.insert("b", FieldSchema::optional(FieldType::String));
        schema.insert("a", FieldSchema::required(FieldType::Long));
        let names: Vec<&str> = schema.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(schema.get("a").is_some_and(|f| !f.nullable));

        // Replacing keeps position.
        schema.insert("b", FieldSchema::required(FieldType::Boolean));
        let names: Vec<&str> = schema.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(schema.get("b").unwrap().data_type, FieldType::Boolean);

        assert_eq!(schema.remove("b").unwrap().data_type, FieldType::Boolean);
        assert!(!schema.contains("b"));
    }
}
