//! Error tiers of a generation run.
//!
//! Two tiers live in-process:
//!
//! - [`SkipError`]: one declaration cannot be translated. Ingestion drops it,
//!   logs the reason with `warn!`, and moves on.
//! - [`AbortError`]: an internal invariant was violated. The run stops.
//!
//! The third tier (errors raised by the *generated* glue at the Lua boundary)
//! is emitted text, see [`crate::callgen::runtime_errors`].

use thiserror::Error;

use crate::model::ClassId;

/// A declaration that cannot be turned into bindings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipError {
    /// The type spelling is not one the converter (or any patch) understands.
    #[error("type '{0}' is unhandled")]
    UnhandledType(String),

    /// Templates are only accepted when a patch recognises them.
    #[error("templated type '{0}' is not supported")]
    TemplatedType(String),

    #[error("multi-level pointer '{0}' is not supported")]
    MultiLevelPointer(String),

    /// `char` by value has no string or numeric mapping.
    #[error("type 'char' is only supported as 'char*'")]
    PlainChar,

    /// A class with the same `(scope, name)` is already registered.
    #[error("a class named '{name}' already exists")]
    DuplicateClass { name: String, existing: ClassId },

    #[error("an enum named '{0}' already exists")]
    DuplicateEnum(String),

    /// The overload adds no information over one already registered.
    #[error("overload already exists")]
    DuplicateOverload,

    /// A declaration refers to a class that was never declared.
    #[error("class '{0}' was never declared")]
    UnknownClass(String),
}

/// An internal invariant violated during ingestion or emission.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AbortError {
    /// A capability was requested from a kind that does not provide it.
    #[error("'{operation}' is not supported for type '{kind}'")]
    Unsupported {
        operation: &'static str,
        kind: String,
    },

    /// An opaque struct type refers to a class the registry never saw.
    #[error("was unable to find class or struct for type '{0}'")]
    MissingClass(String),

    /// An opaque struct value is pushed but has no owning class.
    #[error("was unable to find an owner to type '{0}'")]
    MissingOwner(String),

    /// Adding a base edge would make a class its own ancestor.
    #[error("base cycle: '{derived}' cannot derive from '{base}'")]
    BaseCycle { derived: String, base: String },

    #[error("function '{0}' has no overloads")]
    NoOverloads(String),
}
