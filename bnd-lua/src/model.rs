//! Function, class and enum models held by the [`crate::registry::Registry`].
//!
//! Scopes are spelled `""` for the global namespace and `::A::B` otherwise.

use std::collections::BTreeMap;

use crate::error::SkipError;
use crate::types::Type;

/// Metamethod names a class may implement, in emission order.
pub const METAMETHOD_NAMES: [&str; 24] = [
    "__add",
    "__sub",
    "__mul",
    "__div",
    "__mod",
    "__pow",
    "__unm",
    "__idiv",
    "__band",
    "__bor",
    "__bxor",
    "__bnot",
    "__shl",
    "__shr",
    "__concat",
    "__len",
    "__eq",
    "__lt",
    "__le",
    "__index",
    "__newindex",
    "__call",
    "__gc",
    "__close",
];

const OPERATOR_OVERLOADS: [&str; 39] = [
    "operator&&",
    "operator||",
    "operator++",
    "operator--",
    "operator()",
    "operator[]",
    "operator+",
    "operator-",
    "operator*",
    "operator->",
    "operator/",
    "operator%",
    "operator^",
    "operator&",
    "operator|",
    "operator~",
    "operator!",
    "operator=",
    "operator<",
    "operator>",
    "operator+=",
    "operator-=",
    "operator*=",
    "operator/=",
    "operator%=",
    "operator^=",
    "operator&=",
    "operator|=",
    "operator<<",
    "operator>>",
    "operator>>=",
    "operator<<=",
    "operator==",
    "operator!=",
    "operator<=",
    "operator>=",
    "operator<=>",
    "operator,",
    "operator->*",
];

/// Operator overloads are not translated to Lua and get no wrapper.
pub fn is_operator_overload(name: &str) -> bool {
    name.starts_with("operator") && OPERATOR_OVERLOADS.contains(&name)
}

/// `::A::B` becomes `__A__B`, usable inside C++ identifiers.
pub fn scope_as_function_name(scope: &str) -> String {
    scope.replace(':', "_")
}

/// `::A::B` becomes `["A", "B"]`; the global scope has no parts.
pub fn scope_parts(scope: &str) -> Vec<&str> {
    scope.split("::").filter(|part| !part.is_empty()).collect()
}

/// Splits `::A::B::C` into `("::A::B", "C")`. A name with no scope lands in
/// the global scope.
pub fn split_qualified(qualified: &str) -> (String, String) {
    match qualified.rfind("::") {
        Some(pos) => {
            let scope = &qualified[..pos];
            let name = &qualified[pos + 2..];
            (normalize_scope(scope), name.to_string())
        }
        None => (String::new(), qualified.to_string()),
    }
}

/// Accepts `A::B`, `::A::B` or `::` and returns the canonical `::A::B` / `""`.
pub fn normalize_scope(scope: &str) -> String {
    scope_parts(scope)
        .iter()
        .map(|part| format!("::{part}"))
        .collect()
}

/// Index of a class inside the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(pub(crate) usize);

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// Parameters in call-site order.
pub type Overload = Vec<Param>;

/// One logical function: a name with one or more overloads.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Name the function is registered under in Lua.
    pub lua_name: String,
    /// Scope used for the native call. For members this is the class itself.
    pub scope: String,
    /// Lua-side scope when it differs from `scope`.
    pub scope_override: Option<String>,
    /// Externally supplied wrapper that replaces the generated body.
    pub wrapper_name: Option<String>,
    /// Header declaring the function.
    pub source: String,
    /// Back-reference to the owning class.
    pub owner: Option<ClassId>,
    pub overloads: Vec<Overload>,
    pub return_type: Type,
    pub is_static: bool,
    pub is_constructor: bool,
    /// Registers an additional Lua name for a wrapper emitted elsewhere.
    pub is_alias: bool,
    pub is_custom_redirector: bool,
    pub shares_file_with_class: bool,
    /// Binding target for free functions.
    pub state: Option<String>,
}

impl Function {
    pub fn new(name: impl Into<String>, scope: impl Into<String>, return_type: Type) -> Self {
        let name = name.into();
        Self {
            lua_name: name.clone(),
            name,
            scope: scope.into(),
            scope_override: None,
            wrapper_name: None,
            source: String::new(),
            owner: None,
            overloads: Vec::new(),
            return_type,
            is_static: false,
            is_constructor: false,
            is_alias: false,
            is_custom_redirector: false,
            shares_file_with_class: true,
            state: None,
        }
    }

    /// Scope the function is registered under on the Lua side.
    pub fn lua_scope(&self) -> &str {
        self.scope_override.as_deref().unwrap_or(&self.scope)
    }

    /// Adds an overload unless an existing one already covers it.
    ///
    /// An overload is a duplicate when some existing overload has the same
    /// arity and an equivalent type at every position (string flavors are
    /// equivalent to each other), or when it takes no parameters and
    /// overloads already exist.
    pub fn add_overload(&mut self, overload: Overload) -> Result<(), SkipError> {
        if overload.is_empty() && !self.overloads.is_empty() {
            return Err(SkipError::DuplicateOverload);
        }
        let duplicate = self.overloads.iter().any(|existing| {
            existing.len() == overload.len()
                && existing
                    .iter()
                    .zip(&overload)
                    .all(|(a, b)| equivalent(&a.ty, &b.ty))
        });
        if duplicate {
            return Err(SkipError::DuplicateOverload);
        }
        self.overloads.push(overload);
        Ok(())
    }
}

fn equivalent(a: &Type, b: &Type) -> bool {
    if a.is_string() && b.is_string() {
        return true;
    }
    match (a.qualified_name(), b.qualified_name()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Functions keyed by name, iterated in name order.
pub type FunctionContainer = BTreeMap<String, Function>;

#[derive(Debug, Clone)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub scope: String,
    /// Lua-side scope when it differs from `scope`.
    pub scope_override: Option<String>,
    pub source: String,
    /// Binding target. Thin classes (`None`) only take part in base
    /// resolution and convertible-to sets.
    pub state: Option<String>,
    pub functions: FunctionContainer,
    pub static_functions: FunctionContainer,
    pub constructors: FunctionContainer,
    /// Keyed by metamethod name.
    pub metamethods: FunctionContainer,
    pub nested: Vec<ClassId>,
    /// Direct bases in declaration order.
    pub bases: Vec<ClassId>,
    pub has_parameterless_constructor: bool,
}

impl Class {
    pub fn new(id: ClassId, name: &str, scope: &str, source: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            scope: scope.to_string(),
            scope_override: None,
            source: source.to_string(),
            state: None,
            functions: FunctionContainer::new(),
            static_functions: FunctionContainer::new(),
            constructors: FunctionContainer::new(),
            metamethods: FunctionContainer::new(),
            nested: Vec::new(),
            bases: Vec::new(),
            has_parameterless_constructor: false,
        }
    }

    pub fn is_exposed(&self) -> bool {
        self.state.is_some()
    }

    /// `::A::B::Name`
    pub fn qualified(&self) -> String {
        format!("{}::{}", self.scope, self.name)
    }

    /// Shared prefix of every generated identifier for this class: `__A__B_Name`.
    pub fn tag(&self) -> String {
        format!("{}_{}", scope_as_function_name(&self.scope), self.name)
    }

    pub fn lua_scope(&self) -> &str {
        self.scope_override.as_deref().unwrap_or(&self.scope)
    }

    /// The constructor dispatch entry, if any non-default constructor exists.
    pub fn constructor(&self) -> Option<&Function> {
        self.constructors.get(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct Enum {
    pub name: String,
    pub scope: String,
    pub state: String,
    /// Declaration order is kept for emission.
    pub values: Vec<(String, u64)>,
}

impl Enum {
    pub fn qualified(&self) -> String {
        format!("{}::{}", self.scope, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Numeric, StringKind, TypeKind};

    fn param(ty: Type) -> Param {
        Param {
            name: String::new(),
            ty,
        }
    }

    #[test]
    fn scope_helpers() {
        assert_eq!(scope_as_function_name("::A::B"), "__A__B");
        assert_eq!(scope_parts("::A::B"), vec!["A", "B"]);
        assert!(scope_parts("").is_empty());
        assert!(scope_parts("::").is_empty());
        assert_eq!(
            split_qualified("::A::B::C"),
            ("::A::B".to_string(), "C".to_string())
        );
        assert_eq!(split_qualified("Foo"), (String::new(), "Foo".to_string()));
        assert_eq!(split_qualified("::Foo"), (String::new(), "Foo".to_string()));
        assert_eq!(normalize_scope("A::B"), "::A::B");
        assert_eq!(normalize_scope("::"), "");
    }

    #[test]
    fn operator_overloads_are_recognised() {
        assert!(is_operator_overload("operator=="));
        assert!(is_operator_overload("operator->*"));
        assert!(!is_operator_overload("operator_helper"));
        assert!(!is_operator_overload("Bar"));
    }

    #[test]
    fn overload_with_same_types_is_duplicate() {
        let mut f = Function::new("Bar", "::Foo", Type::void());
        f.add_overload(vec![param(Type::numeric(Numeric::Int32))])
            .unwrap();
        f.add_overload(vec![param(Type::numeric(Numeric::Float))])
            .unwrap();
        assert_eq!(
            f.add_overload(vec![param(Type::numeric(Numeric::Int32))]),
            Err(SkipError::DuplicateOverload)
        );
        assert_eq!(f.overloads.len(), 2);
    }

    #[test]
    fn string_flavors_are_equivalent_overloads() {
        let mut f = Function::new("Print", "", Type::void());
        f.add_overload(vec![param(TypeKind::Str(StringKind::String).into())])
            .unwrap();
        assert_eq!(
            f.add_overload(vec![param(
                Type::from(TypeKind::Str(StringKind::CString)).pointer()
            )]),
            Err(SkipError::DuplicateOverload)
        );
    }

    #[test]
    fn parameterless_overload_after_others_is_duplicate() {
        let mut f = Function::new("Reset", "", Type::void());
        f.add_overload(vec![param(TypeKind::Bool.into())]).unwrap();
        assert_eq!(f.add_overload(vec![]), Err(SkipError::DuplicateOverload));

        let mut g = Function::new("Reset", "", Type::void());
        g.add_overload(vec![]).unwrap();
        g.add_overload(vec![param(TypeKind::Bool.into())]).unwrap();
        assert_eq!(g.overloads.len(), 2);
    }
}
