//! Turns native type spellings from declaration files into [`Type`]s.
//!
//! Names are resolved against the enclosing scope, walking outward, using the
//! sets of class and enum names seen in the declaration stream. Templates the
//! core does not know are offered to the registry's type patches.

use std::collections::BTreeSet;

use crate::error::SkipError;
use crate::model::{scope_parts, split_qualified};
use crate::registry::Registry;
use crate::types::{ForwardDecl, FunctionSignature, Numeric, OpaqueStruct, StringKind, Type, TypeKind};

/// Qualified names (`::A::B::Name`) of every class and enum declared in the
/// stream, whether or not they are bound.
#[derive(Debug, Default, Clone)]
pub struct KnownNames {
    pub classes: BTreeSet<String>,
    pub enums: BTreeSet<String>,
}

impl KnownNames {
    pub fn add_class(&mut self, scope: &str, name: &str) {
        self.classes.insert(format!("{scope}::{name}"));
    }

    pub fn add_enum(&mut self, scope: &str, name: &str) {
        self.enums.insert(format!("{scope}::{name}"));
    }
}

pub struct TypeConverter<'a> {
    registry: &'a Registry,
    known: &'a KnownNames,
}

impl<'a> TypeConverter<'a> {
    pub fn new(registry: &'a Registry, known: &'a KnownNames) -> Self {
        Self { registry, known }
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// Converts `spelling` as written inside `scope`.
    pub fn convert(&self, spelling: &str, scope: &str) -> Result<Type, SkipError> {
        let original = spelling.trim();
        let mut rest = original;
        let mut is_const = false;
        let mut is_pointer = false;
        let mut is_reference = false;

        if let Some(r) = rest.strip_prefix("const ") {
            is_const = true;
            rest = r.trim_start();
        }
        loop {
            rest = rest.trim_end();
            if let Some(r) = rest.strip_suffix('&') {
                if is_reference || is_pointer {
                    return Err(SkipError::UnhandledType(original.to_string()));
                }
                is_reference = true;
                rest = r;
            } else if let Some(r) = rest.strip_suffix(" const") {
                is_const = true;
                rest = r;
            } else if let Some(r) = rest.strip_suffix('*') {
                if is_pointer {
                    return Err(SkipError::MultiLevelPointer(original.to_string()));
                }
                is_pointer = true;
                rest = r;
            } else {
                break;
            }
        }
        let base = rest.trim();

        let (kind, from_core) = self.convert_base(base, original, scope, is_pointer)?;
        let mut ty = Type {
            kind,
            is_pointer,
            is_reference,
            is_const,
        };
        if from_core {
            for patch in self.registry.patches() {
                patch.post_process(&mut ty);
            }
        }
        Ok(ty)
    }

    fn convert_base(
        &self,
        base: &str,
        original: &str,
        scope: &str,
        is_pointer: bool,
    ) -> Result<(TypeKind, bool), SkipError> {
        if let Some(inner) = base
            .strip_prefix("std::function<")
            .and_then(|s| s.strip_suffix('>'))
        {
            let sig = self.signature(inner, original, scope, true)?;
            return Ok((TypeKind::FunctionSignature(sig), true));
        }
        if let Some(pos) = base.find("(*)") {
            let text = format!("{}{}", &base[..pos], &base[pos + 3..]);
            let sig = self.signature(&text, original, scope, false)?;
            return Ok((TypeKind::FunctionSignature(sig), true));
        }
        if let Some(builtin) = builtin(base, is_pointer) {
            return builtin.map(|kind| (kind, true));
        }
        if let Some(name) = base.strip_prefix("enum ") {
            let name = name.trim();
            let qualified = self
                .resolve(name, scope, &self.known.enums)
                .unwrap_or_else(|| qualify(name, scope));
            return Ok((TypeKind::Enum(qualified), true));
        }
        for (keyword, forward) in [("struct ", ForwardDecl::Struct), ("class ", ForwardDecl::Class)] {
            if let Some(name) = base.strip_prefix(keyword) {
                let name = name.trim();
                let qualified = self
                    .resolve(name, scope, &self.known.classes)
                    .unwrap_or_else(|| qualify(name, scope));
                let (class_scope, class_name) = split_qualified(&qualified);
                let mut opaque = OpaqueStruct::new(class_scope, class_name);
                opaque.forward_declaration = Some(forward);
                return Ok((TypeKind::OpaqueStruct(opaque), true));
            }
        }
        if base.contains('<') {
            return self.template(base, original, scope).map(|kind| (kind, false));
        }
        if !is_identifier(base) {
            return Err(SkipError::UnhandledType(original.to_string()));
        }
        if let Some(qualified) = self.resolve(base, scope, &self.known.enums) {
            return Ok((TypeKind::Enum(qualified), true));
        }
        let qualified = self
            .resolve(base, scope, &self.known.classes)
            .unwrap_or_else(|| format!("::{}", base.trim_start_matches("::")));
        let (class_scope, class_name) = split_qualified(&qualified);
        Ok((
            TypeKind::OpaqueStruct(OpaqueStruct::new(class_scope, class_name)),
            true,
        ))
    }

    /// `R(A, B)` into a signature.
    fn signature(
        &self,
        text: &str,
        original: &str,
        scope: &str,
        has_storage: bool,
    ) -> Result<FunctionSignature, SkipError> {
        let unhandled = || SkipError::UnhandledType(original.to_string());
        let open = text.find('(').ok_or_else(unhandled)?;
        let close = text.rfind(')').ok_or_else(unhandled)?;
        if close < open {
            return Err(unhandled());
        }
        let return_type = self.convert(&text[..open], scope)?;
        let mut params = Vec::new();
        let inner = text[open + 1..close].trim();
        if !inner.is_empty() && inner != "void" {
            for param in split_top_level(inner) {
                params.push(self.convert(&param, scope)?);
            }
        }
        Ok(FunctionSignature {
            params,
            return_type: Box::new(return_type),
            has_storage,
        })
    }

    fn template(&self, base: &str, original: &str, scope: &str) -> Result<TypeKind, SkipError> {
        let (Some(open), Some(args)) = (base.find('<'), base.strip_suffix('>')) else {
            return Err(SkipError::UnhandledType(original.to_string()));
        };
        let name = format!("::{}", base[..open].trim().trim_start_matches("::"));
        let args = split_top_level(&args[open + 1..]);
        let mapped = self
            .registry
            .template_classes
            .get(&name)
            .cloned()
            .unwrap_or(name);
        for patch in self.registry.patches() {
            if let Some(converted) = patch.convert(&mapped, &args, self, scope) {
                return converted;
            }
        }
        Err(SkipError::TemplatedType(original.to_string()))
    }

    /// Looks `name` up in `set`, trying `scope` and each enclosing scope.
    fn resolve(&self, name: &str, scope: &str, set: &BTreeSet<String>) -> Option<String> {
        if name.starts_with("::") {
            return set.contains(name).then(|| name.to_string());
        }
        let mut parts = scope_parts(scope);
        loop {
            let prefix: String = parts.iter().map(|part| format!("::{part}")).collect();
            let candidate = format!("{prefix}::{name}");
            if set.contains(&candidate) {
                return Some(candidate);
            }
            parts.pop()?;
        }
    }
}

/// `name` as written in `scope` when nothing better is known.
fn qualify(name: &str, scope: &str) -> String {
    if name.starts_with("::") {
        name.to_string()
    } else {
        format!("{scope}::{name}")
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Splits on commas outside `<>` and `()`.
pub(crate) fn split_top_level(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '<' | '(' => depth += 1,
            '>' | ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn builtin(base: &str, is_pointer: bool) -> Option<Result<TypeKind, SkipError>> {
    let kind = match base.trim_start_matches("::") {
        "void" => TypeKind::Void,
        "bool" => TypeKind::Bool,
        "int8_t" | "signed char" => TypeKind::Numeric(Numeric::Int8),
        "int16_t" | "short" => TypeKind::Numeric(Numeric::Int16),
        "int32_t" | "int" => TypeKind::Numeric(Numeric::Int32),
        "int64_t" | "long long" => TypeKind::Numeric(Numeric::Int64),
        "uint8_t" | "unsigned char" => TypeKind::Numeric(Numeric::UInt8),
        "uint16_t" | "unsigned short" => TypeKind::Numeric(Numeric::UInt16),
        "uint32_t" | "unsigned int" | "unsigned" => TypeKind::Numeric(Numeric::UInt32),
        "uint64_t" | "unsigned long long" | "size_t" => TypeKind::Numeric(Numeric::UInt64),
        "float" => TypeKind::Numeric(Numeric::Float),
        "double" => TypeKind::Numeric(Numeric::Double),
        "char" if is_pointer => TypeKind::Str(StringKind::CString),
        "char" => return Some(Err(SkipError::PlainChar)),
        "wchar_t" if is_pointer => TypeKind::Str(StringKind::CWString),
        "wchar_t" => return Some(Err(SkipError::UnhandledType("wchar_t".to_string()))),
        "std::string" | "std::string_view" => TypeKind::Str(StringKind::String),
        "std::wstring" | "std::wstring_view" => TypeKind::Str(StringKind::WString),
        "File::StringType" | "File::StringViewType" | "RC::File::StringType" => {
            TypeKind::Str(StringKind::AutoString)
        }
        _ => return None,
    };
    Some(Ok(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> KnownNames {
        let mut known = KnownNames::default();
        known.add_class("::Gfx", "Texture");
        known.add_class("", "Widget");
        known.add_enum("::Gfx", "Filter");
        known
    }

    fn convert(spelling: &str, scope: &str) -> Result<Type, SkipError> {
        let registry = Registry::default();
        let known = known();
        TypeConverter::new(&registry, &known).convert(spelling, scope)
    }

    #[test]
    fn builtins_and_modifiers() {
        let ty = convert("const int32_t&", "").unwrap();
        assert!(matches!(ty.kind, TypeKind::Numeric(Numeric::Int32)));
        assert!(ty.is_const && ty.is_reference && !ty.is_pointer);

        let ty = convert("unsigned long long", "").unwrap();
        assert!(matches!(ty.kind, TypeKind::Numeric(Numeric::UInt64)));

        let ty = convert("const char*", "").unwrap();
        assert!(matches!(ty.kind, TypeKind::Str(StringKind::CString)));
        assert!(ty.is_pointer && ty.is_const);

        let ty = convert("std::wstring_view", "").unwrap();
        assert!(matches!(ty.kind, TypeKind::Str(StringKind::WString)));
    }

    #[test]
    fn unsupported_spellings_are_skips() {
        assert_eq!(convert("char", "").unwrap_err(), SkipError::PlainChar);
        assert_eq!(
            convert("int**", "").unwrap_err(),
            SkipError::MultiLevelPointer("int**".into())
        );
        assert_eq!(
            convert("std::vector<int>", "").unwrap_err(),
            SkipError::TemplatedType("std::vector<int>".into())
        );
        assert!(matches!(convert("int&&", ""), Err(SkipError::UnhandledType(_))));
    }

    #[test]
    fn names_resolve_outward_from_scope() {
        let ty = convert("Texture*", "::Gfx::Texture").unwrap();
        let opaque = ty.as_opaque().unwrap();
        assert_eq!(opaque.qualified(), "::Gfx::Texture");
        assert!(opaque.forward_declaration.is_none());

        let ty = convert("Widget&", "::Gfx").unwrap();
        assert_eq!(ty.as_opaque().unwrap().qualified(), "::Widget");

        let ty = convert("Filter", "::Gfx::Texture").unwrap();
        assert!(matches!(&ty.kind, TypeKind::Enum(name) if name == "::Gfx::Filter"));
    }

    #[test]
    fn forward_declarations_keep_their_kind() {
        let ty = convert("struct Socket*", "::Net").unwrap();
        let opaque = ty.as_opaque().unwrap();
        assert_eq!(opaque.qualified(), "::Net::Socket");
        assert_eq!(opaque.forward_declaration, Some(ForwardDecl::Struct));
    }

    #[test]
    fn function_pointers_and_closures() {
        let ty = convert("void(*)(int, const Texture*)", "::Gfx").unwrap();
        let TypeKind::FunctionSignature(sig) = &ty.kind else {
            panic!("expected a signature, got {ty:?}");
        };
        assert!(!sig.has_storage);
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.signature(true).unwrap(), "void(*)(int32_t, const ::Gfx::Texture*)");

        let ty = convert("const std::function<bool(Filter)>&", "::Gfx").unwrap();
        let TypeKind::FunctionSignature(sig) = &ty.kind else {
            panic!("expected a signature, got {ty:?}");
        };
        assert!(sig.has_storage);
        assert!(ty.is_reference && ty.is_const);
        assert_eq!(sig.signature(false).unwrap(), "bool(::Gfx::Filter)");
    }

    #[test]
    fn top_level_split_respects_nesting() {
        assert_eq!(
            split_top_level("int, std::function<void(int, int)>, Map<A, B>"),
            vec!["int", "std::function<void(int, int)>", "Map<A, B>"]
        );
    }
}
