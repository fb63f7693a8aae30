//! The type model and its capability contract.
//!
//! Every C++ type a binding touches is a [`Type`]: a closed [`TypeKind`] plus
//! the pointer/reference/const modifiers. The call-code generator and class
//! emitter only ever talk to a type through the contract methods on [`Type`]
//! (`validate`, `retrieve`, `push`, `tiebreak`, and the optional conversion and
//! extra-processing phases), so they never branch on concrete kinds.
//!
//! Operations a kind does not support return [`AbortError::Unsupported`].

use std::fmt;
use std::sync::Arc;

use crate::error::AbortError;
use crate::model::scope_as_function_name;
use crate::registry::Registry;

/// Returned by every kind without a value-level overload check.
const DEFAULT_TIEBREAK: &str = "                return true;";

/// Fixed-width numeric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Numeric {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
}

impl Numeric {
    pub const ALL: [Numeric; 10] = [
        Numeric::Int8,
        Numeric::Int16,
        Numeric::Int32,
        Numeric::Int64,
        Numeric::UInt8,
        Numeric::UInt16,
        Numeric::UInt32,
        Numeric::UInt64,
        Numeric::Float,
        Numeric::Double,
    ];

    pub fn cxx_name(self) -> &'static str {
        match self {
            Numeric::Int8 => "int8_t",
            Numeric::Int16 => "int16_t",
            Numeric::Int32 => "int32_t",
            Numeric::Int64 => "int64_t",
            Numeric::UInt8 => "uint8_t",
            Numeric::UInt16 => "uint16_t",
            Numeric::UInt32 => "uint32_t",
            Numeric::UInt64 => "uint64_t",
            Numeric::Float => "float",
            Numeric::Double => "double",
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, Numeric::Float | Numeric::Double)
    }
}

/// The four string flavors plus the platform-dependent `File::StringType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringKind {
    /// `char*`
    CString,
    /// `wchar_t*`
    CWString,
    /// `std::string`
    String,
    /// `std::wstring`
    WString,
    /// `RC::File::StringType`, treated as wide.
    AutoString,
}

impl StringKind {
    pub fn cxx_name(self) -> &'static str {
        match self {
            StringKind::CString => "char*",
            StringKind::CWString => "wchar_t*",
            StringKind::String => "std::string",
            StringKind::WString => "std::wstring",
            StringKind::AutoString => "RC::File::StringType",
        }
    }

    /// Name used for `qualified_name`, before the modifier suffix.
    fn base_name(self) -> &'static str {
        match self {
            StringKind::CString => "char",
            StringKind::CWString => "wchar_t",
            StringKind::String => "std::string",
            StringKind::WString => "std::wstring",
            StringKind::AutoString => "::RC::File::StringType",
        }
    }

    fn is_wide(self) -> bool {
        matches!(
            self,
            StringKind::CWString | StringKind::WString | StringKind::AutoString
        )
    }
}

/// How an opaque struct was spelled when it was never fully defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecl {
    Struct,
    Class,
}

/// A reference to a registered class or struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueStruct {
    pub name: String,
    /// `""` for the global scope, otherwise `::A::B`.
    pub scope: String,
    pub forward_declaration: Option<ForwardDecl>,
    /// Pushes construct the userdata from `std::move(value)`.
    pub move_on_construct: bool,
}

impl OpaqueStruct {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: scope.into(),
            forward_declaration: None,
            move_on_construct: false,
        }
    }

    /// `::A::B::Name`
    pub fn qualified(&self) -> String {
        format!("{}::{}", self.scope, self.name)
    }

    /// Key shared by the metatable name and the convertible-to set:
    /// `__A__B_Name`.
    pub fn tag(&self) -> String {
        format!("{}_{}", scope_as_function_name(&self.scope), self.name)
    }
}

/// A function pointer (`R(*)(A)`) or closure (`std::function<R(A)>`).
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub params: Vec<Type>,
    pub return_type: Box<Type>,
    /// Closures capture state; raw function pointers go through `fnptr`.
    pub has_storage: bool,
}

impl FunctionSignature {
    /// `Ret(*)(const A*, B&)` when `as_pointer`, otherwise `Ret(const A*, B&)`.
    pub fn signature(&self, as_pointer: bool) -> Result<String, AbortError> {
        let mut params = Vec::with_capacity(self.params.len());
        for param in &self.params {
            params.push(format!(
                "{}{}",
                if param.is_const { "const " } else { "" },
                param.qualified_name()?
            ));
        }
        Ok(format!(
            "{}{}({})",
            self.return_type.cxx_name()?,
            if as_pointer { "(*)" } else { "" },
            params.join(", ")
        ))
    }

    /// Name of the generated Lua wrapper: `Ret_<ret>_Params_<p1>_<p2>`.
    pub fn wrapper_name(&self) -> Result<String, AbortError> {
        let mut params = Vec::with_capacity(self.params.len());
        for param in &self.params {
            params.push(format!(
                "{}{}{}{}",
                if param.is_const { "Const" } else { "" },
                scope_as_function_name(&param.cxx_name()?),
                if param.is_pointer { "Ptr" } else { "" },
                if param.is_reference { "Ref" } else { "" },
            ));
        }
        Ok(format!(
            "Ret_{}_Params_{}",
            scope_as_function_name(&self.return_type.cxx_name()?),
            params.join("_")
        ))
    }
}

/// A type kind supplied by a [`crate::patch::TypePatch`].
///
/// The modifiers live on the wrapping [`Type`], which is passed back into
/// every call.
pub trait PatchedType: fmt::Debug {
    fn cxx_name(&self) -> String;

    fn validate(&self, ty: &Type, slot: i32) -> String;

    fn retrieve(&self, ty: &Type, slot: i32) -> String;

    fn push(
        &self,
        ty: &Type,
        value: &str,
        prefix: &str,
        registry: &Registry,
    ) -> Result<String, AbortError>;

    fn tiebreak(&self, _ty: &Type, _slot: i32) -> String {
        DEFAULT_TIEBREAK.to_string()
    }

    fn needs_conversion(&self) -> bool {
        false
    }

    fn converted(&self, _ty: &Type, _param: usize) -> Result<String, AbortError> {
        Err(AbortError::Unsupported {
            operation: "converted",
            kind: self.cxx_name(),
        })
    }

    /// Types nested inside this one, walked when collecting function
    /// signatures.
    fn inner_types(&self) -> Vec<&Type> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Numeric(Numeric),
    Bool,
    Str(StringKind),
    /// Holds the enum's qualified C++ name.
    Enum(String),
    OpaqueStruct(OpaqueStruct),
    FunctionSignature(FunctionSignature),
    Patch(Arc<dyn PatchedType>),
}

/// Coarse grouping used by `is_a` for shared codegen paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindGroup {
    Numeric,
    String,
}

#[derive(Debug, Clone)]
pub struct Type {
    pub kind: TypeKind,
    pub is_pointer: bool,
    pub is_reference: bool,
    pub is_const: bool,
}

impl From<TypeKind> for Type {
    fn from(kind: TypeKind) -> Self {
        Type {
            kind,
            is_pointer: false,
            is_reference: false,
            is_const: false,
        }
    }
}

impl Type {
    pub fn void() -> Self {
        TypeKind::Void.into()
    }

    pub fn numeric(numeric: Numeric) -> Self {
        TypeKind::Numeric(numeric).into()
    }

    pub fn opaque(scope: impl Into<String>, name: impl Into<String>) -> Self {
        TypeKind::OpaqueStruct(OpaqueStruct::new(scope, name)).into()
    }

    pub fn pointer(mut self) -> Self {
        self.is_pointer = true;
        self
    }

    pub fn reference(mut self) -> Self {
        self.is_reference = true;
        self
    }

    pub fn constant(mut self) -> Self {
        self.is_const = true;
        self
    }

    pub fn group(&self) -> Option<KindGroup> {
        match self.kind {
            TypeKind::Numeric(_) => Some(KindGroup::Numeric),
            TypeKind::Str(_) => Some(KindGroup::String),
            _ => None,
        }
    }

    pub fn is_a(&self, group: KindGroup) -> bool {
        self.group() == Some(group)
    }

    pub fn is_string(&self) -> bool {
        self.is_a(KindGroup::String)
    }

    /// `void` by value: no return value is pushed.
    pub fn is_void_value(&self) -> bool {
        matches!(self.kind, TypeKind::Void) && !self.is_pointer
    }

    pub fn as_opaque(&self) -> Option<&OpaqueStruct> {
        match &self.kind {
            TypeKind::OpaqueStruct(opaque) => Some(opaque),
            _ => None,
        }
    }

    /// `*`, `&` or `*&` as carried by the modifiers.
    pub fn pointer_ref(&self) -> &'static str {
        match (self.is_pointer, self.is_reference) {
            (true, true) => "*&",
            (true, false) => "*",
            (false, true) => "&",
            (false, false) => "",
        }
    }

    fn kind_label(&self) -> String {
        match &self.kind {
            TypeKind::Void => "void".to_string(),
            TypeKind::Numeric(n) => n.cxx_name().to_string(),
            TypeKind::Bool => "bool".to_string(),
            TypeKind::Str(s) => s.cxx_name().to_string(),
            TypeKind::Enum(name) => name.clone(),
            TypeKind::OpaqueStruct(opaque) => opaque.qualified(),
            TypeKind::FunctionSignature(_) => "function signature".to_string(),
            TypeKind::Patch(patched) => patched.cxx_name(),
        }
    }

    fn unsupported(&self, operation: &'static str) -> AbortError {
        AbortError::Unsupported {
            operation,
            kind: self.kind_label(),
        }
    }

    /// The C++ spelling without modifiers.
    pub fn cxx_name(&self) -> Result<String, AbortError> {
        Ok(match &self.kind {
            TypeKind::Void => "void".to_string(),
            TypeKind::Numeric(n) => n.cxx_name().to_string(),
            TypeKind::Bool => "bool".to_string(),
            TypeKind::Str(s) => s.cxx_name().to_string(),
            TypeKind::Enum(name) => name.clone(),
            TypeKind::OpaqueStruct(opaque) => opaque.name.clone(),
            TypeKind::FunctionSignature(_) => return Err(self.unsupported("cxx_name")),
            TypeKind::Patch(patched) => patched.cxx_name(),
        })
    }

    /// The C++ spelling with scope and modifiers, used in signatures and for
    /// comparing overloads.
    pub fn qualified_name(&self) -> Result<String, AbortError> {
        let suffix = self.pointer_ref();
        Ok(match &self.kind {
            TypeKind::Str(s) => format!("{}{}", s.base_name(), suffix),
            TypeKind::OpaqueStruct(opaque) => format!("{}{}", opaque.qualified(), suffix),
            TypeKind::FunctionSignature(sig) => sig.signature(false)?,
            _ => format!("{}{}", self.cxx_name()?, suffix),
        })
    }

    /// Boolean C++ expression: is the value at `slot` convertible to this type.
    pub fn validate(&self, slot: i32) -> String {
        match &self.kind {
            TypeKind::Void => {
                if self.is_reference {
                    format!("lua_islightuserdata(lua_state, {slot}) || lua_isuserdata(lua_state, {slot})")
                } else if self.is_pointer {
                    format!(
                        "lua_islightuserdata(lua_state, {slot}) || lua_isnil(lua_state, {slot}) || lua_isuserdata(lua_state, {slot})"
                    )
                } else {
                    format!("lua_isnil(lua_state, {slot})")
                }
            }
            TypeKind::Numeric(_) => {
                if self.is_pointer {
                    format!(
                        "lua_islightuserdata(lua_state, {slot}) || lua_isnil(lua_state, {slot}) || lua_isuserdata(lua_state, {slot})"
                    )
                } else if self.is_reference {
                    format!("lua_islightuserdata(lua_state, {slot}) || lua_isuserdata(lua_state, {slot})")
                } else {
                    format!("lua_isnumber(lua_state, {slot})")
                }
            }
            TypeKind::Bool => format!("lua_isboolean(lua_state, {slot})"),
            TypeKind::Str(_) => format!("lua_isstring(lua_state, {slot})"),
            TypeKind::Enum(_) => format!("lua_isinteger(lua_state, {slot})"),
            TypeKind::OpaqueStruct(_) => {
                if self.is_pointer {
                    format!("lua_isuserdata(lua_state, {slot}) || lua_isnil(lua_state, {slot})")
                } else {
                    format!("lua_isuserdata(lua_state, {slot})")
                }
            }
            TypeKind::FunctionSignature(_) => format!(
                "lua_isfunction(lua_state, {slot}) || lua_isuserdata(lua_state, {slot}) || lua_isinteger(lua_state, {slot}) || lua_isnil(lua_state, {slot})"
            ),
            TypeKind::Patch(patched) => patched.validate(self, slot),
        }
    }

    /// Body of a lambda returning whether this parameter survives the
    /// value-level overload check.
    pub fn tiebreak(&self, slot: i32) -> String {
        match &self.kind {
            TypeKind::OpaqueStruct(opaque) => {
                let mut buffer = String::from("                bool matches_overload{};\n");
                buffer.push_str(&format!("                if (lua_isuserdata(lua_state, {slot}))\n"));
                buffer.push_str("                {\n");
                buffer.push_str(&format!("                    lua_getmetatable(lua_state, {slot});\n"));
                buffer.push_str("                    lua_pushliteral(lua_state, \"__name\");\n");
                buffer.push_str("                    lua_rawget(lua_state, -2);\n");
                buffer.push_str("                    auto metatable_name = std::string{lua_tostring(lua_state, -1)};\n");
                buffer.push_str(&format!(
                    "                    if (convertible_to_{}.contains(metatable_name))\n",
                    opaque.tag()
                ));
                buffer.push_str("                    {\n");
                buffer.push_str("                        matches_overload = true;\n");
                buffer.push_str("                    }\n");
                buffer.push_str("                }\n");
                buffer.push_str("                else // value is nil (treat as nullptr)\n");
                buffer.push_str("                {\n");
                buffer.push_str("                    matches_overload = true;\n");
                buffer.push_str("                }\n");
                buffer.push_str("                if (matches_overload)\n");
                buffer.push_str("                {\n");
                buffer.push_str("                    return true;\n");
                buffer.push_str("                }\n");
                buffer.push_str("                else\n");
                buffer.push_str("                {\n");
                buffer.push_str("                    return false;\n");
                buffer.push_str("                }");
                buffer
            }
            TypeKind::Patch(patched) => patched.tiebreak(self, slot),
            _ => DEFAULT_TIEBREAK.to_string(),
        }
    }

    /// C++ expression producing the native value, assuming `validate` passed.
    pub fn retrieve(&self, slot: i32, registry: &Registry) -> Result<String, AbortError> {
        let constness = if self.is_const { "const " } else { "" };
        Ok(match &self.kind {
            TypeKind::Void => {
                if self.is_reference {
                    format!("*static_cast<void**>(lua_touserdata(lua_state, {slot}))")
                } else if self.is_pointer {
                    format!("lua_isnil(lua_state, {slot}) ? nullptr : lua_touserdata(lua_state, {slot})")
                } else {
                    return Err(self.unsupported("retrieve"));
                }
            }
            TypeKind::Numeric(n) => {
                let name = n.cxx_name();
                if self.is_pointer {
                    format!(
                        "static_cast<{constness}{name}*>(lua_isnil(lua_state, {slot}) ? nullptr : lua_touserdata(lua_state, {slot}))"
                    )
                } else if self.is_reference {
                    format!("*static_cast<{constness}{name}*>(lua_touserdata(lua_state, {slot}))")
                } else {
                    format!("static_cast<{name}>(lua_tonumber(lua_state, {slot}))")
                }
            }
            TypeKind::Bool => format!("lua_toboolean(lua_state, {slot})"),
            TypeKind::Str(StringKind::String) => {
                format!("std::string{{lua_tostring(lua_state, {slot})}}")
            }
            TypeKind::Str(_) => format!("lua_tostring(lua_state, {slot})"),
            TypeKind::Enum(name) => format!("static_cast<{name}>(lua_tointeger(lua_state, {slot}))"),
            TypeKind::OpaqueStruct(opaque) => {
                let scope = match registry.find_class(&opaque.scope, &opaque.name) {
                    Some(class) => class.scope.clone(),
                    None if opaque.forward_declaration.is_some() => opaque.scope.clone(),
                    None => return Err(AbortError::MissingClass(opaque.name.clone())),
                };
                let tag = opaque.tag();
                let name = &opaque.name;
                if self.is_pointer {
                    format!(
                        "lua_isnil(lua_state, {slot}) ? nullptr : static_cast<{scope}::{name}*>(luaL_checkudata(lua_state, {slot}, \"{tag}Metatable\"))"
                    )
                } else {
                    format!("*static_cast<{scope}::{name}*>(luaL_checkudata(lua_state, {slot}, \"{tag}Metatable\"))")
                }
            }
            TypeKind::FunctionSignature(_) => {
                let mut buffer = String::from("[&]() {\n");
                buffer.push_str(&format!("        if (lua_isfunction(lua_state, {slot}))\n"));
                buffer.push_str("        {\n");
                buffer.push_str("            return luaL_ref(lua_state, LUA_REGISTRYINDEX);\n");
                buffer.push_str("        }\n");
                buffer.push_str("        else\n");
                buffer.push_str("        {\n");
                buffer.push_str("            return 0;\n");
                buffer.push_str("        }\n");
                buffer.push_str("}();\n");
                buffer
            }
            TypeKind::Patch(patched) => patched.retrieve(self, slot),
        })
    }

    /// Statements that push `value` onto the Lua stack. `prefix` qualifies
    /// `lua_state` when pushing from inside a captured lambda.
    pub fn push(&self, value: &str, prefix: &str, registry: &Registry) -> Result<String, AbortError> {
        Ok(match &self.kind {
            TypeKind::Void => {
                if self.is_pointer {
                    format!("        lua_pushlightuserdata({prefix}lua_state, {value})")
                } else {
                    return Err(self.unsupported("push"));
                }
            }
            TypeKind::Numeric(n) => {
                if self.is_pointer {
                    format!("        lua_pushlightuserdata({prefix}lua_state, {value})")
                } else {
                    format!(
                        "        lua_{}({prefix}lua_state, static_cast<{}>({value}))",
                        if n.is_floating_point() { "pushnumber" } else { "pushinteger" },
                        n.cxx_name()
                    )
                }
            }
            TypeKind::Bool => format!("        lua_pushboolean({prefix}lua_state, {value})"),
            TypeKind::Str(StringKind::CString) => format!("        lua_pushstring({prefix}lua_state, {value})"),
            TypeKind::Str(StringKind::String) => {
                format!("        lua_pushstring({prefix}lua_state, {value}.c_str())")
            }
            TypeKind::Str(_) => {
                format!("        lua_pushstring({prefix}lua_state, ::RC::to_string({value}).c_str())")
            }
            TypeKind::Enum(_) => {
                format!("        lua_pushinteger({prefix}lua_state, static_cast<lua_Integer>({value}))")
            }
            TypeKind::OpaqueStruct(opaque) => self.push_opaque(opaque, value, prefix, registry)?,
            TypeKind::FunctionSignature(sig) => {
                let mut buffer = String::new();
                buffer.push_str("        auto userdata = lua_newuserdatauv(lua_state, sizeof(FunctionProto), 0);\n");
                buffer.push_str(&format!(
                    "        new(userdata) FunctionProto{{std::bit_cast<void*>({value}), &{}}};\n",
                    sig.wrapper_name()?
                ));
                buffer.push_str("        luaL_getmetatable(lua_state, \"FunctionProtoMetatable\");\n");
                buffer.push_str("        lua_setmetatable(lua_state, -2);\n");
                buffer
            }
            TypeKind::Patch(patched) => patched.push(self, value, prefix, registry)?,
        })
    }

    fn push_opaque(
        &self,
        opaque: &OpaqueStruct,
        value: &str,
        prefix: &str,
        registry: &Registry,
    ) -> Result<String, AbortError> {
        let owner = registry
            .find_class(&opaque.scope, &opaque.name)
            .ok_or_else(|| AbortError::MissingOwner(opaque.qualified()))?;
        let full = format!("{}::{}", owner.scope, owner.name);
        let star = if self.is_pointer { "*" } else { "" };

        let mut buffer = String::new();
        buffer.push_str(&format!(
            "        auto* userdata = static_cast<{full}*>(lua_newuserdatauv({prefix}lua_state, sizeof({full}{star}), 1));\n"
        ));
        buffer.push_str(&format!(
            "        lua_pushinteger({prefix}lua_state, {});\n",
            if self.is_pointer { 1 } else { 0 }
        ));
        buffer.push_str(&format!("        lua_setiuservalue({prefix}lua_state, -2, 1);\n"));
        let construct_from = if opaque.move_on_construct {
            format!("std::move({value})")
        } else {
            value.to_string()
        };
        buffer.push_str(&format!(
            "        new(userdata) {}{full}{star}{{{construct_from}}};\n",
            if self.is_const { "const " } else { "" }
        ));
        buffer.push_str(&format!(
            "        luaL_getmetatable({prefix}lua_state, \"{}_{}Metatable\");\n",
            scope_as_function_name(&opaque.scope),
            owner.name
        ));
        buffer.push_str(&format!("        lua_setmetatable({prefix}lua_state, -2)"));
        Ok(buffer)
    }

    /// Whether `retrieve` yields an intermediate that `converted` finishes.
    pub fn needs_conversion(&self) -> bool {
        match &self.kind {
            TypeKind::Str(s) => s.is_wide(),
            TypeKind::FunctionSignature(_) => true,
            TypeKind::Patch(patched) => patched.needs_conversion(),
            _ => false,
        }
    }

    /// Statement turning `param_inter_N` into `param_N`. Closures without
    /// storage also append a recursion resetter that runs after the native call.
    pub fn converted(
        &self,
        param: usize,
        resetters: &mut Vec<String>,
        registry: &Registry,
    ) -> Result<String, AbortError> {
        match &self.kind {
            TypeKind::Str(StringKind::CWString) => Ok(format!(
                "auto param_ansi_{param} = std::string{{param_inter_{param}}};\n                auto param_wide_{param} = std::wstring{{param_ansi_{param}.begin(), param_ansi_{param}.end()}};\n                auto param_{param} = param_wide_{param}.c_str()"
            )),
            TypeKind::Str(StringKind::WString) => Ok(format!(
                "auto param_ansi_{param} = std::string{{param_inter_{param}}};\n                auto param_{param} = std::wstring{{param_ansi_{param}.begin(), param_ansi_{param}.end()}}"
            )),
            TypeKind::Str(StringKind::AutoString) => Ok(format!(
                "auto param_unknown_{param} = std::string{{param_inter_{param}}};\n                auto param_{param} = RC::File::StringType{{param_unknown_{param}.begin(), param_unknown_{param}.end()}}"
            )),
            TypeKind::FunctionSignature(sig) => convert_closure(sig, param, resetters, registry),
            TypeKind::Patch(patched) => patched.converted(self, param),
            _ => Err(self.unsupported("converted")),
        }
    }

    /// Opaque structs skip the validate/retrieve split and extract through
    /// `lua_util_userdata_Get`, which also accepts nil for pointers.
    pub fn needs_extra_processing(&self) -> bool {
        matches!(self.kind, TypeKind::OpaqueStruct(_))
    }

    pub fn extra_processing(&self, slot: i32) -> Result<String, AbortError> {
        let TypeKind::OpaqueStruct(opaque) = &self.kind else {
            return Err(self.unsupported("extra_processing"));
        };
        Ok(format!(
            "        auto{} param_{slot} = lua_util_userdata_Get<\"{tag}Metatable\", {}::{}{}, convertible_to_{tag}>(lua_state, {slot});\n",
            if self.is_reference { "&" } else { "" },
            opaque.scope,
            opaque.name,
            self.pointer_ref(),
            tag = opaque.tag(),
        ))
    }

    /// Every function signature reachable from this type, outermost first.
    pub fn signatures(&self) -> Vec<&FunctionSignature> {
        let mut found = Vec::new();
        self.collect_signatures(&mut found);
        found
    }

    fn collect_signatures<'a>(&'a self, found: &mut Vec<&'a FunctionSignature>) {
        match &self.kind {
            TypeKind::FunctionSignature(sig) => {
                found.push(sig);
                for param in &sig.params {
                    param.collect_signatures(found);
                }
                sig.return_type.collect_signatures(found);
            }
            TypeKind::Patch(patched) => {
                for inner in patched.inner_types() {
                    inner.collect_signatures(found);
                }
            }
            _ => {}
        }
    }
}

/// The closure conversion: wraps the registry reference taken by `retrieve`
/// in a native lambda that calls back into Lua.
fn convert_closure(
    sig: &FunctionSignature,
    param: usize,
    resetters: &mut Vec<String>,
    registry: &Registry,
) -> Result<String, AbortError> {
    let mut buffer = String::new();
    let mut prefix = String::new();

    if !sig.has_storage {
        prefix = format!("lambda_params_{param}.");
        buffer.push_str(&format!("struct LambdaParams_{param}\n"));
        buffer.push_str("        {\n");
        buffer.push_str("            lua_State* lua_state;\n");
        buffer.push_str(&format!("            int param_inter_{param};\n"));
        buffer.push_str("        };\n");
        buffer.push_str(&format!(
            "        static std::vector<LambdaParams_{param}> static_lambda_params_{param}{{}};\n"
        ));
        buffer.push_str(&format!("        static LambdaParams_{param} lambda_params_{param}{{}};\n"));
        buffer.push_str(&format!(
            "        lambda_params_{param} = static_lambda_params_{param}.emplace_back(LambdaParams_{param}{{lua_state, param_inter_{param}}});\n"
        ));
    }

    buffer.push_str(&format!(
        "auto param_function_ref_{param} = [{}](",
        if sig.has_storage { "=" } else { "&" }
    ));
    let mut lambda_params = Vec::with_capacity(sig.params.len());
    for (i, param_type) in sig.params.iter().enumerate() {
        lambda_params.push(format!(
            "{}{}{} lambda_param_{}",
            if param_type.is_const { "const " } else { "" },
            param_type.cxx_name()?,
            param_type.pointer_ref(),
            i + 1
        ));
    }
    buffer.push_str(&lambda_params.join(", "));

    let ret = &sig.return_type;
    buffer.push_str(&format!(
        ") -> {}{}{} {{\n",
        if ret.is_const { "const " } else { "" },
        ret.cxx_name()?,
        ret.pointer_ref()
    ));
    buffer.push_str(&format!(
        "            if (lua_rawgeti({prefix}lua_state, LUA_REGISTRYINDEX, {prefix}param_inter_{param}) != LUA_TFUNCTION)\n"
    ));
    buffer.push_str("            {\n");
    buffer.push_str(&format!(
        "                luaL_error({prefix}lua_state, std::format(\"Expected 'function' got '{{}}'\", lua_typename({prefix}lua_state, -1)).c_str());\n"
    ));
    buffer.push_str("            }\n");
    buffer.push_str("            \n");
    for (i, param_type) in sig.params.iter().enumerate() {
        buffer.push_str("            {\n");
        buffer.push_str(&format!(
            "{};\n",
            param_type.push(&format!("lambda_param_{}", i + 1), &prefix, registry)?
        ));
        buffer.push_str("            }\n\n");
    }
    buffer.push_str("        \n");
    buffer.push_str(&format!(
        "            if (int status = lua_pcall({prefix}lua_state, {}, {}, 0); status != LUA_OK)\n",
        sig.params.len(),
        if ret.is_void_value() { 0 } else { 1 }
    ));
    buffer.push_str("            {\n");
    buffer.push_str(&format!(
        "                throw std::runtime_error(std::format(\"lua_pcall returned {{}}\", resolve_status_message({prefix}lua_state, status)));\n"
    ));
    buffer.push_str("            }\n");
    buffer.push_str("        \n");
    if !ret.is_void_value() {
        buffer.push_str(&format!("            if ({})\n", ret.validate(-1)));
        buffer.push_str("            {\n");
        buffer.push_str(&format!("                return {};\n", ret.retrieve(-1, registry)?));
        buffer.push_str("            }\n");
        buffer.push_str("            else\n");
        buffer.push_str("            {\n");
        buffer.push_str(&format!("                return {}{{}};\n", ret.cxx_name()?));
        buffer.push_str("            }\n");
    }
    buffer.push_str("        };\n");

    let pointer_signature = sig.signature(true)?;
    if sig.has_storage {
        buffer.push_str(&format!(
            "    using CXXFuncSignature = std::function<{}>;\n",
            sig.signature(false)?
        ));
    } else {
        buffer.push_str(&format!("    using CXXFuncSignature = {pointer_signature};\n"));
    }
    buffer.push_str(&format!("    CXXFuncSignature param_{param};\n"));
    buffer.push_str(&format!("    if (lua_isuserdata(lua_state, {param}))\n"));
    buffer.push_str("    {\n");
    buffer.push_str(&format!(
        "        auto function_proto = static_cast<FunctionProto*>(luaL_checkudata(lua_state, {param}, \"FunctionProtoMetatable\"));\n"
    ));
    buffer.push_str(&format!(
        "        param_{param} = std::bit_cast<{pointer_signature}>(function_proto->function_pointer);\n"
    ));
    buffer.push_str("    }\n");
    buffer.push_str(&format!("    else if (lua_isinteger(lua_state, {param}))\n"));
    buffer.push_str("    {\n");
    buffer.push_str(&format!(
        "        param_{param} = std::bit_cast<{pointer_signature}>(lua_tointeger(lua_state, {param}));\n"
    ));
    buffer.push_str("    }\n");
    buffer.push_str(&format!("    else if (lua_isnil(lua_state, {param}))\n"));
    buffer.push_str("    {\n");
    buffer.push_str(&format!("        param_{param} = std::bit_cast<{pointer_signature}>(nullptr);\n"));
    buffer.push_str("    }\n");
    buffer.push_str("    else\n");
    buffer.push_str("    {\n");
    if sig.has_storage {
        buffer.push_str(&format!("            param_{param} = param_function_ref_{param};\n"));
    } else {
        buffer.push_str(&format!(
            "                param_{param} = fnptr<{}>(param_function_ref_{param});\n",
            sig.signature(false)?
        ));
    }
    buffer.push_str("    }\n");

    if !sig.has_storage {
        let mut resetter = String::new();
        resetter.push_str(&format!("        static_lambda_params_{param}.pop_back();\n"));
        resetter.push_str(&format!("        if (!static_lambda_params_{param}.empty())\n"));
        resetter.push_str("        {\n");
        resetter.push_str(&format!(
            "            lambda_params_{param} = static_lambda_params_{param}.back();\n"
        ));
        resetter.push_str("        }\n");
        resetters.push(resetter);
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::default()
    }

    #[test]
    fn numeric_by_value_validates_as_number() {
        let ty = Type::numeric(Numeric::Int32);
        assert_eq!(ty.validate(1), "lua_isnumber(lua_state, 1)");
        assert_eq!(
            ty.retrieve(1, &registry()).unwrap(),
            "static_cast<int32_t>(lua_tonumber(lua_state, 1))"
        );
        assert_eq!(
            ty.push("return_value", "", &registry()).unwrap(),
            "        lua_pushinteger(lua_state, static_cast<int32_t>(return_value))"
        );
    }

    #[test]
    fn numeric_pointer_accepts_nil_and_userdata() {
        let ty = Type::numeric(Numeric::Float).pointer().constant();
        assert_eq!(
            ty.validate(2),
            "lua_islightuserdata(lua_state, 2) || lua_isnil(lua_state, 2) || lua_isuserdata(lua_state, 2)"
        );
        assert_eq!(
            ty.retrieve(2, &registry()).unwrap(),
            "static_cast<const float*>(lua_isnil(lua_state, 2) ? nullptr : lua_touserdata(lua_state, 2))"
        );
        assert_eq!(ty.qualified_name().unwrap(), "float*");
    }

    #[test]
    fn float_pushes_as_number() {
        let ty = Type::numeric(Numeric::Double);
        assert_eq!(
            ty.push("v", "lambda_params_1.", &registry()).unwrap(),
            "        lua_pushnumber(lambda_params_1.lua_state, static_cast<double>(v))"
        );
    }

    #[test]
    fn void_by_value_cannot_be_retrieved_or_pushed() {
        let ty = Type::void();
        assert!(ty.is_void_value());
        assert_eq!(ty.validate(1), "lua_isnil(lua_state, 1)");
        assert!(matches!(
            ty.retrieve(1, &registry()),
            Err(AbortError::Unsupported { operation: "retrieve", .. })
        ));
        assert!(matches!(
            ty.push("v", "", &registry()),
            Err(AbortError::Unsupported { operation: "push", .. })
        ));
    }

    #[test]
    fn wide_strings_need_conversion() {
        let wide: Type = TypeKind::Str(StringKind::WString).into();
        let narrow: Type = TypeKind::Str(StringKind::String).into();
        assert!(wide.needs_conversion());
        assert!(!narrow.needs_conversion());
        assert!(wide.is_a(KindGroup::String));

        let mut resetters = Vec::new();
        let converted = wide.converted(3, &mut resetters, &registry()).unwrap();
        assert!(converted.starts_with("auto param_ansi_3 = std::string{param_inter_3};"));
        assert!(converted.ends_with("auto param_3 = std::wstring{param_ansi_3.begin(), param_ansi_3.end()}"));
        assert!(resetters.is_empty());
    }

    #[test]
    fn opaque_pointer_accepts_nil() {
        let ty = Type::opaque("::Gfx", "Texture").pointer();
        assert_eq!(
            ty.validate(1),
            "lua_isuserdata(lua_state, 1) || lua_isnil(lua_state, 1)"
        );
        assert!(ty.needs_extra_processing());
        assert_eq!(
            ty.extra_processing(1).unwrap(),
            "        auto param_1 = lua_util_userdata_Get<\"__Gfx_TextureMetatable\", ::Gfx::Texture*, convertible_to___Gfx_Texture>(lua_state, 1);\n"
        );
    }

    #[test]
    fn opaque_tiebreak_checks_convertible_set() {
        let ty = Type::opaque("", "Widget").reference();
        let tiebreak = ty.tiebreak(2);
        assert!(tiebreak.contains("if (convertible_to__Widget.contains(metatable_name))"));
        assert!(tiebreak.contains("lua_getmetatable(lua_state, 2);"));
        assert!(tiebreak.ends_with("                }"));
        assert_eq!(Type::numeric(Numeric::Int8).tiebreak(1), DEFAULT_TIEBREAK);
    }

    #[test]
    fn unknown_opaque_is_an_abort() {
        let ty = Type::opaque("::Nowhere", "Ghost");
        assert_eq!(
            ty.retrieve(1, &registry()),
            Err(AbortError::MissingClass("Ghost".into()))
        );
        assert_eq!(
            ty.push("v", "", &registry()),
            Err(AbortError::MissingOwner("::Nowhere::Ghost".into()))
        );
    }

    #[test]
    fn forward_declared_opaque_retrieves_without_class() {
        let mut ty = Type::opaque("::Net", "Socket").pointer();
        if let TypeKind::OpaqueStruct(opaque) = &mut ty.kind {
            opaque.forward_declaration = Some(ForwardDecl::Struct);
        }
        assert_eq!(
            ty.retrieve(4, &registry()).unwrap(),
            "lua_isnil(lua_state, 4) ? nullptr : static_cast<::Net::Socket*>(luaL_checkudata(lua_state, 4, \"__Net_SocketMetatable\"))"
        );
    }

    #[test]
    fn function_pointer_signature_and_wrapper_name() {
        let sig = FunctionSignature {
            params: vec![
                Type::numeric(Numeric::Int32),
                Type::opaque("::Gfx", "Texture").pointer().constant(),
            ],
            return_type: Box::new(Type::void()),
            has_storage: false,
        };
        assert_eq!(
            sig.signature(true).unwrap(),
            "void(*)(int32_t, const ::Gfx::Texture*)"
        );
        assert_eq!(
            sig.wrapper_name().unwrap(),
            "Ret_void_Params_int32_t_ConstTexturePtr"
        );
    }

    #[test]
    fn closure_without_storage_registers_resetter() {
        let ty: Type = TypeKind::FunctionSignature(FunctionSignature {
            params: vec![Type::numeric(Numeric::Int32)],
            return_type: Box::new(TypeKind::Bool.into()),
            has_storage: false,
        })
        .into();
        let mut resetters = Vec::new();
        let converted = ty.converted(1, &mut resetters, &registry()).unwrap();
        assert!(converted.starts_with("struct LambdaParams_1\n"));
        assert!(converted.contains("auto param_function_ref_1 = [&](int32_t lambda_param_1) -> bool {\n"));
        assert!(converted.contains("lua_pushinteger(lambda_params_1.lua_state, static_cast<int32_t>(lambda_param_1));"));
        assert!(converted.contains("    using CXXFuncSignature = bool(*)(int32_t);\n"));
        assert!(converted.contains("param_1 = fnptr<bool(int32_t)>(param_function_ref_1);"));
        assert_eq!(resetters.len(), 1);
        assert!(resetters[0].starts_with("        static_lambda_params_1.pop_back();\n"));
    }

    #[test]
    fn closure_with_storage_captures_by_value() {
        let ty: Type = TypeKind::FunctionSignature(FunctionSignature {
            params: vec![],
            return_type: Box::new(Type::void()),
            has_storage: true,
        })
        .into();
        let mut resetters = Vec::new();
        let converted = ty.converted(2, &mut resetters, &registry()).unwrap();
        assert!(converted.starts_with("auto param_function_ref_2 = [=]() -> void {\n"));
        assert!(converted.contains("lua_pcall(lua_state, 0, 0, 0)"));
        assert!(converted.contains("    using CXXFuncSignature = std::function<void()>;\n"));
        assert!(resetters.is_empty());
    }
}
