//! Type patches: target-specific type kinds and emission hooks.
//!
//! A [`TypePatch`] may recognise templates the core converter rejects,
//! adjust every type the core produces, and inject text at fixed points of
//! the state file. Every hook defaults to doing nothing.

use std::fmt;
use std::sync::Arc;

use crate::config::{DynamicArrayConfig, HeapObjectConfig, PatchesConfig};
use crate::error::{AbortError, SkipError};
use crate::model::{scope_as_function_name, split_qualified, Class, ClassId};
use crate::registry::Registry;
use crate::spelling::TypeConverter;
use crate::types::{Numeric, PatchedType, Type, TypeKind};

pub trait TypePatch: fmt::Debug {
    /// Offered every template instantiation the core cannot convert.
    /// `template` is the qualified template name after `LuaMapTemplateClass`
    /// redirection.
    fn convert(
        &self,
        _template: &str,
        _args: &[String],
        _converter: &TypeConverter<'_>,
        _scope: &str,
    ) -> Option<Result<TypeKind, SkipError>> {
        None
    }

    /// Runs on every type the core converter produces.
    fn post_process(&self, _ty: &mut Type) {}

    /// Headers every state file includes while this patch is active.
    fn includes(&self) -> Vec<String> {
        Vec::new()
    }

    fn state_file_pre(&self, _registry: &Registry, _classes: &[ClassId]) -> String {
        String::new()
    }

    fn state_file_post(&self, _registry: &Registry, _classes: &[ClassId]) -> String {
        String::new()
    }

    /// Emitted inside a class's userdata metatable setup.
    fn per_class(&self, _class: &Class) -> String {
        String::new()
    }

    /// Emitted at the end of `lua_setup_state_{S}`.
    fn setup_post(&self) -> String {
        String::new()
    }
}

/// Builds the patches enabled in the configuration.
pub fn from_config(config: &PatchesConfig) -> Vec<Box<dyn TypePatch>> {
    let mut patches: Vec<Box<dyn TypePatch>> = Vec::new();
    if let Some(array) = &config.dynamic_array {
        patches.push(Box::new(DynamicArrayPatch::new(array)));
    }
    if let Some(heap) = &config.heap_objects {
        patches.push(Box::new(HeapObjectPatch::new(heap)));
    }
    patches
}

// ---------------------------------------------------------------------------
// Dynamic array
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ArrayNames {
    template: String,
    wrapper_scope: String,
    wrapper_name: String,
    raw: String,
}

impl ArrayNames {
    fn wrapper(&self) -> String {
        format!("{}::{}", self.wrapper_scope, self.wrapper_name)
    }

    fn wrapper_metatable(&self) -> String {
        format!(
            "{}_{}Metatable",
            scope_as_function_name(&self.wrapper_scope),
            self.wrapper_name
        )
    }
}

/// `template<Elem>` exposed to Lua as the configured wrapper struct.
#[derive(Debug)]
pub struct DynamicArrayPatch {
    names: Arc<ArrayNames>,
    include: Option<String>,
}

impl DynamicArrayPatch {
    pub fn new(config: &DynamicArrayConfig) -> Self {
        let (wrapper_scope, wrapper_name) = split_qualified(&config.wrapper);
        Self {
            names: Arc::new(ArrayNames {
                template: format!("::{}", config.template.trim_start_matches("::")),
                wrapper_scope,
                wrapper_name,
                raw: format!("::{}", config.raw.trim_start_matches("::")),
            }),
            include: config.include.clone(),
        }
    }
}

impl TypePatch for DynamicArrayPatch {
    fn convert(
        &self,
        template: &str,
        args: &[String],
        converter: &TypeConverter<'_>,
        scope: &str,
    ) -> Option<Result<TypeKind, SkipError>> {
        if template != self.names.template {
            return None;
        }
        let element = args.first()?;
        Some(converter.convert(element, scope).map(|element| {
            TypeKind::Patch(Arc::new(DynamicArrayType {
                names: Arc::clone(&self.names),
                element,
            }))
        }))
    }

    fn post_process(&self, ty: &mut Type) {
        if let TypeKind::OpaqueStruct(opaque) = &mut ty.kind {
            if opaque.scope == self.names.wrapper_scope && opaque.name == self.names.wrapper_name {
                opaque.move_on_construct = true;
            }
        }
    }

    fn includes(&self) -> Vec<String> {
        self.include.iter().cloned().collect()
    }
}

#[derive(Debug)]
struct DynamicArrayType {
    names: Arc<ArrayNames>,
    element: Type,
}

impl DynamicArrayType {
    fn element_name(&self) -> Result<String, AbortError> {
        match self.element.as_opaque() {
            Some(opaque) => Ok(opaque.qualified()),
            None => self.element.cxx_name(),
        }
    }
}

impl PatchedType for DynamicArrayType {
    fn cxx_name(&self) -> String {
        split_qualified(&self.names.raw).1
    }

    fn validate(&self, _ty: &Type, slot: i32) -> String {
        format!("lua_isuserdata(lua_state, {slot})")
    }

    fn retrieve(&self, _ty: &Type, slot: i32) -> String {
        format!(
            "static_cast<{}*>(luaL_checkudata(lua_state, {slot}, \"{}\"))",
            self.names.wrapper(),
            self.names.wrapper_metatable()
        )
    }

    fn push(
        &self,
        ty: &Type,
        value: &str,
        prefix: &str,
        _registry: &Registry,
    ) -> Result<String, AbortError> {
        let wrapper = self.names.wrapper();
        let raw = &self.names.raw;
        let element = self.element_name()?;
        let bit_cast = if ty.is_pointer {
            format!("std::bit_cast<{raw}*>({value})")
        } else if ty.is_reference {
            format!("std::bit_cast<{raw}*>(&{value})")
        } else {
            format!("std::move(*std::bit_cast<{raw}*>(&{value}))")
        };

        let mut buffer = format!(
            "        auto array_wrapper = {wrapper}{{{bit_cast}, sizeof({element}), alignof({element}), \"{element}\", {}}};\n",
            self.element.is_pointer
        );
        buffer.push_str(&format!(
            "        auto* userdata = static_cast<{wrapper}*>(lua_newuserdatauv({prefix}lua_state, sizeof({wrapper}), 1));\n"
        ));
        buffer.push_str(&format!("        lua_pushinteger({prefix}lua_state, 0);\n"));
        buffer.push_str(&format!("        lua_setiuservalue({prefix}lua_state, -2, 1);\n"));
        if ty.is_pointer {
            buffer.push_str(&format!("        new(userdata) {wrapper}{{array_wrapper}};\n"));
        } else {
            buffer.push_str(&format!(
                "        new(userdata) {wrapper}{{std::move(array_wrapper)}};\n"
            ));
        }
        buffer.push_str(&format!(
            "        luaL_getmetatable({prefix}lua_state, \"{}\");\n",
            self.names.wrapper_metatable()
        ));
        buffer.push_str(&format!("        lua_setmetatable({prefix}lua_state, -2);\n"));
        Ok(buffer)
    }

    fn needs_conversion(&self) -> bool {
        true
    }

    fn converted(&self, _ty: &Type, param: usize) -> Result<String, AbortError> {
        Ok(format!(
            "auto& param_{param} = *std::bit_cast<{}<{}{}{}>*>(param_inter_{param})",
            self.names.template,
            if self.element.is_const { "const " } else { "" },
            self.element_name()?,
            self.element.pointer_ref()
        ))
    }

    fn inner_types(&self) -> Vec<&Type> {
        vec![&self.element]
    }
}

// ---------------------------------------------------------------------------
// Heap objects
// ---------------------------------------------------------------------------

/// Short type names per class, a name-to-heap-pusher map, and numeric
/// metatables so raw heap memory can be wrapped by type name at runtime.
#[derive(Debug)]
pub struct HeapObjectPatch {
    strip_prefixes: Vec<String>,
    name_field: String,
}

impl HeapObjectPatch {
    pub fn new(config: &HeapObjectConfig) -> Self {
        Self {
            strip_prefixes: config.strip_prefixes.clone(),
            name_field: config.name_field.clone(),
        }
    }

    fn short_name<'a>(&self, name: &'a str) -> &'a str {
        self.strip_prefixes
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix.as_str()))
            .filter(|short| !short.is_empty())
            .unwrap_or(name)
    }
}

impl TypePatch for HeapObjectPatch {
    fn state_file_post(&self, registry: &Registry, classes: &[ClassId]) -> String {
        let mut buffer = String::from(
            "inline std::unordered_map<std::string, void (*)(lua_State*, void*, uint32_t)> lua_type_name_to_lua_object_from_heap {\n",
        );
        buffer.push_str("    // Custom types.\n");
        for &id in classes {
            let class = registry.class(id);
            buffer.push_str(&format!(
                "    {{\"{}\", &lua_Userdata_to_lua_from_heap<\"{}Metatable\", {}>}},\n",
                class.qualified(),
                class.tag(),
                class.qualified()
            ));
        }
        buffer.push_str("\n    // Built-in types.\n");
        for numeric in Numeric::ALL {
            let name = numeric.cxx_name();
            buffer.push_str(&format!("    {{\"{name}\", &lua_{name}_to_lua_from_heap}},\n"));
        }
        buffer.push_str("};\n\n");

        buffer.push_str(
            "inline std::unordered_map<std::string, void (*)(lua_State*, void*, uint32_t)> lua_short_type_name_to_lua_object_from_heap {\n",
        );
        buffer.push_str("    // Custom types.\n");
        for &id in classes {
            let class = registry.class(id);
            buffer.push_str(&format!(
                "    {{\"{}\", &lua_Userdata_to_lua_from_heap<\"{}Metatable\", {}>}},\n",
                self.short_name(&class.name),
                class.tag(),
                class.qualified()
            ));
        }
        buffer.push_str("};\n\n");
        buffer
    }

    fn per_class(&self, class: &Class) -> String {
        let mut buffer = format!("    lua_pushliteral(lua_state, \"{}\");\n", self.name_field);
        buffer.push_str(&format!(
            "    lua_pushliteral(lua_state, \"{}\");\n",
            self.short_name(&class.name)
        ));
        buffer.push_str("    lua_rawset(lua_state, -3);\n\n");
        buffer
    }

    fn setup_post(&self) -> String {
        NUMERICAL_METATABLES.to_string()
    }
}

const NUMERICAL_METATABLES: &str = r##"#define NUMERICAL_METATABLE_GET_SELF(Type)                                                                                        \
    luaL_argcheck(lua_state, lua_isuserdata(lua_state, 1), 1, "first param was not userdata");                                                      \
    lua_getiuservalue(lua_state, 1, 1);                                                                                                             \
    int pointer_depth = lua_tointeger(lua_state, -1);                                                                                               \
    bool is_pointer = pointer_depth > 0;                                                                                                            \
    lua_getmetatable(lua_state, 1);                                                                                                                 \
    lua_pushliteral(lua_state, "__name");                                                                                                           \
    lua_rawget(lua_state, -2);                                                                                                                      \
    auto metatable_name = std::string{lua_tostring(lua_state, -1)};                                                                                 \
    auto bad_self_error_message = std::format("self was '{}', expected '"#Type"Metatable' or derivative", metatable_name);                          \
    luaL_argcheck(lua_state, metatable_name == #Type"Metatable", 1, bad_self_error_message.c_str());                                                \
    lua_pop(lua_state, 3);                                                                                                                          \
    Type** self_container{};                                                                                                                        \
    Type* self{};                                                                                                                                   \
    if (is_pointer)                                                                                                                                 \
    {                                                                                                                                               \
        auto* outer_most_container = lua_touserdata(lua_state, 1);                                                                                  \
        self_container = static_cast<Type**>(deref(outer_most_container, pointer_depth - 1));                                                       \
        self = *self_container;                                                                                                                     \
    }                                                                                                                                               \
    else                                                                                                                                            \
    {                                                                                                                                               \
        self = static_cast<Type*>(lua_touserdata(lua_state, 1));                                                                                    \
    }                                                                                                                                               \
    lua_remove(lua_state, 1);                                                                                                                       \
    {                                                                                                                                               \
        luaL_argcheck(lua_state, self, 1, "self was nullptr");                                                                                      \
    }

#define INTEGRAL_NEWINDEX_METAMETHOD_BODY(Type, IsFunction, ToFunction)                                                                             \
        NUMERICAL_METATABLE_GET_SELF(Type)                                                                                                          \
                                                                                                                                                    \
        if (IsFunction(lua_state, 1))                                                                                                               \
        {                                                                                                                                           \
            *static_cast<Type*>(self) = ToFunction(lua_state, 1);                                                                                   \
        }                                                                                                                                           \
        else                                                                                                                                        \
        {                                                                                                                                           \
            luaL_argerror(lua_state, 1, "Invalid argument for 'Set'");                                                                              \
        }                                                                                                                                           \
        return 0;

#define REGISTER_NUMERICAL_METATABLE(Type, PushFunction, IsFunction, ToFunction)                                                                    \
    luaL_newmetatable(lua_state, #Type"Metatable");                                                                                                 \
    lua_pushliteral(lua_state, "__index");                                                                                                          \
    auto Type##_my_index = [](lua_State* lua_state) -> int {                                                                                        \
        NUMERICAL_METATABLE_GET_SELF(Type)                                                                                                          \
                                                                                                                                                    \
        if (lua_isstring(lua_state, -1))                                                                                                            \
        {                                                                                                                                           \
            auto index = std::string_view{lua_tostring(lua_state, -1)};                                                                             \
            lua_pop(lua_state, 1);                                                                                                                  \
            if (index == "Get" || index == "get")                                                                                                   \
            {                                                                                                                                       \
                lua_pushcfunction(lua_state, [](lua_State* lua_state) {                                                                             \
                    NUMERICAL_METATABLE_GET_SELF(Type)                                                                                              \
                    PushFunction(lua_state, *self);                                                                                                 \
                    return 1;                                                                                                                       \
                });                                                                                                                                 \
                return 1;                                                                                                                           \
            }                                                                                                                                       \
            else if (index == "Set" || index == "set")                                                                                              \
            {                                                                                                                                       \
                lua_pushcfunction(lua_state, [](lua_State* lua_state) {                                                                             \
                    INTEGRAL_NEWINDEX_METAMETHOD_BODY(Type, IsFunction, ToFunction)                                                                 \
                });                                                                                                                                 \
                return 1;                                                                                                                           \
            }                                                                                                                                       \
        }                                                                                                                                           \
                                                                                                                                                    \
        return 0;                                                                                                                                   \
    };                                                                                                                                              \
    lua_pushcfunction(lua_state, Type##_my_index);                                                                                                  \
    lua_rawset(lua_state, -3);                                                                                                                      \
    lua_settop(lua_state, 0);

    lua_settop(lua_state, 0);
    REGISTER_NUMERICAL_METATABLE(int8_t, lua_pushinteger, lua_isinteger, lua_tointeger)
    REGISTER_NUMERICAL_METATABLE(int16_t, lua_pushinteger, lua_isinteger, lua_tointeger)
    REGISTER_NUMERICAL_METATABLE(int32_t, lua_pushinteger, lua_isinteger, lua_tointeger)
    REGISTER_NUMERICAL_METATABLE(int64_t, lua_pushinteger, lua_isinteger, lua_tointeger)
    REGISTER_NUMERICAL_METATABLE(uint8_t, lua_pushinteger, lua_isinteger, lua_tointeger)
    REGISTER_NUMERICAL_METATABLE(uint16_t, lua_pushinteger, lua_isinteger, lua_tointeger)
    REGISTER_NUMERICAL_METATABLE(uint32_t, lua_pushinteger, lua_isinteger, lua_tointeger)
    REGISTER_NUMERICAL_METATABLE(uint64_t, lua_pushinteger, lua_isinteger, lua_tointeger)
    REGISTER_NUMERICAL_METATABLE(float, lua_pushnumber, lua_isnumber, lua_tonumber)
    REGISTER_NUMERICAL_METATABLE(double, lua_pushnumber, lua_isnumber, lua_tonumber)

#undef REGISTER_NUMERICAL_METATABLE
#undef INTEGRAL_NEWINDEX_METAMETHOD_BODY
#undef NUMERICAL_METATABLE_GET_SELF

"##;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spelling::KnownNames;

    fn array_config() -> DynamicArrayConfig {
        DynamicArrayConfig {
            template: "::Engine::TArray".into(),
            wrapper: "::Engine::Runtime::ArrayWrapper".into(),
            raw: "::Engine::FScriptArray".into(),
            include: Some("Runtime/Array.hpp".into()),
        }
    }

    fn registry_with_array() -> Registry {
        Registry::new(from_config(&PatchesConfig {
            dynamic_array: Some(array_config()),
            heap_objects: None,
        }))
    }

    #[test]
    fn array_template_becomes_patch_type() {
        let registry = registry_with_array();
        let known = KnownNames::default();
        // Template names are not resolved against the enclosing scope.
        let err = TypeConverter::new(&registry, &known)
            .convert("TArray<int32_t>&", "::Engine")
            .unwrap_err();
        assert_eq!(err, SkipError::TemplatedType("TArray<int32_t>&".into()));

        let ty = TypeConverter::new(&registry, &known)
            .convert("Engine::TArray<float>&", "")
            .unwrap();
        assert!(ty.is_reference);
        assert_eq!(ty.cxx_name().unwrap(), "FScriptArray");
        assert!(ty.needs_conversion());
        assert_eq!(ty.validate(2), "lua_isuserdata(lua_state, 2)");
        assert_eq!(
            ty.retrieve(2, &registry).unwrap(),
            "static_cast<::Engine::Runtime::ArrayWrapper*>(luaL_checkudata(lua_state, 2, \"__Engine__Runtime_ArrayWrapperMetatable\"))"
        );
        let mut resetters = Vec::new();
        assert_eq!(
            ty.converted(1, &mut resetters, &registry).unwrap(),
            "auto& param_1 = *std::bit_cast<::Engine::TArray<float>*>(param_inter_1)"
        );
    }

    #[test]
    fn array_push_references_raw_storage() {
        let registry = registry_with_array();
        let known = KnownNames::default();
        let ty = TypeConverter::new(&registry, &known)
            .convert("::Engine::TArray<int32_t>&", "")
            .unwrap();
        let push = ty.push("return_value", "", &registry).unwrap();
        assert!(push.starts_with(
            "        auto array_wrapper = ::Engine::Runtime::ArrayWrapper{std::bit_cast<::Engine::FScriptArray*>(&return_value), sizeof(int32_t), alignof(int32_t), \"int32_t\", false};\n"
        ));
        assert!(push.contains("new(userdata) ::Engine::Runtime::ArrayWrapper{std::move(array_wrapper)};"));
    }

    #[test]
    fn wrapper_struct_is_moved_on_construct() {
        let registry = registry_with_array();
        let mut known = KnownNames::default();
        known.add_class("::Engine::Runtime", "ArrayWrapper");
        let ty = TypeConverter::new(&registry, &known)
            .convert("Runtime::ArrayWrapper", "::Engine")
            .unwrap();
        assert!(ty.as_opaque().unwrap().move_on_construct);
    }

    #[test]
    fn heap_patch_strips_prefixes() {
        let patch = HeapObjectPatch::new(&HeapObjectConfig {
            strip_prefixes: vec!["F".into(), "U".into()],
            name_field: "__short_name".into(),
        });
        let mut registry = Registry::default();
        let id = registry.add_class("UObject", "::Engine", "o.hpp", "Main").unwrap();
        let text = patch.per_class(registry.class(id));
        assert_eq!(
            text,
            "    lua_pushliteral(lua_state, \"__short_name\");\n    lua_pushliteral(lua_state, \"Object\");\n    lua_rawset(lua_state, -3);\n\n"
        );
        let post = patch.state_file_post(&registry, &[id]);
        assert!(post.contains(
            "    {\"::Engine::UObject\", &lua_Userdata_to_lua_from_heap<\"__Engine_UObjectMetatable\", ::Engine::UObject>},\n"
        ));
        assert!(post.contains(
            "    {\"Object\", &lua_Userdata_to_lua_from_heap<\"__Engine_UObjectMetatable\", ::Engine::UObject>},\n"
        ));
        assert!(post.contains("    {\"double\", &lua_double_to_lua_from_heap},\n"));
        assert!(patch.setup_post().contains("REGISTER_NUMERICAL_METATABLE(double, lua_pushnumber, lua_isnumber, lua_tonumber)"));
    }

    #[test]
    fn numeric_metatable_macros_do_not_leak() {
        let text = HeapObjectPatch::new(&HeapObjectConfig {
            strip_prefixes: Vec::new(),
            name_field: "__short_name".into(),
        })
        .setup_post();
        assert!(text.contains("expected '\"#Type\"Metatable' or derivative"));
        assert!(text.ends_with("#undef NUMERICAL_METATABLE_GET_SELF\n\n"));
        for name in [
            "NUMERICAL_METATABLE_GET_SELF",
            "INTEGRAL_NEWINDEX_METAMETHOD_BODY",
            "REGISTER_NUMERICAL_METATABLE",
        ] {
            assert_eq!(text.matches(&format!("#define {name}(")).count(), 1, "{name}");
            assert_eq!(text.matches(&format!("#undef {name}\n")).count(), 1, "{name}");
            let defined = text.find(&format!("#define {name}(")).unwrap();
            let undefined = text.rfind(&format!("#undef {name}\n")).unwrap();
            let last_use = text.rfind(&format!("{name}(")).unwrap();
            assert!(defined < last_use && last_use < undefined, "{name}");
        }
    }
}
