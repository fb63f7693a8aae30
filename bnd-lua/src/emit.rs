//! Artifact emission: one `Main.hpp` per state plus `LuaSetup.hpp`.
//!
//! Every state file is self-contained. It carries its own copy of the
//! runtime helpers inside `namespace {ns}::{state}`, so any number of state
//! files can be included into one translation unit.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::debug;

use crate::callgen::{self, runtime_errors};
use crate::class_emit::ClassEmitter;
use crate::error::AbortError;
use crate::model::{scope_as_function_name, scope_parts, ClassId, Enum, Function};
use crate::registry::Registry;
use crate::types::Numeric;

/// `fnptr`, `resolve_status_message`, `StringLiteral` and `FunctionProto`.
const PREAMBLE: &str = include_str!("emit/preamble.hpp");

/// `deref`, `lua_util_userdata_Get`, the generic `Set`/`Get`/`IsValid`/
/// `GetAddress` member wrappers and `lua_Userdata_to_lua_from_heap`.
const UTILITY: &str = include_str!("emit/utility.hpp");

const HEAP_PUSHER_MACRO: &str = r#"#define GenerateBuiltinToLuaFromHeapFunction(BuiltinType) \
inline auto lua_##BuiltinType##_to_lua_from_heap(lua_State* lua_state, void* item, uint32_t pointer_depth) -> void \
{ \
    auto* userdata = static_cast<BuiltinType*>(lua_newuserdatauv(lua_state, sizeof(BuiltinType*), 1)); \
    lua_pushinteger(lua_state, pointer_depth); \
    lua_setiuservalue(lua_state, -2, 1); \
    new(userdata) BuiltinType*{static_cast<BuiltinType*>(item)}; \
    luaL_getmetatable(lua_state, #BuiltinType"Metatable"); \
    lua_setmetatable(lua_state, -2); \
}
"#;

/// A file produced by a run, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Emits every state file followed by `LuaSetup.hpp`.
pub fn emit(registry: &Registry, namespace: &str) -> Result<Vec<GeneratedFile>, AbortError> {
    let mut files = Vec::with_capacity(registry.states.len() + 1);
    for state in &registry.states {
        let contents = StateFile::new(registry, namespace, state).render()?;
        files.push(GeneratedFile {
            path: state_file_path(state),
            contents,
        });
    }
    files.push(GeneratedFile {
        path: PathBuf::from("include/LuaBindings/LuaSetup.hpp"),
        contents: setup_file(registry, namespace),
    });
    Ok(files)
}

pub fn state_file_path(state: &str) -> PathBuf {
    PathBuf::from(format!("include/LuaBindings/States/{state}/Main.hpp"))
}

/// Name of the generated wrapper for a free function, unless an external
/// wrapper was supplied.
pub fn free_function_wrapper(function: &Function) -> String {
    match &function.wrapper_name {
        Some(wrapper) => wrapper.clone(),
        None => format!(
            "lua{}_{}_wrapper",
            scope_as_function_name(&function.scope),
            function.name
        ),
    }
}

// ---------------------------------------------------------------------------
// LuaSetup.hpp
// ---------------------------------------------------------------------------

fn setup_file(registry: &Registry, namespace: &str) -> String {
    let mut out = String::from(
        "#ifndef LUAWRAPPERGENERATOR_LUASETUP_HPP\n#define LUAWRAPPERGENERATOR_LUASETUP_HPP\n\n",
    );
    out.push_str("#include <atomic>\n");
    out.push_str("#include <format>\n");
    out.push_str("#include <functional>\n");
    out.push_str("#include <string_view>\n");
    out.push_str("#include <unordered_map>\n");
    out.push('\n');
    for state in &registry.states {
        out.push_str(&format!("#include <LuaBindings/States/{state}/Main.hpp>\n"));
    }

    out.push_str(&format!("\nnamespace {namespace}\n{{\n"));
    out.push_str(
        "static std::unordered_map<std::string, void (*)(lua_State*)> s_state_setup_functions{\n",
    );
    for state in &registry.states {
        out.push_str(&format!(
            "    {{\"{state}\", &{state}::lua_setup_state_{state}}},\n"
        ));
    }
    out.push_str("};\n\n");

    out.push_str("inline auto lua_setup_state(lua_State* lua_state, std::string_view state_name) -> void\n");
    out.push_str("{\n");
    out.push_str("    if (auto it = s_state_setup_functions.find(std::string{state_name}); it != s_state_setup_functions.end())\n");
    out.push_str("    {\n");
    out.push_str("        it->second(lua_state);\n");
    out.push_str("    }\n");
    out.push_str("    else\n");
    out.push_str("    {\n");
    out.push_str(&format!(
        "        luaL_error(lua_state, std::format(\"{}\", state_name).c_str());\n",
        runtime_errors::UNKNOWN_STATE
    ));
    out.push_str("    }\n");
    out.push_str("}\n");
    out.push_str(&format!(
        "}} // {namespace}\n\n#endif //LUAWRAPPERGENERATOR_LUASETUP_HPP\n"
    ));
    out
}

// ---------------------------------------------------------------------------
// State files
// ---------------------------------------------------------------------------

struct StateFile<'a> {
    registry: &'a Registry,
    namespace: &'a str,
    state: &'a str,
    classes: Vec<ClassId>,
    functions: Vec<&'a Function>,
    enums: Vec<&'a Enum>,
}

impl<'a> StateFile<'a> {
    fn new(registry: &'a Registry, namespace: &'a str, state: &'a str) -> Self {
        let functions = registry
            .functions
            .values()
            .filter(|f| f.state.as_deref() == Some(state))
            .collect();
        let enums = registry.enums().filter(|e| e.state == state).collect();
        Self {
            registry,
            namespace,
            state,
            classes: registry.classes_for_state(state),
            functions,
            enums,
        }
    }

    fn render(&self) -> Result<String, AbortError> {
        let state = self.state;
        let guard = format!("LUAWRAPPERGENERATOR_{state}_MAIN_HPP");
        let mut out = format!("#ifndef {guard}\n#define {guard}\n\n");
        out.push_str("#include <string>\n");
        out.push_str("#include <format>\n");
        out.push_str("#include <unordered_map>\n");
        out.push_str("#include <unordered_set>\n");
        out.push('\n');
        out.push_str("#include <lua.hpp>\n");
        for include in self.includes() {
            out.push_str(&format!("#include \"{include}\"\n"));
        }

        out.push_str(&format!("\nnamespace {}::{state}\n{{\n", self.namespace));
        out.push_str(PREAMBLE.trim_end());
        out.push_str("\n\n");
        out.push_str(UTILITY.trim_end());
        out.push_str("\n\n");

        let mut pre = String::new();
        for patch in self.registry.patches() {
            pre.push_str(&patch.state_file_pre(self.registry, &self.classes));
        }
        if !pre.is_empty() {
            out.push_str(&pre);
            out.push_str("\n\n");
        }

        out.push_str(&self.convertible_sets());
        out.push_str("\n\n");

        out.push_str(&callgen::proto_metatable());
        for sig in self.registry.function_protos.values() {
            out.push_str(&callgen::proto_wrapper(sig, self.registry)?);
        }
        out.push_str("\n\n");

        for &id in &self.classes {
            let emitter = ClassEmitter::new(self.registry, id);
            let constructor = emitter.constructor_dispatch()?;
            if !constructor.is_empty() {
                out.push_str(&constructor);
                out.push_str("\n\n");
            }
            out.push_str(&emitter.get_self());
            out.push_str("\n\n");
            out.push_str(&emitter.member_wrappers()?);
            out.push_str("\n\n");
        }

        for &id in &self.classes {
            let emitter = ClassEmitter::new(self.registry, id);
            out.push_str(&emitter.member_map());
            out.push('\n');
            out.push_str(&emitter.metamethod_map());
            out.push('\n');
            out.push_str(&emitter.setup_function());
            out.push_str("\n\n");
        }

        out.push_str(&heap_pushers());
        out.push_str(&self.free_function_wrappers()?);
        out.push('\n');
        out.push_str(&self.free_function_setup());
        out.push('\n');
        out.push_str(&self.enum_setup());
        out.push('\n');
        out.push_str(&self.state_setup());

        for patch in self.registry.patches() {
            out.push_str(&patch.state_file_post(self.registry, &self.classes));
        }

        out.push_str(&format!(
            "}} // {}::{state}\n\n#endif //{guard}\n",
            self.namespace
        ));
        debug!(state, classes = self.classes.len(), functions = self.functions.len(), enums = self.enums.len(), "rendered state file");
        Ok(out)
    }

    /// Declaring headers of everything in this state, plus the extra
    /// includes collected during ingestion.
    fn includes(&self) -> BTreeSet<&str> {
        let mut includes = BTreeSet::new();
        for &id in &self.classes {
            let class = self.registry.class(id);
            includes.insert(class.source.as_str());
            for function in class.functions.values().chain(class.static_functions.values()) {
                if !function.shares_file_with_class {
                    includes.insert(function.source.as_str());
                }
            }
        }
        for function in &self.functions {
            includes.insert(function.source.as_str());
        }
        for include in &self.registry.extra_includes {
            includes.insert(include.as_str());
        }
        includes.remove("");
        includes
    }

    /// `convertible_to_{tag}` for every registered class: its own metatable
    /// name plus that of every class deriving from it.
    fn convertible_sets(&self) -> String {
        let mut sets = Vec::new();
        for class in self.registry.classes() {
            let mut set = format!(
                "inline std::unordered_set<std::string> convertible_to_{} {{\n",
                class.tag()
            );
            for tag in self.registry.convertible_to(class.id) {
                set.push_str(&format!("        {{\"{tag}Metatable\"}},\n"));
            }
            set.push_str("};");
            sets.push(set);
        }
        sets.join("\n\n")
    }

    fn free_function_wrappers(&self) -> Result<String, AbortError> {
        let mut out = String::new();
        for function in &self.functions {
            if function.is_custom_redirector || function.is_alias || function.wrapper_name.is_some() {
                continue;
            }
            let mut wrapper =
                callgen::wrapper_function(&free_function_wrapper(function), function, self.registry)?;
            // Free wrappers are separated by a single newline.
            wrapper.pop();
            out.push_str(&wrapper);
        }
        Ok(out)
    }

    fn free_function_setup(&self) -> String {
        let mut out = format!(
            "inline auto lua_setup_global_free_functions_{}(lua_State* lua_state) -> void\n{{\n",
            self.state
        );
        for function in &self.functions {
            let wrapper = free_function_wrapper(function);
            out.push_str("    {\n");
            let parts = scope_parts(function.lua_scope());
            if parts.is_empty() {
                out.push_str(&format!("        lua_pushcfunction(lua_state, &{wrapper});\n"));
                out.push_str(&format!(
                    "        lua_setglobal(lua_state, \"{}\");\n",
                    function.lua_name
                ));
            } else {
                out.push_str(&in_scope(&parts, |body| {
                    body.push_str(&format!(
                        "        lua_pushliteral(lua_state, \"{}\");\n",
                        function.lua_name
                    ));
                    body.push_str(&format!("        lua_pushcfunction(lua_state, &{wrapper});\n"));
                    body.push_str("        lua_rawset(lua_state, -3);\n");
                }));
            }
            out.push_str("    }\n\n");
        }
        out.push_str("}\n");
        out
    }

    /// One table per enum, keyed by enumerator name.
    fn enum_setup(&self) -> String {
        let mut out = format!(
            "inline auto lua_setup_enums_{}(lua_State* lua_state) -> void\n{{\n",
            self.state
        );
        for the_enum in &self.enums {
            let fill = |body: &mut String| {
                body.push_str("        lua_newtable(lua_state);\n");
                for (key, value) in &the_enum.values {
                    body.push_str(&format!("        lua_pushliteral(lua_state, \"{key}\");\n"));
                    body.push_str(&format!("        lua_pushinteger(lua_state, {});\n", enum_literal(*value)));
                    body.push_str("        lua_rawset(lua_state, -3);\n");
                }
            };
            out.push_str("    {\n");
            let parts = scope_parts(&the_enum.scope);
            if parts.is_empty() {
                fill(&mut out);
                out.push_str(&format!(
                    "        lua_setglobal(lua_state, \"{}\");\n",
                    the_enum.name
                ));
            } else {
                out.push_str(&in_scope(&parts, |body| {
                    body.push_str(&format!(
                        "        lua_pushliteral(lua_state, \"{}\");\n",
                        the_enum.name
                    ));
                    fill(body);
                    body.push_str("        lua_rawset(lua_state, -3);\n");
                }));
            }
            out.push_str("    }\n\n");
        }
        out.push_str("}\n");
        out
    }

    fn state_setup(&self) -> String {
        let state = self.state;
        let mut out = format!("inline auto lua_setup_state_{state}(lua_State* lua_state) -> void\n{{\n");
        out.push_str("    setup_FunctionProto(lua_state);\n");
        for &id in &self.classes {
            out.push_str(&format!(
                "    lua_setup_{}(lua_state);\n",
                self.registry.class(id).tag()
            ));
        }
        out.push('\n');
        out.push_str(&format!("    lua_setup_global_free_functions_{state}(lua_state);\n"));
        out.push_str(&format!("    lua_setup_enums_{state}(lua_state);\n"));
        for patch in self.registry.patches() {
            out.push_str(&patch.setup_post());
        }
        out.push_str("}\n\n");
        out
    }
}

/// Values past `i64::MAX` become an unsigned literal cast to `lua_Integer`.
fn enum_literal(value: u64) -> String {
    if i64::try_from(value).is_ok() {
        value.to_string()
    } else {
        format!("static_cast<lua_Integer>({value}ull)")
    }
}

/// Heap pushers for the numeric builtins, used to wrap raw memory by type.
fn heap_pushers() -> String {
    let mut out = String::from(HEAP_PUSHER_MACRO);
    out.push('\n');
    for numeric in Numeric::ALL {
        out.push_str(&format!(
            "    GenerateBuiltinToLuaFromHeapFunction({})\n",
            numeric.cxx_name()
        ));
    }
    out.push_str("#undef GenerateBuiltinToLuaFromHeapFunction\n\n");
    out
}

/// Walks to (creating as needed) the table for `parts`, runs `body` with that
/// table on top of the stack, then restores the stack and publishes the
/// global table if it was created here.
fn in_scope(parts: &[&str], body: impl FnOnce(&mut String)) -> String {
    let mut out = String::new();
    let Some((global_table, nested)) = parts.split_first() else {
        body(&mut out);
        return out;
    };

    out.push_str(&format!(
        "        bool global_table_exists = lua_getglobal(lua_state, \"{global_table}\") == LUA_TTABLE;\n"
    ));
    out.push_str("        if (!global_table_exists)\n");
    out.push_str("        {\n");
    out.push_str("            lua_pop(lua_state, 1);\n");
    out.push_str("            lua_newtable(lua_state);\n");
    out.push_str("        }\n\n");
    for part in nested {
        out.push_str(&format!("        lua_pushliteral(lua_state, \"{part}\");\n"));
        out.push_str("        if (lua_rawget(lua_state, -2) != LUA_TTABLE)\n");
        out.push_str("        {\n");
        out.push_str("            lua_pop(lua_state, 1);\n");
        out.push_str(&format!("            lua_pushliteral(lua_state, \"{part}\");\n"));
        out.push_str("            lua_newtable(lua_state);\n");
        out.push_str("            lua_rawset(lua_state, -3);\n");
        out.push_str(&format!("            lua_pushliteral(lua_state, \"{part}\");\n"));
        out.push_str("            lua_rawget(lua_state, -2);\n");
        out.push_str("        }\n\n");
    }

    body(&mut out);

    if !nested.is_empty() {
        out.push_str(&format!("        lua_pop(lua_state, {});\n", nested.len()));
    }
    out.push_str("\n        if (!global_table_exists)\n");
    out.push_str("        {\n");
    out.push_str(&format!("            lua_setglobal(lua_state, \"{global_table}\");\n"));
    out.push_str("        }\n");
    out.push_str("        else\n");
    out.push_str("        {\n");
    out.push_str("            lua_pop(lua_state, 1);\n");
    out.push_str("        }\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Param;
    use crate::types::Type;
    use pretty_assertions::assert_eq;

    fn enum_registry() -> Registry {
        let mut registry = Registry::default();
        registry
            .add_enum(Enum {
                name: "Color".into(),
                scope: "::Gfx".into(),
                state: "Main".into(),
                values: vec![("Red".into(), 0), ("Green".into(), 1), ("Blue".into(), 5)],
            })
            .unwrap();
        registry.states.insert("Main".into());
        registry
    }

    #[test]
    fn enum_values_past_signed_range_are_cast() {
        let mut registry = Registry::default();
        registry
            .add_enum(Enum {
                name: "Mask".into(),
                scope: String::new(),
                state: "Main".into(),
                values: vec![("Low".into(), i64::MAX as u64), ("All".into(), u64::MAX)],
            })
            .unwrap();
        let text = StateFile::new(&registry, "RC::LuaBindings", "Main").enum_setup();
        assert!(text.contains("        lua_pushinteger(lua_state, 9223372036854775807);\n"));
        assert!(text.contains(
            "        lua_pushinteger(lua_state, static_cast<lua_Integer>(18446744073709551615ull));\n"
        ));
        assert!(text.contains("        lua_setglobal(lua_state, \"Mask\");\n"));
    }

    #[test]
    fn scoped_enum_becomes_nested_table() {
        let registry = enum_registry();
        let text = StateFile::new(&registry, "RC::LuaBindings", "Main").enum_setup();
        let expected = "inline auto lua_setup_enums_Main(lua_State* lua_state) -> void\n{\n    {\n\
            \x20       bool global_table_exists = lua_getglobal(lua_state, \"Gfx\") == LUA_TTABLE;\n\
            \x20       if (!global_table_exists)\n\
            \x20       {\n\
            \x20           lua_pop(lua_state, 1);\n\
            \x20           lua_newtable(lua_state);\n\
            \x20       }\n\n\
            \x20       lua_pushliteral(lua_state, \"Color\");\n\
            \x20       lua_newtable(lua_state);\n\
            \x20       lua_pushliteral(lua_state, \"Red\");\n\
            \x20       lua_pushinteger(lua_state, 0);\n\
            \x20       lua_rawset(lua_state, -3);\n\
            \x20       lua_pushliteral(lua_state, \"Green\");\n\
            \x20       lua_pushinteger(lua_state, 1);\n\
            \x20       lua_rawset(lua_state, -3);\n\
            \x20       lua_pushliteral(lua_state, \"Blue\");\n\
            \x20       lua_pushinteger(lua_state, 5);\n\
            \x20       lua_rawset(lua_state, -3);\n\
            \x20       lua_rawset(lua_state, -3);\n\n\
            \x20       if (!global_table_exists)\n\
            \x20       {\n\
            \x20           lua_setglobal(lua_state, \"Gfx\");\n\
            \x20       }\n\
            \x20       else\n\
            \x20       {\n\
            \x20           lua_pop(lua_state, 1);\n\
            \x20       }\n\
            \x20   }\n\n}\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn deep_scope_pops_every_nested_table() {
        let text = in_scope(&["A", "B", "C"], |body| body.push_str("        // body\n"));
        assert_eq!(text.matches("lua_rawget(lua_state, -2) != LUA_TTABLE").count(), 2);
        assert!(text.contains("        // body\n        lua_pop(lua_state, 2);\n"));
    }

    #[test]
    fn free_functions_register_under_lua_name_and_scope() {
        let mut registry = Registry::default();
        registry.states.insert("Main".into());
        let mut find = Function::new("Find", "::World", Type::void());
        find.state = Some("Main".into());
        find.source = "world.hpp".into();
        find.add_overload(vec![Param {
            name: "id".into(),
            ty: Type::numeric(Numeric::UInt32),
        }])
        .unwrap();
        let mut alias = find.clone();
        alias.lua_name = "Lookup".into();
        alias.scope_override = Some(String::new());
        alias.is_alias = true;
        registry.functions.insert("::World::Find".into(), find);
        registry.functions.insert("::Lookup".into(), alias);

        let file = StateFile::new(&registry, "RC::LuaBindings", "Main");
        let wrappers = file.free_function_wrappers().unwrap();
        assert_eq!(wrappers.matches("inline auto lua__World_Find_wrapper(").count(), 1);
        assert!(wrappers.contains("        ::World::Find(param_1);\n"));

        let setup = file.free_function_setup();
        assert!(setup.contains("        lua_pushcfunction(lua_state, &lua__World_Find_wrapper);\n        lua_setglobal(lua_state, \"Lookup\");\n"));
        assert!(setup.contains("        lua_pushliteral(lua_state, \"Find\");\n        lua_pushcfunction(lua_state, &lua__World_Find_wrapper);\n"));
        assert!(file.includes().contains("world.hpp"));
    }

    #[test]
    fn setup_file_maps_every_state() {
        let mut registry = Registry::default();
        registry.states.insert("Main".into());
        registry.states.insert("Editor".into());
        let text = setup_file(&registry, "Game::Lua");
        assert!(text.contains("#include <LuaBindings/States/Editor/Main.hpp>\n#include <LuaBindings/States/Main/Main.hpp>\n"));
        assert!(text.contains("    {\"Editor\", &Editor::lua_setup_state_Editor},\n    {\"Main\", &Main::lua_setup_state_Main},\n"));
        assert!(text.contains("Was unable to find lua state type '{}'"));
        assert!(text.ends_with("} // Game::Lua\n\n#endif //LUAWRAPPERGENERATOR_LUASETUP_HPP\n"));
    }

    #[test]
    fn convertible_sets_cover_derived_classes() {
        let mut registry = Registry::default();
        let base = registry.add_class("Base", "", "b.hpp", "Main").unwrap();
        let derived = registry.add_class("Derived", "", "d.hpp", "Main").unwrap();
        registry.add_base(derived, base).unwrap();
        registry.states.insert("Main".into());
        let sets = StateFile::new(&registry, "NS", "Main").convertible_sets();
        assert_eq!(
            sets,
            "inline std::unordered_set<std::string> convertible_to__Base {\n        {\"_BaseMetatable\"},\n        {\"_DerivedMetatable\"},\n};\n\n\
             inline std::unordered_set<std::string> convertible_to__Derived {\n        {\"_DerivedMetatable\"},\n};"
        );
    }

    #[test]
    fn state_file_sections_are_ordered() {
        let mut registry = enum_registry();
        registry.add_class("Widget", "::Ui", "ui/widget.hpp", "Main").unwrap();
        registry.extra_includes.insert("extra/array.hpp".into());
        let files = emit(&registry, "RC::LuaBindings").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, PathBuf::from("include/LuaBindings/States/Main/Main.hpp"));
        assert_eq!(files[1].path, PathBuf::from("include/LuaBindings/LuaSetup.hpp"));

        let text = &files[0].contents;
        assert!(text.starts_with("#ifndef LUAWRAPPERGENERATOR_Main_MAIN_HPP\n"));
        assert!(text.contains("#include \"extra/array.hpp\"\n#include \"ui/widget.hpp\"\n"));
        let order = [
            "namespace RC::LuaBindings::Main\n{\n",
            "struct FunctionProto",
            "inline auto deref(",
            "convertible_to___Ui_Widget {",
            "auto inline setup_FunctionProto(",
            "inline auto internal___Ui__Widget_get_self(",
            "__Ui_Widget_member_functions = {",
            "inline auto lua_setup___Ui_Widget(",
            "GenerateBuiltinToLuaFromHeapFunction(double)",
            "inline auto lua_setup_global_free_functions_Main(",
            "inline auto lua_setup_enums_Main(",
            "inline auto lua_setup_state_Main(",
            "} // RC::LuaBindings::Main\n",
        ];
        let mut last = 0;
        for marker in order {
            let pos = text[last..]
                .find(marker)
                .unwrap_or_else(|| panic!("missing or out of order: {marker}"));
            last += pos;
        }
        assert!(text.contains("    setup_FunctionProto(lua_state);\n    lua_setup___Ui_Widget(lua_state);\n\n"));
    }
}
