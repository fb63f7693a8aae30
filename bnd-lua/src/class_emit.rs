//! Per-class emission: the `get_self` helper, member wrappers, the member
//! and metamethod maps, the constructor dispatcher and the setup function
//! that builds the userdata metatable and the Lua-side class table.
//!
//! Inherited members and metamethods are resolved here, at emission time,
//! by walking [`Registry::flattened_bases`]. Nothing is copied into the
//! derived class during ingestion.

use std::collections::BTreeSet;

use crate::callgen::{self, runtime_errors};
use crate::error::AbortError;
use crate::model::{
    is_operator_overload, scope_as_function_name, scope_parts, Class, ClassId, Function,
    METAMETHOD_NAMES,
};
use crate::registry::Registry;

/// Names the generic utility entries occupy in every member map.
const RESERVED_NAMES: [&str; 6] = ["Set", "set", "Get", "get", "IsValid", "GetAddress"];

pub struct ClassEmitter<'a> {
    registry: &'a Registry,
    class: &'a Class,
    /// `__A__B_Name`
    tag: String,
    /// `::A::B::Name`
    qualified: String,
    /// `internal___A__B_Name_get_self`
    get_self: String,
}

impl<'a> ClassEmitter<'a> {
    pub fn new(registry: &'a Registry, id: ClassId) -> Self {
        let class = registry.class(id);
        Self {
            registry,
            class,
            tag: class.tag(),
            qualified: class.qualified(),
            get_self: format!(
                "internal_{}__{}_get_self",
                scope_as_function_name(&class.scope),
                class.name
            ),
        }
    }

    fn wrapper_name(&self, function: &Function) -> String {
        let owner = function
            .owner
            .map(|id| self.registry.class(id))
            .unwrap_or(self.class);
        format!("{}_member_function_wrapper_{}", owner.tag(), function.name)
    }

    // ---------------------------------------------------------------------------
    // Self extraction
    // ---------------------------------------------------------------------------

    /// `internal_..._get_self`: validates slot 1, checks the metatable name
    /// against the convertible-to set, then follows the stored pointer depth.
    pub fn get_self(&self) -> String {
        let q = &self.qualified;
        let tag = &self.tag;
        let mut out = format!(
            "template<typename ReturnType = {q}*, bool return_container_or_nullptr = false, bool pop_userdata = true>\n"
        );
        out.push_str(&format!(
            "inline auto {}(lua_State* lua_state) -> std::pair<bool, ReturnType>\n",
            self.get_self
        ));
        out.push_str("{\n");
        out.push_str(&format!(
            "    luaL_argcheck(lua_state, lua_isuserdata(lua_state, 1), 1, \"{}\");\n",
            runtime_errors::self_not_userdata(&self.class.name)
        ));
        out.push_str("    lua_getiuservalue(lua_state, 1, 1);\n");
        out.push_str("    int pointer_depth = lua_tointeger(lua_state, -1);\n");
        out.push_str("    bool is_pointer = pointer_depth > 0;\n");
        out.push_str("    lua_getmetatable(lua_state, 1);\n");
        out.push_str("    lua_pushliteral(lua_state, \"__name\");\n");
        out.push_str("    lua_rawget(lua_state, -2);\n");
        out.push_str("    auto metatable_name = std::string{lua_tostring(lua_state, -1)};\n");
        out.push_str(&format!(
            "    auto bad_self_error_message = std::format(\"{}\", metatable_name);\n",
            runtime_errors::bad_self(tag)
        ));
        out.push_str(&format!(
            "    luaL_argcheck(lua_state, convertible_to_{tag}.contains(metatable_name), 1, bad_self_error_message.c_str());\n"
        ));
        out.push_str("    lua_pop(lua_state, 3);\n");
        out.push_str(&format!("    {q}** self_container{{}};\n"));
        out.push_str(&format!("    {q}* self{{}};\n"));
        out.push_str("    if (is_pointer)\n    {\n");
        out.push_str("        auto* outer_most_container = lua_touserdata(lua_state, 1);\n");
        out.push_str("        if (outer_most_container)\n");
        out.push_str("        {\n");
        out.push_str(&format!(
            "            self_container = static_cast<{q}**>(deref(outer_most_container, pointer_depth - 1));\n"
        ));
        out.push_str("            if (self_container) { self = *self_container; }\n");
        out.push_str("        }\n");
        out.push_str("    }\n    else\n    {\n");
        out.push_str(&format!("        self = static_cast<{q}*>(lua_touserdata(lua_state, 1));\n"));
        out.push_str("    }\n");
        out.push_str("    if constexpr (pop_userdata)\n");
        out.push_str("    {\n");
        out.push_str("        lua_remove(lua_state, 1);\n");
        out.push_str("    }\n");
        out.push_str("    if constexpr (return_container_or_nullptr)\n");
        out.push_str("    {\n");
        out.push_str("        if (is_pointer)\n");
        out.push_str("        {\n");
        out.push_str("            return {is_pointer, self_container};\n");
        out.push_str("        }\n");
        out.push_str("        else\n");
        out.push_str("        {\n");
        // The bit_cast is only read after the caller checks `is_pointer`.
        out.push_str(&format!(
            "            luaL_argcheck(lua_state, self, 1, \"{}\");\n",
            runtime_errors::NULL_SELF
        ));
        out.push_str("            return {is_pointer, std::bit_cast<ReturnType>(self)};\n");
        out.push_str("        }\n");
        out.push_str("    }\n");
        out.push_str("    else\n");
        out.push_str("    {\n");
        out.push_str(&format!(
            "        luaL_argcheck(lua_state, self, 1, \"{}\");\n",
            runtime_errors::NULL_SELF
        ));
        out.push_str("        return {is_pointer, self};\n");
        out.push_str("    }\n");
        out.push('}');
        out
    }

    // ---------------------------------------------------------------------------
    // Wrappers and maps
    // ---------------------------------------------------------------------------

    /// One wrapper per own member and static function. Redirected functions
    /// reuse their external wrapper; operators are not exposed.
    pub fn member_wrappers(&self) -> Result<String, AbortError> {
        let mut out = String::new();
        for function in self.class.functions.values() {
            if function.is_custom_redirector || is_operator_overload(&function.name) {
                continue;
            }
            out.push_str(&callgen::wrapper_function(
                &self.wrapper_name(function),
                function,
                self.registry,
            )?);
        }
        for function in self.class.static_functions.values() {
            if function.is_custom_redirector {
                continue;
            }
            out.push_str(&callgen::wrapper_function(
                &self.wrapper_name(function),
                function,
                self.registry,
            )?);
        }
        Ok(out)
    }

    /// Name-to-wrapper map consulted by `__index`. Own functions come first
    /// and shadow inherited ones of the same name.
    pub fn member_map(&self) -> String {
        let mut out = format!(
            "inline static std::unordered_map<std::string, int (*)(lua_State*)> {}_member_functions = {{\n",
            self.tag
        );

        let mut containers = vec![&self.class.functions];
        for base in self.registry.flattened_bases(self.class.id) {
            containers.push(&self.registry.class(base).functions);
        }

        // Collisions are settled over every candidate before any reserved
        // entry is appended.
        let collides = |name: &str| {
            containers
                .iter()
                .any(|functions| functions.values().any(|f| f.name == name))
        };
        let reserved: BTreeSet<&str> = RESERVED_NAMES
            .into_iter()
            .filter(|name| collides(name))
            .collect();

        let mut emitted = BTreeSet::new();
        for functions in &containers {
            for function in functions.values() {
                if is_operator_overload(&function.name) || !emitted.insert(function.name.as_str()) {
                    continue;
                }
                let target = match (&function.wrapper_name, function.is_custom_redirector) {
                    (Some(wrapper), true) => wrapper.clone(),
                    _ => self.wrapper_name(function),
                };
                out.push_str(&format!("    {{\"{}\", &{target}}},\n", function.name));
            }
        }

        out.push_str("\n    // Generic utility\n");
        let q = &self.qualified;
        let tag = &self.tag;
        let get_self = format!("{}<{q}**, true>", self.get_self);
        if !reserved.contains("Set") && !reserved.contains("set") {
            for name in ["Set", "set"] {
                out.push_str(&format!(
                    "    {{\"{name}\", &lua_util_userdata_member_function_wrapper_Set<\"{tag}Metatable\", {q}, convertible_to_{tag}, decltype({get_self}), {get_self}>}},\n"
                ));
            }
        }
        if !reserved.contains("Get") && !reserved.contains("get") {
            out.push_str("    {\"Get\", &lua_util_userdata_member_function_wrapper_Get},\n");
            out.push_str("    {\"get\", &lua_util_userdata_member_function_wrapper_Get},\n");
        }
        for name in ["IsValid", "GetAddress"] {
            if !reserved.contains(name) {
                out.push_str(&format!(
                    "    {{\"{name}\", &lua_util_userdata_member_function_wrapper_{name}<decltype({get_self}), {get_self}>}},\n"
                ));
            }
        }
        out.push_str("};\n");
        out
    }

    /// Every metamethod the class or one of its bases implements.
    pub fn metamethod_map(&self) -> String {
        let mut out = format!(
            "inline static std::unordered_map<std::string, int (*)(lua_State*, void*)> {}_metamethods = {{\n",
            self.tag
        );
        for name in METAMETHOD_NAMES {
            if let Some(wrapper) = self.metamethod_wrapper(name) {
                out.push_str(&format!("    {{\"{name}\", &{wrapper}}},\n"));
            }
        }
        out.push_str("};\n");
        out
    }

    fn metamethod_wrapper(&self, name: &str) -> Option<&str> {
        self.registry
            .find_metamethod(self.class.id, name)
            .and_then(|function| function.wrapper_name.as_deref())
    }

    // ---------------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------------

    /// `__call` on the class table. Empty when the class only has a default
    /// constructor or none at all.
    pub fn constructor_dispatch(&self) -> Result<String, AbortError> {
        let Some(constructor) = self.class.constructor() else {
            return Ok(String::new());
        };
        let q = &self.qualified;
        let mut out = format!(
            "inline auto lua_setup_{}_constructor_dispatch(lua_State* lua_state) -> void\n",
            self.tag
        );
        out.push_str("{\n");
        out.push_str("    lua_newtable(lua_state);\n");
        out.push_str("    lua_pushliteral(lua_state, \"__call\");\n");
        out.push_str("    lua_pushcfunction(lua_state, ([](lua_State* lua_state) -> int {\n");
        out.push_str("        lua_remove(lua_state, 1);\n");
        if self.class.has_parameterless_constructor {
            out.push_str("        if (lua_gettop(lua_state) == 0)\n");
            out.push_str("        {\n");
            out.push_str(&format!("            auto constructed_object = {q}{{}};\n"));
            out.push_str(&format!(
                "            auto* userdata = static_cast<{q}*>(lua_newuserdatauv(lua_state, sizeof({q}), 1));\n"
            ));
            out.push_str("            lua_pushinteger(lua_state, 0);\n");
            out.push_str("            lua_setiuservalue(lua_state, -2, 1);\n");
            out.push_str(&format!("            new(userdata) {q}{{std::move(constructed_object)}};\n"));
            out.push_str(&format!(
                "            luaL_getmetatable(lua_state, \"{}Metatable\");\n",
                self.tag
            ));
            out.push_str("            lua_setmetatable(lua_state, -2);\n");
            out.push_str("            return 1;\n");
            out.push_str("        }\n");
        }
        out.push_str(&callgen::wrapper_body(constructor, self.registry)?);
        out.push_str("    }));\n");
        out.push_str("    lua_rawset(lua_state, -3);\n");
        out.push_str("    lua_setmetatable(lua_state, -2);\n");
        out.push('}');
        Ok(out)
    }

    // ---------------------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------------------

    /// `lua_setup_{tag}`: registers the userdata metatable, then publishes the
    /// class table (statics and constructor) under its Lua scope.
    pub fn setup_function(&self) -> String {
        let tag = &self.tag;
        let name = &self.class.name;
        let mut out = format!("inline auto lua_setup_{tag}(lua_State* lua_state) -> void\n{{\n");

        out.push_str("    // Metatable For Userdata -> START\n");
        out.push_str(&format!("    luaL_newmetatable(lua_state, \"{tag}Metatable\");\n\n"));
        out.push_str("    lua_pushliteral(lua_state, \"__cxx_name\");\n");
        out.push_str(&format!("    lua_pushliteral(lua_state, \"{}\");\n", self.qualified));
        out.push_str("    lua_rawset(lua_state, -3);\n\n");

        for patch in self.registry.patches() {
            out.push_str(&patch.per_class(self.class));
        }

        out.push_str(&self.index_trampoline());

        for metamethod in METAMETHOD_NAMES {
            if metamethod == "__index" || self.metamethod_wrapper(metamethod).is_none() {
                continue;
            }
            out.push_str(&format!("    lua_pushliteral(lua_state, \"{metamethod}\");\n"));
            out.push_str("    lua_pushcclosure(lua_state, [](lua_State* lua_state) -> int {\n");
            out.push_str("        if (!lua_isuserdata(lua_state, 1))\n");
            out.push_str("        {\n");
            out.push_str("                lua_remove(lua_state, 1);\n");
            out.push_str(&format!(
                "                luaL_error(lua_state, \"{}\");\n",
                runtime_errors::metamethod_without_self(metamethod, name)
            ));
            out.push_str("        }\n\n");
            out.push_str(&self.self_without_pop());
            out.push_str(&format!(
                "        auto it = {tag}_metamethods.find(\"{metamethod}\");\n"
            ));
            out.push_str(&format!(
                "        if (it == {tag}_metamethods.end()) {{ return 0; }}\n"
            ));
            out.push_str("        return it->second(lua_state, self);\n");
            out.push_str("    }, 0);\n");
            out.push_str("    lua_rawset(lua_state, -3);\n\n");
        }

        out.push_str("    // Remove table from the stack now that we're done with it.\n");
        out.push_str("    lua_remove(lua_state, -1);\n");
        out.push_str("    // Metatable For Userdata -> END\n\n");

        out.push_str(&self.class_table());
        out.push_str("    // Scopes -> END\n");
        out.push_str("}\n");
        out
    }

    /// `__index` looks the key up in the member map first and falls back to
    /// the resolved `__index` metamethod, own or inherited.
    fn index_trampoline(&self) -> String {
        let tag = &self.tag;
        let mut out = String::from("    lua_pushliteral(lua_state, \"__index\");\n");
        out.push_str("    lua_pushcclosure(lua_state, [](lua_State* lua_state) -> int {\n");
        out.push_str("        if (!lua_isuserdata(lua_state, -2))\n");
        out.push_str("        {\n");
        out.push_str("                lua_remove(lua_state, -1);\n");
        out.push_str("                lua_remove(lua_state, -2);\n");
        out.push_str(&format!(
            "                luaL_error(lua_state, \"{}\");\n",
            runtime_errors::member_without_self(&self.class.name)
        ));
        out.push_str("        }\n\n");
        out.push_str(&format!(
            "        luaL_argcheck(lua_state, lua_isstring(lua_state, -1), 2, \"{}\");\n\n",
            runtime_errors::INDEX_NOT_STRING
        ));
        out.push_str("        auto index = std::string_view{lua_tostring(lua_state, -1)};\n");
        out.push_str(&format!(
            "        if (auto it = {tag}_member_functions.find(index.data()); it != {tag}_member_functions.end())\n"
        ));
        out.push_str("        {\n");
        out.push_str("            lua_pop(lua_state, 1);\n");
        out.push_str("            lua_pushcfunction(lua_state, it->second);\n");
        out.push_str("            return 1;\n");
        out.push_str("        }\n\n");
        out.push_str(&self.self_without_pop());
        out.push_str(&format!(
            "        auto index_it = {tag}_metamethods.find(\"__index\");\n"
        ));
        out.push_str(&format!(
            "        if (index_it == {tag}_metamethods.end()) {{ return 0; }}\n"
        ));
        out.push_str("        return index_it->second(lua_state, self);\n");
        out.push_str("    }, 0);\n");
        out.push_str("    lua_rawset(lua_state, -3);\n\n");
        out
    }

    fn self_without_pop(&self) -> String {
        format!(
            "        auto [_, self] = {}<{}*, false, false>(lua_state);\n        if (!self) {{ luaL_error(lua_state, \"{}\"); }};\n",
            self.get_self,
            self.qualified,
            runtime_errors::member_with_null_self(&self.class.name)
        )
    }

    /// The Lua-side class table: nested tables for each scope part, the
    /// static functions and the constructor metatable.
    fn class_table(&self) -> String {
        let name = &self.class.name;
        let lua_scope = self.class.lua_scope();
        let parts = scope_parts(lua_scope);
        let mut out = String::from("    // Scopes -> START\n");

        let Some((global_table, nested)) = parts.split_first() else {
            out.push_str("    lua_newtable(lua_state);\n\n");
            out.push_str(&self.class_table_contents());
            out.push_str(&format!("    lua_setglobal(lua_state, \"{name}\");\n"));
            return out;
        };

        out.push_str(&format!(
            "    bool global_table_exists = lua_getglobal(lua_state, \"{global_table}\") == LUA_TTABLE;\n"
        ));
        out.push_str("    if (!global_table_exists)\n");
        out.push_str("    {\n");
        out.push_str("        lua_pop(lua_state, 1);\n");
        out.push_str("        lua_newtable(lua_state);\n");
        out.push_str("    }\n\n");
        for part in nested {
            out.push_str(&format!("    lua_pushliteral(lua_state, \"{part}\");\n"));
            out.push_str("    if (lua_rawget(lua_state, -2) != LUA_TTABLE)\n");
            out.push_str("    {\n");
            out.push_str("        lua_pop(lua_state, 1);\n");
            out.push_str(&format!("        lua_pushliteral(lua_state, \"{part}\");\n"));
            out.push_str("        lua_newtable(lua_state);\n");
            out.push_str("        lua_rawset(lua_state, -3);\n");
            out.push_str(&format!("        lua_pushliteral(lua_state, \"{part}\");\n"));
            out.push_str("        lua_rawget(lua_state, -2);\n");
            out.push_str("    }\n\n");
        }
        out.push_str(&format!("    lua_pushliteral(lua_state, \"{name}\");\n"));
        out.push_str("    lua_newtable(lua_state);\n\n");
        out.push_str(&self.class_table_contents());
        out.push_str("    lua_rawset(lua_state, -3);\n");
        if !nested.is_empty() {
            out.push_str(&format!("    lua_pop(lua_state, {});\n", nested.len()));
        }
        out.push_str("\n    if (global_table_exists)\n");
        out.push_str("    {\n");
        out.push_str("        lua_pop(lua_state, 1);\n");
        out.push_str("    }\n");
        out.push_str("    else\n");
        out.push_str("    {\n");
        out.push_str(&format!("        lua_setglobal(lua_state, \"{global_table}\");\n"));
        out.push_str("    }\n");
        out
    }

    fn class_table_contents(&self) -> String {
        let mut out = String::new();
        for function in self.class.static_functions.values() {
            out.push_str(&format!("    lua_pushliteral(lua_state, \"{}\");\n", function.name));
            let target = match (&function.wrapper_name, function.is_custom_redirector) {
                (Some(wrapper), true) => wrapper.clone(),
                _ => self.wrapper_name(function),
            };
            out.push_str(&format!("    lua_pushcfunction(lua_state, &{target});\n"));
            out.push_str("    lua_rawset(lua_state, -3);\n\n");
        }
        if self.class.constructor().is_some() {
            out.push_str("    // Metatable For Table -> START\n");
            out.push_str(&format!(
                "    lua_setup_{}_constructor_dispatch(lua_state);\n",
                self.tag
            ));
            out.push_str("    // Metatable For Table -> END\n\n");
        }
        out
    }
}
