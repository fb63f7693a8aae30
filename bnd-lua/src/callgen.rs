//! Call-code generation: argument validation, overload resolution, the
//! native call and the return push for one [`Function`].
//!
//! With one overload every parameter is checked with `luaL_argcheck` and
//! extracted in order. With several, resolution runs in two phases inside
//! the generated code:
//!
//! 1. a guard per overload: arity plus every parameter's `validate`;
//! 2. for overloads whose guard passed, every parameter's tiebreak.
//!
//! Survivors are collected into `matching_overloads`. Zero or more than one
//! survivor raises a Lua error; exactly one is dispatched by index.

use crate::error::AbortError;
use crate::model::{scope_as_function_name, Function, Param};
use crate::registry::Registry;
use crate::types::{FunctionSignature, Type};

/// Messages raised by the generated glue at the Lua boundary.
///
/// Scripts match on these, so the text is fixed.
pub mod runtime_errors {
    pub const PROTO_NOT_USERDATA: &str = "first param for 'FunctionProto' was not userdata";
    pub const PROTO_BAD_SELF: &str = "self was '{}', expected FunctionProtoMetatable";
    pub const UNCAUGHT_RESOLUTION: &str = "Overload resolution failed and wasn't caught";
    pub const NULL_SELF: &str = "self was nullptr";
    pub const UNKNOWN_STATE: &str = "Was unable to find lua state type '{}'";
    pub const INDEX_NOT_STRING: &str = "accessing __index must be done with a string";

    pub fn member_without_self(class: &str) -> String {
        format!("{class} member accessed without self context")
    }

    pub fn member_with_null_self(class: &str) -> String {
        format!("{class} member accessed with self == nullptr")
    }

    pub fn metamethod_without_self(metamethod: &str, class: &str) -> String {
        format!("metamethod '{metamethod}' for '{class}' accessed without self context")
    }

    pub fn ambiguous_overload(function: &str) -> String {
        format!(
            "Ambiguous overload for function '{function}' (no overload was specific enough to match the parameters)"
        )
    }

    pub fn no_overload(function: &str) -> String {
        format!("No overload found for function '{function}'")
    }

    pub fn self_not_userdata(class: &str) -> String {
        format!("first param was not userdata of type '{class}'")
    }

    /// Formatted at run time with the metatable name actually found.
    pub fn bad_self(tag: &str) -> String {
        format!("self was '{{}}', expected '{tag}Metatable' or derivative")
    }
}

const PROTO_PROLOGUE: [&str; 8] = [
    "luaL_argcheck(lua_state, lua_isuserdata(lua_state, 1), 1, \"first param for 'FunctionProto' was not userdata\");",
    "lua_getmetatable(lua_state, 1);",
    "lua_pushliteral(lua_state, \"__name\");",
    "lua_rawget(lua_state, -2);",
    "auto metatable_name = std::string{lua_tostring(lua_state, -1)};",
    "if (metatable_name != \"FunctionProtoMetatable\") { luaL_error(lua_state, \"self was '{}', expected FunctionProtoMetatable\"); }",
    "auto function_proto = static_cast<FunctionProto*>(lua_touserdata(lua_state, 1));",
    "lua_pop(lua_state, 2);",
];

// ---------------------------------------------------------------------------
// Native call
// ---------------------------------------------------------------------------

/// Parameter extraction for every overload and, when `with_call` is set, the
/// native call capturing `return_value`.
pub fn cxx_call(function: &Function, registry: &Registry, with_call: bool) -> Result<String, AbortError> {
    let mut out = String::new();
    let mut resetters = Vec::new();

    match function.overloads.as_slice() {
        [] => return Err(AbortError::NoOverloads(function.name.clone())),
        [params] => {
            for (i, param) in params.iter().enumerate() {
                let slot = i as i32 + 1;
                let ty = &param.ty;
                if !ty.needs_extra_processing() {
                    out.push_str(&format!(
                        "        luaL_argcheck(lua_state, {}, {}, \"\");\n",
                        ty.validate(slot),
                        slot + 1
                    ));
                }
                if ty.needs_extra_processing() {
                    out.push_str(&ty.extra_processing(slot)?);
                } else if !ty.needs_conversion() {
                    out.push_str(&format!(
                        "        auto{} param_{slot} = {};\n",
                        if !ty.is_string() && ty.is_reference { "&" } else { "" },
                        ty.retrieve(slot, registry)?
                    ));
                } else {
                    out.push_str(&format!(
                        "        auto param_inter_{slot} = {};\n",
                        ty.retrieve(slot, registry)?
                    ));
                    out.push_str(&format!(
                        "        {};\n",
                        ty.converted(slot as usize, &mut resetters, registry)?
                    ));
                }
                out.push('\n');
            }
            if with_call {
                call_tail(&mut out, function, params, false, &resetters);
            }
        }
        overloads => {
            resolve_overloads(&mut out, function, overloads);
            dispatch_overloads(&mut out, function, overloads, registry, with_call, &mut resetters)?;
        }
    }

    Ok(out)
}

fn resolve_overloads(out: &mut String, function: &Function, overloads: &[Vec<Param>]) {
    out.push_str("        std::unordered_set<int> matching_overloads{};\n");
    out.push_str("        int num_matching_overloads{};\n");
    out.push_str("        auto num_params_on_stack = lua_gettop(lua_state);\n");

    for (x, params) in overloads.iter().enumerate() {
        out.push_str("        if (");
        out.push_str(&format!("(num_params_on_stack == {}) &&\n", params.len()));
        let guards: Vec<String> = params
            .iter()
            .enumerate()
            .map(|(i, param)| format!("            ({})", param.ty.validate(i as i32 + 1)))
            .collect();
        out.push_str(&guards.join(" &&\n"));
        out.push_str(")\n");
        out.push_str("        {\n");

        for (i, param) in params.iter().enumerate() {
            let slot = i as i32 + 1;
            out.push_str(&format!(
                "            bool param_overload_resolution_condition_{slot} = [=]() {{\n"
            ));
            out.push_str(&format!("{}\n", param.ty.tiebreak(slot)));
            out.push_str("            }();\n\n");
        }

        out.push_str("            if (");
        let conditions: Vec<String> = (1..=params.len())
            .map(|slot| {
                format!(
                    "{}param_overload_resolution_condition_{slot}",
                    if slot == 1 { "" } else { "                " }
                )
            })
            .collect();
        out.push_str(&conditions.join(" &&\n"));
        out.push_str(")\n");
        out.push_str("            {\n");
        out.push_str(&format!("                matching_overloads.emplace({x});\n"));
        out.push_str("            }\n");
        out.push_str("        }\n\n");
    }

    out.push_str("        if (matching_overloads.size() > 1)\n");
    out.push_str("        {\n");
    out.push_str(&format!(
        "            luaL_error(lua_state, \"{}\");\n",
        runtime_errors::ambiguous_overload(&function.name)
    ));
    out.push_str("        }\n");
    out.push_str("        else if (matching_overloads.empty())\n");
    out.push_str("        {\n");
    out.push_str(&format!(
        "            luaL_error(lua_state, \"{}\");\n",
        runtime_errors::no_overload(&function.name)
    ));
    out.push_str("        }\n\n");
    out.push_str("        auto selected_overload = *matching_overloads.begin();\n\n");
}

fn dispatch_overloads(
    out: &mut String,
    function: &Function,
    overloads: &[Vec<Param>],
    registry: &Registry,
    with_call: bool,
    resetters: &mut Vec<String>,
) -> Result<(), AbortError> {
    let ret = &function.return_type;
    let captured = if ret.is_void_value() {
        String::new()
    } else {
        format!("auto{} return_value = ", ret.pointer_ref())
    };
    out.push_str(&format!("        {captured}[=]() {{\n"));

    for (x, params) in overloads.iter().enumerate() {
        out.push_str(&format!(
            "            {}if (selected_overload == {x})\n",
            if x == 0 { "" } else { "else " }
        ));
        out.push_str("            {\n");
        for (i, param) in params.iter().enumerate() {
            let slot = i as i32 + 1;
            let ty = &param.ty;
            if !ty.needs_extra_processing() {
                out.push_str(&format!(
                    "                luaL_argcheck(lua_state, {}, {}, \"\");\n",
                    ty.validate(slot),
                    slot + 1
                ));
            }
            if ty.needs_extra_processing() {
                out.push_str(&ty.extra_processing(slot)?);
            } else if !ty.needs_conversion() {
                out.push_str(&format!(
                    "                auto{} param_{slot} = {};\n",
                    if ty.is_reference { "&" } else { "" },
                    ty.retrieve(slot, registry)?
                ));
            } else {
                out.push_str(&format!(
                    "                auto param_inter_{slot} = {};\n",
                    ty.retrieve(slot, registry)?
                ));
                out.push_str(&format!(
                    "                {};\n",
                    ty.converted(slot as usize, resetters, registry)?
                ));
            }
        }
        if with_call {
            call_tail(out, function, params, true, resetters);
        }
        out.push_str("            }\n");
    }

    out.push_str("            else\n");
    out.push_str("            {\n");
    out.push_str(&format!(
        "                luaL_error(lua_state, \"{}\");\n",
        runtime_errors::UNCAUGHT_RESOLUTION
    ));
    // luaL_error longjmps; the throw keeps every path returning.
    out.push_str("                throw std::runtime_error{\"\"};\n");
    out.push_str("            }\n");
    out.push_str("        }();\n\n");
    Ok(())
}

fn call_tail(out: &mut String, function: &Function, params: &[Param], in_lambda: bool, resetters: &[String]) {
    let ret = &function.return_type;
    let is_void = ret.is_void_value();

    if !in_lambda && !is_void {
        out.push_str(&format!("        auto{} return_value = ", ret.pointer_ref()));
    }
    if in_lambda && !is_void {
        out.push_str("                return ");
    }

    let pad = if is_void { "        " } else { "" };
    if function.owner.is_some() && !function.is_static {
        out.push_str(&format!("{pad}self->{}(", function.name));
    } else if function.is_constructor {
        out.push_str(&format!("{pad}{}(", function.scope));
    } else {
        out.push_str(&format!("{pad}{}::{}(", function.scope, function.name));
    }

    let args: Vec<String> = (1..=params.len()).map(|slot| format!("param_{slot}")).collect();
    out.push_str(&args.join(", "));
    out.push_str(");\n\n");

    for resetter in resetters {
        out.push_str(resetter);
    }
}

// ---------------------------------------------------------------------------
// Wrappers
// ---------------------------------------------------------------------------

/// `return 0;` for void by value, otherwise one push and `return 1;`.
pub fn return_statement(function: &Function, registry: &Registry) -> Result<String, AbortError> {
    if function.return_type.is_void_value() {
        return Ok("        return 0;".to_string());
    }
    Ok(format!(
        "{};\n        return 1;",
        function.return_type.push("return_value", "", registry)?
    ))
}

/// The `try`/`catch` body shared by every generated `lua_CFunction`.
pub fn wrapper_body(function: &Function, registry: &Registry) -> Result<String, AbortError> {
    let mut out = String::from("    try\n    {\n");

    if function.owner.is_some() && !function.is_static {
        out.push_str("        // Prologue\n");
        out.push_str(&format!(
            "        auto [_, self] = internal_{}_get_self(lua_state);\n\n",
            scope_as_function_name(&function.scope)
        ));
    }

    out.push_str("        // Native call\n");
    out.push_str(&cxx_call(function, registry, true)?);
    out.push_str(&return_statement(function, registry)?);
    out.push('\n');
    out.push_str("    }\n");
    out.push_str("    catch (std::exception& e)\n");
    out.push_str("    {\n");
    out.push_str("        luaL_error(lua_state, e.what());\n");
    out.push_str("        return 0;\n");
    out.push_str("    }\n\n");
    Ok(out)
}

/// A complete `inline auto {name}(lua_State*) -> int` definition.
pub fn wrapper_function(name: &str, function: &Function, registry: &Registry) -> Result<String, AbortError> {
    Ok(format!(
        "inline auto {name}(lua_State* lua_state) -> int\n{{\n{}}}\n\n",
        wrapper_body(function, registry)?
    ))
}

// ---------------------------------------------------------------------------
// Function signatures
// ---------------------------------------------------------------------------

/// Lua entry point for calling a native function pointer boxed in a
/// `FunctionProto` userdata.
pub fn proto_wrapper(sig: &FunctionSignature, registry: &Registry) -> Result<String, AbortError> {
    let name = sig.wrapper_name()?;
    let mut function = Function::new(name.clone(), "", (*sig.return_type).clone());
    let params: Vec<Param> = sig
        .params
        .iter()
        .map(|ty| Param {
            name: String::new(),
            ty: ty.clone(),
        })
        .collect();
    let arity = params.len();
    function.overloads.push(params);

    let mut out = format!("inline auto {name}(lua_State* lua_state) -> int\n{{\n");
    out.push_str("    try\n    {\n");
    out.push_str("        // Prologue\n");
    for line in PROTO_PROLOGUE {
        out.push_str(&format!("        {line}\n"));
    }
    out.push_str("        lua_remove(lua_state, 1);\n\n");

    out.push_str("        // Native call\n");
    out.push_str(&cxx_call(&function, registry, false)?);
    out.push('\n');
    let args: Vec<String> = (1..=arity).map(|slot| format!("param_{slot}")).collect();
    let capture = if function.return_type.is_void_value() {
        String::new()
    } else {
        format!("auto{} return_value = ", function.return_type.pointer_ref())
    };
    out.push_str(&format!(
        "        {capture}std::bit_cast<{}>(function_proto->function_pointer)({});\n",
        sig.signature(true)?,
        args.join(", ")
    ));
    out.push_str(&return_statement(&function, registry)?);
    out.push('\n');
    out.push_str("    }\n");
    out.push_str("    catch (std::exception& e)\n");
    out.push_str("    {\n");
    out.push_str("        luaL_error(lua_state, e.what());\n");
    out.push_str("        return 0;\n");
    out.push_str("    }\n\n");
    out.push_str("}\n");
    Ok(out)
}

/// `setup_FunctionProto`: the metatable every boxed function pointer gets.
/// `__call` forwards to the signature wrapper, `__index` exposes
/// `GetFunctionAddress`.
pub fn proto_metatable() -> String {
    let mut out = String::new();
    out.push_str("auto inline setup_FunctionProto(lua_State* lua_state) -> void\n");
    out.push_str("{\n");
    out.push_str("    luaL_newmetatable(lua_state, \"FunctionProtoMetatable\");\n");

    out.push_str("    lua_pushliteral(lua_state, \"__call\");\n");
    out.push_str("    lua_pushcfunction(lua_state, [](lua_State* lua_state) -> int {\n");
    push_proto_checks(&mut out, "        ", 2);
    out.push_str("        return function_proto->lua_wrapper_function_function_pointer(lua_state);\n");
    out.push_str("    });\n");
    out.push_str("    lua_rawset(lua_state, -3);\n");

    out.push_str("    lua_pushliteral(lua_state, \"__index\");\n");
    out.push_str("    lua_pushcfunction(lua_state, [](lua_State* lua_state) -> int {\n");
    push_proto_checks(&mut out, "        ", 2);
    out.push_str("        lua_remove(lua_state, 1);\n");
    out.push_str("        if (lua_isstring(lua_state, 1))\n");
    out.push_str("        {\n");
    out.push_str("            auto member_name = std::string{lua_tostring(lua_state, 1)};\n");
    out.push_str("            if (member_name == \"GetFunctionAddress\")\n");
    out.push_str("            {\n");
    out.push_str("                lua_pushcfunction(lua_state, [](lua_State* lua_state) -> int {\n");
    push_proto_checks(&mut out, "                    ", 3);
    out.push_str("                    lua_pushinteger(lua_state, std::bit_cast<lua_Integer>(function_proto->function_pointer));\n");
    out.push_str("                    return 1;\n");
    out.push_str("                });\n");
    out.push_str("                return 1;\n");
    out.push_str("            }\n");
    out.push_str("            else\n");
    out.push_str("            {\n");
    out.push_str("                return 0;\n");
    out.push_str("            }\n");
    out.push_str("        }\n");
    out.push_str("        else\n");
    out.push_str("        {\n");
    out.push_str("            return 0;\n");
    out.push_str("        }\n");
    out.push_str("    });\n");
    out.push_str("    lua_rawset(lua_state, -3);\n");
    out.push_str("    lua_pop(lua_state, 1);\n");
    out.push_str("}\n");
    out
}

/// The self check shared by the `FunctionProto` closures, popping `pop`
/// values at the end.
fn push_proto_checks(out: &mut String, indent: &str, pop: u32) {
    for line in &PROTO_PROLOGUE[..PROTO_PROLOGUE.len() - 1] {
        out.push_str(&format!("{indent}{line}\n"));
    }
    out.push_str(&format!("{indent}lua_pop(lua_state, {pop});\n"));
}

/// Collects the type of every parameter, used by callers that only need to
/// walk a function's types.
pub fn param_types(function: &Function) -> impl Iterator<Item = &Type> {
    function
        .overloads
        .iter()
        .flat_map(|overload| overload.iter().map(|param| &param.ty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Numeric, TypeKind};
    use pretty_assertions::assert_eq;

    fn param(ty: Type) -> Param {
        Param {
            name: "value".into(),
            ty,
        }
    }

    fn member(registry: &mut Registry, name: &str, ret: Type) -> Function {
        let id = registry.add_class("Foo", "", "foo.hpp", "Main").unwrap();
        let mut f = Function::new(name, registry.class(id).qualified(), ret);
        f.owner = Some(id);
        f
    }

    #[test]
    fn single_overload_member_with_void_return() {
        let mut registry = Registry::default();
        let mut bar = member(&mut registry, "Bar", Type::void());
        bar.add_overload(vec![param(Type::numeric(Numeric::Int32))])
            .unwrap();

        let body = wrapper_body(&bar, &registry).unwrap();
        let expected = "    try\n    {\n\
            \x20       // Prologue\n\
            \x20       auto [_, self] = internal___Foo_get_self(lua_state);\n\n\
            \x20       // Native call\n\
            \x20       luaL_argcheck(lua_state, lua_isnumber(lua_state, 1), 2, \"\");\n\
            \x20       auto param_1 = static_cast<int32_t>(lua_tonumber(lua_state, 1));\n\n\
            \x20       self->Bar(param_1);\n\n\
            \x20       return 0;\n\
            \x20   }\n\
            \x20   catch (std::exception& e)\n\
            \x20   {\n\
            \x20       luaL_error(lua_state, e.what());\n\
            \x20       return 0;\n\
            \x20   }\n\n";
        assert_eq!(body, expected);
        assert_eq!(body.matches("luaL_argcheck").count(), 1);
    }

    #[test]
    fn int_and_float_overloads_resolve_at_run_time() {
        let mut registry = Registry::default();
        let mut bar = member(&mut registry, "Bar", Type::void());
        bar.add_overload(vec![param(Type::numeric(Numeric::Int32))])
            .unwrap();
        bar.add_overload(vec![param(Type::numeric(Numeric::Float))])
            .unwrap();

        let call = cxx_call(&bar, &registry, true).unwrap();
        assert!(call.contains(
            "        if ((num_params_on_stack == 1) &&\n            (lua_isnumber(lua_state, 1)))\n"
        ));
        assert!(call.contains("matching_overloads.emplace(0);"));
        assert!(call.contains("matching_overloads.emplace(1);"));
        assert!(call.contains(&runtime_errors::ambiguous_overload("Bar")));
        assert!(call.contains("luaL_error(lua_state, \"No overload found for function 'Bar'\");"));
        assert!(call.contains("            if (selected_overload == 0)\n"));
        assert!(call.contains("            else if (selected_overload == 1)\n"));
        assert!(call.contains("        [=]() {\n"));
        // Survivor check runs after every guard.
        let last_guard = call.rfind("matching_overloads.emplace").unwrap();
        let ambiguity = call.find("if (matching_overloads.size() > 1)").unwrap();
        assert!(last_guard < ambiguity);
    }

    #[test]
    fn overloaded_return_value_is_captured_from_lambda() {
        let registry = Registry::default();
        let mut find = Function::new("Find", "::World", Type::numeric(Numeric::Int64));
        find.add_overload(vec![param(TypeKind::Bool.into())]).unwrap();
        find.add_overload(vec![
            param(TypeKind::Bool.into()),
            param(Type::numeric(Numeric::Int8)),
        ])
        .unwrap();

        let call = cxx_call(&find, &registry, true).unwrap();
        assert!(call.contains("        auto return_value = [=]() {\n"));
        assert!(call.contains("                return ::World::Find(param_1, param_2);\n"));
        assert!(call.contains("            (lua_isboolean(lua_state, 1)) &&\n            (lua_isnumber(lua_state, 2)))"));
        assert!(call.contains(
            "            if (param_overload_resolution_condition_1 &&\n                param_overload_resolution_condition_2)\n"
        ));
        assert_eq!(
            return_statement(&find, &registry).unwrap(),
            "        lua_pushinteger(lua_state, static_cast<int64_t>(return_value));\n        return 1;"
        );
    }

    #[test]
    fn opaque_pointer_parameter_uses_extra_processing() {
        let mut registry = Registry::default();
        registry.add_class("Texture", "::Gfx", "tex.hpp", "Main").unwrap();
        let mut bind = Function::new("Bind", "::Gfx", Type::void());
        bind.add_overload(vec![param(Type::opaque("::Gfx", "Texture").pointer())])
            .unwrap();

        let call = cxx_call(&bind, &registry, true).unwrap();
        assert!(!call.contains("luaL_argcheck"));
        assert!(call.starts_with(
            "        auto param_1 = lua_util_userdata_Get<\"__Gfx_TextureMetatable\", ::Gfx::Texture*, convertible_to___Gfx_Texture>(lua_state, 1);\n"
        ));
        assert!(call.contains("        ::Gfx::Bind(param_1);\n"));
    }

    #[test]
    fn string_reference_is_copied() {
        let registry = Registry::default();
        let mut log = Function::new("Log", "", Type::void());
        log.add_overload(vec![param(
            Type::from(TypeKind::Str(crate::types::StringKind::String))
                .reference()
                .constant(),
        )])
        .unwrap();
        let call = cxx_call(&log, &registry, true).unwrap();
        assert!(call.contains("        auto param_1 = std::string{lua_tostring(lua_state, 1)};\n"));
        assert!(call.contains("        ::Log(param_1);\n"));
    }

    #[test]
    fn constructor_calls_class_directly() {
        let mut registry = Registry::default();
        let id = registry.add_class("Vec", "::Math", "vec.hpp", "Main").unwrap();
        let mut ctor = Function::new("Vec", "::Math::Vec", Type::opaque("::Math", "Vec"));
        ctor.owner = Some(id);
        ctor.is_static = true;
        ctor.is_constructor = true;
        ctor.add_overload(vec![param(Type::numeric(Numeric::Float))])
            .unwrap();

        let body = wrapper_body(&ctor, &registry).unwrap();
        assert!(!body.contains("// Prologue"));
        assert!(body.contains("        auto return_value = ::Math::Vec(param_1);\n"));
        assert!(body.contains("luaL_getmetatable(lua_state, \"__Math_VecMetatable\");"));
        assert!(body.contains("        return 1;"));
    }

    #[test]
    fn function_without_overloads_is_an_abort() {
        let f = Function::new("Empty", "", Type::void());
        assert_eq!(
            cxx_call(&f, &Registry::default(), true),
            Err(AbortError::NoOverloads("Empty".into()))
        );
    }

    #[test]
    fn proto_wrapper_calls_through_function_pointer() {
        let sig = FunctionSignature {
            params: vec![Type::numeric(Numeric::Int32), TypeKind::Bool.into()],
            return_type: Box::new(Type::void()),
            has_storage: false,
        };
        let wrapper = proto_wrapper(&sig, &Registry::default()).unwrap();
        assert!(wrapper.starts_with(
            "inline auto Ret_void_Params_int32_t_bool(lua_State* lua_state) -> int\n{\n    try\n    {\n        // Prologue\n"
        ));
        assert!(wrapper.contains("        lua_remove(lua_state, 1);\n\n        // Native call\n"));
        assert!(wrapper.contains("        luaL_argcheck(lua_state, lua_isboolean(lua_state, 2), 3, \"\");\n"));
        assert!(wrapper.contains(
            "        std::bit_cast<void(*)(int32_t, bool)>(function_proto->function_pointer)(param_1, param_2);\n        return 0;\n    }\n"
        ));
        assert!(!wrapper.contains("return_value"));
        assert!(wrapper.ends_with("    }\n\n}\n"));
    }

    #[test]
    fn proto_wrapper_pushes_non_void_result() {
        let sig = FunctionSignature {
            params: vec![Type::numeric(Numeric::Int32)],
            return_type: Box::new(Type::numeric(Numeric::Int32)),
            has_storage: false,
        };
        let wrapper = proto_wrapper(&sig, &Registry::default()).unwrap();
        assert!(wrapper.contains(
            "        auto return_value = std::bit_cast<int32_t(*)(int32_t)>(function_proto->function_pointer)(param_1);\n\
             \x20       lua_pushinteger(lua_state, static_cast<int32_t>(return_value));\n\
             \x20       return 1;\n    }\n"
        ));
    }

    #[test]
    fn proto_metatable_pops_three_inside_address_getter() {
        let text = proto_metatable();
        assert_eq!(text.matches(runtime_errors::PROTO_NOT_USERDATA).count(), 3);
        assert_eq!(text.matches("lua_pop(lua_state, 2);").count(), 2);
        assert!(text.contains("                    lua_pop(lua_state, 3);\n"));
        assert!(text.ends_with("    lua_rawset(lua_state, -3);\n    lua_pop(lua_state, 1);\n}\n"));
    }
}
