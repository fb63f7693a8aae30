//! Registry ingestion.
//!
//! Two passes over the [`DeclStream`]:
//!
//! 1. Every comment is scanned for binding requests (`LuaLate`,
//!    `LuaAddMetamethod`, redirectors, template maps, extra bases) and every
//!    class and enum name is recorded so type spellings can be resolved.
//! 2. Declarations are registered. Exposed classes get their members,
//!    everything else becomes a thin class used only for base resolution.
//!
//! A finishing step applies extra bases and redirectors, and drops functions
//! that name classes the stream never declared.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use tracing::{debug, trace, warn};

use crate::annotation::{Annotations, AttributeError};
use crate::callgen;
use crate::decl::{ClassDecl, Decl, DeclStream, EnumDecl, FunctionDecl};
use crate::error::{AbortError, SkipError};
use crate::model::{
    is_operator_overload, normalize_scope, split_qualified, ClassId, Enum, Function,
    FunctionContainer, Overload, Param, METAMETHOD_NAMES,
};
use crate::registry::Registry;
use crate::spelling::{KnownNames, TypeConverter};
use crate::types::{Type, TypeKind};

/// Counts reported once ingestion completes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub classes: usize,
    pub thin_classes: usize,
    pub functions: usize,
    pub enums: usize,
    pub skipped: usize,
    pub states: usize,
}

/// Ingests every declaration of `stream` into `registry`.
pub fn ingest(stream: &DeclStream, registry: &mut Registry) -> anyhow::Result<IngestSummary> {
    let mut ingestor = Ingestor::new(registry);
    for decl in stream.iter() {
        ingestor.collect(&decl?);
    }
    for decl in stream.iter() {
        ingestor.ingest(decl?)?;
    }
    ingestor.finish()?;
    Ok(ingestor.summary())
}

// ---------------------------------------------------------------------------
// Binding requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ClassRequest {
    state: String,
    /// Lua-side scope, when given.
    scope: Option<String>,
}

#[derive(Debug, Clone)]
struct FunctionRequest {
    state: String,
    scope: String,
    /// The first name is primary, later ones are aliases.
    names: Vec<String>,
}

#[derive(Debug, Clone)]
struct EnumRequest {
    state: String,
    scope: Option<String>,
}

#[derive(Debug, Clone)]
struct MetamethodRequest {
    class: String,
    metamethod: String,
}

#[derive(Debug, Clone)]
struct RedirectorRequest {
    class: String,
    function: String,
    is_static: bool,
}

/// Everything pass 1 learns from comments, keyed by canonical qualified name.
#[derive(Debug, Default)]
struct Requests {
    classes: BTreeMap<String, ClassRequest>,
    free_functions: BTreeMap<String, FunctionRequest>,
    /// Keyed by the wrapper implementing the functions.
    custom_free_functions: BTreeMap<String, FunctionRequest>,
    enums: BTreeMap<String, EnumRequest>,
    /// Keyed by wrapper.
    metamethods: BTreeMap<String, MetamethodRequest>,
    /// Keyed by wrapper.
    redirectors: BTreeMap<String, RedirectorRequest>,
    /// `(class, base)` in request order.
    bases: Vec<(String, String)>,
}

impl Requests {
    fn collect(
        &mut self,
        annotations: &Annotations,
        template_classes: &mut BTreeMap<String, String>,
    ) -> Result<(), AttributeError> {
        let Some(state) = annotations.get("LuaStateTypes") else {
            return Ok(());
        };
        let state = state.param(0)?.to_string();

        if let Some(late) = annotations.get("LuaLate").filter(|a| a.num_params() >= 2) {
            let target = canonical(late.param(1)?);
            match late.param(0)? {
                "Class" => {
                    let scope = late.optional(2).map(normalize_scope);
                    self.classes.insert(target, ClassRequest { state, scope });
                }
                "FreeFunction" => {
                    let (scope, name) = split_qualified(&target);
                    let scope = match late.optional(2) {
                        Some(s) if s != "_" => normalize_scope(s),
                        _ => scope,
                    };
                    let alias = late.optional(3).map_or(name, str::to_string);
                    self.free_functions
                        .entry(target)
                        .or_insert_with(|| FunctionRequest {
                            state,
                            scope,
                            names: Vec::new(),
                        })
                        .names
                        .push(alias);
                }
                "CustomFreeFunction" => {
                    let wrapper = canonical(late.param(2)?);
                    let (scope, name) = split_qualified(&target);
                    let scope = late.optional(3).map_or(scope, normalize_scope);
                    self.custom_free_functions
                        .entry(wrapper)
                        .or_insert_with(|| FunctionRequest {
                            state,
                            scope,
                            names: Vec::new(),
                        })
                        .names
                        .push(name);
                }
                "Enum" => {
                    let scope = late.optional(2).map(normalize_scope);
                    self.enums.insert(target, EnumRequest { state, scope });
                }
                other => warn!(kind = other, target = %target, "unknown LuaLate request kind"),
            }
        } else if let Some(attr) = annotations.get("LuaAddMetamethod").filter(|a| a.num_params() >= 3) {
            self.metamethods.insert(
                canonical(attr.param(2)?),
                MetamethodRequest {
                    class: canonical(attr.param(0)?),
                    metamethod: attr.param(1)?.to_string(),
                },
            );
        } else if let Some(attr) = annotations.get("LuaMapTemplateClass").filter(|a| a.num_params() >= 2) {
            template_classes.insert(canonical(attr.param(0)?), canonical(attr.param(1)?));
        } else if let Some(attr) = annotations.get("LuaAddBaseToClass").filter(|a| a.num_params() >= 2) {
            self.bases
                .push((canonical(attr.param(0)?), canonical(attr.param(1)?)));
        } else {
            let (attr, is_static) = match annotations.get("LuaMemberFunctionRedirector") {
                Some(attr) => (Some(attr), false),
                None => (annotations.get("LuaStaticMemberFunctionRedirector"), true),
            };
            if let Some(attr) = attr.filter(|a| a.num_params() >= 3) {
                self.redirectors.insert(
                    canonical(attr.param(2)?),
                    RedirectorRequest {
                        class: canonical(attr.param(0)?),
                        function: attr.param(1)?.to_string(),
                        is_static,
                    },
                );
            }
        }
        Ok(())
    }

    fn is_redirected(&self, class: &str, function: &str) -> bool {
        self.redirectors
            .values()
            .any(|r| r.class == class && r.function == function)
    }
}

/// `A::B`, `::A::B` all become `::A::B`.
fn canonical(name: &str) -> String {
    let (scope, name) = split_qualified(name);
    format!("{scope}::{name}")
}

/// The state named by an inline `Lua(state)` annotation.
fn inline_state(comment: &str) -> Option<String> {
    if comment.is_empty() {
        return None;
    }
    Annotations::parse(comment)
        .get("Lua")
        .and_then(|attr| attr.optional(0))
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

/// A wrapper declaration waiting for its class to be attached to.
#[derive(Debug)]
struct Pending<R> {
    request: R,
    wrapper: String,
    source: String,
}

struct Ingestor<'r> {
    registry: &'r mut Registry,
    known: KnownNames,
    requests: Requests,
    /// The exposed class whose members are being ingested.
    current: Option<ClassId>,
    exposed: BTreeSet<ClassId>,
    redirectors: Vec<Pending<RedirectorRequest>>,
    metamethods: Vec<Pending<MetamethodRequest>>,
    states: BTreeSet<String>,
    skipped: usize,
}

impl<'r> Ingestor<'r> {
    fn new(registry: &'r mut Registry) -> Self {
        let includes: Vec<String> = registry
            .patches()
            .iter()
            .flat_map(|patch| patch.includes())
            .collect();
        registry.extra_includes.extend(includes);
        Self {
            registry,
            known: KnownNames::default(),
            requests: Requests::default(),
            current: None,
            exposed: BTreeSet::new(),
            redirectors: Vec::new(),
            metamethods: Vec::new(),
            states: BTreeSet::new(),
            skipped: 0,
        }
    }

    /// Pass 1.
    fn collect(&mut self, decl: &Decl) {
        match decl {
            Decl::Class(class) => self.known.add_class(&class.scope, &class.name),
            Decl::Enum(the_enum) => self.known.add_enum(&the_enum.scope, &the_enum.name),
            _ => {}
        }
        let comment = decl.comment();
        if comment.is_empty() {
            return;
        }
        let annotations = Annotations::parse(comment);
        if let Err(e) = self
            .requests
            .collect(&annotations, &mut self.registry.template_classes)
        {
            warn!(comment, error = %e, "ignoring malformed binding request");
        }
    }

    /// Pass 2.
    fn ingest(&mut self, decl: Decl) -> Result<(), AbortError> {
        match decl {
            Decl::Annotation(_) => Ok(()),
            Decl::Class(class) => self.ingest_class(&class),
            Decl::Function(function) if function.owner.is_some() => {
                self.ingest_member(&function);
                Ok(())
            }
            Decl::Function(function) => {
                self.ingest_free_function(&function);
                Ok(())
            }
            Decl::Enum(the_enum) => {
                self.ingest_enum(the_enum);
                Ok(())
            }
        }
    }

    fn ingest_class(&mut self, class: &ClassDecl) -> Result<(), AbortError> {
        let qualified = class.qualified();
        let request = self.requests.classes.get(&qualified).cloned();
        let state = request
            .as_ref()
            .map(|r| r.state.clone())
            .or_else(|| inline_state(&class.comment));

        self.current = None;
        let id = match state {
            Some(state) => {
                match self
                    .registry
                    .add_class(&class.name, &class.scope, &class.source, &state)
                {
                    Ok(id) => {
                        let scope_override = request
                            .and_then(|r| r.scope)
                            .filter(|scope| *scope != class.scope);
                        let exposed = self.registry.class_mut(id);
                        exposed.scope_override = scope_override;
                        exposed.has_parameterless_constructor |= class.default_constructor;
                        debug!(class = %qualified, state = %state, line = ?class.line, "exposing class");
                        self.states.insert(state);
                        self.exposed.insert(id);
                        self.current = Some(id);
                        id
                    }
                    Err(e) => {
                        let existing = match &e {
                            SkipError::DuplicateClass { existing, .. } => {
                                self.registry.class(*existing).source.clone()
                            }
                            _ => String::new(),
                        };
                        warn!(class = %qualified, source = %class.source, existing = %existing, "{e}, skipping");
                        self.skipped += 1;
                        return Ok(());
                    }
                }
            }
            None => {
                trace!(class = %qualified, "thin class");
                self.registry
                    .add_thin_class(&class.name, &class.scope, &class.source)
            }
        };

        for base in &class.bases {
            let (scope, name) = split_qualified(base);
            let base_id = self.registry.add_thin_class(&name, &scope, "");
            self.registry.add_base(id, base_id)?;
        }

        if !class.scope.is_empty() {
            let (outer_scope, outer_name) = split_qualified(&class.scope);
            if let Some(outer) = self.registry.class_id(&outer_scope, &outer_name) {
                let nested = &mut self.registry.class_mut(outer).nested;
                if !nested.contains(&id) {
                    nested.push(id);
                }
            }
        }
        Ok(())
    }

    fn ingest_member(&mut self, decl: &FunctionDecl) {
        let Some(id) = self.current else {
            trace!(function = %decl.qualified(), "member of an unexposed class");
            return;
        };
        if decl.is_constructor && decl.params.is_empty() {
            self.registry.class_mut(id).has_parameterless_constructor = true;
            return;
        }
        if is_operator_overload(&decl.name) {
            debug!(function = %decl.qualified(), "operator overloads are not bound");
            return;
        }
        if self.requests.is_redirected(&decl.scope, &decl.name) {
            debug!(function = %decl.qualified(), "redirected, no wrapper generated");
            return;
        }
        let Some((overload, return_type)) = self.convert_signature(decl) else {
            return;
        };

        let class = self.registry.class_mut(id);
        let shares_file = decl.source == class.source;
        let container = if decl.is_constructor {
            &mut class.constructors
        } else if decl.is_static {
            &mut class.static_functions
        } else {
            &mut class.functions
        };
        let function = container.entry(decl.name.clone()).or_insert_with(|| {
            let mut function = Function::new(&decl.name, &decl.scope, return_type.clone());
            function.owner = Some(id);
            function.is_static = decl.is_static || decl.is_constructor;
            function.is_constructor = decl.is_constructor;
            function.source = decl.source.clone();
            function.shares_file_with_class = shares_file;
            function
        });
        let types: Vec<Type> = overload.iter().map(|param| param.ty.clone()).collect();
        match function.add_overload(overload) {
            Ok(()) => self.register_signatures(&types, &return_type),
            Err(e) => debug!(function = %decl.qualified(), "{e}, skipping"),
        }
    }

    fn ingest_free_function(&mut self, decl: &FunctionDecl) {
        let qualified = decl.qualified();

        if let Some(request) = self.requests.metamethods.get(&qualified).cloned() {
            self.metamethods.push(Pending {
                request,
                wrapper: qualified,
                source: decl.source.clone(),
            });
            return;
        }
        if let Some(request) = self.requests.redirectors.get(&qualified).cloned() {
            self.redirectors.push(Pending {
                request,
                wrapper: qualified,
                source: decl.source.clone(),
            });
            return;
        }
        if let Some(request) = self.requests.custom_free_functions.get(&qualified).cloned() {
            self.add_custom_free_function(decl, &request);
            return;
        }
        if let Some(request) = self.requests.free_functions.get(&qualified).cloned() {
            self.add_free_function(decl, &request);
            return;
        }
        if let Some(state) = inline_state(&decl.comment) {
            let request = FunctionRequest {
                state,
                scope: decl.scope.clone(),
                names: vec![decl.name.clone()],
            };
            self.add_free_function(decl, &request);
            return;
        }
        trace!(function = %qualified, "no binding requested");
    }

    fn add_free_function(&mut self, decl: &FunctionDecl, request: &FunctionRequest) {
        let Some((overload, return_type)) = self.convert_signature(decl) else {
            return;
        };
        let types: Vec<Type> = overload.iter().map(|param| param.ty.clone()).collect();
        let mut added = false;
        for (i, lua_name) in request.names.iter().enumerate() {
            let key = format!("{}::{lua_name}", request.scope);
            let function = self.registry.functions.entry(key).or_insert_with(|| {
                let mut function = Function::new(&decl.name, &decl.scope, return_type.clone());
                function.lua_name = lua_name.clone();
                if request.scope != decl.scope {
                    function.scope_override = Some(request.scope.clone());
                }
                function.is_alias = i > 0;
                function.source = decl.source.clone();
                function.state = Some(request.state.clone());
                function
            });
            match function.add_overload(overload.clone()) {
                Ok(()) => added = true,
                Err(e) => debug!(function = %decl.qualified(), lua_name = %lua_name, "{e}, skipping"),
            }
        }
        if added {
            self.register_signatures(&types, &return_type);
            self.states.insert(request.state.clone());
        }
    }

    /// Functions implemented by an external wrapper: no signature is read.
    fn add_custom_free_function(&mut self, decl: &FunctionDecl, request: &FunctionRequest) {
        let wrapper = decl.qualified();
        for (i, name) in request.names.iter().enumerate() {
            let key = format!("{}::{name}", request.scope);
            self.registry.functions.entry(key).or_insert_with(|| {
                let mut function = Function::new(name, &request.scope, Type::void());
                function.wrapper_name = Some(wrapper.clone());
                function.is_alias = i > 0;
                function.source = decl.source.clone();
                function.state = Some(request.state.clone());
                function
            });
        }
        self.states.insert(request.state.clone());
    }

    fn ingest_enum(&mut self, decl: EnumDecl) {
        let qualified = decl.qualified();
        let (state, scope) = match self.requests.enums.get(&qualified) {
            Some(request) => (
                request.state.clone(),
                request.scope.clone().unwrap_or_else(|| decl.scope.clone()),
            ),
            None => match inline_state(&decl.comment) {
                Some(state) => (state, decl.scope.clone()),
                None => {
                    trace!(enum_name = %qualified, "no binding requested");
                    return;
                }
            },
        };
        let the_enum = Enum {
            name: decl.name,
            scope,
            state: state.clone(),
            values: decl.values.into_iter().map(|v| (v.key, v.value)).collect(),
        };
        match self.registry.add_enum(the_enum) {
            Ok(()) => {
                self.states.insert(state);
            }
            Err(e) => {
                warn!(enum_name = %qualified, source = %decl.source, "{e}, skipping");
                self.skipped += 1;
            }
        }
    }

    /// Converts every parameter and the return type, logging and counting the
    /// first failure.
    fn convert_signature(&mut self, decl: &FunctionDecl) -> Option<(Overload, Type)> {
        let converter = TypeConverter::new(&*self.registry, &self.known);
        let mut overload = Vec::with_capacity(decl.params.len());
        for param in &decl.params {
            match converter.convert(&param.ty, &decl.scope) {
                Ok(ty) => overload.push(Param {
                    name: param.name.clone(),
                    ty,
                }),
                Err(e) => {
                    warn!(function = %decl.qualified(), param = %param.name, reason = %e, "skipping function");
                    self.skipped += 1;
                    return None;
                }
            }
        }
        let return_type = match &decl.owner {
            Some((scope, name)) if decl.is_constructor => Type::opaque(scope.clone(), name.clone()),
            _ => match converter.convert(&decl.returns, &decl.scope) {
                Ok(ty) => ty,
                Err(e) => {
                    warn!(function = %decl.qualified(), param = "return", reason = %e, "skipping function");
                    self.skipped += 1;
                    return None;
                }
            },
        };
        Some((overload, return_type))
    }

    fn register_signatures(&mut self, params: &[Type], return_type: &Type) {
        for ty in params.iter().chain(std::iter::once(return_type)) {
            if let Err(e) = self.registry.register_signatures(ty) {
                warn!(error = %e, "function signature cannot be wrapped");
            }
        }
    }

    // ---------------------------------------------------------------------------
    // Finishing step
    // ---------------------------------------------------------------------------

    fn finish(&mut self) -> Result<(), AbortError> {
        for (class, base) in mem::take(&mut self.requests.bases) {
            let (scope, name) = split_qualified(&class);
            let Some(id) = self.registry.class_id(&scope, &name) else {
                warn!(class = %class, base = %base, "extra base for an undeclared class");
                continue;
            };
            let (base_scope, base_name) = split_qualified(&base);
            let base_id = self.registry.add_thin_class(&base_name, &base_scope, "");
            self.registry.add_base(id, base_id)?;
        }

        for pending in mem::take(&mut self.redirectors) {
            let Some(id) = self.exposed_class(&pending.request.class) else {
                warn!(class = %pending.request.class, wrapper = %pending.wrapper, "redirector for a class without bindings");
                continue;
            };
            let class = self.registry.class_mut(id);
            let mut function = Function::new(&pending.request.function, class.qualified(), Type::void());
            function.owner = Some(id);
            function.wrapper_name = Some(pending.wrapper);
            function.is_custom_redirector = true;
            function.is_static = pending.request.is_static;
            function.source = pending.source;
            function.shares_file_with_class = false;
            let container = if pending.request.is_static {
                &mut class.static_functions
            } else {
                &mut class.functions
            };
            container.insert(pending.request.function, function);
        }

        for pending in mem::take(&mut self.metamethods) {
            let metamethod = pending.request.metamethod;
            if !METAMETHOD_NAMES.contains(&metamethod.as_str()) {
                warn!(metamethod = %metamethod, wrapper = %pending.wrapper, "unknown metamethod");
                continue;
            }
            let Some(id) = self.exposed_class(&pending.request.class) else {
                warn!(class = %pending.request.class, wrapper = %pending.wrapper, "metamethod for a class without bindings");
                continue;
            };
            let class = self.registry.class_mut(id);
            let mut function = Function::new(&metamethod, class.qualified(), Type::void());
            function.owner = Some(id);
            function.wrapper_name = Some(pending.wrapper);
            function.is_custom_redirector = true;
            function.source = pending.source.clone();
            class.metamethods.insert(metamethod, function);
            if !pending.source.is_empty() {
                self.registry.extra_includes.insert(pending.source);
            }
        }

        self.drop_unresolved();
        self.registry.states.extend(mem::take(&mut self.states));
        Ok(())
    }

    fn exposed_class(&self, qualified: &str) -> Option<ClassId> {
        let (scope, name) = split_qualified(qualified);
        self.registry
            .class_id(&scope, &name)
            .filter(|id| self.exposed.contains(id))
    }

    /// Removes functions whose types name undeclared classes, records the
    /// headers of classes reached through patched types, and registers thin
    /// classes for forward declarations that are only ever retrieved.
    fn drop_unresolved(&mut self) {
        let mut reached = Reached::default();
        let registry = &*self.registry;

        let free = unresolved(registry, &registry.functions, &mut reached);
        let members: Vec<(ClassId, [Vec<String>; 3])> = registry
            .classes()
            .filter(|class| class.is_exposed())
            .map(|class| {
                let dropped = [&class.functions, &class.static_functions, &class.constructors]
                    .map(|container| unresolved(registry, container, &mut reached));
                (class.id, dropped)
            })
            .collect();

        self.skipped += free.len();
        for key in free {
            self.registry.functions.remove(&key);
        }
        for (id, dropped) in members {
            let class = self.registry.class_mut(id);
            let containers = [
                &mut class.functions,
                &mut class.static_functions,
                &mut class.constructors,
            ];
            for (container, names) in containers.into_iter().zip(dropped) {
                self.skipped += names.len();
                for name in names {
                    container.remove(&name);
                }
            }
        }

        for (scope, name) in reached.forward {
            debug!(class = %format!("{scope}::{name}"), "thin class for forward declaration");
            self.registry.add_thin_class(&name, &scope, "");
        }
        reached.includes.remove("");
        self.registry.extra_includes.extend(reached.includes);
    }

    fn summary(&self) -> IngestSummary {
        let classes = self.exposed.len();
        let members: usize = self
            .registry
            .exposed_classes()
            .map(|class| class.functions.len() + class.static_functions.len())
            .sum();
        IngestSummary {
            classes,
            thin_classes: self.registry.classes().count() - classes,
            functions: self.registry.functions.len() + members,
            enums: self.registry.enums().count(),
            skipped: self.skipped,
            states: self.registry.states.len(),
        }
    }
}

/// What the type walk found besides failures.
#[derive(Debug, Default)]
struct Reached {
    /// Headers of classes nested inside patched types.
    includes: BTreeSet<String>,
    /// `(scope, name)` of undeclared, forward-declared classes.
    forward: BTreeSet<(String, String)>,
}

/// Keys of the generated functions in `container` that cannot be emitted.
fn unresolved(registry: &Registry, container: &FunctionContainer, reached: &mut Reached) -> Vec<String> {
    container
        .iter()
        .filter(|(_, function)| function.wrapper_name.is_none())
        .filter_map(|(key, function)| {
            let resolved = callgen::param_types(function)
                .try_for_each(|ty| check_type(registry, ty, true, false, reached))
                .and_then(|()| check_type(registry, &function.return_type, false, false, reached));
            match resolved {
                Ok(()) => None,
                Err(e) => {
                    warn!(function = %format!("{}::{}", function.scope, function.name), reason = %e, "dropping function");
                    Some(key.clone())
                }
            }
        })
        .collect()
}

/// Forward-declared classes are accepted where a value is only retrieved.
fn check_type(
    registry: &Registry,
    ty: &Type,
    retrieved: bool,
    in_patch: bool,
    reached: &mut Reached,
) -> Result<(), SkipError> {
    match &ty.kind {
        TypeKind::OpaqueStruct(opaque) => match registry.find_class(&opaque.scope, &opaque.name) {
            Some(class) => {
                if in_patch {
                    reached.includes.insert(class.source.clone());
                }
                Ok(())
            }
            None if retrieved && opaque.forward_declaration.is_some() => {
                reached
                    .forward
                    .insert((opaque.scope.clone(), opaque.name.clone()));
                Ok(())
            }
            None => Err(SkipError::UnknownClass(opaque.qualified())),
        },
        TypeKind::FunctionSignature(sig) => {
            for param in &sig.params {
                check_type(registry, param, false, in_patch, reached)?;
            }
            check_type(registry, &sig.return_type, false, in_patch, reached)
        }
        TypeKind::Patch(patched) => {
            for inner in patched.inner_types() {
                check_type(registry, inner, retrieved, true, reached)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
