//! The single store of classes, functions, enums and type patches for one
//! generation run.
//!
//! Classes live in an arena indexed by [`ClassId`]; bases and nested classes
//! refer to each other by id, so the registry is the only owner. A
//! `(scope, name)` pair resolves to at most one class.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{AbortError, SkipError};
use crate::model::{Class, ClassId, Enum, Function};
use crate::patch::TypePatch;
use crate::types::{FunctionSignature, Type};

#[derive(Debug, Default)]
pub struct Registry {
    classes: Vec<Class>,
    class_index: HashMap<String, ClassId>,
    enums: Vec<Enum>,
    enum_index: HashMap<String, usize>,
    patches: Vec<Box<dyn TypePatch>>,
    /// Free functions keyed by `scope::lua_name`.
    pub functions: BTreeMap<String, Function>,
    /// Every function signature used by a binding, keyed by wrapper name.
    pub function_protos: BTreeMap<String, FunctionSignature>,
    /// Binding targets seen during ingestion.
    pub states: BTreeSet<String>,
    /// Headers included by every state file on top of the declaring headers.
    pub extra_includes: BTreeSet<String>,
    /// Template redirections from `LuaMapTemplateClass`.
    pub template_classes: BTreeMap<String, String>,
}

fn class_key(scope: &str, name: &str) -> String {
    format!("{scope}::{name}")
}

impl Registry {
    pub fn new(patches: Vec<Box<dyn TypePatch>>) -> Self {
        Self {
            patches,
            ..Self::default()
        }
    }

    pub fn patches(&self) -> &[Box<dyn TypePatch>] {
        &self.patches
    }

    // ---------------------------------------------------------------------------
    // Classes
    // ---------------------------------------------------------------------------

    /// Registers an exposed class for `state`.
    ///
    /// A thin class of the same name is upgraded in place. Any other
    /// existing registration is left untouched and reported.
    pub fn add_class(
        &mut self,
        name: &str,
        scope: &str,
        source: &str,
        state: &str,
    ) -> Result<ClassId, SkipError> {
        if let Some(&existing) = self.class_index.get(&class_key(scope, name)) {
            let class = &mut self.classes[existing.0];
            if class.is_exposed() {
                return Err(SkipError::DuplicateClass {
                    name: class.qualified(),
                    existing,
                });
            }
            class.state = Some(state.to_string());
            if !source.is_empty() {
                class.source = source.to_string();
            }
            return Ok(existing);
        }
        let id = self.insert_class(name, scope, source);
        self.classes[id.0].state = Some(state.to_string());
        Ok(id)
    }

    /// Returns the class registered under `(scope, name)`, creating a thin
    /// one if none exists.
    pub fn add_thin_class(&mut self, name: &str, scope: &str, source: &str) -> ClassId {
        match self.class_index.get(&class_key(scope, name)) {
            Some(&existing) => existing,
            None => self.insert_class(name, scope, source),
        }
    }

    fn insert_class(&mut self, name: &str, scope: &str, source: &str) -> ClassId {
        let id = ClassId(self.classes.len());
        self.classes.push(Class::new(id, name, scope, source));
        self.class_index.insert(class_key(scope, name), id);
        id
    }

    pub fn class_id(&self, scope: &str, name: &str) -> Option<ClassId> {
        self.class_index.get(&class_key(scope, name)).copied()
    }

    pub fn find_class(&self, scope: &str, name: &str) -> Option<&Class> {
        self.class_id(scope, name).map(|id| &self.classes[id.0])
    }

    pub fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.0]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut Class {
        &mut self.classes[id.0]
    }

    /// All classes in registration order, thin ones included.
    pub fn classes(&self) -> impl Iterator<Item = &Class> {
        self.classes.iter()
    }

    pub fn exposed_classes(&self) -> impl Iterator<Item = &Class> {
        self.classes.iter().filter(|class| class.is_exposed())
    }

    // ---------------------------------------------------------------------------
    // Inheritance
    // ---------------------------------------------------------------------------

    /// Adds a direct base edge. Refuses edges that would make `derived` its
    /// own ancestor.
    pub fn add_base(&mut self, derived: ClassId, base: ClassId) -> Result<(), AbortError> {
        if derived == base || self.flattened_bases(base).contains(&derived) {
            return Err(AbortError::BaseCycle {
                derived: self.class(derived).qualified(),
                base: self.class(base).qualified(),
            });
        }
        let bases = &mut self.classes[derived.0].bases;
        if !bases.contains(&base) {
            bases.push(base);
        }
        Ok(())
    }

    /// Transitive bases, depth first in declaration order. A base reachable
    /// along several paths is listed once, at its first visit.
    pub fn flattened_bases(&self, id: ClassId) -> Vec<ClassId> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::from([id]);
        self.walk_bases(id, &mut seen, &mut out);
        out
    }

    fn walk_bases(&self, id: ClassId, seen: &mut BTreeSet<ClassId>, out: &mut Vec<ClassId>) {
        for &base in &self.classes[id.0].bases {
            if seen.insert(base) {
                out.push(base);
                self.walk_bases(base, seen, out);
            }
        }
    }

    /// Own metamethod first, then the first base (in flattened order) that
    /// defines it.
    pub fn find_metamethod(&self, id: ClassId, name: &str) -> Option<&Function> {
        if let Some(own) = self.class(id).metamethods.get(name) {
            return Some(own);
        }
        self.flattened_bases(id)
            .into_iter()
            .find_map(|base| self.class(base).metamethods.get(name))
    }

    /// Tags of `id` and every class that transitively derives from it.
    pub fn convertible_to(&self, id: ClassId) -> BTreeSet<String> {
        let mut tags = BTreeSet::from([self.class(id).tag()]);
        for class in &self.classes {
            if self.flattened_bases(class.id).contains(&id) {
                tags.insert(class.tag());
            }
        }
        tags
    }

    /// Exposed classes bound to `state`, plus every exposed base they reach,
    /// in registration order.
    pub fn classes_for_state(&self, state: &str) -> Vec<ClassId> {
        let mut ids = BTreeSet::new();
        for class in self.exposed_classes() {
            if class.state.as_deref() == Some(state) {
                ids.insert(class.id);
                for base in self.flattened_bases(class.id) {
                    if self.class(base).is_exposed() {
                        ids.insert(base);
                    }
                }
            }
        }
        ids.into_iter().collect()
    }

    // ---------------------------------------------------------------------------
    // Enums
    // ---------------------------------------------------------------------------

    pub fn add_enum(&mut self, the_enum: Enum) -> Result<(), SkipError> {
        let key = the_enum.qualified();
        if self.enum_index.contains_key(&key) {
            return Err(SkipError::DuplicateEnum(key));
        }
        self.enum_index.insert(key, self.enums.len());
        self.enums.push(the_enum);
        Ok(())
    }

    pub fn enums(&self) -> impl Iterator<Item = &Enum> {
        self.enums.iter()
    }

    pub fn has_enum(&self, qualified: &str) -> bool {
        self.enum_index.contains_key(qualified)
    }

    // ---------------------------------------------------------------------------
    // Function signatures
    // ---------------------------------------------------------------------------

    /// Records every function signature reachable from `ty`.
    pub fn register_signatures(&mut self, ty: &Type) -> Result<(), AbortError> {
        for sig in ty.signatures() {
            let key = sig.wrapper_name()?;
            self.function_protos.entry(key).or_insert_with(|| sig.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn metamethod(name: &str, wrapper: &str) -> Function {
        let mut f = Function::new(name, "", Type::void());
        f.wrapper_name = Some(wrapper.to_string());
        f.is_custom_redirector = true;
        f
    }

    #[test]
    fn duplicate_class_keeps_first_registration() {
        let mut registry = Registry::default();
        let first = registry.add_class("Foo", "::A", "a.hpp", "Main").unwrap();
        let err = registry
            .add_class("Foo", "::A", "b.hpp", "Other")
            .unwrap_err();
        assert_eq!(
            err,
            SkipError::DuplicateClass {
                name: "::A::Foo".into(),
                existing: first
            }
        );
        let class = registry.class(first);
        assert_eq!(class.source, "a.hpp");
        assert_eq!(class.state.as_deref(), Some("Main"));
    }

    #[test]
    fn thin_class_is_upgraded() {
        let mut registry = Registry::default();
        let thin = registry.add_thin_class("Base", "", "");
        assert!(!registry.class(thin).is_exposed());
        let exposed = registry.add_class("Base", "", "base.hpp", "Main").unwrap();
        assert_eq!(thin, exposed);
        assert_eq!(registry.class(exposed).source, "base.hpp");
    }

    #[test]
    fn base_cycle_is_rejected() {
        let mut registry = Registry::default();
        let a = registry.add_thin_class("A", "", "");
        let b = registry.add_thin_class("B", "", "");
        let c = registry.add_thin_class("C", "", "");
        registry.add_base(a, b).unwrap();
        registry.add_base(b, c).unwrap();
        assert!(matches!(
            registry.add_base(c, a),
            Err(AbortError::BaseCycle { .. })
        ));
        assert!(registry.add_base(a, a).is_err());
        assert_eq!(registry.flattened_bases(a), vec![b, c]);
    }

    #[test]
    fn diamond_visits_each_base_once_in_declaration_order() {
        let mut registry = Registry::default();
        let root = registry.add_thin_class("Root", "", "");
        let left = registry.add_thin_class("Left", "", "");
        let right = registry.add_thin_class("Right", "", "");
        let leaf = registry.add_thin_class("Leaf", "", "");
        registry.add_base(left, root).unwrap();
        registry.add_base(right, root).unwrap();
        registry.add_base(leaf, left).unwrap();
        registry.add_base(leaf, right).unwrap();
        assert_eq!(registry.flattened_bases(leaf), vec![left, root, right]);
    }

    #[test]
    fn metamethod_lookup_prefers_first_declared_base() {
        let mut registry = Registry::default();
        let left = registry.add_thin_class("Left", "", "");
        let right = registry.add_thin_class("Right", "", "");
        let leaf = registry.add_thin_class("Leaf", "", "");
        registry.add_base(leaf, left).unwrap();
        registry.add_base(leaf, right).unwrap();
        registry
            .class_mut(left)
            .metamethods
            .insert("__eq".into(), metamethod("__eq", "left_eq"));
        registry
            .class_mut(right)
            .metamethods
            .insert("__eq".into(), metamethod("__eq", "right_eq"));

        let found = registry.find_metamethod(leaf, "__eq").unwrap();
        assert_eq!(found.wrapper_name.as_deref(), Some("left_eq"));
        assert!(registry.find_metamethod(leaf, "__len").is_none());
    }

    #[test]
    fn convertible_set_includes_transitive_derived() {
        let mut registry = Registry::default();
        let base = registry.add_thin_class("Base", "::G", "");
        let mid = registry.add_thin_class("Mid", "::G", "");
        let leaf = registry.add_thin_class("Leaf", "", "");
        registry.add_base(mid, base).unwrap();
        registry.add_base(leaf, mid).unwrap();
        let tags: Vec<_> = registry.convertible_to(base).into_iter().collect();
        assert_eq!(tags, vec!["_Leaf", "__G_Base", "__G_Mid"]);
        assert_eq!(registry.convertible_to(leaf).len(), 1);
    }

    #[test]
    fn state_pulls_in_exposed_bases_only() {
        let mut registry = Registry::default();
        let thin = registry.add_thin_class("Thin", "", "");
        let other = registry.add_class("Shared", "", "s.hpp", "Other").unwrap();
        let main = registry.add_class("Widget", "", "w.hpp", "Main").unwrap();
        registry.add_base(main, thin).unwrap();
        registry.add_base(main, other).unwrap();
        assert_eq!(registry.classes_for_state("Main"), vec![other, main]);
        assert_eq!(registry.classes_for_state("Other"), vec![other]);
    }
}
