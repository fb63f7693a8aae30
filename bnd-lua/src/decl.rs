//! Declaration files: the TOML stand-in for a parsed C++ header.
//!
//! ```toml
//! source = "gfx/texture.hpp"
//!
//! [[annotation]]
//! comment = "// CUSTOM_ATTRIBUTE[LuaStateTypes(Main) LuaLate(Class, ::Gfx::Texture)]"
//!
//! [[class]]
//! name = "Texture"
//! scope = "::Gfx"
//! bases = ["::Gfx::Resource"]
//!
//! [[class.method]]
//! name = "Resize"
//! params = [{ name = "width", type = "uint32_t" }, { name = "height", type = "uint32_t" }]
//! returns = "bool"
//! ```
//!
//! A [`DeclStream`] turns a list of such files into a flat, restartable
//! sequence of [`Decl`]s.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::model::normalize_scope;

#[derive(Debug, Error)]
pub enum DeclError {
    #[error("failed to read declaration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse declaration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeclFile {
    source: String,
    #[serde(default)]
    annotation: Vec<AnnotationDecl>,
    #[serde(default)]
    class: Vec<RawClass>,
    #[serde(default)]
    function: Vec<FunctionDecl>,
    #[serde(default, rename = "enum")]
    enums: Vec<EnumDecl>,
}

#[derive(Debug, Deserialize)]
struct AnnotationDecl {
    comment: String,
}

#[derive(Debug, Deserialize)]
struct RawClass {
    name: String,
    #[serde(default)]
    scope: String,
    source: Option<String>,
    line: Option<u32>,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    bases: Vec<String>,
    #[serde(default)]
    default_constructor: bool,
    #[serde(default, rename = "method")]
    methods: Vec<FunctionDecl>,
    #[serde(default, rename = "constructor")]
    constructors: Vec<RawConstructor>,
}

#[derive(Debug, Deserialize)]
struct RawConstructor {
    #[serde(default)]
    params: Vec<ParamDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// A free function, method or constructor.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    /// For methods and constructors this is the owning class's qualified name.
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    #[serde(default = "default_return")]
    pub returns: String,
    #[serde(default, rename = "static")]
    pub is_static: bool,
    #[serde(default)]
    pub comment: String,
    /// `(scope, name)` of the owning class.
    #[serde(skip)]
    pub owner: Option<(String, String)>,
    #[serde(skip)]
    pub is_constructor: bool,
    #[serde(skip)]
    pub source: String,
}

impl FunctionDecl {
    pub fn qualified(&self) -> String {
        format!("{}::{}", self.scope, self.name)
    }
}

fn default_return() -> String {
    "void".to_string()
}

#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: String,
    pub scope: String,
    pub source: String,
    pub line: Option<u32>,
    pub comment: String,
    /// Qualified base names in declaration order.
    pub bases: Vec<String>,
    pub default_constructor: bool,
}

impl ClassDecl {
    pub fn qualified(&self) -> String {
        format!("{}::{}", self.scope, self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnumValueDecl {
    pub key: String,
    pub value: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnumDecl {
    pub name: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub values: Vec<EnumValueDecl>,
    #[serde(skip)]
    pub source: String,
}

impl EnumDecl {
    pub fn qualified(&self) -> String {
        format!("{}::{}", self.scope, self.name)
    }
}

/// One item of the declaration stream.
#[derive(Debug, Clone)]
pub enum Decl {
    /// A comment not attached to any declaration.
    Annotation(String),
    Class(ClassDecl),
    Function(FunctionDecl),
    Enum(EnumDecl),
}

impl Decl {
    /// The comment attached to this declaration, if any.
    pub fn comment(&self) -> &str {
        match self {
            Decl::Annotation(comment) => comment,
            Decl::Class(class) => &class.comment,
            Decl::Function(function) => &function.comment,
            Decl::Enum(the_enum) => &the_enum.comment,
        }
    }
}

impl DeclFile {
    /// Flattens the file in stream order: annotations, each class followed
    /// by its constructors and methods, free functions, enums.
    fn into_decls(self) -> Vec<Decl> {
        let source = self.source;
        let mut decls: Vec<Decl> = self.annotation.into_iter().map(|a| Decl::Annotation(a.comment)).collect();

        for raw in self.class {
            let scope = normalize_scope(&raw.scope);
            let class_source = raw.source.unwrap_or_else(|| source.clone());
            let qualified = format!("{scope}::{}", raw.name);
            let owner = Some((scope.clone(), raw.name.clone()));
            decls.push(Decl::Class(ClassDecl {
                name: raw.name.clone(),
                scope,
                source: class_source.clone(),
                line: raw.line,
                comment: raw.comment,
                bases: raw.bases,
                default_constructor: raw.default_constructor,
            }));
            for ctor in raw.constructors {
                decls.push(Decl::Function(FunctionDecl {
                    name: raw.name.clone(),
                    scope: qualified.clone(),
                    params: ctor.params,
                    returns: default_return(),
                    is_static: true,
                    comment: String::new(),
                    owner: owner.clone(),
                    is_constructor: true,
                    source: class_source.clone(),
                }));
            }
            for mut method in raw.methods {
                method.scope = qualified.clone();
                method.owner = owner.clone();
                method.source = class_source.clone();
                decls.push(Decl::Function(method));
            }
        }

        for mut function in self.function {
            function.scope = normalize_scope(&function.scope);
            function.source = source.clone();
            decls.push(Decl::Function(function));
        }
        for mut the_enum in self.enums {
            the_enum.scope = normalize_scope(&the_enum.scope);
            the_enum.source = source.clone();
            decls.push(Decl::Enum(the_enum));
        }
        decls
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Unit {
    File(PathBuf),
    /// In-memory contents, named for error messages.
    Inline { name: PathBuf, contents: String },
}

impl Unit {
    fn load(&self) -> Result<Vec<Decl>, DeclError> {
        let (path, contents) = match self {
            Unit::File(path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| DeclError::Read {
                    path: path.clone(),
                    source,
                })?;
                (path, contents)
            }
            Unit::Inline { name, contents } => (name, contents.clone()),
        };
        let file: DeclFile = toml::from_str(&contents).map_err(|source| DeclError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok(file.into_decls())
    }
}

/// An ordered list of source units, each read only when iteration reaches
/// it. Iterating again starts over from the first unit.
#[derive(Debug, Clone, Default)]
pub struct DeclStream {
    units: Vec<Unit>,
}

impl DeclStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_file(&mut self, path: impl Into<PathBuf>) {
        self.units.push(Unit::File(path.into()));
    }

    pub fn push_inline(&mut self, name: impl AsRef<Path>, contents: impl Into<String>) {
        self.units.push(Unit::Inline {
            name: name.as_ref().to_path_buf(),
            contents: contents.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Decl, DeclError>> + '_ {
        self.units.iter().flat_map(|unit| match unit.load() {
            Ok(decls) => decls.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDGET: &str = r#"
source = "ui/widget.hpp"

[[annotation]]
comment = "// CUSTOM_ATTRIBUTE[LuaStateTypes(Main) LuaLate(Class, ::Ui::Widget)]"

[[class]]
name = "Widget"
scope = "Ui"
bases = ["::Ui::Node"]
default_constructor = true

[[class.constructor]]
params = [{ name = "id", type = "int" }]

[[class.method]]
name = "Show"

[[function]]
name = "Root"
scope = "::Ui"
returns = "Widget*"

[[enum]]
name = "Align"
scope = "::Ui"
values = [{ key = "Left", value = 0 }, { key = "Right", value = 1 }]
"#;

    fn kinds(stream: &DeclStream) -> Vec<String> {
        stream
            .iter()
            .map(|decl| match decl.unwrap() {
                Decl::Annotation(_) => "annotation".to_string(),
                Decl::Class(c) => format!("class {}", c.qualified()),
                Decl::Function(f) if f.is_constructor => format!("ctor {}", f.qualified()),
                Decl::Function(f) => format!("function {}", f.qualified()),
                Decl::Enum(e) => format!("enum {}", e.qualified()),
            })
            .collect()
    }

    #[test]
    fn declarations_come_out_in_file_order() {
        let mut stream = DeclStream::new();
        stream.push_inline("widget.toml", WIDGET);
        assert_eq!(
            kinds(&stream),
            [
                "annotation",
                "class ::Ui::Widget",
                "ctor ::Ui::Widget::Widget",
                "function ::Ui::Widget::Show",
                "function ::Ui::Root",
                "enum ::Ui::Align",
            ]
        );
    }

    #[test]
    fn members_carry_owner_and_source() {
        let mut stream = DeclStream::new();
        stream.push_inline("widget.toml", WIDGET);
        let show = stream
            .iter()
            .filter_map(Result::ok)
            .find_map(|decl| match decl {
                Decl::Function(f) if f.name == "Show" => Some(f),
                _ => None,
            })
            .unwrap();
        assert_eq!(show.owner, Some(("::Ui".to_string(), "Widget".to_string())));
        assert_eq!(show.source, "ui/widget.hpp");
        assert_eq!(show.returns, "void");
        assert!(!show.is_static);
    }

    #[test]
    fn stream_restarts_from_the_first_unit() {
        let mut stream = DeclStream::new();
        stream.push_inline("widget.toml", WIDGET);
        assert_eq!(stream.iter().count(), stream.iter().count());
    }

    #[test]
    fn bad_unit_is_an_error_after_earlier_units() {
        let mut stream = DeclStream::new();
        stream.push_inline("widget.toml", WIDGET);
        stream.push_inline("broken.toml", "source = ");
        let results: Vec<_> = stream.iter().collect();
        assert!(results[..6].iter().all(Result::is_ok));
        let err = results[6].as_ref().unwrap_err().to_string();
        assert!(err.starts_with("failed to parse declaration file broken.toml"), "{err}");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let mut stream = DeclStream::new();
        stream.push_file("/nonexistent/decls.toml");
        let err = stream.iter().next().unwrap().unwrap_err();
        assert!(matches!(err, DeclError::Read { .. }));
    }
}
