//! Parser for the `CUSTOM_ATTRIBUTE[...]` comment annotations that decide
//! which declarations get bindings.
//!
//! ```text
//! // CUSTOM_ATTRIBUTE[LuaStateTypes(Main) LuaLate(Class, ::Gfx::Texture)]
//! ```

use std::collections::HashMap;

use thiserror::Error;

const TAG: &str = "CUSTOM_ATTRIBUTE[";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    #[error("attribute '{0}' is not present")]
    Missing(String),

    #[error("attribute '{attribute}' has no parameter {index}")]
    MissingParam { attribute: String, index: usize },
}

/// One `Name(p1, p2)` item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub params: Vec<String>,
}

impl Attribute {
    pub fn param(&self, index: usize) -> Result<&str, AttributeError> {
        self.params
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| AttributeError::MissingParam {
                attribute: self.name.clone(),
                index,
            })
    }

    /// The parameter at `index`, or `None` when absent or empty.
    pub fn optional(&self, index: usize) -> Option<&str> {
        self.params
            .get(index)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }
}

/// All attributes found in a single comment.
#[derive(Debug, Default, Clone)]
pub struct Annotations {
    attributes: HashMap<String, Attribute>,
}

impl Annotations {
    pub fn parse(comment: &str) -> Self {
        let mut annotations = Annotations::default();
        let Some(start) = comment.find(TAG) else {
            return annotations;
        };
        let rest = &comment[start + TAG.len()..];
        let Some(end) = rest.find(']') else {
            return annotations;
        };
        let body = &rest[..end];

        if !body.contains('(') {
            let name = body.trim();
            if !name.is_empty() {
                annotations.insert(Attribute {
                    name: name.to_string(),
                    params: Vec::new(),
                });
            }
            return annotations;
        }

        let mut chars = body.chars().peekable();
        loop {
            while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
            let name: String = chars.by_ref().take_while(|c| *c != '(').collect();
            let name = name.trim().to_string();
            if name.is_empty() {
                break;
            }

            let mut params = Vec::new();
            let mut param = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                match c {
                    ',' => params.push(std::mem::take(&mut param)),
                    ')' => {
                        params.push(std::mem::take(&mut param));
                        closed = true;
                        break;
                    }
                    ' ' => {}
                    _ => param.push(c),
                }
            }
            if !closed && !param.is_empty() {
                params.push(param);
            }
            annotations.insert(Attribute { name, params });
            if !closed {
                break;
            }
        }
        annotations
    }

    fn insert(&mut self, attribute: Attribute) {
        self.attributes
            .entry(attribute.name.clone())
            .or_insert(attribute);
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn attribute(&self, name: &str) -> Result<&Attribute, AttributeError> {
        self.get(name)
            .ok_or_else(|| AttributeError::Missing(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}
