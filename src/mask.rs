//! Shape constraints for structured request and response bodies.
//!
//! A [`Mask`] is attached to a route and checked before the handler sees a
//! JSON body or a form, and after the handler fills a JSON response.
//!
//! Masks can be built in code or from a JSON template:
//!
//! ```rust
//! use trellis_web::Mask;
//! use serde_json::json;
//!
//! let mask = Mask::from_template(&json!({
//!     "name": "{string(>=1)(<=32)}",
//!     "age": "{none|number(>=0)}",
//!     "tags": "{string[<=8]}",
//!     "kind": "user",
//! }))
//! .unwrap();
//!
//! assert!(mask.validate(&json!({"name": "ann", "tags": ["a"], "kind": "user"})));
//! assert!(!mask.validate(&json!({"name": "", "tags": [], "kind": "user"})));
//! ```
//!
//! # Template syntax
//!
//! | Template                   | Meaning                                        |
//! |----------------------------|------------------------------------------------|
//! | `"text"`                   | exactly the string `text`                      |
//! | `"{string}"`               | any string                                     |
//! | `"{string(>=3)(<10)}"`     | string with 3 to 9 characters                  |
//! | `"{number(=5)}"`           | the number 5                                   |
//! | `"{bool}"`, `"{null}"`     | a boolean, null                                |
//! | `"{any}"`                  | anything                                       |
//! | `"{string[<=4]}"`          | array of at most 4 strings                     |
//! | `"{string\|null}"`         | alternation                                    |
//! | `"{none\|...}"`            | the key may be missing (object fields only)    |
//! | `{...}` / `[...]`          | nested object / array of alternatives          |

use crate::errors::ErrorKind;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Inclusive or exclusive limits on a size or a value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    lower: Option<(f64, bool)>,
    upper: Option<(f64, bool)>,
}

impl Bounds {
    pub const NONE: Bounds = Bounds {
        lower: None,
        upper: None,
    };

    /// `min <= x <= max`
    #[inline]
    pub const fn between(min: f64, max: f64) -> Self {
        Bounds {
            lower: Some((min, true)),
            upper: Some((max, true)),
        }
    }

    #[inline]
    pub const fn at_least(min: f64) -> Self {
        Bounds {
            lower: Some((min, true)),
            upper: None,
        }
    }

    #[inline]
    pub const fn at_most(max: f64) -> Self {
        Bounds {
            lower: None,
            upper: Some((max, true)),
        }
    }

    #[inline]
    pub fn contains(&self, x: f64) -> bool {
        let lower = match self.lower {
            Some((min, true)) => x >= min,
            Some((min, false)) => x > min,
            None => true,
        };
        let upper = match self.upper {
            Some((max, true)) => x <= max,
            Some((max, false)) => x < max,
            None => true,
        };
        lower && upper
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: String,
    pub mask: Mask,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mask {
    Any,
    Null,
    /// A boolean, optionally a fixed one
    Bool(Option<bool>),
    /// A number within bounds
    Number(Bounds),
    /// A string whose character count is within bounds
    String(Bounds),
    /// Exactly this value
    Exact(Value),
    /// An array of elements matching the mask, length within bounds
    Array(Box<Mask>, Bounds),
    /// An object with these keys and no others
    Object(Vec<Field>),
    /// The first alternative that matches wins
    OneOf(Vec<Mask>),
}

impl Mask {
    #[inline]
    pub fn string() -> Self {
        Mask::String(Bounds::NONE)
    }

    #[inline]
    pub fn number() -> Self {
        Mask::Number(Bounds::NONE)
    }

    #[inline]
    pub fn array(item: Mask) -> Self {
        Mask::Array(Box::new(item), Bounds::NONE)
    }

    /// An object mask where every listed key is required.
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Mask)>,
    {
        Mask::Object(
            fields
                .into_iter()
                .map(|(key, mask)| Field {
                    key: key.into(),
                    mask,
                    optional: false,
                })
                .collect(),
        )
    }

    /// Marks an object field as optional.
    ///
    /// Does nothing on other masks or when the key is unknown.
    pub fn optional(mut self, key: &str) -> Self {
        if let Mask::Object(fields) = &mut self {
            if let Some(field) = fields.iter_mut().find(|f| f.key == key) {
                field.optional = true;
            }
        }
        self
    }

    pub fn validate(&self, value: &Value) -> bool {
        match self {
            Mask::Any => true,
            Mask::Null => value.is_null(),
            Mask::Bool(expected) => match (value.as_bool(), expected) {
                (Some(got), Some(expected)) => got == *expected,
                (Some(_), None) => true,
                (None, _) => false,
            },
            Mask::Number(bounds) => value.as_f64().is_some_and(|x| bounds.contains(x)),
            Mask::String(bounds) => value
                .as_str()
                .is_some_and(|s| bounds.contains(s.chars().count() as f64)),
            Mask::Exact(expected) => value == expected,
            Mask::Array(item, bounds) => value.as_array().is_some_and(|items| {
                bounds.contains(items.len() as f64) && items.iter().all(|v| item.validate(v))
            }),
            Mask::Object(fields) => value
                .as_object()
                .is_some_and(|map| Self::validate_object(fields, map)),
            Mask::OneOf(variants) => variants.iter().any(|m| m.validate(value)),
        }
    }

    /// Checks decoded form fields, seen as an object of strings.
    pub fn validate_form(&self, form: &HashMap<String, String>) -> bool {
        let map: Map<String, Value> = form
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        self.validate(&Value::Object(map))
    }

    #[inline]
    fn validate_object(fields: &[Field], map: &Map<String, Value>) -> bool {
        if map.keys().any(|k| !fields.iter().any(|f| &f.key == k)) {
            return false;
        }

        fields.iter().all(|field| match map.get(&field.key) {
            Some(value) => field.mask.validate(value),
            None => field.optional,
        })
    }
}

// TEMPLATES

impl Mask {
    /// Builds a mask from a JSON template, see the [module docs](self).
    pub fn from_template(template: &Value) -> Result<Mask, ErrorKind> {
        Ok(Self::resolve(template)?.0)
    }

    // Returns the mask and whether `none` was listed
    fn resolve(template: &Value) -> Result<(Mask, bool), ErrorKind> {
        match template {
            Value::String(s) => match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(expr) if !expr.is_empty() => parse_expression(expr),
                _ => Ok((Mask::Exact(template.clone()), false)),
            },
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (key, value) in map {
                    let (mask, optional) = Self::resolve(value)?;
                    fields.push(Field {
                        key: key.clone(),
                        mask,
                        optional,
                    });
                }
                Ok((Mask::Object(fields), false))
            }
            Value::Array(items) => {
                let item = match items.len() {
                    0 => Mask::Any,
                    1 => Self::resolve(&items[0])?.0,
                    _ => Mask::OneOf(
                        items
                            .iter()
                            .map(|v| Self::resolve(v).map(|r| r.0))
                            .collect::<Result<_, _>>()?,
                    ),
                };
                Ok((Mask::array(item), false))
            }
            other => Ok((Mask::Exact(other.clone()), false)),
        }
    }
}

fn parse_expression(expr: &str) -> Result<(Mask, bool), ErrorKind> {
    let mut optional = false;
    let mut variants = Vec::new();

    for alternative in expr.split('|') {
        let alternative = alternative.trim();
        let name_end = alternative
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(alternative.len());
        let (name, mut rest) = alternative.split_at(name_end);

        let mut mask = match name {
            "none" => {
                optional = true;
                if !rest.trim().is_empty() {
                    return Err(template_error(expr));
                }
                continue;
            }
            "string" => Mask::String(Bounds::NONE),
            "number" | "numeric" | "decimal" | "bigint" => Mask::Number(Bounds::NONE),
            "bool" => Mask::Bool(None),
            "null" => Mask::Null,
            "any" => Mask::Any,
            _ => return Err(template_error(expr)),
        };

        loop {
            rest = rest.trim_start();
            let Some(open) = rest.chars().next() else {
                break;
            };

            let close = match open {
                '(' => ')',
                '[' => ']',
                _ => return Err(template_error(expr)),
            };
            let end = rest.find(close).ok_or_else(|| template_error(expr))?;
            let inner = rest[1..end].trim();
            rest = &rest[end + 1..];

            match open {
                '(' => apply_bound(&mut mask, inner).ok_or_else(|| template_error(expr))?,
                _ => {
                    let mut bounds = Bounds::NONE;
                    if !inner.is_empty() {
                        parse_bound(&mut bounds, inner).ok_or_else(|| template_error(expr))?;
                    }
                    mask = Mask::Array(Box::new(mask), bounds);
                }
            }
        }

        variants.push(mask);
    }

    let mask = match variants.len() {
        0 => Mask::Any,
        1 => variants.remove(0),
        _ => Mask::OneOf(variants),
    };

    Ok((mask, optional))
}

fn apply_bound(mask: &mut Mask, inner: &str) -> Option<()> {
    match mask {
        Mask::String(bounds) | Mask::Number(bounds) | Mask::Array(_, bounds) => {
            parse_bound(bounds, inner)
        }
        Mask::Bool(expected) => {
            let value = inner.trim_start_matches('=').trim();
            *expected = Some(value.parse::<f64>().ok()? != 0.0);
            Some(())
        }
        _ => None,
    }
}

fn parse_bound(bounds: &mut Bounds, inner: &str) -> Option<()> {
    let (op, number) = match inner.find(|c: char| c.is_ascii_digit() || c == '.' || c == '-') {
        Some(i) => inner.split_at(i),
        None => return None,
    };
    let value = number.trim().parse::<f64>().ok()?;

    match op.trim() {
        "" | "=" => {
            bounds.lower = Some((value, true));
            bounds.upper = Some((value, true));
        }
        ">=" => bounds.lower = Some((value, true)),
        ">" => bounds.lower = Some((value, false)),
        "<=" => bounds.upper = Some((value, true)),
        "<" => bounds.upper = Some((value, false)),
        _ => return None,
    }
    Some(())
}

#[inline]
fn template_error(expr: &str) -> ErrorKind {
    ErrorKind::Config(format!("cannot resolve mask expression `{{{expr}}}`"))
}
