use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{
    de::{self, MapAccess, Visitor},
    Deserialize, Deserializer,
};
use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    path::Path,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
/// Value of a node parameter
pub enum ParamValue {
    /// A boolean flag
    Bool(bool),
    /// A signed integer
    Integer(i64),
    /// A floating point number
    Double(f64),
    /// A string
    String(String),
}

impl ParamValue {
    /// Name of the value type, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Integer(_) => "integer",
            ParamValue::Double(_) => "double",
            ParamValue::String(_) => "string",
        }
    }

    /// Convert `self` to the type of `declared`, if the two are compatible
    fn coerce_to(self, declared: &ParamValue) -> Option<ParamValue> {
        use ParamValue::*;
        match (declared, self) {
            (Bool(_), v @ Bool(_)) => Some(v),
            (Integer(_), v @ Integer(_)) => Some(v),
            (Integer(_), Double(d)) if d.fract() == 0.0 => Some(Integer(d as i64)),
            (Double(_), v @ Double(_)) => Some(v),
            (Double(_), Integer(i)) => Some(Double(i as f64)),
            (String(_), v @ String(_)) => Some(v),
            _ => None,
        }
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Integer(v) => write!(f, "{v}"),
            ParamValue::Double(v) => write!(f, "{v}"),
            ParamValue::String(v) => write!(f, "\"{v}\""),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Double(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.into())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

/// Types that can be read out of a [`ParamValue`]
pub trait FromParam: Sized {
    /// Name of the type, matching [`ParamValue::kind`]
    const KIND: &'static str;
    /// Extract the value, `None` on a type mismatch
    fn from_param(value: &ParamValue) -> Option<Self>;
}

impl FromParam for bool {
    const KIND: &'static str = "bool";
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParam for i64 {
    const KIND: &'static str = "integer";
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParam for f64 {
    const KIND: &'static str = "double";
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParam for String {
    const KIND: &'static str = "string";
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
/// Errors raised by the parameter store
pub enum ParamError {
    /// Name is not a dotted identifier
    #[error("Invalid parameter name \"{0}\"")]
    InvalidName(String),
    /// Parameter was never declared
    #[error("Parameter \"{0}\" has not been declared")]
    Undeclared(String),
    /// Parameter is declared twice
    #[error("Parameter \"{0}\" has already been declared")]
    AlreadyDeclared(String),
    /// Value does not match the declared type
    #[error("Parameter \"{name}\" is of type {expected}, got {found}")]
    TypeMismatch {
        /// Parameter name
        name: String,
        /// Declared type
        expected: &'static str,
        /// Type of the offending value
        found: &'static str,
    },
    /// Command line override without `:=`
    #[error("Invalid parameter override \"{0}\", expected name:=value")]
    InvalidOverride(String),
    /// Parameter file could not be read
    #[error("Failed to read parameter file: {0}")]
    Io(#[from] std::io::Error),
    /// Parameter file is not valid JSON5
    #[error("Failed to parse parameter file: {0}")]
    ParseError(String),
}

/// A parameter file entry: either a value or a nested table
enum ParamTree {
    Leaf(ParamValue),
    Table(Vec<(String, ParamTree)>),
}

impl<'de> Deserialize<'de> for ParamTree {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TreeVisitor)
    }
}

struct TreeVisitor;

impl<'de> Visitor<'de> for TreeVisitor {
    type Value = ParamTree;

    fn expecting(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("a parameter value or a table of parameters")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<ParamTree, E> {
        Ok(ParamTree::Leaf(ParamValue::Bool(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ParamTree, E> {
        Ok(ParamTree::Leaf(ParamValue::Integer(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ParamTree, E> {
        i64::try_from(v)
            .map(|v| ParamTree::Leaf(ParamValue::Integer(v)))
            .map_err(|_| E::custom("integer out of range"))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ParamTree, E> {
        Ok(ParamTree::Leaf(ParamValue::Double(v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ParamTree, E> {
        Ok(ParamTree::Leaf(ParamValue::String(v.into())))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<ParamTree, E> {
        Ok(ParamTree::Leaf(ParamValue::String(v)))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ParamTree, A::Error> {
        let mut entries = Vec::new();
        while let Some((key, value)) = map.next_entry::<String, ParamTree>()? {
            entries.push((key, value));
        }
        Ok(ParamTree::Table(entries))
    }
}

fn validate_name(name: &str) -> Result<(), ParamError> {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
            .expect("Failed to compile regex");
    }
    if RE.is_match(name) {
        Ok(())
    } else {
        Err(ParamError::InvalidName(name.into()))
    }
}

#[derive(Debug, Default, Clone)]
/// Declared node parameters plus overrides waiting for their declaration.
///
/// Values loaded from files or the command line before a parameter is
/// declared are held back and take the place of the default once the
/// parameter is declared.
pub struct ParamStore {
    params: BTreeMap<String, ParamValue>,
    overrides: BTreeMap<String, ParamValue>,
}

impl ParamStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter and return its effective value
    pub fn declare_parameter(
        &mut self,
        name: &str,
        default: impl Into<ParamValue>,
    ) -> Result<ParamValue, ParamError> {
        validate_name(name)?;
        if self.params.contains_key(name) {
            return Err(ParamError::AlreadyDeclared(name.into()));
        }
        let default = default.into();
        let value = match self.overrides.remove(name) {
            Some(value) => {
                let found = value.kind();
                value
                    .coerce_to(&default)
                    .ok_or_else(|| ParamError::TypeMismatch {
                        name: name.into(),
                        expected: default.kind(),
                        found,
                    })?
            }
            None => default,
        };
        debug!("Declared parameter {name} = {value}");
        self.params.insert(name.into(), value.clone());
        Ok(value)
    }

    /// Check whether a parameter has been declared
    pub fn has_parameter(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Read a declared parameter
    pub fn get_parameter<T: FromParam>(&self, name: &str) -> Result<T, ParamError> {
        let value = self
            .params
            .get(name)
            .ok_or_else(|| ParamError::Undeclared(name.into()))?;
        T::from_param(value).ok_or_else(|| ParamError::TypeMismatch {
            name: name.into(),
            expected: T::KIND,
            found: value.kind(),
        })
    }

    /// Change the value of a declared parameter
    pub fn set_parameter(
        &mut self,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<(), ParamError> {
        let current = self
            .params
            .get_mut(name)
            .ok_or_else(|| ParamError::Undeclared(name.into()))?;
        let value = value.into();
        let found = value.kind();
        *current = value
            .coerce_to(current)
            .ok_or_else(|| ParamError::TypeMismatch {
                name: name.into(),
                expected: current.kind(),
                found,
            })?;
        Ok(())
    }

    /// Set a declared parameter, or hold the value until it is declared
    pub fn set_or_hold(
        &mut self,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<(), ParamError> {
        validate_name(name)?;
        if self.params.contains_key(name) {
            self.set_parameter(name, value)
        } else {
            self.overrides.insert(name.into(), value.into());
            Ok(())
        }
    }

    /// Apply a `name:=value` override. The value is read as JSON5 and taken
    /// as a plain string when that fails.
    pub fn apply_override(&mut self, arg: &str) -> Result<(), ParamError> {
        let (name, value) = arg
            .split_once(":=")
            .ok_or_else(|| ParamError::InvalidOverride(arg.into()))?;
        let value = match json5::from_str::<ParamTree>(value) {
            Ok(ParamTree::Leaf(value)) => value,
            _ => ParamValue::String(value.into()),
        };
        self.set_or_hold(name.trim(), value)
    }

    /// Load parameters from a JSON5 file. Nested tables become dotted names.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ParamError> {
        let data = std::fs::read_to_string(path)?;
        self.load_str(&data)
    }

    /// Load parameters from a JSON5 document
    pub fn load_str(&mut self, data: &str) -> Result<(), ParamError> {
        let tree =
            json5::from_str::<ParamTree>(data).map_err(|e| ParamError::ParseError(e.to_string()))?;
        match tree {
            ParamTree::Table(entries) => self.load_table("", entries),
            ParamTree::Leaf(_) => Err(ParamError::ParseError(
                "expected a table of parameters".into(),
            )),
        }
    }

    fn load_table(
        &mut self,
        prefix: &str,
        entries: Vec<(String, ParamTree)>,
    ) -> Result<(), ParamError> {
        for (key, entry) in entries {
            let name = if prefix.is_empty() {
                key
            } else {
                format!("{prefix}.{key}")
            };
            match entry {
                ParamTree::Leaf(value) => self.set_or_hold(&name, value)?,
                ParamTree::Table(entries) => self.load_table(&name, entries)?,
            }
        }
        Ok(())
    }

    /// Names of held overrides that no declaration has picked up
    pub fn undeclared_overrides(&self) -> Vec<&str> {
        self.overrides.keys().map(String::as_str).collect()
    }
}
