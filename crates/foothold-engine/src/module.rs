//! The module contract: descriptor, argument schema and binding.
//!
//! A module is a static descriptor plus an async body. The engine validates
//! and binds arguments against the descriptor before the body ever runs, so a
//! module receives a [`BoundArgs`] whose values already have the declared
//! types.

use crate::context::ModuleContext;
use async_trait::async_trait;
use foothold_core::{Error, Fact, PlatformKind, Result, Schedule, Scope};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Raw keyword arguments as supplied by a caller.
pub type Args = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// Runs and returns a value.
    Base,
    /// Discovers facts; cached per its schedule.
    Enumerate,
    /// Changes the target persistently and can be removed later.
    Implant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    Str,
    Bool,
    Int,
    /// Comma-separated string or JSON array of strings.
    List,
    /// Collects every unrecognized keyword into one object.
    Remainder,
}

#[derive(Clone, Debug, Serialize)]
pub struct Argument {
    pub name: String,
    pub ty: ArgType,
    /// No default marks the argument required.
    pub default: Option<Value>,
    /// Allowed values, compared after coercion to string.
    pub choices: Vec<String>,
    pub help: String,
}

impl Argument {
    pub fn new(name: impl Into<String>, ty: ArgType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            choices: Vec::new(),
            help: String::new(),
        }
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none() && self.ty != ArgType::Remainder
    }
}

/// Static metadata of a module. Immutable once registered.
#[derive(Clone, Debug, Serialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub description: String,
    pub kind: ModuleKind,
    /// Compatible platforms; empty means any.
    pub platforms: Vec<PlatformKind>,
    pub arguments: Vec<Argument>,
    /// Fact types an enumeration module may emit.
    pub provides: Vec<String>,
    pub schedule: Schedule,
    pub scope: Scope,
    /// Present a single fact as a bare value instead of a list.
    pub collapse_result: bool,
    /// Accept keywords the schema does not declare.
    pub allow_kwargs: bool,
}

impl ModuleDescriptor {
    fn with_kind(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            platforms: Vec::new(),
            arguments: Vec::new(),
            provides: Vec::new(),
            schedule: Schedule::Once,
            scope: Scope::Host,
            collapse_result: false,
            allow_kwargs: false,
        }
    }

    pub fn base(name: impl Into<String>) -> Self {
        Self::with_kind(name, ModuleKind::Base)
    }

    pub fn enumerate(name: impl Into<String>) -> Self {
        Self::with_kind(name, ModuleKind::Enumerate)
    }

    pub fn implant(name: impl Into<String>) -> Self {
        Self::with_kind(name, ModuleKind::Implant)
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn platforms(mut self, platforms: &[PlatformKind]) -> Self {
        self.platforms = platforms.to_vec();
        self
    }

    pub fn argument(mut self, arg: Argument) -> Self {
        self.arguments.push(arg);
        self
    }

    pub fn provides<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn collapse_result(mut self) -> Self {
        self.collapse_result = true;
        self
    }

    pub fn allow_kwargs(mut self) -> Self {
        self.allow_kwargs = true;
        self
    }

    pub fn supports(&self, platform: PlatformKind) -> bool {
        self.platforms.is_empty() || self.platforms.contains(&platform)
    }

    pub fn is_enumeration(&self) -> bool {
        self.kind == ModuleKind::Enumerate
    }

    /// Bind caller arguments against the schema.
    pub fn bind(&self, mut raw: Args) -> Result<BoundArgs> {
        let mut values = BTreeMap::new();
        let mut remainder_name = None;

        for arg in &self.arguments {
            if arg.ty == ArgType::Remainder {
                remainder_name = Some(arg.name.clone());
                continue;
            }
            let value = match raw.remove(&arg.name) {
                Some(v) => coerce(&arg.name, arg.ty, v)?,
                None => match &arg.default {
                    Some(d) => d.clone(),
                    None => {
                        return Err(Error::MissingArgument {
                            module: self.name.clone(),
                            name: arg.name.clone(),
                        })
                    }
                },
            };
            if !arg.choices.is_empty() {
                let text = value_text(&value);
                if !arg.choices.iter().any(|c| c == &text) {
                    return Err(Error::invalid_argument(
                        &arg.name,
                        format!("{:?} is not one of: {}", text, arg.choices.join(", ")),
                    ));
                }
            }
            values.insert(arg.name.clone(), value);
        }

        match remainder_name {
            Some(name) => {
                values.insert(name, Value::Object(raw.into_iter().collect()));
            }
            None if self.allow_kwargs => values.extend(raw),
            None => {
                if let Some(unknown) = raw.keys().next() {
                    return Err(Error::invalid_argument(
                        unknown,
                        format!("{} takes no argument named {}", self.name, unknown),
                    ));
                }
            }
        }
        Ok(BoundArgs(values))
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce(name: &str, ty: ArgType, value: Value) -> Result<Value> {
    let bad = |v: &Value, expected: &str| Error::argument_format(name, expected, value_text(v));
    match ty {
        ArgType::Str => match value {
            Value::String(_) => Ok(value),
            Value::Number(_) | Value::Bool(_) => Ok(Value::String(value_text(&value))),
            other => Err(bad(&other, "string")),
        },
        ArgType::Bool => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(Value::Bool(false)),
                _ => Err(bad(&value, "boolean")),
            },
            _ => Err(bad(&value, "boolean")),
        },
        ArgType::Int => match &value {
            Value::Number(n) if n.is_i64() => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| bad(&value, "integer")),
            _ => Err(bad(&value, "integer")),
        },
        ArgType::List => match value {
            Value::Array(items) => Ok(Value::Array(
                items.iter().map(|v| Value::String(value_text(v))).collect(),
            )),
            Value::String(s) => Ok(Value::Array(
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| Value::String(p.to_string()))
                    .collect(),
            )),
            other => Err(bad(&other, "list")),
        },
        ArgType::Remainder => Ok(value),
    }
}

/// Arguments after binding. Getters return the declared type.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BoundArgs(BTreeMap<String, Value>);

impl BoundArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn bool(&self, name: &str) -> bool {
        self.0.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn list(&self, name: &str) -> Vec<String> {
        self.0
            .get(name)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

/// A unit of work the engine can invoke.
#[async_trait]
pub trait Module: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Module body. Facts, status and progress go through `ctx`; the return
    /// value becomes the run's final result.
    async fn run(&self, ctx: &ModuleContext, args: &BoundArgs) -> Result<Value>;

    /// Undo an implant that produced `fact`.
    async fn remove(&self, _ctx: &ModuleContext, _fact: &Fact) -> Result<()> {
        Err(Error::module_failed(self.name(), "not removable"))
    }
}

/// Build raw args from `key=value` words.
pub fn parse_kv_args<S: AsRef<str>>(words: &[S]) -> Result<Args> {
    let mut args = Args::new();
    for word in words {
        let word = word.as_ref();
        let Some((k, v)) = word.split_once('=') else {
            return Err(Error::invalid_argument(word, "expected key=value"));
        };
        args.insert(k.trim().to_string(), Value::String(v.to_string()));
    }
    Ok(args)
}
