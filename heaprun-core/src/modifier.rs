//! Command-line and environment transformations applied to benchmarks.
//!
//! A modifier is a small, composable edit to a benchmark invocation: extra
//! JVM arguments, classpath entries, environment variables, wrapper or
//! companion programs, and so on. Modifiers are declared by name in the
//! configuration and referenced from config strings, optionally carrying
//! `-opt` value options that are substituted into `{0}`, `{1}`, ...
//! placeholders at construction time.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::error::ModelError;
use crate::util::split_quoted;

/// Restricts a modifier to particular (suite, benchmark) pairs.
pub type Scope = BTreeMap<String, BTreeSet<String>>;

/// Raw configuration fields of a modifier, kept around so the modifier can
/// be re-instantiated with fresh value options.
#[derive(Debug, Clone, Deserialize)]
pub struct ModifierSpec {
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub val: Option<String>,
    #[serde(default)]
    pub var: Option<String>,
    #[serde(default)]
    pub includes: Option<Scope>,
    #[serde(default)]
    pub excludes: Option<Scope>,
}

/// The effect a modifier has when attached to a benchmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifierKind {
    /// Extra JVM arguments, inserted before the classpath.
    JvmArg { args: Vec<String> },
    /// Classpath entries appended after the benchmark's own entries.
    JvmClasspathAppend { entries: Vec<String> },
    /// Classpath entries inserted before the benchmark's own entries.
    JvmClasspathPrepend { entries: Vec<String> },
    /// Sets (or overwrites) one environment variable.
    EnvVar { var: String, val: String },
    /// Arguments appended to the benchmark program's own argument list.
    ProgramArg { args: Vec<String> },
    /// Argv prefix placed before the runtime executable.
    Wrapper { argv: Vec<String> },
    /// A program run alongside the benchmark (e.g. a profiler).
    Companion { argv: Vec<String> },
    /// Extra JavaScript engine arguments.
    JsArg { args: Vec<String> },
    /// Extra Julia runtime arguments.
    JuliaArg { args: Vec<String> },
    /// A `|`-joined list of other modifier references; must be flattened
    /// through the configuration before attachment.
    ModifierSet { members: Vec<String> },
}

impl ModifierKind {
    /// Short name used in log messages.
    pub fn label(&self) -> &'static str {
        match self {
            ModifierKind::JvmArg { .. } => "JVMArg",
            ModifierKind::JvmClasspathAppend { .. } => "JVMClasspathAppend",
            ModifierKind::JvmClasspathPrepend { .. } => "JVMClasspathPrepend",
            ModifierKind::EnvVar { .. } => "EnvVar",
            ModifierKind::ProgramArg { .. } => "ProgramArg",
            ModifierKind::Wrapper { .. } => "Wrapper",
            ModifierKind::Companion { .. } => "Companion",
            ModifierKind::JsArg { .. } => "JSArg",
            ModifierKind::JuliaArg { .. } => "JuliaArg",
            ModifierKind::ModifierSet { .. } => "ModifierSet",
        }
    }
}

/// A named, parameterized benchmark transformation.
#[derive(Debug, Clone)]
pub struct Modifier {
    name: String,
    kind: ModifierKind,
    includes: Option<Scope>,
    excludes: Scope,
    spec: ModifierSpec,
}

/// Fields of a spec after value-option templating, handed to the per-type
/// constructors.
struct ResolvedFields {
    val: Option<String>,
    var: Option<String>,
}

type KindCtor = fn(&str, &ResolvedFields) -> Result<ModifierKind, ModelError>;

/// Name-to-constructor table for all modifier types accepted in
/// configuration files. `JVMClasspath` is a backward-compatible alias of
/// `JVMClasspathAppend`.
static MODIFIER_TYPES: &[(&str, KindCtor)] = &[
    ("JVMArg", |n, f| {
        Ok(ModifierKind::JvmArg {
            args: split_quoted(require_val(n, f)?),
        })
    }),
    ("JVMClasspath", |n, f| {
        Ok(ModifierKind::JvmClasspathAppend {
            entries: split_quoted(require_val(n, f)?),
        })
    }),
    ("JVMClasspathAppend", |n, f| {
        Ok(ModifierKind::JvmClasspathAppend {
            entries: split_quoted(require_val(n, f)?),
        })
    }),
    ("JVMClasspathPrepend", |n, f| {
        Ok(ModifierKind::JvmClasspathPrepend {
            entries: split_quoted(require_val(n, f)?),
        })
    }),
    ("EnvVar", |n, f| {
        let var = f.var.clone().ok_or(ModelError::MissingField {
            family: "modifier",
            name: n.to_string(),
            field: "var",
        })?;
        Ok(ModifierKind::EnvVar {
            var,
            val: require_val(n, f)?.to_string(),
        })
    }),
    ("ProgramArg", |n, f| {
        Ok(ModifierKind::ProgramArg {
            args: split_quoted(require_val(n, f)?),
        })
    }),
    ("Wrapper", |n, f| {
        Ok(ModifierKind::Wrapper {
            argv: split_quoted(require_val(n, f)?),
        })
    }),
    ("Companion", |n, f| {
        Ok(ModifierKind::Companion {
            argv: split_quoted(require_val(n, f)?),
        })
    }),
    ("JSArg", |n, f| {
        Ok(ModifierKind::JsArg {
            args: split_quoted(require_val(n, f)?),
        })
    }),
    ("JuliaArg", |n, f| {
        Ok(ModifierKind::JuliaArg {
            args: split_quoted(require_val(n, f)?),
        })
    }),
    ("ModifierSet", |n, f| {
        Ok(ModifierKind::ModifierSet {
            members: require_val(n, f)?
                .split('|')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
        })
    }),
];

fn require_val<'a>(name: &str, fields: &'a ResolvedFields) -> Result<&'a str, ModelError> {
    fields.val.as_deref().ok_or(ModelError::MissingField {
        family: "modifier",
        name: name.to_string(),
        field: "val",
    })
}

/// Substitute `{0}`, `{1}`, ... placeholders with value options.
///
/// Returns `None` when the string references an option index that was not
/// supplied; the caller keeps the original string in that case, matching the
/// original tool's lenient templating.
fn template(s: &str, opts: &[String]) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if after[..close].chars().all(|c| c.is_ascii_digit()) && close > 0 => {
                let index: usize = after[..close].parse().ok()?;
                out.push_str(opts.get(index)?);
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Some(out)
}

impl Modifier {
    /// Instantiate a modifier from its configuration entry.
    pub fn from_spec(name: &str, value: &serde_yaml::Value) -> Result<Modifier, ModelError> {
        let spec: ModifierSpec = serde_yaml::from_value(value.clone())?;
        Modifier::build(name.to_string(), spec, &[])
    }

    fn build(name: String, spec: ModifierSpec, value_opts: &[String]) -> Result<Modifier, ModelError> {
        if name.contains('-') {
            return Err(ModelError::InvalidModifierName(name));
        }
        let ctor = MODIFIER_TYPES
            .iter()
            .find(|(tag, _)| *tag == spec.type_tag)
            .map(|(_, ctor)| *ctor)
            .ok_or_else(|| ModelError::UnknownType {
                family: "modifier",
                tag: spec.type_tag.clone(),
            })?;
        let fields = ResolvedFields {
            val: resolve_field(spec.val.as_deref(), value_opts),
            var: resolve_field(spec.var.as_deref(), value_opts),
        };
        let kind = ctor(&name, &fields)?;
        Ok(Modifier {
            name,
            kind,
            includes: spec.includes.clone(),
            excludes: spec.excludes.clone().unwrap_or_default(),
            spec,
        })
    }

    /// Rebuild this modifier from its raw spec with fresh value options.
    pub fn apply_value_opts(&self, value_opts: &[String]) -> Result<Modifier, ModelError> {
        Modifier::build(self.name.clone(), self.spec.clone(), value_opts)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ModifierKind {
        &self.kind
    }

    /// Whether this modifier applies to the given (suite, benchmark) pair.
    ///
    /// A pair listed in `excludes` is never attached, even when it is also
    /// listed in `includes`.
    pub fn should_attach(&self, suite_name: &str, bm_name: &str) -> bool {
        if let Some(bms) = self.excludes.get(suite_name) {
            if bms.contains(bm_name) {
                return false;
            }
        }
        match &self.includes {
            None => true,
            Some(includes) => includes
                .get(suite_name)
                .map(|bms| bms.contains(bm_name))
                .unwrap_or(false),
        }
    }

    /// Synthetic modifier used by runtimes to inject heap-size JVM arguments.
    pub fn jvm_arg(name: impl Into<String>, val: impl Into<String>) -> Modifier {
        Modifier::synthetic(name.into(), "JVMArg", val.into(), None)
    }

    /// Synthetic modifier used by runtimes to inject JS engine arguments.
    pub fn js_arg(name: impl Into<String>, val: impl Into<String>) -> Modifier {
        Modifier::synthetic(name.into(), "JSArg", val.into(), None)
    }

    /// Synthetic environment-variable modifier.
    pub fn env_var(
        name: impl Into<String>,
        var: impl Into<String>,
        val: impl Into<String>,
    ) -> Modifier {
        Modifier::synthetic(name.into(), "EnvVar", val.into(), Some(var.into()))
    }

    fn synthetic(name: String, tag: &str, val: String, var: Option<String>) -> Modifier {
        let spec = ModifierSpec {
            type_tag: tag.to_string(),
            val: Some(val),
            var,
            includes: None,
            excludes: None,
        };
        // The tag is one of ours and the required fields are present, so
        // build cannot fail; fall back to an inert ProgramArg if it ever does.
        Modifier::build(name.clone(), spec, &[]).unwrap_or(Modifier {
            name,
            kind: ModifierKind::ProgramArg { args: Vec::new() },
            includes: None,
            excludes: Scope::new(),
            spec: ModifierSpec {
                type_tag: "ProgramArg".to_string(),
                val: Some(String::new()),
                var: None,
                includes: None,
                excludes: None,
            },
        })
    }
}

fn resolve_field(raw: Option<&str>, opts: &[String]) -> Option<String> {
    let raw = raw?;
    if opts.is_empty() {
        return Some(raw.to_string());
    }
    Some(template(raw, opts).unwrap_or_else(|| raw.to_string()))
}

impl std::fmt::Display for Modifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Modifier {} {}", self.name, self.kind.label())
    }
}
