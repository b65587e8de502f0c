//! Configuration loading, merging, and resolution.
//!
//! A configuration is a single YAML mapping. `includes` pulls in other
//! files (combined left-to-right, then the including document on top) and
//! `overrides` patches the combined result with dotted selectors; both keys
//! are consumed during loading and never survive into a loaded
//! [`Configuration`]. `resolve` instantiates the declared suites, modifiers,
//! and runtimes and replaces benchmark specs with concrete benchmarks.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use thiserror::Error;
use tracing::info;

use heaprun_core::modifier::ModifierKind;
use heaprun_core::util::expand_env;
use heaprun_core::{Benchmark, BenchmarkSpec, ModelError, Modifier, Runtime, Suite};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration not found at '{0}'")]
    NotFound(PathBuf),

    #[error("configuration at '{0}' is not a file")]
    NotAFile(PathBuf),

    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("configuration '{0}' is not a mapping")]
    NotAMapping(PathBuf),

    #[error("'overrides' without 'includes' in '{0}'")]
    OverridesWithoutIncludes(PathBuf),

    #[error(
        "key '{0}' is defined in more than one document and is neither \
         an array nor a dictionary; use overrides instead"
    )]
    CombineConflict(String),

    #[error("override selector '{selector}': {reason}")]
    BadSelector { selector: String, reason: String },

    #[error("section '{0}' is missing or malformed")]
    BadSection(&'static str),

    #[error("modifier '{0}' not defined")]
    UnknownModifier(String),

    #[error("runtime '{0}' not defined")]
    UnknownRuntime(String),

    #[error("suite '{0}' not defined")]
    UnknownSuite(String),

    #[error("modifier set '{0}' references itself, directly or indirectly")]
    ModifierSetCycle(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A loaded (but not yet resolved) configuration document.
#[derive(Debug, Clone)]
pub struct Configuration {
    items: serde_yaml::Mapping,
}

impl Configuration {
    /// Load `path` (resolved relative to `in_folder` unless absolute),
    /// processing `includes` and `overrides`.
    pub fn from_file(in_folder: &Path, path: &str) -> Result<Configuration, ConfigError> {
        let expanded = expand_env(path);
        let mut resolved = PathBuf::from(&expanded);
        if !resolved.is_absolute() {
            resolved = in_folder.join(&expanded);
        }
        info!("loading config {} from {}", path, resolved.display());
        if !resolved.exists() {
            return Err(ConfigError::NotFound(resolved));
        }
        if !resolved.is_file() {
            return Err(ConfigError::NotAFile(resolved));
        }
        let file = File::open(&resolved)?;
        let doc: Value = serde_yaml::from_reader(file).map_err(|source| ConfigError::Parse {
            path: resolved.clone(),
            source,
        })?;
        let Value::Mapping(mut mapping) = doc else {
            return Err(ConfigError::NotAMapping(resolved));
        };

        let includes = mapping.remove(Value::from("includes"));
        let overrides = mapping.remove(Value::from("overrides"));

        let Some(includes) = includes else {
            if overrides.is_some() {
                return Err(ConfigError::OverridesWithoutIncludes(resolved));
            }
            return Ok(Configuration { items: mapping });
        };

        let Value::Sequence(includes) = includes else {
            return Err(ConfigError::BadSection("includes"));
        };
        let parent = resolved.parent().unwrap_or(Path::new(".")).to_path_buf();
        let mut combined = Configuration {
            items: serde_yaml::Mapping::new(),
        };
        for inc in &includes {
            let Some(inc) = inc.as_str() else {
                return Err(ConfigError::BadSection("includes"));
            };
            combined = combined.combine(&Configuration::from_file(&parent, inc)?)?;
        }
        let mut combined = combined.combine(&Configuration { items: mapping })?;

        if let Some(overrides) = overrides {
            let Value::Mapping(overrides) = overrides else {
                return Err(ConfigError::BadSection("overrides"));
            };
            for (selector, new_value) in overrides {
                let Some(selector) = selector.as_str() else {
                    return Err(ConfigError::BadSection("overrides"));
                };
                combined.override_value(selector, new_value)?;
            }
        }
        Ok(combined)
    }

    /// Merge `other`'s top-level entries on top of this document.
    ///
    /// Arrays concatenate; dictionaries update one level deep; a scalar key
    /// present in both documents is a conflict.
    pub fn combine(&self, other: &Configuration) -> Result<Configuration, ConfigError> {
        let mut items = self.items.clone();
        for (key, value) in &other.items {
            match items.get_mut(key) {
                None => {
                    items.insert(key.clone(), value.clone());
                }
                Some(Value::Sequence(existing)) => match value {
                    Value::Sequence(incoming) => existing.extend(incoming.iter().cloned()),
                    _ => return Err(combine_conflict(key)),
                },
                Some(Value::Mapping(existing)) => match value {
                    Value::Mapping(incoming) => {
                        for (k, v) in incoming {
                            existing.insert(k.clone(), v.clone());
                        }
                    }
                    _ => return Err(combine_conflict(key)),
                },
                Some(_) => return Err(combine_conflict(key)),
            }
        }
        Ok(Configuration { items })
    }

    /// Apply one dotted-selector override. Numeric segments index into
    /// sequences, other segments into mappings; a mapping key named by the
    /// final segment is created if absent.
    pub fn override_value(&mut self, selector: &str, new_value: Value) -> Result<(), ConfigError> {
        let parts: Vec<&str> = selector.split('.').collect();
        if parts.len() == 1 {
            self.items.insert(Value::from(parts[0]), new_value);
            return Ok(());
        }
        let mut current = self
            .items
            .get_mut(Value::from(parts[0]))
            .ok_or_else(|| bad_selector(selector, parts[0]))?;
        for part in &parts[1..parts.len() - 1] {
            current = descend(current, part).ok_or_else(|| bad_selector(selector, part))?;
        }
        let last = parts[parts.len() - 1];
        match current {
            Value::Sequence(seq) if last.chars().all(|c| c.is_ascii_digit()) => {
                let index: usize = last
                    .parse()
                    .map_err(|_| bad_selector(selector, last))?;
                let slot = seq
                    .get_mut(index)
                    .ok_or_else(|| bad_selector(selector, last))?;
                *slot = new_value;
            }
            Value::Mapping(map) => {
                map.insert(Value::from(last), new_value);
            }
            _ => return Err(bad_selector(selector, last)),
        }
        Ok(())
    }

    /// Write the raw document back out, for run metadata.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let file = File::create(path)?;
        serde_yaml::to_writer(file, &self.items)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.items.get(Value::from(name))
    }

    /// Instantiate every declared suite, modifier, and runtime, then turn
    /// benchmark specs into concrete benchmarks.
    pub fn resolve(self) -> Result<ResolvedConfiguration, ConfigError> {
        let suites = resolve_section(&self.items, "suites", Suite::from_spec)?;
        let modifiers = resolve_section(&self.items, "modifiers", Modifier::from_spec)?;
        let runtimes = resolve_section(&self.items, "runtimes", Runtime::from_spec)?;

        let mut benchmarks: Vec<(String, Vec<Benchmark>)> = Vec::new();
        if let Some(section) = self.get("benchmarks") {
            let Value::Mapping(section) = section else {
                return Err(ConfigError::BadSection("benchmarks"));
            };
            for (suite_name, bm_specs) in section {
                let Some(suite_name) = suite_name.as_str() else {
                    return Err(ConfigError::BadSection("benchmarks"));
                };
                let suite = suites
                    .get(suite_name)
                    .ok_or_else(|| ConfigError::UnknownSuite(suite_name.to_string()))?;
                let specs: Vec<BenchmarkSpec> = serde_yaml::from_value(bm_specs.clone())?;
                let mut bms = Vec::with_capacity(specs.len());
                for spec in &specs {
                    bms.push(suite.get_benchmark(spec)?);
                }
                benchmarks.push((suite_name.to_string(), bms));
            }
        }

        Ok(ResolvedConfiguration {
            raw: self,
            suites,
            modifiers,
            runtimes,
            benchmarks,
        })
    }
}

fn combine_conflict(key: &Value) -> ConfigError {
    ConfigError::CombineConflict(key.as_str().unwrap_or("<non-string key>").to_string())
}

fn bad_selector(selector: &str, part: &str) -> ConfigError {
    ConfigError::BadSelector {
        selector: selector.to_string(),
        reason: format!("cannot descend into '{}'", part),
    }
}

fn descend<'a>(current: &'a mut Value, part: &str) -> Option<&'a mut Value> {
    match current {
        Value::Sequence(seq) if part.chars().all(|c| c.is_ascii_digit()) => {
            seq.get_mut(part.parse::<usize>().ok()?)
        }
        Value::Mapping(map) => map.get_mut(Value::from(part)),
        _ => None,
    }
}

fn resolve_section<T>(
    items: &serde_yaml::Mapping,
    section: &'static str,
    ctor: fn(&str, &Value) -> Result<T, ModelError>,
) -> Result<BTreeMap<String, T>, ConfigError> {
    let mut resolved = BTreeMap::new();
    let Some(value) = items.get(Value::from(section)) else {
        return Ok(resolved);
    };
    let Value::Mapping(entries) = value else {
        return Err(ConfigError::BadSection(section));
    };
    for (name, spec) in entries {
        let Some(name) = name.as_str() else {
            return Err(ConfigError::BadSection(section));
        };
        resolved.insert(name.to_string(), ctor(name, spec)?);
    }
    Ok(resolved)
}

/// A configuration with all class references resolved to instances.
pub struct ResolvedConfiguration {
    raw: Configuration,
    suites: BTreeMap<String, Suite>,
    modifiers: BTreeMap<String, Modifier>,
    runtimes: BTreeMap<String, Runtime>,
    /// Suite name plus its benchmarks, in document order.
    benchmarks: Vec<(String, Vec<Benchmark>)>,
}

impl ResolvedConfiguration {
    pub fn raw(&self) -> &Configuration {
        &self.raw
    }

    pub fn suite(&self, name: &str) -> Option<&Suite> {
        self.suites.get(name)
    }

    pub fn benchmarks(&self) -> &[(String, Vec<Benchmark>)] {
        &self.benchmarks
    }

    /// The ordered list of config strings (`runtime|mod|mod...`).
    pub fn configs(&self) -> Result<Vec<String>, ConfigError> {
        let Some(value) = self.raw.get("configs") else {
            return Err(ConfigError::BadSection("configs"));
        };
        let configs: Vec<String> = serde_yaml::from_value(value.clone())
            .map_err(|_| ConfigError::BadSection("configs"))?;
        Ok(configs)
    }

    pub fn invocations(&self) -> Option<u64> {
        self.raw.get("invocations").and_then(Value::as_u64)
    }

    pub fn heap_range(&self) -> Option<u64> {
        self.raw.get("heap_range").and_then(Value::as_u64)
    }

    pub fn spread_factor(&self) -> Option<u64> {
        self.raw.get("spread_factor").and_then(Value::as_u64)
    }

    pub fn minheap_multiplier(&self) -> Option<f64> {
        self.raw.get("minheap_multiplier").and_then(Value::as_f64)
    }

    pub fn maxheap(&self) -> Option<u64> {
        self.raw.get("maxheap").and_then(Value::as_u64)
    }

    pub fn attempts(&self) -> Option<u64> {
        self.raw.get("attempts").and_then(Value::as_u64)
    }

    pub fn remote_host(&self) -> Option<String> {
        self.raw
            .get("remote_host")
            .and_then(Value::as_str)
            .map(String::from)
    }

    pub fn plugins(&self) -> Option<&Value> {
        self.raw.get("plugins")
    }

    /// Parse `runtime|modSpec|modSpec...` into the runtime and the flattened
    /// modifier list.
    pub fn parse_config_str(&self, c: &str) -> Result<(&Runtime, Vec<Modifier>), ConfigError> {
        let mut segments = c.split('|');
        let runtime_name = segments.next().unwrap_or_default().trim();
        let runtime = self
            .runtimes
            .get(runtime_name)
            .ok_or_else(|| ConfigError::UnknownRuntime(runtime_name.to_string()))?;
        let mod_strs: Vec<&str> = segments.collect();
        Ok((runtime, self.parse_modifier_strs(&mod_strs)?))
    }

    /// Resolve modifier references of the form `name[-opt...]`, recursively
    /// flattening modifier sets. Empty segments are ignored.
    pub fn parse_modifier_strs(&self, mod_strs: &[&str]) -> Result<Vec<Modifier>, ConfigError> {
        let mut mods = Vec::new();
        let mut in_flight = BTreeSet::new();
        for m in mod_strs {
            self.parse_one_modifier(m.trim(), &mut mods, &mut in_flight)?;
        }
        Ok(mods)
    }

    fn parse_one_modifier(
        &self,
        mod_str: &str,
        out: &mut Vec<Modifier>,
        in_flight: &mut BTreeSet<String>,
    ) -> Result<(), ConfigError> {
        if mod_str.is_empty() {
            return Ok(());
        }
        let mut pieces = mod_str.split('-');
        let mod_name = pieces.next().unwrap_or_default();
        let value_opts: Vec<String> = pieces.map(String::from).collect();
        let modifier = self
            .modifiers
            .get(mod_name)
            .ok_or_else(|| ConfigError::UnknownModifier(mod_name.to_string()))?;
        let modifier = modifier.apply_value_opts(&value_opts)?;
        match modifier.kind() {
            ModifierKind::ModifierSet { members } => {
                // Guard against self-referential sets; the original tool
                // would recurse forever here.
                if !in_flight.insert(mod_name.to_string()) {
                    return Err(ConfigError::ModifierSetCycle(mod_name.to_string()));
                }
                for member in members.clone() {
                    self.parse_one_modifier(member.trim(), out, in_flight)?;
                }
                in_flight.remove(mod_name);
            }
            _ => out.push(modifier),
        }
        Ok(())
    }
}

/// Encode a config string for filenames: `|` separators become `.`.
pub fn config_str_encode(c: &str) -> String {
    c.split('|')
        .map(|x| x.trim())
        .collect::<Vec<_>>()
        .join(".")
}

/// Map a config index to a single progress glyph: 0-25 → a-z, 26-51 → A-Z.
pub fn config_index_to_chr(i: usize) -> Option<char> {
    match i {
        0..=25 => Some((b'a' + i as u8) as char),
        26..=51 => Some((b'A' + (i - 26) as u8) as char),
        _ => None,
    }
}
