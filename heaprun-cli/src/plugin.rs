//! Sweep lifecycle plugins.
//!
//! Plugins observe the sweep (run ids, progress, pass/fail per config) and
//! may inject side effects, but cannot alter control flow: every hook is
//! invoked unconditionally around the corresponding loop body.

use std::path::Path;

use heaprun_core::{Benchmark, ModelError};

/// Hooks around the runbms loops. All hooks default to no-ops so a plugin
/// implements only what it cares about.
#[allow(unused_variables)]
pub trait RunbmsPlugin {
    fn name(&self) -> &str;

    fn set_run_id(&mut self, run_id: &str) {}
    fn set_runbms_dir(&mut self, runbms_dir: &Path) {}
    fn set_log_dir(&mut self, log_dir: &Path) {}

    fn start_hfac(&mut self, hfac: Option<f64>) {}
    fn end_hfac(&mut self, hfac: Option<f64>) {}

    fn start_benchmark(&mut self, hfac: Option<f64>, size: Option<u64>, bm: &Benchmark) {}
    fn end_benchmark(&mut self, hfac: Option<f64>, size: Option<u64>, bm: &Benchmark) {}

    fn start_invocation(&mut self, hfac: Option<f64>, size: Option<u64>, bm: &Benchmark, i: u64) {}
    fn end_invocation(&mut self, hfac: Option<f64>, size: Option<u64>, bm: &Benchmark, i: u64) {}

    fn start_config(
        &mut self,
        hfac: Option<f64>,
        size: Option<u64>,
        bm: &Benchmark,
        i: u64,
        config: &str,
        j: usize,
    ) {
    }

    fn end_config(
        &mut self,
        hfac: Option<f64>,
        size: Option<u64>,
        bm: &Benchmark,
        i: u64,
        config: &str,
        j: usize,
        passed: bool,
    ) {
    }
}

type PluginCtor = fn(&str, &serde_yaml::Value) -> Result<Box<dyn RunbmsPlugin>, ModelError>;

/// Name-to-constructor table for plugin types. No plugin types ship with
/// the tool itself, so anything configured here is an unknown type.
static PLUGIN_TYPES: &[(&str, PluginCtor)] = &[];

/// Instantiate a plugin from its configuration entry.
pub fn plugin_from_spec(
    name: &str,
    value: &serde_yaml::Value,
) -> Result<Box<dyn RunbmsPlugin>, ModelError> {
    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ModelError::MissingField {
            family: "plugin",
            name: name.to_string(),
            field: "type",
        })?;
    let ctor = PLUGIN_TYPES
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, ctor)| *ctor)
        .ok_or_else(|| ModelError::UnknownType {
            family: "plugin",
            tag: tag.to_string(),
        })?;
    ctor(name, value)
}

/// Instantiate every entry of a `plugins` section and hand each the run
/// context.
pub fn load_plugins(
    section: Option<&serde_yaml::Value>,
    run_id: &str,
    runbms_dir: &Path,
    log_dir: &Path,
) -> Result<Vec<Box<dyn RunbmsPlugin>>, ModelError> {
    let mut plugins = Vec::new();
    let Some(section) = section else {
        return Ok(plugins);
    };
    let Some(entries) = section.as_mapping() else {
        return Err(ModelError::BadField {
            family: "plugin",
            name: "plugins".to_string(),
            reason: "plugins must be a dictionary".to_string(),
        });
    };
    for (name, spec) in entries {
        let name = name.as_str().unwrap_or_default();
        let mut plugin = plugin_from_spec(name, spec)?;
        plugin.set_run_id(run_id);
        plugin.set_runbms_dir(runbms_dir);
        plugin.set_log_dir(log_dir);
        plugins.push(plugin);
    }
    Ok(plugins)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plugin_type_is_fatal() {
        let value: serde_yaml::Value =
            serde_yaml::from_str("{type: Zulip, stream: benchmarks}").unwrap();
        assert!(matches!(
            plugin_from_spec("notify", &value),
            Err(ModelError::UnknownType { .. })
        ));
    }

    #[test]
    fn missing_section_loads_no_plugins() {
        let plugins =
            load_plugins(None, "run", Path::new("/tmp"), Path::new("/tmp")).unwrap();
        assert!(plugins.is_empty());
    }

    #[test]
    fn default_hooks_are_noops() {
        struct Recorder {
            hfacs: Vec<Option<f64>>,
        }
        impl RunbmsPlugin for Recorder {
            fn name(&self) -> &str {
                "recorder"
            }
            fn start_hfac(&mut self, hfac: Option<f64>) {
                self.hfacs.push(hfac);
            }
        }
        let mut p = Recorder { hfacs: Vec::new() };
        p.set_run_id("run");
        p.start_hfac(Some(1.5));
        p.end_hfac(Some(1.5));
        assert_eq!(p.hfacs, vec![Some(1.5)]);
    }
}
