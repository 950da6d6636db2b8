use anyhow::{Context, bail};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, env, fs, path::Path, path::PathBuf};

use crate::checkpoint::CheckpointPolicy;
use crate::domain::DecompositionStrategy;
use crate::time::{SECONDS_PER_DAY, TimeRecord, build_time_records};

/// Immutable run configuration, identical on every worker after broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalParameters {
    pub run: RunSection,
    pub domain: DomainSection,
    pub state: StateSection,
    #[serde(default)]
    pub forcing: ForcingSection,
    #[serde(default)]
    pub parameters: ParameterSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    pub start: NaiveDateTime,
    pub step_seconds: u32,
    pub nrecs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSection {
    pub nx: usize,
    pub ny: usize,
    /// Explicit list of active spatial indices; all cells when absent.
    #[serde(default)]
    pub active: Option<Vec<usize>>,
    /// Spatial indices masked out of the simulation.
    #[serde(default)]
    pub inactive: Vec<usize>,
    #[serde(default)]
    pub decomposition: DecompositionStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVariable {
    pub name: String,
    #[serde(default)]
    pub default: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSection {
    pub variables: Vec<StateVariable>,
    /// Checkpoint manifest to restart from; cold start when absent.
    #[serde(default)]
    pub init_path: Option<PathBuf>,
    #[serde(default)]
    pub checkpoint: CheckpointPolicy,
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_state_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcingSection {
    #[serde(default = "default_forcing_variables")]
    pub variables: Vec<String>,
    /// Last instant covered by forcing data. Unbounded when absent.
    #[serde(default)]
    pub available_until: Option<NaiveDateTime>,
}

impl Default for ForcingSection {
    fn default() -> Self {
        Self {
            variables: default_forcing_variables(),
            available_until: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSection {
    /// Per-cell parameter file. Model defaults apply when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSection {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            streams: Vec::new(),
        }
    }
}

/// One history stream: a set of variables flushed on its own cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub frequency: OutputFrequency,
    pub variables: Vec<OutputVariable>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputFrequency {
    Steps { every: usize },
    Days { every: u32 },
    Months { every: u32 },
    Years { every: u32 },
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputVariable {
    pub name: String,
    #[serde(default)]
    pub aggregation: Aggregation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Avg,
    Sum,
    Min,
    Max,
    Beg,
    End,
}

/// Routing extension toggles. `run` and `write` are independent phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub run: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub outlet_path: Option<PathBuf>,
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_state_prefix() -> String {
    "state".to_string()
}

fn default_forcing_variables() -> Vec<String> {
    vec!["prec".to_string(), "temp".to_string()]
}

impl GlobalParameters {
    /// Read, expand and validate a JSON configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading global parameters from {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let params: GlobalParameters = serde_json::from_str(&expand_env_vars(raw))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.run.nrecs == 0 {
            bail!("run.nrecs must be at least 1");
        }
        if self.run.step_seconds == 0 || SECONDS_PER_DAY % self.run.step_seconds != 0 {
            bail!(
                "run.step_seconds ({}) must evenly divide one day",
                self.run.step_seconds
            );
        }
        if self.domain.nx == 0 || self.domain.ny == 0 {
            bail!("domain must have nonzero nx and ny");
        }
        if self.state.variables.is_empty() {
            bail!("state.variables must list at least one variable");
        }

        let mut names = BTreeSet::new();
        for var in &self.state.variables {
            if !names.insert(var.name.as_str()) {
                bail!("duplicate state variable `{}`", var.name);
            }
        }

        self.state.checkpoint.validate()?;

        let mut streams = BTreeSet::new();
        for stream in &self.output.streams {
            if !streams.insert(stream.name.as_str()) {
                bail!("duplicate output stream `{}`", stream.name);
            }
            match stream.frequency {
                OutputFrequency::Steps { every: 0 }
                | OutputFrequency::Days { every: 0 }
                | OutputFrequency::Months { every: 0 }
                | OutputFrequency::Years { every: 0 } => {
                    bail!("output stream `{}` has a zero frequency", stream.name)
                }
                _ => {}
            }
            for var in &stream.variables {
                if !names.contains(var.name.as_str()) {
                    bail!(
                        "output stream `{}` references unknown state variable `{}`",
                        stream.name,
                        var.name
                    );
                }
            }
        }

        if self.routing.enabled && self.routing.write && self.routing.outlet_path.is_none() {
            bail!("routing.write requires routing.outlet_path");
        }

        Ok(())
    }

    pub fn nrecs(&self) -> usize {
        self.run.nrecs
    }

    pub fn time_records(&self) -> Vec<TimeRecord> {
        build_time_records(self.run.start, self.run.step_seconds, self.run.nrecs)
    }

    pub fn state_variable_names(&self) -> Vec<String> {
        self.state.variables.iter().map(|v| v.name.clone()).collect()
    }
}

/// Pick the configuration file: explicit path, `GRIDRUN_CONFIG`, then `./gridrun.json`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p);
    }

    if let Ok(p) = env::var("GRIDRUN_CONFIG") {
        return Ok(PathBuf::from(p));
    }

    let candidate = PathBuf::from("gridrun.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find gridrun.json (pass --config, set GRIDRUN_CONFIG or create ./gridrun.json)"
    ))
}

/// Replace `${NAME}` with the environment value; unknown names are left as-is.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_json() -> String {
        r#"{
            "run": { "start": "2000-01-01T00:00:00", "step_seconds": 21600, "nrecs": 8 },
            "domain": { "nx": 4, "ny": 3, "inactive": [5] },
            "state": {
                "variables": [
                    { "name": "storage", "default": 10.0 },
                    { "name": "runoff" }
                ],
                "checkpoint": { "kind": "interval", "every": 4 }
            },
            "output": {
                "streams": [
                    {
                        "name": "daily",
                        "frequency": { "kind": "days", "every": 1 },
                        "variables": [ { "name": "runoff", "aggregation": "sum" } ]
                    }
                ]
            }
        }"#
        .to_string()
    }

    pub(crate) fn sample() -> GlobalParameters {
        GlobalParameters::from_json(&sample_json()).unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let params = sample();
        assert_eq!(params.nrecs(), 8);
        assert_eq!(params.state.prefix, "state");
        assert_eq!(params.forcing.variables, vec!["prec", "temp"]);
        assert!(!params.routing.enabled);
        assert_eq!(params.time_records().len(), 8);
    }

    #[test]
    fn test_rejects_step_not_dividing_day() {
        let raw = sample_json().replace("21600", "7000");
        let err = GlobalParameters::from_json(&raw).unwrap_err();
        assert!(err.to_string().contains("evenly divide"));
    }

    #[test]
    fn test_rejects_unknown_output_variable() {
        let raw = sample_json().replace(r#""name": "runoff", "aggregation""#, r#""name": "snow", "aggregation""#);
        let err = GlobalParameters::from_json(&raw).unwrap_err();
        assert!(err.to_string().contains("unknown state variable `snow`"));
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: test-local variable name, no other test reads it.
        unsafe { env::set_var("GRIDRUN_TEST_DIR", "/scratch/run1") };
        assert_eq!(expand_env_vars("${GRIDRUN_TEST_DIR}/out"), "/scratch/run1/out");
        assert_eq!(expand_env_vars("${GRIDRUN_UNSET_VAR}/x"), "${GRIDRUN_UNSET_VAR}/x");
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = resolve_config_path(Some(PathBuf::from("/tmp/a.json"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/a.json"));
    }
}
