use std::path::{Path, PathBuf};

use config::Config;
use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::flattener::DEFAULT_MAX_DEPTH;

pub const ENV_PREFIX: &str = "JSON_FANOUT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Flatten in parallel and push every leaf through the dispatch queue
    #[default]
    Dispatch,
    /// Count leaf values
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input: Option<PathBuf>,
    pub mode: Mode,
    pub workers: usize,
    pub queue_name: String,
    pub queue_capacity: usize,
    pub max_depth: usize,
    /// Spread aggregate mode over `workers` threads; single-threaded when false
    pub parallel_aggregate: bool,
    /// File for dispatched records; stdout when unset
    pub output: Option<PathBuf>,
    /// Directory for daily rolling log files; stderr when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: None,
            mode: Mode::Dispatch,
            workers: 10,
            queue_name: "/json_fanout".to_string(),
            queue_capacity: 10,
            max_depth: DEFAULT_MAX_DEPTH,
            parallel_aggregate: false,
            output: None,
            log_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults, then the optional TOML file, then `JSON_FANOUT_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
        );

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Thread count for aggregate mode, `None` for the single-threaded path.
    pub fn aggregate_workers(&self) -> Option<usize> {
        self.parallel_aggregate.then_some(self.workers)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
