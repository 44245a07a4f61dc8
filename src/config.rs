use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use serde::Deserialize;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_EXTENSION: &str = "py";
const SCRATCH_DIR_NAME: &str = "scratch";
/// Per stream, per test
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "grader", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Number of concurrent grading workers, overrides the configuration file
    #[arg(long = "workers", short = 'j')]
    pub workers: Option<usize>,

    /// Whether to flush the existing result store
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Submission descriptor files (JSON) to grade
    #[arg(required = true)]
    pub submissions: Vec<PathBuf>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)?;

        if let Some(workers) = self.workers {
            config.grader.workers = workers;
        }
        config.validate()?;

        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub grader: GraderConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.grader.workers == 0 {
            bail!("The number of grading workers must not be 0");
        }
        let extension = &self.grader.extension;
        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            bail!("Invalid workspace file extension {extension:?}");
        }
        if self.grader.max_output_bytes == 0 {
            bail!("The output limit must not be 0");
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct GraderConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub scratch_dir: Option<PathBuf>,
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Treat a non-zero exit status as a runtime error even when stderr is empty
    #[serde(default)]
    pub strict_exit_code: bool,
    /// Bytes of stdout and of stderr kept per test; output past this is a wrong answer
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            scratch_dir: None,
            extension: default_extension(),
            strict_exit_code: false,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl GraderConfig {
    /// Returns the configured scratch directory, falling back to the user cache directory
    pub fn scratch_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.scratch_dir {
            return Ok(dir.clone());
        }

        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "grader")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;
        Ok(proj_dirs.cache_dir().join(SCRATCH_DIR_NAME))
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}
