use crate::augment::AugmentConfig;
use crate::classifier::ClassifierConfig;
use crate::dataset::{DEFAULT_SPLIT_SEED, DEFAULT_TEST_FRACTION};
use crate::embedding::DEFAULT_EMBEDDINGS_OUTPUT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_YAMNET_THREADS: usize = 1;
pub const ENV_CORPUS_DIR: &str = "SER_CORPUS_DIR";
pub const ENV_YAMNET_MODEL: &str = "SER_YAMNET_MODEL";
pub const ENV_YAMNET_THREADS: &str = "SER_YAMNET_THREADS";
pub const ENV_YAMNET_OUTPUT: &str = "SER_YAMNET_OUTPUT";

/// Root of a labelled audio corpus.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorpusDir(PathBuf);

impl CorpusDir {
    pub fn new<P: Into<PathBuf>>(value: P) -> Result<Self, ConfigError> {
        let p = value.into();
        if p.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCorpusDir);
        }
        Ok(Self(p))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelPath(PathBuf);

impl ModelPath {
    pub fn new<P: Into<PathBuf>>(value: P) -> Result<Self, ConfigError> {
        let p = value.into();
        if p.as_os_str().is_empty() {
            return Err(ConfigError::EmptyModelPath);
        }
        Ok(Self(p))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadCount(usize);

impl ThreadCount {
    pub fn new(value: usize) -> Result<Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        Ok(Self(value))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Default for ThreadCount {
    fn default() -> Self {
        Self(DEFAULT_YAMNET_THREADS)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct YamnetConfig {
    pub model: ModelPath,
    pub threads: ThreadCount,
    pub output_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SplitConfig {
    /// Share of rows held out for validation and the final evaluation.
    pub test_fraction: f64,
    pub seed: u64,
}

impl SplitConfig {
    pub fn new(test_fraction: f64, seed: u64) -> Result<Self, ConfigError> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(ConfigError::InvalidTestFraction(test_fraction));
        }
        Ok(Self {
            test_fraction,
            seed,
        })
    }
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_fraction: DEFAULT_TEST_FRACTION,
            seed: DEFAULT_SPLIT_SEED,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub corpus: CorpusDir,
    pub yamnet: YamnetConfig,
    pub augment: AugmentConfig,
    pub split: SplitConfig,
    pub classifier: ClassifierConfig,
    /// Files to classify once training finishes.
    pub predict: Vec<PathBuf>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.augment
            .validate()
            .map_err(|e| ConfigError::Augment(e.to_string()))?;
        self.classifier
            .validate()
            .map_err(|e| ConfigError::Classifier(e.to_string()))?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("corpus directory must not be empty")]
    EmptyCorpusDir,
    #[error("model path must not be empty")]
    EmptyModelPath,
    #[error("thread count must be > 0")]
    ZeroThreads,
    #[error("invalid thread count: {0}")]
    InvalidThreads(String),
    #[error("test fraction must be in (0, 1), got {0}")]
    InvalidTestFraction(f64),
    #[error("missing {what}: pass {flag} or set {env}")]
    Missing {
        what: &'static str,
        flag: &'static str,
        env: &'static str,
    },
    #[error("augmentation: {0}")]
    Augment(String),
    #[error("classifier: {0}")]
    Classifier(String),
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

pub fn resolve_corpus_dir(
    cli_value: Option<PathBuf>,
    env: &impl Env,
) -> Result<CorpusDir, ConfigError> {
    match resolve_optional_path(cli_value, ENV_CORPUS_DIR, env) {
        Some(p) => CorpusDir::new(p),
        None => Err(ConfigError::Missing {
            what: "corpus directory",
            flag: "--corpus",
            env: ENV_CORPUS_DIR,
        }),
    }
}

pub fn resolve_model_path(
    cli_value: Option<PathBuf>,
    env: &impl Env,
) -> Result<ModelPath, ConfigError> {
    match resolve_optional_path(cli_value, ENV_YAMNET_MODEL, env) {
        Some(p) => ModelPath::new(p),
        None => Err(ConfigError::Missing {
            what: "YAMNet model",
            flag: "--yamnet-model",
            env: ENV_YAMNET_MODEL,
        }),
    }
}

pub fn resolve_threads(
    cli_value: Option<usize>,
    env: &impl Env,
) -> Result<ThreadCount, ConfigError> {
    match cli_value {
        Some(n) => ThreadCount::new(n),
        None => match env.var(ENV_YAMNET_THREADS) {
            Some(v) => {
                let n = v
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidThreads(v.clone()))?;
                ThreadCount::new(n)
            }
            None => Ok(ThreadCount::default()),
        },
    }
}

pub fn resolve_yamnet_output(cli_value: Option<String>, env: &impl Env) -> String {
    resolve_string_with_default(cli_value, ENV_YAMNET_OUTPUT, env, DEFAULT_EMBEDDINGS_OUTPUT)
}

pub fn resolve_string_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> String {
    match cli_value {
        Some(v) => v,
        None => env.var(env_key).unwrap_or_else(|| default.to_owned()),
    }
}

pub fn resolve_optional_path(
    cli_value: Option<PathBuf>,
    env_key: &str,
    env: &impl Env,
) -> Option<PathBuf> {
    match cli_value {
        Some(v) => Some(v),
        None => env.var(env_key).map(PathBuf::from),
    }
}
