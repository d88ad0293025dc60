// Environment-driven configuration shared by the API and the worker

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::job::{Backoff, JobKind, JobOptions};
use crate::types::Language;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("no sandbox image or command configured for {0}")]
    MissingRuntime(Language),

    #[error("failed to load language file {path}: {message}")]
    LanguagesFile { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl RedisConfig {
    /// Structured connection info. The password is passed through verbatim,
    /// so characters like `@` or `/` need no URL escaping.
    pub fn connection_info(&self) -> ::redis::ConnectionInfo {
        ::redis::ConnectionInfo {
            addr: ::redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: ::redis::RedisConnectionInfo {
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How one language is run inside its container. The source file is mounted
/// read-only at `/app/<file_name>`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LanguageRuntime {
    pub image: String,
    pub command: Vec<String>,
    pub file_name: String,
}

impl LanguageRuntime {
    pub fn file_extension(&self) -> &str {
        Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
    }

    pub fn mount_path(&self) -> String {
        format!("/app/{}", self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LanguageRuntimes {
    pub javascript: LanguageRuntime,
    pub python: LanguageRuntime,
    pub java: LanguageRuntime,
}

#[derive(Debug, Deserialize)]
struct LanguagesFile {
    languages: Vec<LanguageOverride>,
}

#[derive(Debug, Deserialize)]
struct LanguageOverride {
    name: String,
    image: Option<String>,
    command: Option<Vec<String>>,
    file_name: Option<String>,
}

impl Default for LanguageRuntimes {
    fn default() -> Self {
        Self {
            javascript: LanguageRuntime {
                image: "node:18".to_string(),
                command: vec!["node".to_string(), "/app/code.js".to_string()],
                file_name: "code.js".to_string(),
            },
            python: LanguageRuntime {
                image: "python:3.9".to_string(),
                command: vec!["python".to_string(), "-u".to_string(), "/app/code.py".to_string()],
                file_name: "code.py".to_string(),
            },
            // Single-file source launch, so no writable javac output dir is needed
            java: LanguageRuntime {
                image: "openjdk:11".to_string(),
                command: vec!["java".to_string(), "/app/Main.java".to_string()],
                file_name: "Main.java".to_string(),
            },
        }
    }
}

impl LanguageRuntimes {
    pub fn get(&self, language: Language) -> &LanguageRuntime {
        match language {
            Language::Javascript => &self.javascript,
            Language::Python => &self.python,
            Language::Java => &self.java,
        }
    }

    fn get_mut(&mut self, language: Language) -> &mut LanguageRuntime {
        match language {
            Language::Javascript => &mut self.javascript,
            Language::Python => &mut self.python,
            Language::Java => &mut self.java,
        }
    }

    /// Apply per-language overrides from a `languages.json` style document.
    pub fn apply_overrides(&mut self, json: &str) -> Result<(), String> {
        let file: LanguagesFile = serde_json::from_str(json).map_err(|e| e.to_string())?;
        for entry in file.languages {
            let language: Language = entry.name.parse().map_err(|e| format!("{}", e))?;
            let runtime = self.get_mut(language);
            if let Some(image) = entry.image {
                runtime.image = image;
            }
            if let Some(command) = entry.command {
                runtime.command = command;
            }
            if let Some(file_name) = entry.file_name {
                runtime.file_name = file_name;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for language in Language::ALL {
            let runtime = self.get(language);
            if runtime.image.trim().is_empty()
                || runtime.command.is_empty()
                || runtime.file_name.trim().is_empty()
            {
                return Err(ConfigError::MissingRuntime(language));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub temp_dir: PathBuf,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub pids_limit: i64,
    pub timeout_ms: u64,
    /// Deadline for pulling a missing image
    pub pull_timeout_ms: u64,
    pub runtimes: LanguageRuntimes,
    /// Test cases run concurrently per submission. 1 keeps them sequential.
    pub parallelism: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("talent-sandbox"),
            memory_limit_mb: 100,
            cpu_limit: 0.5,
            pids_limit: 64,
            timeout_ms: 5000,
            pull_timeout_ms: 300_000,
            runtimes: LanguageRuntimes::default(),
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Dispatches allowed per window, across all workers
    pub max_per_window: u32,
    pub window_ms: u64,
    /// Concurrent processors per worker process
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub code_execution: QueueLimits,
    pub exam_processing: QueueLimits,
    pub job_options: JobOptions,
    pub completed_retention_secs: u64,
    pub connect_retries: u32,
    /// How long a worker blocks on an empty queue before re-checking shutdown
    pub poll_interval_ms: u64,
    /// A dispatched job whose lease lapses is handed to another worker.
    /// Workers renew the lease while the job runs.
    pub lease_ms: u64,
}

impl QueueConfig {
    pub fn limits(&self, queue: JobKind) -> &QueueLimits {
        match queue {
            JobKind::CodeExecution => &self.code_execution,
            JobKind::ExamProcessing => &self.exam_processing,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            code_execution: QueueLimits {
                max_per_window: 5,
                window_ms: 1000,
                concurrency: 1,
            },
            exam_processing: QueueLimits {
                max_per_window: 10,
                window_ms: 1000,
                concurrency: 1,
            },
            job_options: JobOptions::default(),
            completed_retention_secs: 86400,
            connect_retries: 3,
            poll_interval_ms: 1000,
            lease_ms: 30_000,
        }
    }
}

/// TTL classes in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl {
    pub questions: u64,
    pub exams: u64,
    pub results: u64,
    pub sessions: u64,
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            questions: 3600,
            exams: 1800,
            results: 86400,
            sessions: 7200,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub sandbox: SandboxConfig,
    pub queue: QueueConfig,
    pub cache_ttl: CacheTtl,
    pub api_bind_addr: String,
    pub worker_health_addr: String,
    pub problems_file: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let redis = RedisConfig {
            host: text("REDIS_HOST", "localhost"),
            port: parse_num(&lookup, "REDIS_PORT", 6379)?,
            password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
        };

        let mut runtimes = LanguageRuntimes::default();
        if let Some(path) = lookup("SANDBOX_LANGUAGES_FILE") {
            let path = PathBuf::from(path);
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::LanguagesFile {
                path: path.clone(),
                message: e.to_string(),
            })?;
            runtimes
                .apply_overrides(&content)
                .map_err(|message| ConfigError::LanguagesFile { path, message })?;
        }
        for (key, language) in [
            ("SANDBOX_IMAGE_JAVASCRIPT", Language::Javascript),
            ("SANDBOX_IMAGE_PYTHON", Language::Python),
            ("SANDBOX_IMAGE_JAVA", Language::Java),
        ] {
            if let Some(image) = lookup(key) {
                runtimes.get_mut(language).image = image;
            }
        }
        runtimes.validate()?;

        let sandbox_defaults = SandboxConfig::default();
        let sandbox = SandboxConfig {
            temp_dir: lookup("SANDBOX_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(sandbox_defaults.temp_dir),
            memory_limit_mb: parse_num(&lookup, "SANDBOX_MEMORY_MB", sandbox_defaults.memory_limit_mb)?,
            cpu_limit: parse_num(&lookup, "SANDBOX_CPU_LIMIT", sandbox_defaults.cpu_limit)?,
            pids_limit: parse_num(&lookup, "SANDBOX_PIDS_LIMIT", sandbox_defaults.pids_limit)?,
            timeout_ms: parse_num(&lookup, "EXECUTION_TIMEOUT_MS", sandbox_defaults.timeout_ms)?,
            pull_timeout_ms: parse_num(&lookup, "SANDBOX_PULL_TIMEOUT_MS", sandbox_defaults.pull_timeout_ms)?,
            runtimes,
            parallelism: parse_num(&lookup, "RUNNER_PARALLELISM", sandbox_defaults.parallelism)?.max(1),
        };

        let q = QueueConfig::default();
        let queue = QueueConfig {
            code_execution: QueueLimits {
                max_per_window: parse_num(&lookup, "CODE_QUEUE_RATE", q.code_execution.max_per_window)?,
                window_ms: q.code_execution.window_ms,
                concurrency: parse_num(&lookup, "CODE_QUEUE_CONCURRENCY", q.code_execution.concurrency)?,
            },
            exam_processing: QueueLimits {
                max_per_window: parse_num(&lookup, "EXAM_QUEUE_RATE", q.exam_processing.max_per_window)?,
                window_ms: q.exam_processing.window_ms,
                concurrency: parse_num(&lookup, "EXAM_QUEUE_CONCURRENCY", q.exam_processing.concurrency)?,
            },
            job_options: JobOptions {
                attempts: parse_num(&lookup, "QUEUE_ATTEMPTS", q.job_options.attempts)?,
                backoff: Backoff::exponential(parse_num(
                    &lookup,
                    "QUEUE_BACKOFF_MS",
                    q.job_options.backoff.delay_ms,
                )?),
                remove_on_complete: q.job_options.remove_on_complete,
            },
            completed_retention_secs: parse_num(
                &lookup,
                "QUEUE_COMPLETED_RETENTION_SECS",
                q.completed_retention_secs,
            )?,
            connect_retries: parse_num(&lookup, "BROKER_CONNECT_RETRIES", q.connect_retries)?,
            poll_interval_ms: q.poll_interval_ms,
            lease_ms: parse_num(&lookup, "QUEUE_LEASE_MS", q.lease_ms)?.max(1),
        };

        let ttl = CacheTtl::default();
        let cache_ttl = CacheTtl {
            questions: parse_num(&lookup, "CACHE_TTL_QUESTIONS", ttl.questions)?,
            exams: parse_num(&lookup, "CACHE_TTL_EXAMS", ttl.exams)?,
            results: parse_num(&lookup, "CACHE_TTL_RESULTS", ttl.results)?,
            sessions: parse_num(&lookup, "CACHE_TTL_SESSIONS", ttl.sessions)?,
        };

        Ok(Self {
            redis,
            sandbox,
            queue,
            cache_ttl,
            api_bind_addr: text("API_BIND_ADDR", "0.0.0.0:3000"),
            worker_health_addr: text("WORKER_HEALTH_ADDR", "0.0.0.0:3001"),
            problems_file: PathBuf::from(text("PROBLEMS_FILE", "config/problems.json")),
        })
    }
}

fn parse_num<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}
