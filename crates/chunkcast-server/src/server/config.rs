use anyhow::bail;
use chrono::TimeDelta;
use chunkcast::{DispatchConfig, PipelineConfig, RedeliveryPolicy, WorkerConfig};
use clap::{Parser, ValueEnum};
use core::{fmt, time::Duration};

/// Runtime configuration for the `chunkcast-server` binary.
///
/// Every value can be given as a CLI flag or an environment variable (a `.env`
/// file is loaded first). Defaults suit a single-process deployment backed by
/// the local echo completion backend.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "chunkcast-server",
    version,
    about = "Chunk text, fan it out to completion workers and reassemble the results"
)]
pub struct CliArgs {
    /// Address the HTTP API listens on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Topic chunks are published to and consumed from.
    ///
    /// Environment variable: `TOPIC`
    #[arg(long, env = "TOPIC", default_value_t = String::from("chunks"))]
    pub topic: String,

    /// Number of subscriber tasks processing chunks concurrently.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Token budget per chunk.
    ///
    /// Environment variable: `MAX_TOKENS`
    #[arg(long, env = "MAX_TOKENS", default_value_t = 1000)]
    pub max_tokens: usize,

    /// Largest accepted input text, in bytes.
    ///
    /// Environment variable: `MAX_INPUT_BYTES`
    #[arg(long, env = "MAX_INPUT_BYTES", default_value_t = 8 * 1024 * 1024)]
    pub max_input_bytes: usize,

    /// Publishes awaiting broker acknowledgement per job.
    ///
    /// Environment variable: `MAX_INFLIGHT_PUBLISHES`
    #[arg(long, env = "MAX_INFLIGHT_PUBLISHES", default_value_t = 16)]
    pub max_inflight_publishes: usize,

    /// Publish attempts per chunk, including the first.
    ///
    /// Environment variable: `PUBLISH_MAX_ATTEMPTS`
    #[arg(long, env = "PUBLISH_MAX_ATTEMPTS", default_value_t = 5)]
    pub publish_max_attempts: u32,

    /// Delay after the first rejected publish.
    ///
    /// Environment variable: `PUBLISH_BACKOFF_MS`
    #[arg(long, env = "PUBLISH_BACKOFF_MS", default_value_t = 100)]
    pub publish_backoff_ms: u64,

    /// Upper bound on the delay between publish attempts.
    ///
    /// Environment variable: `PUBLISH_MAX_BACKOFF_MS`
    #[arg(long, env = "PUBLISH_MAX_BACKOFF_MS", default_value_t = 5_000)]
    pub publish_max_backoff_ms: u64,

    /// Deadline for a single publish attempt.
    ///
    /// Environment variable: `PUBLISH_TIMEOUT_SECS`
    #[arg(long, env = "PUBLISH_TIMEOUT_SECS", default_value_t = 10)]
    pub publish_timeout_secs: u64,

    /// Deliveries of one message before a retryable failure is recorded as
    /// permanent.
    ///
    /// Environment variable: `MAX_DELIVERY_ATTEMPTS`
    #[arg(long, env = "MAX_DELIVERY_ATTEMPTS", default_value_t = 5)]
    pub max_delivery_attempts: u32,

    /// Delay before the first redelivery of a nacked message.
    ///
    /// Environment variable: `REDELIVERY_BACKOFF_MS`
    #[arg(long, env = "REDELIVERY_BACKOFF_MS", default_value_t = 100)]
    pub redelivery_backoff_ms: u64,

    /// Upper bound on the redelivery delay.
    ///
    /// Environment variable: `REDELIVERY_MAX_BACKOFF_MS`
    #[arg(long, env = "REDELIVERY_MAX_BACKOFF_MS", default_value_t = 10_000)]
    pub redelivery_max_backoff_ms: u64,

    /// Which completion service the workers call.
    ///
    /// Environment variable: `COMPLETION_BACKEND`
    #[arg(long, env = "COMPLETION_BACKEND", value_enum, default_value_t = CompletionBackend::Echo)]
    pub completion_backend: CompletionBackend,

    /// Base URL of an OpenAI-compatible API.
    ///
    /// Environment variable: `COMPLETION_BASE_URL`
    #[arg(long, env = "COMPLETION_BASE_URL", default_value_t = String::from("https://api.openai.com/v1"))]
    pub completion_base_url: String,

    /// Model name sent with every completion request.
    ///
    /// Environment variable: `COMPLETION_MODEL`
    #[arg(long, env = "COMPLETION_MODEL", default_value_t = String::from("gpt-4o-mini"))]
    pub completion_model: String,

    /// Bearer token for the completion API.
    ///
    /// Environment variable: `COMPLETION_API_KEY`
    #[arg(long, env = "COMPLETION_API_KEY", hide_env_values = true)]
    pub completion_api_key: Option<String>,

    /// Deadline for a single completion call.
    ///
    /// Environment variable: `COMPLETION_TIMEOUT_SECS`
    #[arg(long, env = "COMPLETION_TIMEOUT_SECS", default_value_t = 60)]
    pub completion_timeout_secs: u64,

    /// Output bound passed to the completion service.
    ///
    /// Environment variable: `MAX_OUTPUT_TOKENS`
    #[arg(long, env = "MAX_OUTPUT_TOKENS", default_value_t = 512)]
    pub max_output_tokens: u32,

    /// Prompt sent per chunk; `{chunk}` is replaced by the chunk text.
    ///
    /// Environment variable: `PROMPT_TEMPLATE`
    #[arg(long, env = "PROMPT_TEMPLATE", default_value_t = String::from("{chunk}"))]
    pub prompt_template: String,

    /// Time a job has to collect every result.
    ///
    /// Environment variable: `JOB_DEADLINE_SECS`
    #[arg(long, env = "JOB_DEADLINE_SECS", default_value_t = 600)]
    pub job_deadline_secs: u64,

    /// How long finished jobs stay queryable.
    ///
    /// Environment variable: `JOB_RETENTION_SECS`
    #[arg(long, env = "JOB_RETENTION_SECS", default_value_t = 3600)]
    pub job_retention_secs: u64,

    /// Time allowed for in-flight jobs to finish on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Console log format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable events.
    Pretty,
    /// One JSON object per event.
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionBackend {
    /// Returns the prompt unchanged. No network access.
    Echo,
    /// OpenAI-compatible `chat/completions` endpoint.
    Openai,
}

#[derive(Clone)]
pub struct CompletionConfig {
    pub backend: CompletionBackend,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("backend", &self.backend)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub topic: String,
    pub num_workers: usize,
    pub max_input_bytes: usize,
    pub pipeline: PipelineConfig,
    pub worker: WorkerConfig,
    pub redelivery: RedeliveryPolicy,
    pub completion: CompletionConfig,
    pub job_retention: TimeDelta,
    pub shutdown_timeout: Duration,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.max_tokens == 0 {
            bail!("MAX_TOKENS must be greater than 0");
        }

        if args.max_input_bytes == 0 {
            bail!("MAX_INPUT_BYTES must be greater than 0");
        }

        if args.topic.trim().is_empty() {
            bail!("TOPIC must not be empty");
        }

        if args.max_delivery_attempts == 0 {
            bail!("MAX_DELIVERY_ATTEMPTS must be greater than 0");
        }

        if args.redelivery_backoff_ms > args.redelivery_max_backoff_ms {
            bail!(
                "REDELIVERY_BACKOFF_MS ({}) exceeds REDELIVERY_MAX_BACKOFF_MS ({})",
                args.redelivery_backoff_ms,
                args.redelivery_max_backoff_ms
            );
        }

        if args.completion_timeout_secs == 0 {
            bail!("COMPLETION_TIMEOUT_SECS must be greater than 0");
        }

        if args.job_deadline_secs == 0 {
            bail!("JOB_DEADLINE_SECS must be greater than 0");
        }

        if args.completion_backend == CompletionBackend::Openai {
            if args.completion_base_url.trim().is_empty() {
                bail!("COMPLETION_BASE_URL must not be empty");
            }
            if args.completion_model.trim().is_empty() {
                bail!("COMPLETION_MODEL must not be empty");
            }
        }

        let job_retention = i64::try_from(args.job_retention_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| anyhow::anyhow!("JOB_RETENTION_SECS is out of range"))?;

        let dispatch = DispatchConfig {
            max_attempts: args.publish_max_attempts,
            base_backoff: Duration::from_millis(args.publish_backoff_ms),
            max_backoff: Duration::from_millis(args.publish_max_backoff_ms),
            publish_timeout: Duration::from_secs(args.publish_timeout_secs),
            max_inflight: args.max_inflight_publishes,
        };
        dispatch.validate()?;

        let completion_timeout = Duration::from_secs(args.completion_timeout_secs);

        Ok(Self {
            server_addr: args.server_addr,
            topic: args.topic,
            num_workers: args.num_workers,
            max_input_bytes: args.max_input_bytes,
            pipeline: PipelineConfig {
                max_tokens: args.max_tokens,
                job_deadline: Duration::from_secs(args.job_deadline_secs),
                dispatch,
            },
            worker: WorkerConfig {
                prompt_template: args.prompt_template,
                max_output_tokens: args.max_output_tokens,
                completion_timeout,
                max_delivery_attempts: args.max_delivery_attempts,
            },
            redelivery: RedeliveryPolicy {
                max_delivery_attempts: args.max_delivery_attempts,
                min_backoff: Duration::from_millis(args.redelivery_backoff_ms),
                max_backoff: Duration::from_millis(args.redelivery_max_backoff_ms),
            },
            completion: CompletionConfig {
                backend: args.completion_backend,
                base_url: args.completion_base_url,
                model: args.completion_model,
                api_key: args.completion_api_key.filter(|key| !key.trim().is_empty()),
                timeout: completion_timeout,
            },
            job_retention,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            log_format: args.log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<ServerConfig> {
        let args = CliArgs::try_parse_from(
            std::iter::once("chunkcast-server").chain(extra.iter().copied()),
        )?;
        ServerConfig::try_from(args)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.pipeline.max_tokens, 1000);
        assert_eq!(config.worker.max_delivery_attempts, 5);
        assert_eq!(config.redelivery.max_delivery_attempts, 5);
        assert_eq!(config.completion.backend, CompletionBackend::Echo);
        assert_eq!(config.job_retention, TimeDelta::hours(1));
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn delivery_attempts_are_shared() {
        let config = parse(&["--max-delivery-attempts", "3"]).unwrap();
        assert_eq!(config.worker.max_delivery_attempts, 3);
        assert_eq!(config.redelivery.max_delivery_attempts, 3);
    }

    #[test]
    fn rejects_zero_values() {
        for flag in [
            "--num-workers",
            "--max-tokens",
            "--max-input-bytes",
            "--max-delivery-attempts",
            "--publish-max-attempts",
            "--max-inflight-publishes",
            "--job-deadline-secs",
            "--completion-timeout-secs",
        ] {
            assert!(parse(&[flag, "0"]).is_err(), "{flag} = 0 was accepted");
        }
    }

    #[test]
    fn rejects_inverted_redelivery_backoff() {
        let err = parse(&[
            "--redelivery-backoff-ms",
            "500",
            "--redelivery-max-backoff-ms",
            "100",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("REDELIVERY_BACKOFF_MS"));
    }

    #[test]
    fn openai_backend_needs_a_model() {
        assert!(parse(&["--completion-backend", "openai", "--completion-model", " "]).is_err());
        assert!(parse(&["--completion-backend", "openai"]).is_ok());
    }

    #[test]
    fn api_key_is_redacted() {
        let config = parse(&["--completion-api-key", "sk-secret"]).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
