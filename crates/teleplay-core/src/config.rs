use std::{env, fmt, fs, path::Path, path::PathBuf, time::Duration};

use regex::Regex;

use crate::{
    errors::Error,
    poll::{PollSettings, DEFAULT_BATCH_LIMIT, DEFAULT_POLL_TIMEOUT},
    retry::RetryPolicy,
    session::{redact_token, DEFAULT_CONCURRENCY_LIMIT, MAX_CONCURRENCY_LIMIT},
    Result,
};

/// Upper bound the Telegram Bot API accepts for `getUpdates?limit=`.
const MAX_BATCH_LIMIT: usize = 100;

/// Typed configuration, read from `TELEPLAY_*` environment variables.
#[derive(Clone)]
pub struct Config {
    pub bot_token: String,
    pub concurrency_limit: usize,
    pub batch_limit: usize,
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub retry_factor: f64,
    pub retry_max: Duration,
    pub checkpoint_file: PathBuf,
    pub api_base: String,
    pub reply_prefix: String,
}

impl Config {
    /// Load from the process environment, after applying `.env` if present.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bot_token = get("TELEPLAY_BOT_TOKEN").ok_or_else(|| {
            Error::Config("TELEPLAY_BOT_TOKEN environment variable is required".to_string())
        })?;
        validate_token(&bot_token)?;

        let concurrency_limit =
            parse_or(&get, "TELEPLAY_CONCURRENCY", DEFAULT_CONCURRENCY_LIMIT)?;
        if concurrency_limit == 0 {
            return Err(Error::Config(
                "TELEPLAY_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if concurrency_limit > MAX_CONCURRENCY_LIMIT {
            return Err(Error::Config(format!(
                "TELEPLAY_CONCURRENCY must not exceed {MAX_CONCURRENCY_LIMIT}"
            )));
        }

        let batch_limit = parse_or(&get, "TELEPLAY_BATCH_LIMIT", DEFAULT_BATCH_LIMIT)?;
        if !(1..=MAX_BATCH_LIMIT).contains(&batch_limit) {
            return Err(Error::Config(format!(
                "TELEPLAY_BATCH_LIMIT must be between 1 and {MAX_BATCH_LIMIT}"
            )));
        }

        let poll_timeout = Duration::from_secs(parse_or(
            &get,
            "TELEPLAY_POLL_TIMEOUT_SECS",
            DEFAULT_POLL_TIMEOUT.as_secs(),
        )?);
        let poll_interval =
            Duration::from_millis(parse_or(&get, "TELEPLAY_POLL_INTERVAL_MS", 5_000u64)?);

        let retry_factor: f64 = parse_or(&get, "TELEPLAY_RETRY_FACTOR", 1.0)?;
        if !retry_factor.is_finite() || retry_factor < 1.0 {
            return Err(Error::Config(
                "TELEPLAY_RETRY_FACTOR must be a number >= 1.0".to_string(),
            ));
        }
        let retry_max =
            Duration::from_millis(parse_or(&get, "TELEPLAY_RETRY_MAX_MS", 60_000u64)?);

        let checkpoint_file = PathBuf::from(
            get("TELEPLAY_CHECKPOINT_FILE")
                .unwrap_or_else(|| "/tmp/teleplay-checkpoints.json".to_string()),
        );
        let api_base = get("TELEPLAY_API_BASE")
            .unwrap_or_else(|| "https://api.telegram.org".to_string())
            .trim_end_matches('/')
            .to_string();
        // Not trimmed: trailing whitespace in the prefix is significant.
        let reply_prefix =
            lookup("TELEPLAY_REPLY_PREFIX").unwrap_or_else(|| "you said: ".to_string());

        Ok(Self {
            bot_token,
            concurrency_limit,
            batch_limit,
            poll_timeout,
            poll_interval,
            retry_factor,
            retry_max,
            checkpoint_file,
            api_base,
            reply_prefix,
        })
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            batch_limit: self.batch_limit,
            poll_timeout: self.poll_timeout,
            retry: RetryPolicy {
                first: self.poll_interval,
                max: self.retry_max.max(self.poll_interval),
                factor: self.retry_factor,
            },
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bot_token", &redact_token(&self.bot_token))
            .field("concurrency_limit", &self.concurrency_limit)
            .field("batch_limit", &self.batch_limit)
            .field("poll_timeout", &self.poll_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("retry_factor", &self.retry_factor)
            .field("retry_max", &self.retry_max)
            .field("checkpoint_file", &self.checkpoint_file)
            .field("api_base", &self.api_base)
            .field("reply_prefix", &self.reply_prefix)
            .finish()
    }
}

fn validate_token(token: &str) -> Result<()> {
    let re = Regex::new(r"^\d+:[A-Za-z0-9_-]+$").expect("valid regex");
    if re.is_match(token) {
        Ok(())
    } else {
        Err(Error::Config(
            "TELEPLAY_BOT_TOKEN must look like <bot id>:<secret>".to_string(),
        ))
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw:?}"))),
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim().trim_start_matches("export ").trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }
        out.push((key.to_string(), val));
    }
    out
}
