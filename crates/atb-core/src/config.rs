use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Crypto Pay network (testnet is the default for new deployments).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayNetwork {
    Testnet,
    Mainnet,
}

impl PayNetwork {
    pub fn hostname(self) -> &'static str {
        match self {
            PayNetwork::Testnet => "testnet-pay.crypt.bot",
            PayNetwork::Mainnet => "pay.crypt.bot",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "testnet" | "test" => Ok(PayNetwork::Testnet),
            "mainnet" | "main" => Ok(PayNetwork::Mainnet),
            other => Err(Error::Config(format!(
                "CRYPTOPAY_NETWORK must be testnet or mainnet, got {other}"
            ))),
        }
    }
}

/// Typed configuration for the bot.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub bot_token: String,
    pub bot_version: String,
    pub admins: Vec<i64>,
    pub allowed_users: Vec<i64>,

    // OpenAI
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub assistant_model: String,
    pub title_model: String,

    // Payments
    pub cryptopay_token: Option<String>,
    pub cryptopay_network: PayNetwork,
    pub cryptopay_asset: String,
    pub starter_tokens: i64,

    // Storage
    pub database_path: PathBuf,
    pub temp_dir: PathBuf,

    // Runtime constants
    pub query_timeout: Duration,

    // Telegram limits
    pub telegram_message_limit: usize,
    pub telegram_safe_limit: usize,
    pub streaming_throttle: Duration,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let bot_token = env_str("BOT_TOKEN").and_then(non_empty).ok_or_else(|| {
            Error::Config("BOT_TOKEN environment variable is required".to_string())
        })?;
        let openai_api_key = env_str("OPENAI_API_KEY")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("OPENAI_API_KEY environment variable is required".to_string())
            })?;

        let cryptopay_network =
            PayNetwork::parse(&env_str("CRYPTOPAY_NETWORK").unwrap_or_default())?;

        let temp_dir =
            PathBuf::from(env_str("TEMP_DIR").unwrap_or("/tmp/assistant-bot".to_string()));
        fs::create_dir_all(&temp_dir)?;

        Ok(Self {
            bot_token,
            bot_version: env_str("BOT_VERSION")
                .and_then(non_empty)
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            admins: parse_csv_i64(env_str("BOT_ADMINS")),
            allowed_users: parse_csv_i64(env_str("TELEGRAM_ALLOWED_USERS")),
            openai_api_key,
            openai_base_url: env_str("OPENAI_BASE_URL")
                .and_then(non_empty)
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            assistant_model: env_str("ASSISTANT_MODEL")
                .and_then(non_empty)
                .unwrap_or_else(|| "gpt-4o".to_string()),
            title_model: env_str("TITLE_MODEL")
                .and_then(non_empty)
                .unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
            cryptopay_token: env_str("CRYPTOPAY_TOKEN").and_then(non_empty),
            cryptopay_network,
            cryptopay_asset: env_str("CRYPTOPAY_ASSET")
                .and_then(non_empty)
                .map(|s| s.trim().to_uppercase())
                .unwrap_or_else(|| "USDT".to_string()),
            starter_tokens: env_i64("STARTER_TOKENS").unwrap_or(5_000).max(0),
            database_path: PathBuf::from(
                env_str("DATABASE_PATH").unwrap_or("./assistant-bot.sqlite".to_string()),
            ),
            temp_dir,
            query_timeout: Duration::from_millis(env_u64("QUERY_TIMEOUT_MS").unwrap_or(180_000)),
            telegram_message_limit: env_usize("TELEGRAM_MESSAGE_LIMIT").unwrap_or(4096),
            telegram_safe_limit: env_usize("TELEGRAM_SAFE_LIMIT").unwrap_or(4000),
            streaming_throttle: Duration::from_millis(
                env_u64("STREAMING_THROTTLE_MS").unwrap_or(500),
            ),
            audit_log_path: PathBuf::from(
                env_str("AUDIT_LOG_PATH").unwrap_or("/tmp/assistant-bot-audit.log".to_string()),
            ),
            audit_log_json: env_bool("AUDIT_LOG_JSON").unwrap_or(false),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED").unwrap_or(true),
            rate_limit_requests: env_u32("RATE_LIMIT_REQUESTS").unwrap_or(20),
            rate_limit_window: Duration::from_secs(env_u64("RATE_LIMIT_WINDOW").unwrap_or(60)),
        })
    }

    pub fn payments_enabled(&self) -> bool {
        self.cryptopay_token.is_some()
    }

    /// Config with every knob at its default, for tests.
    pub fn for_tests() -> Self {
        Self {
            bot_token: "x".to_string(),
            bot_version: "0.0.0".to_string(),
            admins: vec![],
            allowed_users: vec![],
            openai_api_key: "sk-test".to_string(),
            openai_base_url: "http://127.0.0.1:9".to_string(),
            assistant_model: "gpt-4o".to_string(),
            title_model: "gpt-3.5-turbo".to_string(),
            cryptopay_token: None,
            cryptopay_network: PayNetwork::Testnet,
            cryptopay_asset: "USDT".to_string(),
            starter_tokens: 5_000,
            database_path: ":memory:".into(),
            temp_dir: "/tmp".into(),
            query_timeout: Duration::from_secs(5),
            telegram_message_limit: 4096,
            telegram_safe_limit: 4000,
            streaming_throttle: Duration::from_millis(500),
            audit_log_path: "/tmp/assistant-bot-test-audit.log".into(),
            audit_log_json: false,
            rate_limit_enabled: true,
            rate_limit_requests: 20,
            rate_limit_window: Duration::from_secs(60),
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
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

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_ids_skip_garbage() {
        assert_eq!(
            parse_csv_i64(Some(" 1, 2,,x, 30 ".to_string())),
            vec![1, 2, 30]
        );
        assert!(parse_csv_i64(None).is_empty());
    }

    #[test]
    fn dotenv_strips_quotes_comments_and_export() {
        let parsed = parse_dotenv(
            "# comment\nBOT_TOKEN=\"abc\"\nexport OPENAI_API_KEY='sk'\nBROKEN\n =x\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("BOT_TOKEN".to_string(), "abc".to_string()),
                ("OPENAI_API_KEY".to_string(), "sk".to_string()),
            ]
        );
    }

    #[test]
    fn pay_network_hosts() {
        assert_eq!(PayNetwork::parse("").unwrap(), PayNetwork::Testnet);
        assert_eq!(
            PayNetwork::parse("MAINNET").unwrap().hostname(),
            "pay.crypt.bot"
        );
        assert!(PayNetwork::parse("moon").is_err());
    }
}
