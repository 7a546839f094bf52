use secrecy::SecretString;
use std::{net::SocketAddr, str::FromStr, time::Duration};
use tracing::Level;
use voicebridge_core::{DtmfPolicy, SessionSettings};

pub const DEFAULT_OPENAI_ENDPOINT: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01";
pub const DEFAULT_DEEPGRAM_ENDPOINT: &str = "wss://agent.deepgram.com/v1/agent/converse";
pub const DEFAULT_NO_INPUT_MESSAGE: &str = "User did not provide any input. Act accordingly.";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful and concise voice assistant answering \
    a phone call. Keep answers short. When the caller wants to end the call use the end_call \
    tool; when they ask for a human use the transfer_to_agent tool.";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// The voice-AI backends a session can be bridged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentProvider {
    OpenAI,
    Deepgram,
}

impl AgentProvider {
    /// Case-insensitive lookup by provider name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Some(AgentProvider::OpenAI),
            "deepgram" => Some(AgentProvider::Deepgram),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentProvider::OpenAI => "openai",
            AgentProvider::Deepgram => "deepgram",
        }
    }
}

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_key: Option<SecretString>,
    pub endpoint: String,
    pub voice: String,
}

#[derive(Clone, Debug)]
pub struct DeepgramConfig {
    pub api_key: Option<SecretString>,
    pub endpoint: String,
    pub listen_model: String,
    pub think_provider_type: String,
    pub think_provider_model: String,
    pub speak_voice: String,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub provider: AgentProvider,
    pub session: SessionSettings,
    pub initial_greeting: String,
    pub system_prompt: String,
    pub no_input_message: String,
    pub openai: OpenAiConfig,
    pub deepgram: DeepgramConfig,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_positive(name: &str, default: u64) -> Result<u64, ConfigError> {
    let value = parse_var(name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

fn secret_var(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn dtmf_policy_from_env() -> Result<DtmfPolicy, ConfigError> {
    let defaults = DtmfPolicy::default();

    let terminator = match std::env::var("DTMF_TERMINATOR") {
        Err(_) => defaults.terminator,
        Ok(raw) if raw.trim().eq_ignore_ascii_case("none") || raw.trim().is_empty() => None,
        Ok(raw) => {
            let mut chars = raw.trim().chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if voicebridge_core::dtmf::is_dtmf_digit(c.to_ascii_uppercase()) => {
                    Some(c.to_ascii_uppercase())
                }
                _ => {
                    return Err(ConfigError::InvalidValue(
                        "DTMF_TERMINATOR".to_string(),
                        format!("'{}' is not a single DTMF digit", raw),
                    ));
                }
            }
        }
    };

    let max_digits = match std::env::var("DTMF_MAX_DIGITS") {
        Err(_) => None,
        Ok(_) => Some(parse_positive("DTMF_MAX_DIGITS", 1)? as usize),
    };

    let inter_digit_ms: u64 = parse_var(
        "DTMF_INTER_DIGIT_TIMEOUT_MS",
        defaults
            .inter_digit_timeout
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
    )?;
    let inter_digit_timeout = (inter_digit_ms > 0).then(|| Duration::from_millis(inter_digit_ms));

    Ok(DtmfPolicy {
        terminator,
        max_digits,
        inter_digit_timeout,
    })
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:8080");
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let provider_str = var_or("BOT_PROVIDER", "openai");
        let provider = AgentProvider::parse(&provider_str).ok_or_else(|| {
            ConfigError::InvalidValue(
                "BOT_PROVIDER".to_string(),
                format!("unknown provider '{}'", provider_str),
            )
        })?;

        let session = SessionSettings {
            max_binary_message_size: parse_positive(
                "MAX_BINARY_MESSAGE_SIZE",
                voicebridge_core::settings::DEFAULT_MAX_BINARY_MESSAGE_SIZE as u64,
            )? as usize,
            min_binary_message_size: parse_positive(
                "MIN_BINARY_MESSAGE_SIZE",
                voicebridge_core::settings::DEFAULT_MIN_BINARY_MESSAGE_SIZE as u64,
            )? as usize,
            flush_delay: Duration::from_millis(parse_positive("AUDIO_FLUSH_DELAY_MS", 500)?),
            no_input_timeout: Duration::from_millis(parse_positive("NO_INPUT_TIMEOUT", 30_000)?),
            dtmf: dtmf_policy_from_env()?,
        };
        session.validate().map_err(|e| {
            ConfigError::InvalidValue("MIN_BINARY_MESSAGE_SIZE".to_string(), e.to_string())
        })?;

        let openai = OpenAiConfig {
            api_key: secret_var("OPENAI_API_KEY"),
            endpoint: var_or("OPENAI_MODEL_ENDPOINT", DEFAULT_OPENAI_ENDPOINT),
            voice: var_or("OPENAI_VOICE_ID", "alloy"),
        };
        let deepgram = DeepgramConfig {
            api_key: secret_var("DEEPGRAM_API_KEY"),
            endpoint: var_or("DEEPGRAM_ENDPOINT", DEFAULT_DEEPGRAM_ENDPOINT),
            listen_model: var_or("DEEPGRAM_LISTEN_MODEL", "nova-2-phonecall"),
            think_provider_type: var_or("DEEPGRAM_THINK_PROVIDER_TYPE", "openai"),
            think_provider_model: var_or("DEEPGRAM_THINK_PROVIDER_MODEL", "gpt-4o-mini"),
            speak_voice: var_or("DEEPGRAM_SPEAK_VOICE", "aura-asteria-en"),
        };

        match provider {
            AgentProvider::OpenAI => {
                if openai.api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            AgentProvider::Deepgram => {
                if deepgram.api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "DEEPGRAM_API_KEY must be set for 'deepgram' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            bind_address,
            log_level,
            provider,
            session,
            initial_greeting: var_or("INITIAL_GREETING", "Hello"),
            system_prompt: var_or("SYSTEM_PROMPT", DEFAULT_SYSTEM_PROMPT),
            no_input_message: var_or("NO_INPUT_MESSAGE", DEFAULT_NO_INPUT_MESSAGE),
            openai,
            deepgram,
        })
    }
}

#[cfg(test)]
impl Config {
    /// A fully populated configuration that never touches the environment.
    pub fn for_tests(provider: AgentProvider) -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_level: Level::DEBUG,
            provider,
            session: SessionSettings::default(),
            initial_greeting: "Hello".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            no_input_message: DEFAULT_NO_INPUT_MESSAGE.to_string(),
            openai: OpenAiConfig {
                api_key: Some(SecretString::from("test-openai-key".to_string())),
                endpoint: "ws://127.0.0.1:9/openai".to_string(),
                voice: "alloy".to_string(),
            },
            deepgram: DeepgramConfig {
                api_key: Some(SecretString::from("test-deepgram-key".to_string())),
                endpoint: "ws://127.0.0.1:9/deepgram".to_string(),
                listen_model: "nova-2-phonecall".to_string(),
                think_provider_type: "openai".to_string(),
                think_provider_model: "gpt-4o-mini".to_string(),
                speak_voice: "aura-asteria-en".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::env;
    use tracing::Level;

    const VARS: &[&str] = &[
        "BIND_ADDRESS",
        "RUST_LOG",
        "BOT_PROVIDER",
        "MAX_BINARY_MESSAGE_SIZE",
        "MIN_BINARY_MESSAGE_SIZE",
        "AUDIO_FLUSH_DELAY_MS",
        "NO_INPUT_TIMEOUT",
        "DTMF_TERMINATOR",
        "DTMF_MAX_DIGITS",
        "DTMF_INTER_DIGIT_TIMEOUT_MS",
        "INITIAL_GREETING",
        "SYSTEM_PROMPT",
        "NO_INPUT_MESSAGE",
        "OPENAI_API_KEY",
        "OPENAI_MODEL_ENDPOINT",
        "OPENAI_VOICE_ID",
        "DEEPGRAM_API_KEY",
        "DEEPGRAM_ENDPOINT",
        "DEEPGRAM_LISTEN_MODEL",
        "DEEPGRAM_THINK_PROVIDER_TYPE",
        "DEEPGRAM_THINK_PROVIDER_MODEL",
        "DEEPGRAM_SPEAK_VOICE",
    ];

    fn clear_env_vars() {
        unsafe {
            for var in VARS {
                env::remove_var(var);
            }
        }
    }

    fn set_minimal_env_openai() {
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-openai-key");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    fn test_provider_parse_is_case_insensitive() {
        assert_eq!(AgentProvider::parse("OpenAI"), Some(AgentProvider::OpenAI));
        assert_eq!(AgentProvider::parse("DEEPGRAM"), Some(AgentProvider::Deepgram));
        assert_eq!(AgentProvider::parse("gemini"), None);
        assert_eq!(AgentProvider::Deepgram.as_str(), "deepgram");
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal_openai() {
        clear_env_vars();
        set_minimal_env_openai();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:8080");
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.provider, AgentProvider::OpenAI);
        assert_eq!(
            config.openai.api_key.as_ref().map(|k| k.expose_secret()),
            Some("test-openai-key")
        );
        assert!(config.deepgram.api_key.is_none());
        assert_eq!(config.openai.endpoint, DEFAULT_OPENAI_ENDPOINT);
        assert_eq!(config.openai.voice, "alloy");
        assert_eq!(config.initial_greeting, "Hello");
        assert_eq!(config.no_input_message, DEFAULT_NO_INPUT_MESSAGE);
        assert_eq!(config.session, SessionSettings::default());
        assert_eq!(config.deepgram.speak_voice, "aura-asteria-en");
    }

    #[test]
    #[serial]
    fn test_config_from_env_deepgram_provider() {
        clear_env_vars();
        unsafe {
            env::set_var("BOT_PROVIDER", "DeepGram");
            env::set_var("DEEPGRAM_API_KEY", "test-deepgram-key");
            env::set_var("DEEPGRAM_LISTEN_MODEL", "nova-3");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.provider, AgentProvider::Deepgram);
        assert_eq!(config.deepgram.listen_model, "nova-3");
        assert!(config.openai.api_key.is_none());
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_session_values() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:9000");
            env::set_var("RUST_LOG", "debug");
            env::set_var("MAX_BINARY_MESSAGE_SIZE", "32000");
            env::set_var("MIN_BINARY_MESSAGE_SIZE", "4000");
            env::set_var("AUDIO_FLUSH_DELAY_MS", "250");
            env::set_var("NO_INPUT_TIMEOUT", "10000");
            env::set_var("DTMF_TERMINATOR", "*");
            env::set_var("DTMF_MAX_DIGITS", "6");
            env::set_var("DTMF_INTER_DIGIT_TIMEOUT_MS", "0");
            env::set_var("INITIAL_GREETING", "Good morning");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:9000");
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.session.max_binary_message_size, 32_000);
        assert_eq!(config.session.min_binary_message_size, 4_000);
        assert_eq!(config.session.flush_delay, Duration::from_millis(250));
        assert_eq!(config.session.no_input_timeout, Duration::from_secs(10));
        assert_eq!(config.session.dtmf.terminator, Some('*'));
        assert_eq!(config.session.dtmf.max_digits, Some(6));
        assert_eq!(config.session.dtmf.inter_digit_timeout, None);
        assert_eq!(config.initial_greeting, "Good morning");
    }

    #[test]
    #[serial]
    fn test_config_dtmf_terminator_can_be_disabled() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("DTMF_TERMINATOR", "none");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.session.dtmf.terminator, None);

        unsafe {
            env::set_var("DTMF_TERMINATOR", "##");
        }
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var, _) if var == "DTMF_TERMINATOR"));
    }

    #[test]
    #[serial]
    fn test_config_rejects_min_size_above_max_size() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("MAX_BINARY_MESSAGE_SIZE", "1000");
            env::set_var("MIN_BINARY_MESSAGE_SIZE", "2000");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, msg) => {
                assert_eq!(var, "MIN_BINARY_MESSAGE_SIZE");
                assert!(msg.contains("min 2000"));
            }
            _ => panic!("Expected InvalidValue for frame thresholds"),
        }
    }

    #[test]
    #[serial]
    fn test_config_rejects_non_numeric_and_zero_sizes() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("NO_INPUT_TIMEOUT", "soon");
        }
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var, _) if var == "NO_INPUT_TIMEOUT"));

        unsafe {
            env::remove_var("NO_INPUT_TIMEOUT");
            env::set_var("MAX_BINARY_MESSAGE_SIZE", "0");
        }
        let err = Config::from_env().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue(var, _) if var == "MAX_BINARY_MESSAGE_SIZE")
        );
    }

    #[test]
    #[serial]
    fn test_config_invalid_bind_address() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("BIND_ADDRESS", "not-a-valid-address");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BIND_ADDRESS"),
            _ => panic!("Expected InvalidValue for BIND_ADDRESS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }

    #[test]
    #[serial]
    fn test_config_unknown_provider() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("BOT_PROVIDER", "gemini");
        }

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var, _) if var == "BOT_PROVIDER"));
    }

    #[test]
    #[serial]
    fn test_config_missing_openai_key() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => {
                assert!(msg.contains("OPENAI_API_KEY"));
            }
            _ => panic!("Expected MissingVar for OPENAI_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_deepgram_key() {
        clear_env_vars();
        unsafe {
            env::set_var("BOT_PROVIDER", "deepgram");
            env::set_var("OPENAI_API_KEY", "irrelevant");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => {
                assert!(msg.contains("DEEPGRAM_API_KEY"));
            }
            _ => panic!("Expected MissingVar for DEEPGRAM_API_KEY"),
        }
    }
}
