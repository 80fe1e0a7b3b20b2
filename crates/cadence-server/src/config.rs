//! Agent configuration loading from file and environment variables.

use cadence_voice::{AudioConfig, LiveKitConfig, SttConfig, TtsConfig, DEFAULT_QUEUE_CAPACITY};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Conversation backend connection.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Room service credentials and agent identity.
    #[serde(default)]
    pub livekit: LiveKitConfig,

    /// Remote transcription endpoint.
    #[serde(default)]
    pub asr: SttConfig,

    /// Remote synthesis endpoint.
    #[serde(default)]
    pub tts: TtsConfig,

    /// Capture format and voice-activity detection.
    #[serde(default)]
    pub audio: AudioConfig,

    /// Session sizing and housekeeping intervals.
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Things worth reporting from loading, held until logging is set up.
    #[serde(skip)]
    pub notices: Vec<ConfigNotice>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigNotice {
    FileNotFound(String),
    UnparseableOverride { key: String, value: String },
}

#[derive(Clone, Deserialize)]
pub struct BackendConfig {
    /// WebSocket URL of the conversation backend.
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Shared secret presented on connect. Empty disables authentication.
    #[serde(default)]
    pub agent_secret: String,
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("agent_secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Capacity of each session's playback queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How often sessions with a dead or empty room are removed.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How often the backend connection is checked and repaired.
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
}

impl SessionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "cadence_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_backend_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_liveness_interval_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            agent_secret: String::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
            liveness_interval_secs: default_liveness_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The command line could not be understood.
    #[error("{0}")]
    Usage(String),
}

pub const USAGE: &str = "\
usage: cadence-server [CONFIG_PATH]

Runs the voice agent. CONFIG_PATH defaults to $CADENCE_CONFIG_PATH, then
config.toml; a missing file means built-in defaults. Environment variables
such as BACKEND_WS_URL, AGENT_SECRET, LIVEKIT_URL, ASR_URL and TTS_URL
override file values.

options:
  -h, --help    print this help and exit";

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Help,
    Run {
        path: Option<String>,
        source: &'static str,
    },
}

/// Reads the command line (without the program name). The config path comes
/// from the first argument, then `CADENCE_CONFIG_PATH`.
///
/// # Errors
///
/// Returns `ConfigError::Usage` for unknown options or extra arguments.
pub fn parse_invocation<I, F>(args: I, lookup: F) -> Result<Invocation, ConfigError>
where
    I: IntoIterator<Item = String>,
    F: Fn(&str) -> Option<String>,
{
    let mut args = args.into_iter();
    let first = args.next();
    if let Some(extra) = args.next() {
        return Err(ConfigError::Usage(format!("unexpected argument: {extra}")));
    }

    match first {
        Some(arg) if arg == "-h" || arg == "--help" => return Ok(Invocation::Help),
        Some(arg) if arg.starts_with('-') => {
            return Err(ConfigError::Usage(format!("unknown option: {arg}")));
        }
        Some(arg) if !arg.trim().is_empty() => {
            return Ok(Invocation::Run {
                path: Some(arg),
                source: "cli-arg",
            });
        }
        _ => {}
    }

    if let Some(path) = lookup("CADENCE_CONFIG_PATH").filter(|p| !p.trim().is_empty()) {
        return Ok(Invocation::Run {
            path: Some(path),
            source: "env-var",
        });
    }

    Ok(Invocation::Run {
        path: None,
        source: "default",
    })
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides (see [`apply_overrides`]).
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config {
                notices: vec![ConfigNotice::FileNotFound(p.to_string())],
                ..Config::default()
            },
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies overrides looked up by variable name.
///
/// - `BACKEND_WS_URL`, `AGENT_SECRET`
/// - `LIVEKIT_URL`, `LIVEKIT_API_KEY`, `LIVEKIT_API_SECRET`
/// - `ASR_URL`, `ASR_MODEL`, `ASR_LANGUAGE`
/// - `TTS_URL`, `TTS_MODEL`, `TTS_VOICE`, `TTS_SAMPLE_RATE`
/// - `SAMPLE_RATE`, `CHANNELS`, `VAD_THRESHOLD`, `SILENCE_DURATION_MS`
/// - `CADENCE_LOG_LEVEL`, `CADENCE_LOG_JSON` ("true" or "1" to enable)
///
/// Numeric values that fail to parse are ignored and recorded as notices.
pub fn apply_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |key: &str, target: &mut String| {
        if let Some(value) = lookup(key) {
            *target = value;
        }
    };

    string("BACKEND_WS_URL", &mut config.backend.url);
    string("AGENT_SECRET", &mut config.backend.agent_secret);
    string("LIVEKIT_URL", &mut config.livekit.url);
    string("LIVEKIT_API_KEY", &mut config.livekit.api_key);
    string("LIVEKIT_API_SECRET", &mut config.livekit.api_secret);
    string("ASR_URL", &mut config.asr.url);
    string("ASR_MODEL", &mut config.asr.model);
    string("ASR_LANGUAGE", &mut config.asr.language);
    string("TTS_URL", &mut config.tts.url);
    string("TTS_MODEL", &mut config.tts.model);
    string("TTS_VOICE", &mut config.tts.voice);
    string("CADENCE_LOG_LEVEL", &mut config.logging.level);

    let rejected = [
        parsed(&lookup, "TTS_SAMPLE_RATE", &mut config.tts.sample_rate),
        parsed(&lookup, "SAMPLE_RATE", &mut config.audio.sample_rate),
        parsed(&lookup, "CHANNELS", &mut config.audio.channels),
        parsed(&lookup, "VAD_THRESHOLD", &mut config.audio.vad_threshold),
        parsed(&lookup, "SILENCE_DURATION_MS", &mut config.audio.silence_duration_ms),
    ];
    config.notices.extend(rejected.into_iter().flatten());

    if let Some(json) = lookup("CADENCE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}

fn parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Option<ConfigNotice>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => {
            *target = value;
            None
        }
        Err(_) => Some(ConfigNotice::UnparseableOverride {
            key: key.to_string(),
            value: raw,
        }),
    }
}

/// Masks a secret for logging: first and last two characters only.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    match chars.len() {
        0 => "(not set)".to_string(),
        n if n <= 4 => "****".to_string(),
        n => {
            let head: String = chars[..2].iter().collect();
            let tail: String = chars[n - 2..].iter().collect();
            format!("{head}****{tail}")
        }
    }
}

impl Config {
    /// Logs the load notices and the effective configuration with secrets
    /// masked.
    pub fn log_summary(&self) {
        for notice in &self.notices {
            match notice {
                ConfigNotice::FileNotFound(path) => {
                    tracing::info!(path = %path, "config file not found, using defaults");
                }
                ConfigNotice::UnparseableOverride { key, value } => {
                    tracing::warn!(key = %key, value = %value, "ignoring unparseable override");
                }
            }
        }
        tracing::info!(
            backend_url = %self.backend.url,
            agent_secret = %mask_secret(&self.backend.agent_secret),
            livekit_url = %self.livekit.url,
            livekit_api_key = %mask_secret(&self.livekit.api_key),
            livekit_api_secret = %mask_secret(&self.livekit.api_secret),
            asr_url = %self.asr.url,
            asr_model = %self.asr.model,
            tts_url = %self.tts.url,
            tts_model = %self.tts.model,
            tts_voice = %self.tts.voice,
            tts_sample_rate = self.tts.sample_rate,
            sample_rate = self.audio.sample_rate,
            channels = self.audio.channels,
            vad_threshold = self.audio.vad_threshold,
            silence_duration_ms = self.audio.silence_duration_ms,
            "effective configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_local_services() {
        let config = Config::default();
        assert_eq!(config.backend.url, "ws://localhost:8080/ws");
        assert!(config.backend.agent_secret.is_empty());
        assert_eq!(config.livekit.url, "ws://localhost:7880");
        assert_eq!(config.asr.model, "whisper-1");
        assert_eq!(config.tts.voice, "af_heart");
        assert_eq!(config.tts.sample_rate, 24_000);
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.session.queue_capacity, 100);
        assert_eq!(config.session.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.session.liveness_interval(), Duration::from_secs(5));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.session.queue_capacity, 100);
        assert_eq!(
            config.notices,
            vec![ConfigNotice::FileNotFound(path.to_str().unwrap().to_string())]
        );
    }

    #[test]
    fn file_sections_are_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[backend]
url = "wss://backend.example/ws"
agent_secret = "s3cret-value"

[tts]
voice = "bf_emma"
sample_rate = 22050

[session]
queue_capacity = 8
"#
        )
        .unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.backend.url, "wss://backend.example/ws");
        assert_eq!(config.backend.agent_secret, "s3cret-value");
        assert_eq!(config.tts.voice, "bf_emma");
        assert_eq!(config.tts.sample_rate, 22_050);
        assert_eq!(config.tts.model, "kokoro");
        assert_eq!(config.session.queue_capacity, 8);
        assert_eq!(config.session.sweep_interval_secs, 10);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[backend\nurl = ").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        apply_overrides(
            &mut config,
            env(&[
                ("BACKEND_WS_URL", "ws://10.0.0.2:9000/ws"),
                ("AGENT_SECRET", "abc"),
                ("LIVEKIT_API_KEY", "prodkey"),
                ("ASR_LANGUAGE", "de"),
                ("TTS_SAMPLE_RATE", "16000"),
                ("CHANNELS", "2"),
                ("VAD_THRESHOLD", "0.05"),
                ("SILENCE_DURATION_MS", "1200"),
                ("CADENCE_LOG_JSON", "1"),
            ]),
        );

        assert_eq!(config.backend.url, "ws://10.0.0.2:9000/ws");
        assert_eq!(config.backend.agent_secret, "abc");
        assert_eq!(config.livekit.api_key, "prodkey");
        assert_eq!(config.asr.language, "de");
        assert_eq!(config.tts.sample_rate, 16_000);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.audio.vad_threshold, 0.05);
        assert_eq!(config.audio.silence_duration_ms, 1_200);
        assert!(config.logging.json);
    }

    #[test]
    fn unparseable_numbers_keep_previous_value() {
        let mut config = Config::default();
        apply_overrides(
            &mut config,
            env(&[("SAMPLE_RATE", "fast"), ("CHANNELS", "-1")]),
        );
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(
            config.notices,
            vec![
                ConfigNotice::UnparseableOverride {
                    key: "SAMPLE_RATE".to_string(),
                    value: "fast".to_string(),
                },
                ConfigNotice::UnparseableOverride {
                    key: "CHANNELS".to_string(),
                    value: "-1".to_string(),
                },
            ]
        );
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn help_flags_are_recognised() {
        assert_eq!(parse_invocation(args(&["--help"]), env(&[])).unwrap(), Invocation::Help);
        assert_eq!(parse_invocation(args(&["-h"]), env(&[])).unwrap(), Invocation::Help);
    }

    #[test]
    fn unknown_options_are_rejected() {
        match parse_invocation(args(&["--verbose"]), env(&[])) {
            Err(ConfigError::Usage(msg)) => assert!(msg.contains("--verbose")),
            other => panic!("Expected usage error, got {:?}", other),
        }
        assert!(matches!(
            parse_invocation(args(&["a.toml", "b.toml"]), env(&[])),
            Err(ConfigError::Usage(_))
        ));
    }

    #[test]
    fn config_path_prefers_argument_then_env() {
        let from_env = env(&[("CADENCE_CONFIG_PATH", "/etc/cadence.toml")]);
        assert_eq!(
            parse_invocation(args(&["local.toml"]), &from_env).unwrap(),
            Invocation::Run {
                path: Some("local.toml".to_string()),
                source: "cli-arg",
            }
        );
        assert_eq!(
            parse_invocation(args(&[]), &from_env).unwrap(),
            Invocation::Run {
                path: Some("/etc/cadence.toml".to_string()),
                source: "env-var",
            }
        );
        assert_eq!(
            parse_invocation(args(&["  "]), env(&[])).unwrap(),
            Invocation::Run {
                path: None,
                source: "default",
            }
        );
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret(""), "(not set)");
        assert_eq!(mask_secret("abcd"), "****");
        assert_eq!(mask_secret("abcdef"), "ab****ef");
    }

    #[test]
    fn debug_redacts_agent_secret() {
        let backend = BackendConfig {
            url: "ws://x".to_string(),
            agent_secret: "super-secret".to_string(),
        };
        let debug = format!("{:?}", backend);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
