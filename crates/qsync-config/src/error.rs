use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse qsync config: {0}")]
    Toml(String),
    #[error("invalid value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Toml(redact_user_values(err.message()))
    }
}

/// Strip user-supplied scalars out of a toml/serde message.
///
/// Parse errors end up in logs and CLI output; config values (remote cache tokens, paths) must
/// not.
pub(crate) fn redact_user_values(message: &str) -> String {
    static DOUBLE: OnceLock<regex::Regex> = OnceLock::new();
    static SINGLE: OnceLock<regex::Regex> = OnceLock::new();
    static BACKTICK: OnceLock<regex::Regex> = OnceLock::new();

    let double = DOUBLE
        .get_or_init(|| regex::Regex::new(r#""(?:\\.|[^"\\])*""#).expect("valid regex"));
    let single = SINGLE
        .get_or_init(|| regex::Regex::new(r"'(?:\\.|[^'\\])*'").expect("valid regex"));
    let backtick =
        BACKTICK.get_or_init(|| regex::Regex::new(r"`[^`]*`").expect("valid regex"));

    let out = double.replace_all(message, r#""<redacted>""#);
    let mut out = single.replace_all(&out, "'<redacted>'").into_owned();

    // Only the part before `, expected ...` carries user content; the rest names schema items.
    let user_controlled = ["unknown field", "unknown variant", "invalid type:", "invalid value:"]
        .iter()
        .any(|marker| out.contains(marker));
    if user_controlled {
        let boundary = out.find(", expected").unwrap_or(out.len());
        let head = backtick.replace_all(&out[..boundary], "`<redacted>`").into_owned();
        out = format!("{head}{}", &out[boundary..]);
    }
    out
}
