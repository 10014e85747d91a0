use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const DOTENV_FILE_NAME: &str = ".env";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_ATTEMPTS: u32 = 60;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Layered key/value configuration.
///
/// Lookup order is explicit overrides, then the process environment (unless
/// the settings are isolated), then values parsed from a `.env` file. Blank
/// values and template placeholders (`your_...`) count as missing.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    overrides: BTreeMap<String, String>,
    file_values: BTreeMap<String, String>,
    read_process_env: bool,
}

impl Settings {
    /// Process environment plus `./.env` when present.
    pub fn from_env() -> Self {
        let mut settings = Self {
            read_process_env: true,
            ..Self::default()
        };
        let dotenv = Path::new(DOTENV_FILE_NAME);
        if dotenv.is_file() {
            settings.file_values = parse_dotenv(dotenv);
        }
        settings
    }

    /// Only the given pairs; the process environment is never consulted.
    pub fn isolated<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            overrides: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_dotenv(mut self, path: &Path) -> Self {
        for (key, value) in parse_dotenv(path) {
            self.file_values.entry(key).or_insert(value);
        }
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.overrides.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(key).and_then(|value| usable(value)) {
            return Some(value);
        }
        if self.read_process_env {
            if let Some(value) = std::env::var(key).ok().and_then(|value| usable(&value)) {
                return Some(value);
            }
        }
        self.file_values.get(key).and_then(|value| usable(value))
    }

    pub fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn api_base(&self, key: &str, default: &str) -> String {
        self.get(key)
            .map(|value| value.trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| default.trim_end_matches('/').to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        self.get("THUMBFORGE_POLL_INTERVAL_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    pub fn poll_attempts(&self) -> u32 {
        self.get("THUMBFORGE_POLL_ATTEMPTS")
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_POLL_ATTEMPTS)
    }

    pub fn request_timeout(&self) -> Duration {
        self.get("THUMBFORGE_REQUEST_TIMEOUT_S")
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }
}

fn usable(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with("your_") {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn parse_dotenv(path: &Path) -> BTreeMap<String, String> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    parse_dotenv_str(&content)
}

pub fn parse_dotenv_str(content: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for raw_line in content.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix("export ") {
            line = stripped.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim().to_string();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
                || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
            {
                value = value[1..value.len() - 1].to_string();
            }
        }
        vars.insert(key.to_string(), value);
    }
    vars
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{parse_dotenv_str, Settings, DEFAULT_POLL_ATTEMPTS};

    #[test]
    fn dotenv_parser_handles_comments_exports_and_quotes() {
        let vars = parse_dotenv_str(
            "# keys\nexport OPENAI_API_KEY=\"sk-test\"\nFAL_KEY='fal'\n\nBROKEN\n =nokey\nPLAIN=value = with equals\n",
        );
        assert_eq!(vars.get("OPENAI_API_KEY").map(String::as_str), Some("sk-test"));
        assert_eq!(vars.get("FAL_KEY").map(String::as_str), Some("fal"));
        assert_eq!(
            vars.get("PLAIN").map(String::as_str),
            Some("value = with equals")
        );
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn placeholder_and_blank_values_count_as_missing() {
        let settings = Settings::isolated([
            ("OPENAI_API_KEY", "your_openai_key_here"),
            ("GOOGLE_API_KEY", "   "),
            ("GEMINI_API_KEY", "g-123"),
        ]);
        assert_eq!(settings.get("OPENAI_API_KEY"), None);
        assert_eq!(
            settings.first(&["GOOGLE_API_KEY", "GEMINI_API_KEY"]),
            Some("g-123".to_string())
        );
    }

    #[test]
    fn dotenv_values_fill_gaps_after_overrides() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(".env");
        std::fs::write(&path, "FAL_KEY=from-file\nREPLICATE_API_TOKEN=r8\n")?;
        let settings = Settings::isolated([("FAL_KEY", "from-override")]).with_dotenv(&path);
        assert_eq!(settings.get("FAL_KEY").as_deref(), Some("from-override"));
        assert_eq!(settings.get("REPLICATE_API_TOKEN").as_deref(), Some("r8"));
        Ok(())
    }

    #[test]
    fn polling_knobs_parse_with_defaults() {
        let defaults = Settings::isolated(Vec::<(String, String)>::new());
        assert_eq!(defaults.poll_interval(), Duration::from_secs(2));
        assert_eq!(defaults.poll_attempts(), DEFAULT_POLL_ATTEMPTS);

        let tuned = Settings::isolated([
            ("THUMBFORGE_POLL_INTERVAL_MS", "0"),
            ("THUMBFORGE_POLL_ATTEMPTS", "3"),
            ("THUMBFORGE_REQUEST_TIMEOUT_S", "1.5"),
        ]);
        assert_eq!(tuned.poll_interval(), Duration::ZERO);
        assert_eq!(tuned.poll_attempts(), 3);
        assert_eq!(tuned.request_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn api_base_trims_trailing_slash() {
        let settings = Settings::isolated([("FAL_API_BASE", "http://127.0.0.1:9000/")]);
        assert_eq!(
            settings.api_base("FAL_API_BASE", "https://queue.fal.run"),
            "http://127.0.0.1:9000"
        );
        assert_eq!(
            settings.api_base("FREEPIK_API_BASE", "https://api.freepik.com/"),
            "https://api.freepik.com"
        );
    }
}
