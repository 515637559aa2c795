use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_LOGIN_URL: &str = "/login";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoPollConfig {
    pub transcription: PollPolicy,
    pub analysis: PollPolicy,
}

impl Default for VideoPollConfig {
    fn default() -> Self {
        Self {
            transcription: PollPolicy::new(Duration::from_secs(2), Duration::from_secs(600)),
            analysis: PollPolicy::new(Duration::from_secs(2), Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub credentials_path: PathBuf,
    pub login_url: String,
    pub video: VideoPollConfig,
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            credentials_path: default_credentials_path(),
            login_url: DEFAULT_LOGIN_URL.to_string(),
            video: VideoPollConfig::default(),
        }
    }

    pub fn with_credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_path = path;
        self
    }

    pub fn with_login_url(mut self, login_url: impl Into<String>) -> Self {
        self.login_url = login_url.into();
        self
    }

    pub fn with_video_polling(mut self, video: VideoPollConfig) -> Self {
        self.video = video;
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

pub fn normalize_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url, path.trim_start_matches('/'))
}

pub fn default_credentials_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".nurture").join("credentials.json");
    }

    PathBuf::from("nurture-credentials.json")
}
