//! Client personas for yt-dlp.
//!
//! A persona is one way of presenting ourselves to the origin: user agent,
//! extra headers, player client and network knobs. The acquirer tries each
//! persona of a [`PersonaSet`] in order until one download succeeds.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::error::{MediaError, MediaResult};

const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ANDROID_UA: &str = "com.google.android.youtube/19.09.37 (Linux; U; Android 14) gzip";
const IOS_UA: &str = "com.google.ios.youtube/19.09.3 (iPhone16,2; U; CPU iOS 17_4 like Mac OS X)";
const TV_UA: &str = "Mozilla/5.0 (PlayStation; PlayStation 5/2.26) AppleWebKit/605.1.15 (KHTML, like Gecko)";

/// One validated client identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientPersona {
    name: String,
    user_agent: String,
    headers: Vec<(String, String)>,
    player_client: Option<String>,
    socket_timeout: Duration,
    attempt_timeout: Duration,
    retries: u32,
    force_ipv4: bool,
}

impl ClientPersona {
    pub fn builder(name: impl Into<String>) -> ClientPersonaBuilder {
        ClientPersonaBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn player_client(&self) -> Option<&str> {
        self.player_client.as_deref()
    }

    /// Upper bound for one yt-dlp invocation with this persona.
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// yt-dlp arguments expressing this persona.
    pub fn yt_dlp_args(&self) -> Vec<String> {
        let mut args = vec!["--user-agent".to_string(), self.user_agent.clone()];

        for (name, value) in &self.headers {
            args.push("--add-header".to_string());
            args.push(format!("{}:{}", name, value));
        }

        if let Some(client) = &self.player_client {
            args.push("--extractor-args".to_string());
            args.push(format!("youtube:player_client={}", client));
        }

        args.push("--socket-timeout".to_string());
        args.push(self.socket_timeout.as_secs().max(1).to_string());
        args.push("--retries".to_string());
        args.push(self.retries.to_string());

        if self.force_ipv4 {
            args.push("--force-ipv4".to_string());
        }

        args
    }
}

/// Builder for [`ClientPersona`]; all checks run in [`ClientPersonaBuilder::build`].
#[derive(Debug, Clone)]
pub struct ClientPersonaBuilder {
    name: String,
    user_agent: String,
    headers: Vec<(String, String)>,
    player_client: Option<String>,
    socket_timeout: Duration,
    attempt_timeout: Duration,
    retries: u32,
    force_ipv4: bool,
}

impl ClientPersonaBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_agent: DESKTOP_UA.to_string(),
            headers: Vec::new(),
            player_client: None,
            socket_timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(600),
            retries: 3,
            force_ipv4: false,
        }
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn player_client(mut self, client: impl Into<String>) -> Self {
        self.player_client = Some(client.into());
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn force_ipv4(mut self, force: bool) -> Self {
        self.force_ipv4 = force;
        self
    }

    pub fn build(self) -> MediaResult<ClientPersona> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(MediaError::invalid_persona("persona name is empty"));
        }
        if self.user_agent.trim().is_empty() || has_line_break(&self.user_agent) {
            return Err(MediaError::invalid_persona(format!(
                "{}: user agent must be a non-empty single line",
                name
            )));
        }
        for (header, value) in &self.headers {
            if !is_http_token(header) {
                return Err(MediaError::invalid_persona(format!(
                    "{}: invalid header name '{}'",
                    name, header
                )));
            }
            if has_line_break(value) {
                return Err(MediaError::invalid_persona(format!(
                    "{}: header '{}' value contains a line break",
                    name, header
                )));
            }
        }
        if let Some(client) = &self.player_client {
            if client.is_empty() || !client.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ',') {
                return Err(MediaError::invalid_persona(format!(
                    "{}: invalid player client '{}'",
                    name, client
                )));
            }
        }
        if self.socket_timeout.is_zero() || self.attempt_timeout.is_zero() {
            return Err(MediaError::invalid_persona(format!(
                "{}: timeouts must be non-zero",
                name
            )));
        }

        Ok(ClientPersona {
            name,
            user_agent: self.user_agent,
            headers: self.headers,
            player_client: self.player_client,
            socket_timeout: self.socket_timeout,
            attempt_timeout: self.attempt_timeout,
            retries: self.retries,
            force_ipv4: self.force_ipv4,
        })
    }
}

fn has_line_break(s: &str) -> bool {
    s.contains('\r') || s.contains('\n')
}

/// RFC 7230 `token`.
fn is_http_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c))
}

/// Persona as written in a JSON persona file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaSpec {
    pub name: String,
    pub user_agent: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub player_client: Option<String>,
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub force_ipv4: bool,
}

fn default_socket_timeout_secs() -> u64 {
    30
}
fn default_attempt_timeout_secs() -> u64 {
    600
}
fn default_retries() -> u32 {
    3
}

impl PersonaSpec {
    pub fn into_persona(self) -> MediaResult<ClientPersona> {
        let mut builder = ClientPersona::builder(self.name)
            .user_agent(self.user_agent)
            .socket_timeout(Duration::from_secs(self.socket_timeout_secs))
            .attempt_timeout(Duration::from_secs(self.attempt_timeout_secs))
            .retries(self.retries)
            .force_ipv4(self.force_ipv4);
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }
        if let Some(client) = self.player_client {
            builder = builder.player_client(client);
        }
        builder.build()
    }
}

/// Ordered, non-empty list of personas with unique names.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaSet {
    personas: Vec<ClientPersona>,
}

impl PersonaSet {
    pub fn new(personas: Vec<ClientPersona>) -> MediaResult<Self> {
        if personas.is_empty() {
            return Err(MediaError::invalid_persona("persona set is empty"));
        }
        let mut seen = HashSet::new();
        for persona in &personas {
            if !seen.insert(persona.name()) {
                return Err(MediaError::invalid_persona(format!(
                    "duplicate persona name '{}'",
                    persona.name()
                )));
            }
        }
        Ok(Self { personas })
    }

    /// Parse a JSON array of [`PersonaSpec`].
    pub fn from_json(json: &str) -> MediaResult<Self> {
        let specs: Vec<PersonaSpec> = serde_json::from_str(json)?;
        let personas = specs
            .into_iter()
            .map(PersonaSpec::into_persona)
            .collect::<MediaResult<Vec<_>>>()?;
        Self::new(personas)
    }

    pub async fn load(path: impl AsRef<Path>) -> MediaResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&content)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ClientPersona> {
        self.personas.iter()
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn first(&self) -> &ClientPersona {
        // Non-empty by construction
        &self.personas[0]
    }
}

impl<'a> IntoIterator for &'a PersonaSet {
    type Item = &'a ClientPersona;
    type IntoIter = std::slice::Iter<'a, ClientPersona>;

    fn into_iter(self) -> Self::IntoIter {
        self.personas.iter()
    }
}

impl Default for PersonaSet {
    fn default() -> Self {
        Self {
            personas: default_personas(),
        }
    }
}

/// Built-in personas: desktop web, then the mobile and TV clients.
pub fn default_personas() -> Vec<ClientPersona> {
    let browser = |name: &str, ua: &str, client: &str| ClientPersona {
        name: name.to_string(),
        user_agent: ua.to_string(),
        headers: vec![
            (
                "Accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            ),
            ("Accept-Language".to_string(), "en-US,en;q=0.5".to_string()),
        ],
        player_client: Some(client.to_string()),
        socket_timeout: Duration::from_secs(30),
        attempt_timeout: Duration::from_secs(600),
        retries: 3,
        force_ipv4: false,
    };

    vec![
        browser("web", DESKTOP_UA, "web"),
        ClientPersona {
            headers: Vec::new(),
            force_ipv4: true,
            ..browser("android", ANDROID_UA, "android")
        },
        ClientPersona {
            headers: Vec::new(),
            force_ipv4: true,
            ..browser("ios", IOS_UA, "ios")
        },
        browser("tv_embedded", TV_UA, "tv_embedded"),
    ]
}
