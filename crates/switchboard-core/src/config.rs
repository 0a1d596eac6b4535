use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_PORT: u16 = 18890;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Hard cap on webhook request bodies.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 1024 * 1024;
/// Webhook body read timeout.
pub const WEBHOOK_BODY_TIMEOUT_SECS: u64 = 30;
/// Per-attachment media download cap unless an account overrides it.
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 8 * 1024 * 1024;

/// Top-level config (switchboard.toml + SWITCHBOARD_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Root for all durable state: delivery queue, cron store, pairing store,
    /// downloaded media.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
    #[serde(default)]
    pub identity_links: Vec<IdentityLink>,
    #[serde(default)]
    pub routing: Vec<RouteRule>,
    #[serde(default)]
    pub cross_context: CrossContextConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub agent_backend: AgentBackendConfig,
}

/// The opaque language-model collaborator the gateway drives turns against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentBackendConfig {
    /// HTTP endpoint accepting turn requests. Unset means turns resolve to
    /// no payloads (ingest-only deployments).
    pub endpoint: Option<String>,
    pub model: Option<String>,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            state_dir: default_state_dir(),
            session: SessionConfig::default(),
            agents: AgentsConfig::default(),
            channels: BTreeMap::new(),
            identity_links: Vec::new(),
            routing: Vec::new(),
            cross_context: CrossContextConfig::default(),
            cron: CronConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            agent_backend: AgentBackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Store path template. `{agentId}` is substituted per agent.
    #[serde(default = "default_session_store")]
    pub store: String,
    /// Mirror delivered replies into the session transcript file.
    #[serde(default = "bool_true")]
    pub mirror_transcript: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: default_session_store(),
            mirror_transcript: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Agent used when no routing rule matches.
    #[serde(default = "default_agent_id")]
    pub default: String,
    /// Per-agent overrides, keyed by agent id.
    #[serde(default)]
    pub entries: BTreeMap<String, AgentEntry>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default: default_agent_id(),
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentEntry {
    /// Per-agent session store override (same `{agentId}` templating).
    pub session_store: Option<String>,
    /// Per-agent heartbeat override; `None` falls back to the global block.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Workspace directory holding HEARTBEAT.md.
    pub workspace: Option<String>,
}

// ── Channel configuration ─────────────────────────────────────────────────────

/// DM gate evaluated before any message from a direct chat is processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    Disabled,
    Allowlist,
    #[default]
    Pairing,
    Open,
}

/// Group gate evaluated before any message from a group chat is processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    Disabled,
    #[default]
    Allowlist,
    Open,
}

/// When an ack reaction is applied to an accepted inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckScope {
    Always,
    GroupMentions,
    GroupDirectMentions,
    #[default]
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckReactionConfig {
    #[serde(default = "default_ack_emoji")]
    pub emoji: String,
    #[serde(default)]
    pub scope: AckScope,
    /// Remove the reaction once the reply has been sent.
    #[serde(default)]
    pub remove_after_reply: bool,
}

impl Default for AckReactionConfig {
    fn default() -> Self {
        Self {
            emoji: default_ack_emoji(),
            scope: AckScope::default(),
            remove_after_reply: false,
        }
    }
}

/// How the channel's webhook endpoint authenticates requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookAuthMode {
    /// Constant-time comparison of a shared secret in query or header.
    #[default]
    SharedSecret,
    /// HMAC-SHA1 over URL + sorted POST params, base64 (X-Twilio-Signature).
    Twilio,
    /// HMAC-SHA256 over URL + nonce (X-Plivo-Signature-V2).
    PlivoV2,
    /// HMAC-SHA256 over base URL + nonce + sorted POST params (V3).
    PlivoV3,
    /// Ed25519 over `timestamp|rawBody` (telnyx-signature-ed25519).
    Telnyx,
    /// Operator explicitly opted out of authentication.
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookAuthConfig {
    #[serde(default)]
    pub mode: WebhookAuthMode,
    /// Shared secret or HMAC signing key, depending on mode.
    pub secret: Option<String>,
    /// Base64 Ed25519 public key (Telnyx).
    pub public_key: Option<String>,
    /// Proxy IPs whose forwarded headers may be used for signature
    /// reconstruction.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Hosts accepted from forwarded headers when rebuilding the signed URL.
    #[serde(default)]
    pub forwarded_host_allowlist: Vec<String>,
}

/// One named credential set on a provider. A provider may host several
/// accounts (e.g. two bots), each with its own webhook secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    pub token: Option<String>,
    pub password: Option<String>,
    /// Overrides the channel-level webhook secret for this account.
    pub webhook_secret: Option<String>,
    /// Overrides [`DEFAULT_MAX_ATTACHMENT_BYTES`].
    pub max_attachment_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
    #[serde(default)]
    pub dm_policy: DmPolicy,
    #[serde(default)]
    pub group_policy: GroupPolicy,
    /// DM allowlist (sender handles / ids).
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Group allowlist (chat guids / ids).
    #[serde(default)]
    pub group_allow_from: Vec<String>,
    /// Mention-gate patterns (regex). Empty means no mention requirement.
    #[serde(default)]
    pub mention_patterns: Vec<String>,
    /// Senders authorised for control commands.
    #[serde(default)]
    pub owners: Vec<String>,
    /// When set, group allowlists also grant command authorization.
    #[serde(default)]
    pub use_access_groups: bool,
    #[serde(default)]
    pub ack_reaction: Option<AckReactionConfig>,
    /// REST endpoint the generic push adapter sends outbound messages to
    /// (bridges like BlueBubbles expose one). Channels with a native adapter
    /// leave this unset.
    pub outbound_url: Option<String>,
    /// Per-channel text chunk limit; `None` defers to the adapter default.
    pub text_chunk_limit: Option<usize>,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
    /// Most-recent entries kept after a history backfill merge.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub webhook: WebhookAuthConfig,
    /// Slack: channel ids treated as multi-party DMs (promoted to group scope).
    #[serde(default)]
    pub mpim: Vec<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            accounts: BTreeMap::new(),
            dm_policy: DmPolicy::default(),
            group_policy: GroupPolicy::default(),
            allow_from: Vec::new(),
            group_allow_from: Vec::new(),
            mention_patterns: Vec::new(),
            owners: Vec::new(),
            use_access_groups: false,
            ack_reaction: None,
            outbound_url: None,
            text_chunk_limit: None,
            max_attachment_bytes: default_max_attachment_bytes(),
            history_limit: default_history_limit(),
            webhook: WebhookAuthConfig::default(),
            mpim: Vec::new(),
        }
    }
}

// ── Identity links & routing ──────────────────────────────────────────────────

/// Maps several surface identities to one logical peer so conversations on
/// different channels share a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityLink {
    /// The logical peer id used in session keys after rewriting.
    pub logical: String,
    /// The channel the shared session is keyed under.
    pub channel: String,
    /// Surface identities in `channel:peerId` form.
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Most-specific-match routing rule: channel + account + peer beats
/// channel + account beats channel alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub channel: Option<String>,
    pub account_id: Option<String>,
    pub peer: Option<String>,
    pub agent: String,
}

/// Policy for tool-initiated sends that cross provider/channel boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossContextMode {
    /// Reject sends to a different channel than the invocation context.
    Deny,
    /// Allow, prepending a disclosure marker to the text.
    #[default]
    Disclose,
    /// Allow silently.
    Allow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrossContextConfig {
    #[serde(default)]
    pub mode: CrossContextMode,
    /// Attach a provider-native component block instead of a text marker
    /// where the channel supports it.
    #[serde(default)]
    pub prefer_components: bool,
}

// ── Cron & heartbeat ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Cron store file; defaults to `<state_dir>/cron/jobs.json`.
    pub store: Option<String>,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            store: None,
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

/// Quiet-hours window in a named timezone. Outside `[start, end)` heartbeat
/// runs are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHours {
    /// "HH:MM" local to `timezone`.
    pub start: String,
    pub end: String,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval_minutes")]
    pub interval_minutes: u64,
    /// Session the heartbeat binds to; defaults to the agent's main session.
    pub session: Option<String>,
    /// Delivery target expression: "none", "last", or `channel:to`.
    #[serde(default = "default_heartbeat_target")]
    pub target: String,
    pub active_hours: Option<ActiveHours>,
    /// Explicit targets must appear here; there is no silent fallback.
    #[serde(default)]
    pub allowed_targets: Vec<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_heartbeat_interval_minutes(),
            session: None,
            target: default_heartbeat_target(),
            active_hours: None,
            allowed_targets: Vec::new(),
        }
    }
}

// ── Loading & validation ──────────────────────────────────────────────────────

/// Outcome of a validation pass. The input config is never mutated.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl SwitchboardConfig {
    /// Load from `config_path` (or `SWITCHBOARD_CONFIG`, or
    /// `~/.switchboard/switchboard.toml`) merged with `SWITCHBOARD_*` env
    /// overrides.
    pub fn load(config_path: Option<&str>) -> crate::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SwitchboardConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SWITCHBOARD_").split("__"))
            .extract()
            .map_err(|e| crate::CoreError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Validate cross-field constraints, collecting every problem rather than
    /// stopping at the first.
    pub fn validate(&self) -> ValidationReport {
        let mut errors = Vec::new();

        for (name, channel) in &self.channels {
            if channel.dm_policy == DmPolicy::Allowlist && channel.allow_from.is_empty() {
                errors.push(format!(
                    "channels.{name}: dm_policy=allowlist with empty allow_from blocks every DM"
                ));
            }
            if matches!(channel.webhook.mode, WebhookAuthMode::SharedSecret)
                && channel.webhook.secret.is_none()
                && channel.accounts.values().all(|a| a.webhook_secret.is_none())
            {
                errors.push(format!(
                    "channels.{name}: webhook mode shared-secret requires a secret"
                ));
            }
            if matches!(channel.webhook.mode, WebhookAuthMode::Telnyx)
                && channel.webhook.public_key.is_none()
            {
                errors.push(format!(
                    "channels.{name}: webhook mode telnyx requires public_key"
                ));
            }
            if let Some(limit) = channel.text_chunk_limit {
                if limit == 0 {
                    errors.push(format!("channels.{name}: text_chunk_limit must be non-zero"));
                }
            }
            for pattern in &channel.mention_patterns {
                if let Err(e) = regex_check(pattern) {
                    errors.push(format!("channels.{name}: bad mention pattern {pattern:?}: {e}"));
                }
            }
        }

        for rule in &self.routing {
            if rule.agent.trim().is_empty() {
                errors.push("routing: rule with empty agent id".to_string());
            }
        }

        let hb_blocks = std::iter::once(&self.heartbeat)
            .chain(self.agents.entries.values().filter_map(|a| a.heartbeat.as_ref()));
        for hb in hb_blocks {
            if let Some(hours) = &hb.active_hours {
                for (label, v) in [("start", &hours.start), ("end", &hours.end)] {
                    if parse_hhmm(v).is_none() {
                        errors.push(format!("heartbeat.active_hours.{label}: expected HH:MM, got {v:?}"));
                    }
                }
            }
        }

        ValidationReport { errors }
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.get(name)
    }

    pub fn account<'a>(&'a self, channel: &str, account_id: &str) -> Option<&'a AccountConfig> {
        self.channels.get(channel)?.accounts.get(account_id)
    }
}

/// Parse "HH:MM" into minutes-past-midnight.
pub fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

// Validation-only syntax check; compiled patterns are cached by the mention
// gate itself.
fn regex_check(pattern: &str) -> std::result::Result<(), String> {
    // Cheap structural check without pulling the regex crate into core:
    // reject obviously unbalanced groups/classes.
    let mut paren = 0i32;
    let mut bracket = 0i32;
    let mut escaped = false;
    for ch in pattern.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '(' => paren += 1,
            ')' => paren -= 1,
            '[' => bracket += 1,
            ']' => bracket = (bracket - 1).max(0),
            _ => {}
        }
        if paren < 0 {
            return Err("unbalanced ')'".to_string());
        }
    }
    if paren != 0 {
        return Err("unbalanced '('".to_string());
    }
    if bracket != 0 {
        return Err("unbalanced '['".to_string());
    }
    Ok(())
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_state_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.switchboard/state")
}

fn default_config_path() -> String {
    if let Ok(p) = std::env::var("SWITCHBOARD_CONFIG") {
        return p;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.switchboard/switchboard.toml")
}

fn default_session_store() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.switchboard/agents/{{agentId}}/sessions.json")
}

fn default_agent_id() -> String {
    "main".to_string()
}

fn default_ack_emoji() -> String {
    "\u{1f440}".to_string() // 👀
}

fn default_max_attachment_bytes() -> u64 {
    DEFAULT_MAX_ATTACHMENT_BYTES
}

fn default_history_limit() -> usize {
    50
}

fn default_max_concurrent_runs() -> usize {
    2
}

fn default_heartbeat_interval_minutes() -> u64 {
    30
}

fn default_heartbeat_target() -> String {
    "last".to_string()
}

fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = SwitchboardConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.agents.default, "main");
        assert!(cfg.validate().valid());
    }

    #[test]
    fn allowlist_without_entries_is_flagged() {
        let mut cfg = SwitchboardConfig::default();
        cfg.channels.insert(
            "telegram".into(),
            ChannelConfig {
                dm_policy: DmPolicy::Allowlist,
                webhook: WebhookAuthConfig {
                    mode: WebhookAuthMode::None,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let report = cfg.validate();
        assert!(!report.valid());
        assert!(report.errors[0].contains("allow_from"));
    }

    #[test]
    fn shared_secret_mode_requires_secret() {
        let mut cfg = SwitchboardConfig::default();
        cfg.channels.insert("bluebubbles".into(), ChannelConfig::default());
        let report = cfg.validate();
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("shared-secret requires a secret")));
    }

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("09:30"), Some(570));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("nope"), None);
    }

    #[test]
    fn active_hours_validated() {
        let mut cfg = SwitchboardConfig::default();
        cfg.heartbeat.active_hours = Some(ActiveHours {
            start: "08:00".into(),
            end: "25:00".into(),
            timezone: None,
        });
        let report = cfg.validate();
        assert!(report.errors.iter().any(|e| e.contains("active_hours.end")));
    }
}
