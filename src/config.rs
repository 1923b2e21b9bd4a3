use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub cloud: CloudConfig,
    pub ingress: IngressConfig,
    pub relay: RelayConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttTransport {
    Tcp,
    Ws,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub transport: MqttTransport,
    pub tls: bool,
    /// Path component used for WebSocket transports
    pub ws_path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client id prefix; a random suffix keeps concurrent relays apart
    pub client_id: String,
    pub topic: String,
    pub keep_alive_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            transport: MqttTransport::Tcp,
            tls: false,
            ws_path: "/mqtt".to_string(),
            username: None,
            password: None,
            client_id: "telemetry-relay".to_string(),
            topic: "ati_fm/+/status".to_string(),
            keep_alive_secs: 30,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 60_000,
        }
    }
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("transport", &self.transport)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("topic", &self.topic)
            .finish()
    }
}

/// Header scheme used for calls after authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    /// `Client`, `Branch`, `Token` and a static `Api-Key`
    ApiKey,
    /// `Authorization: Bearer <token>` plus `Client` and `Branch`
    Bearer,
}

/// Which login a batch is authenticated with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoginMode {
    /// Every batch uses `cloud.login`
    Shared,
    /// One session per device; the login is looked up in `device_logins`
    /// and falls back to the device id
    PerDevice,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub base_url: String,
    pub client: String,
    pub login: String,
    pub password: String,
    pub api_key: String,
    pub auth_scheme: AuthScheme,
    pub login_mode: LoginMode,
    /// Device id -> cloud login, used in per-device mode
    pub device_logins: BTreeMap<String, String>,
    pub request_timeout_ms: u64,
    /// Used when the authenticate response carries no expiration
    pub token_lifetime_secs: u64,
    pub token_refresh_margin_secs: u64,
    /// Reporting interval sent with every localization entry
    pub interval_ms: u64,
    pub default_battery: u8,
    pub dry_run: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.platform.twinzo.com/v3".to_string(),
            client: String::new(),
            login: String::new(),
            password: String::new(),
            api_key: String::new(),
            auth_scheme: AuthScheme::ApiKey,
            login_mode: LoginMode::Shared,
            device_logins: BTreeMap::new(),
            request_timeout_ms: 15_000,
            token_lifetime_secs: 3_600,
            token_refresh_margin_secs: 60,
            interval_ms: 100,
            default_battery: 100,
            dry_run: false,
        }
    }
}

impl std::fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudConfig")
            .field("base_url", &self.base_url)
            .field("client", &self.client)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("api_key", &"<redacted>")
            .field("auth_scheme", &self.auth_scheme)
            .field("login_mode", &self.login_mode)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadSchema {
    Flat,
    Nested,
    Pose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    RejectNew,
    DropOldest,
}

/// Field names of the flat payload schema
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub device: String,
    pub sector: String,
    pub x: String,
    pub y: String,
    pub z: String,
    pub heading: String,
    pub battery: String,
    pub moving: String,
    pub timestamp: String,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            device: "DeviceId".to_string(),
            sector: "SectorId".to_string(),
            x: "X".to_string(),
            y: "Y".to_string(),
            z: "Z".to_string(),
            heading: "Heading".to_string(),
            battery: "Battery".to_string(),
            moving: "IsMoving".to_string(),
            timestamp: "Timestamp".to_string(),
        }
    }
}

/// `X' = a*x + b*y + tx`, `Y' = c*x + d*y + ty`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            tx: 0.0,
            ty: 0.0,
        }
    }
}

impl AffineTransform {
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.b * y + self.tx,
            self.c * x + self.d * y + self.ty,
        )
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub schema: PayloadSchema,
    pub fields: FieldMap,
    pub stale_threshold_ms: u64,
    /// Empty means every device is accepted
    pub allowed_devices: Vec<String>,
    pub default_sector: Option<i64>,
    pub queue_capacity: usize,
    pub high_water_mark: usize,
    pub overflow: OverflowPolicy,
    pub transform: AffineTransform,
    pub movement_threshold: f64,
    /// Per-device sector overrides, keyed by device id
    pub device_sectors: BTreeMap<String, i64>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            schema: PayloadSchema::Pose,
            fields: FieldMap::default(),
            stale_threshold_ms: 30_000,
            allowed_devices: Vec::new(),
            default_sector: Some(1),
            queue_capacity: 10_000,
            high_water_mark: 8_000,
            overflow: OverflowPolicy::RejectNew,
            transform: AffineTransform::default(),
            movement_threshold: 250.0,
            device_sectors: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub batch_size: usize,
    pub batch_window_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub spill_path: Option<PathBuf>,
    pub loss_log: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_window_ms: 200,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            shutdown_deadline_ms: 10_000,
            spill_path: None,
            loss_log: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub bind: String,
    pub stale_threshold_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            stale_threshold_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load the config file, apply environment overrides and validate
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))
    }

    /// Secrets may come from the environment instead of the file
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = lookup("TWINZO_CLIENT") {
            self.cloud.client = v;
        }
        if let Some(v) = lookup("TWINZO_LOGIN") {
            self.cloud.login = v;
        }
        if let Some(v) = lookup("TWINZO_PASSWORD") {
            self.cloud.password = v;
        }
        if let Some(v) = lookup("TWINZO_API_KEY") {
            self.cloud.api_key = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mqtt.host.trim().is_empty() {
            anyhow::bail!("mqtt.host must not be empty");
        }
        if self.mqtt.topic.trim().is_empty() {
            anyhow::bail!("mqtt.topic must not be empty");
        }
        if !self.cloud.base_url.starts_with("http://") && !self.cloud.base_url.starts_with("https://")
        {
            anyhow::bail!("cloud.base_url must be an http(s) URL, got {}", self.cloud.base_url);
        }
        if !self.cloud.dry_run && self.cloud.client.is_empty() {
            anyhow::bail!("cloud.client is required unless cloud.dry_run is set");
        }
        if !self.cloud.dry_run
            && self.cloud.login_mode == LoginMode::Shared
            && self.cloud.login.is_empty()
        {
            anyhow::bail!("cloud.login is required for the shared login mode");
        }
        if self.cloud.auth_scheme == AuthScheme::ApiKey
            && !self.cloud.dry_run
            && self.cloud.api_key.is_empty()
        {
            anyhow::bail!("cloud.api_key is required for the api-key auth scheme");
        }
        if self.relay.batch_size == 0 {
            anyhow::bail!("relay.batch_size must be at least 1");
        }
        if self.relay.max_attempts == 0 {
            anyhow::bail!("relay.max_attempts must be at least 1");
        }
        if self.relay.backoff_base_ms > self.relay.backoff_cap_ms {
            anyhow::bail!("relay.backoff_base_ms exceeds relay.backoff_cap_ms");
        }
        if self.ingress.queue_capacity == 0 {
            anyhow::bail!("ingress.queue_capacity must be at least 1");
        }
        if self.ingress.high_water_mark > self.ingress.queue_capacity {
            anyhow::bail!(
                "ingress.high_water_mark ({}) exceeds ingress.queue_capacity ({})",
                self.ingress.high_water_mark,
                self.ingress.queue_capacity
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [mqtt]
        host = "broker.example.com"
        port = 8883
        tls = true
        topic = "ati_fm/+/status"

        [cloud]
        client = "Plant"
        login = "relay"
        password = "secret"
        api_key = "key"

        [ingress]
        schema = "flat"
        overflow = "drop-oldest"

        [ingress.fields]
        device = "Name"

        [relay]
        batch_size = 20
        spill_path = "/var/lib/relay/spill.jsonl"
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.mqtt.host, "broker.example.com");
        assert_eq!(config.mqtt.port, 8883);
        assert!(config.mqtt.tls);
        assert_eq!(config.ingress.schema, PayloadSchema::Flat);
        assert_eq!(config.ingress.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.ingress.fields.device, "Name");
        assert_eq!(config.ingress.fields.sector, "SectorId");
        assert_eq!(config.relay.batch_size, 20);
        assert_eq!(config.relay.batch_window_ms, 200);
        assert_eq!(config.relay.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_secrets() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.apply_env_overrides(|key| match key {
            "TWINZO_PASSWORD" => Some("from-env".to_string()),
            "MQTT_USERNAME" => Some("relay-user".to_string()),
            _ => None,
        });
        assert_eq!(config.cloud.password, "from-env");
        assert_eq!(config.mqtt.username.as_deref(), Some("relay-user"));
        assert_eq!(config.cloud.login, "relay");
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let config = Config::parse("[mqtt]\nhost = \"localhost\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_per_device_mode_needs_no_shared_login() {
        let config = Config::parse(
            r#"
            [cloud]
            client = "Plant"
            password = "secret"
            api_key = "key"
            login_mode = "per-device"

            [cloud.device_logins]
            hitech_amr_001 = "tugger-03"
            "#,
        )
        .unwrap();
        assert_eq!(config.cloud.login_mode, LoginMode::PerDevice);
        assert_eq!(config.cloud.device_logins["hitech_amr_001"], "tugger-03");
        assert!(config.validate().is_ok());

        let mut shared = config.clone();
        shared.cloud.login_mode = LoginMode::Shared;
        assert!(shared.validate().is_err());
    }

    #[test]
    fn test_high_water_above_capacity_rejected() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.ingress.high_water_mark = config.ingress.queue_capacity + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::parse(SAMPLE).unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_affine_transform() {
        let t = AffineTransform {
            a: 2.0,
            b: 0.0,
            c: 0.0,
            d: -1.0,
            tx: 10.0,
            ty: 5.0,
        };
        assert_eq!(t.apply(1.0, 2.0), (12.0, 3.0));
        assert!(!t.is_identity());
        assert!(AffineTransform::default().is_identity());
    }
}
