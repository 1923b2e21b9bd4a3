//! Broker and cloud credentials, fixed for the lifetime of the process

use crate::config::{Config, LoginMode};
use std::collections::BTreeMap;

#[derive(Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct CloudCredentials {
    pub client_name: String,
    pub login: String,
    pub password: String,
    pub api_key: String,
    pub login_mode: LoginMode,
    pub device_logins: BTreeMap<String, String>,
}

impl CloudCredentials {
    /// Login whose session carries this device's positions
    pub fn login_for<'a>(&'a self, device_id: &'a str) -> &'a str {
        match self.login_mode {
            LoginMode::Shared => &self.login,
            LoginMode::PerDevice => self
                .device_logins
                .get(device_id)
                .map(String::as_str)
                .unwrap_or(device_id),
        }
    }

    /// The single login of shared mode; per-device logins are only known
    /// once telemetry arrives
    pub fn shared_login(&self) -> Option<&str> {
        match self.login_mode {
            LoginMode::Shared => Some(&self.login),
            LoginMode::PerDevice => None,
        }
    }
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl std::fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("client_name", &self.client_name)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("api_key", &"<redacted>")
            .field("login_mode", &self.login_mode)
            .field("device_logins", &self.device_logins)
            .finish()
    }
}

/// Read-only view over the credentials loaded at startup.
///
/// Rotation requires a restart.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    broker: BrokerCredentials,
    cloud: CloudCredentials,
}

impl CredentialStore {
    pub fn new(broker: BrokerCredentials, cloud: CloudCredentials) -> Self {
        Self { broker, cloud }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            BrokerCredentials {
                username: config.mqtt.username.clone(),
                password: config.mqtt.password.clone(),
            },
            CloudCredentials {
                client_name: config.cloud.client.clone(),
                login: config.cloud.login.clone(),
                password: config.cloud.password.clone(),
                api_key: config.cloud.api_key.clone(),
                login_mode: config.cloud.login_mode,
                device_logins: config.cloud.device_logins.clone(),
            },
        )
    }

    pub fn broker_credentials(&self) -> &BrokerCredentials {
        &self.broker
    }

    pub fn cloud_credentials(&self) -> &CloudCredentials {
        &self.cloud
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_from_config() {
        let mut config = Config::default();
        config.mqtt.username = Some("relay".to_string());
        config.mqtt.password = Some("mqtt-pass".to_string());
        config.cloud.client = "Plant".to_string();
        config.cloud.login = "tugger-01".to_string();
        config.cloud.password = "cloud-pass".to_string();
        config.cloud.api_key = "api-key".to_string();

        let store = CredentialStore::from_config(&config);
        assert_eq!(store.broker_credentials().username.as_deref(), Some("relay"));
        assert_eq!(store.cloud_credentials().client_name, "Plant");
        assert_eq!(store.cloud_credentials().api_key, "api-key");

        let printed = format!("{:?}", store);
        assert!(!printed.contains("mqtt-pass"));
        assert!(!printed.contains("cloud-pass"));
    }

    #[test]
    fn test_login_for_device() {
        let mut config = Config::default();
        config.cloud.login = "relay".to_string();
        config
            .cloud
            .device_logins
            .insert("hitech_amr_001".to_string(), "tugger-03".to_string());

        let shared = CredentialStore::from_config(&config);
        assert_eq!(shared.cloud_credentials().login_for("hitech_amr_001"), "relay");
        assert_eq!(shared.cloud_credentials().shared_login(), Some("relay"));

        config.cloud.login_mode = LoginMode::PerDevice;
        let per_device = CredentialStore::from_config(&config);
        let cloud = per_device.cloud_credentials();
        assert_eq!(cloud.login_for("hitech_amr_001"), "tugger-03");
        assert_eq!(cloud.login_for("tugger-01"), "tugger-01");
        assert_eq!(cloud.shared_login(), None);
    }
}
