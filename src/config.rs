//! Host-side configuration: the shared file format plus the environment layer and the
//! conversions into component settings.

use std::time::Duration;

pub use printfleet_shared::config::*;

use crate::dispatch::{BambuDispatchSettings, PrusaDispatchSettings};

/// Load `path`, then apply `PRINTFLEET_*` variables from the process environment.
pub fn load_with_env(path: &str) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    config.apply_env_overrides(|name| std::env::var(name).ok());
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}

/// Bearer-token secret. Without a configured one, tokens only survive until restart.
pub fn jwt_secret(auth: &AuthConfig) -> Vec<u8> {
    match auth.jwt_secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => secret.as_bytes().to_vec(),
        None => {
            tracing::warn!("No JWT secret configured, generating a random one");
            format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple()).into_bytes()
        }
    }
}

impl From<&PrusaConfig> for PrusaDispatchSettings {
    fn from(prusa: &PrusaConfig) -> Self {
        Self {
            status_timeout: Duration::from_secs(prusa.status_timeout_secs),
            upload_timeout: Duration::from_secs(prusa.upload_timeout_secs),
            confirm_polls: prusa.confirm_polls,
            confirm_interval: Duration::from_millis(prusa.confirm_interval_ms),
        }
    }
}

impl From<&BambuConfig> for BambuDispatchSettings {
    fn from(bambu: &BambuConfig) -> Self {
        Self {
            mqtt_port: bambu.mqtt_port,
            connect_timeout: bambu.connect_timeout(),
            command_timeout: bambu.command_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let prusa = PrusaConfig {
            confirm_polls: 2,
            confirm_interval_ms: 100,
            ..PrusaConfig::default()
        };
        let settings = PrusaDispatchSettings::from(&prusa);
        assert_eq!(settings.confirm_polls, 2);
        assert_eq!(settings.confirm_interval, Duration::from_millis(100));
        assert_eq!(settings.status_timeout, Duration::from_secs(5));

        let bambu = BambuDispatchSettings::from(&BambuConfig::default());
        assert_eq!(bambu.mqtt_port, 8883);
        assert_eq!(bambu.command_timeout, Duration::from_secs(15));
    }

    #[test]
    fn configured_secret_is_used_verbatim() {
        let auth = AuthConfig {
            jwt_secret: Some("abc".into()),
        };
        assert_eq!(jwt_secret(&auth), b"abc".to_vec());
        assert_eq!(jwt_secret(&AuthConfig::default()).len(), 64);
    }
}
