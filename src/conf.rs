use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only resolver backend currently recognized.
pub const EKS_RESOLVER: &str = "eks";

mod defaults {
    use std::time::Duration;

    pub fn resolvers() -> Vec<String> {
        vec![super::EKS_RESOLVER.to_string()]
    }

    pub fn deletion_delay() -> Duration {
        Duration::from_secs(120)
    }

    pub fn mapper_interval() -> Duration {
        Duration::from_secs(90)
    }

    pub fn cache_sync_timeout() -> Duration {
        Duration::from_secs(120)
    }

    pub fn dump_interval() -> Duration {
        Duration::from_secs(300)
    }

    pub fn startup_jitter() -> Duration {
        Duration::from_secs(10)
    }
}

/// Resolver configuration.
///
/// Cluster credentials are not configured here; they come from the standard
/// ambient sources (kubeconfig or the in-cluster service account).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Conf {
    /// Which resolver backends to run. Only `"eks"` is supported.
    #[serde(default = "defaults::resolvers")]
    pub resolvers: Vec<String>,

    /// How long deleted index entries stay readable. Telemetry is
    /// aggregated on ~1 minute windows; twice that covers late arrivals.
    #[serde(default = "defaults::deletion_delay", with = "conf_serde::duration")]
    pub deletion_delay: Duration,

    /// Cadence of the service-to-workload join.
    #[serde(default = "defaults::mapper_interval", with = "conf_serde::duration")]
    pub mapper_interval: Duration,

    /// How long startup waits for the watcher caches before failing.
    #[serde(
        default = "defaults::cache_sync_timeout",
        with = "conf_serde::duration"
    )]
    pub cache_sync_timeout: Duration,

    /// Cadence of the diagnostic index dump.
    #[serde(default = "defaults::dump_interval", with = "conf_serde::duration")]
    pub dump_interval: Duration,

    /// Upper bound of the random sleep before the first cluster list, so
    /// replicas starting together spread their load.
    #[serde(default = "defaults::startup_jitter", with = "conf_serde::duration")]
    pub startup_jitter: Duration,

    /// Health and metrics HTTP endpoints.
    #[serde(default)]
    pub api: ApiConf,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            resolvers: defaults::resolvers(),
            deletion_delay: defaults::deletion_delay(),
            mapper_interval: defaults::mapper_interval(),
            cache_sync_timeout: defaults::cache_sync_timeout(),
            dump_interval: defaults::dump_interval(),
            startup_jitter: defaults::startup_jitter(),
            api: ApiConf::default(),
        }
    }
}

/// Configuration for the API server (health and metrics endpoints).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ApiConf {
    pub enabled: bool,
    pub listen_address: String,
    pub port: u16,
}

impl Default for ApiConf {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: "0.0.0.0".to_string(),
            port: 13133,
        }
    }
}

impl Conf {
    /// Loads configuration, layering an optional YAML file over defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfError> {
        let mut figment = Figment::from(Serialized::defaults(Conf::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }

        let conf: Conf = figment.extract().map_err(Box::new)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), ConfError> {
        for resolver in &self.resolvers {
            if resolver != EKS_RESOLVER {
                return Err(ConfError::UnknownResolver {
                    name: resolver.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("unknown resolver {name:?}; supported resolvers: [{EKS_RESOLVER:?}]")]
    UnknownResolver { name: String },
}

pub mod conf_serde {
    pub mod duration {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&humantime::format_duration(*duration).to_string())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            humantime::parse_duration(&s).map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let conf = Conf::default();
        assert_eq!(conf.resolvers, vec![EKS_RESOLVER.to_string()]);
        assert_eq!(conf.deletion_delay, Duration::from_secs(120));
        assert_eq!(conf.mapper_interval, Duration::from_secs(90));
        assert_eq!(conf.cache_sync_timeout, Duration::from_secs(120));
        assert_eq!(conf.dump_interval, Duration::from_secs(300));
        assert_eq!(conf.startup_jitter, Duration::from_secs(10));
        assert!(!conf.api.enabled);
    }

    #[test]
    fn yaml_overrides_layer_over_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "taxon.yaml",
                concat!(
                    "resolvers: [\"eks\"]\n",
                    "deletion_delay: 3m\n",
                    "api:\n",
                    "  enabled: true\n",
                    "  listen_address: 127.0.0.1\n",
                    "  port: 9000\n",
                ),
            )?;

            let conf = Conf::load(Some(Path::new("taxon.yaml"))).expect("conf should load");
            assert_eq!(conf.deletion_delay, Duration::from_secs(180));
            // Untouched keys keep their defaults.
            assert_eq!(conf.mapper_interval, Duration::from_secs(90));
            assert!(conf.api.enabled);
            assert_eq!(conf.api.port, 9000);
            Ok(())
        });
    }

    #[test]
    fn unknown_resolver_is_rejected() {
        let conf = Conf {
            resolvers: vec!["gke".to_string()],
            ..Default::default()
        };

        let err = conf.validate().expect_err("gke is not a known resolver");
        assert!(matches!(err, ConfError::UnknownResolver { name } if name == "gke"));
    }

    #[test]
    fn durations_round_trip_through_humantime() {
        let conf = Conf::default();
        let encoded = serde_json::to_string(&conf).expect("conf serializes");
        assert!(encoded.contains("\"2m\""));
        assert!(encoded.contains("\"1m 30s\""));
    }
}
