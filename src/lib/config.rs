use argh::FromArgs;
use color_eyre::Report;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::__tracing_subscriber_SubscriberExt, EnvFilter};

use super::wh::AlertLayer;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Common {
    /// chat webhook receiving warnings and errors
    pub webhook: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Server {
    pub listen: String,
    /// header carrying the authenticated user id, set by the gateway in front
    pub user_header: String,
    /// may start test instances
    pub admin_users: Vec<i64>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            user_header: "x-user-id".to_string(),
            admin_users: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Instances {
    /// minimum time between create/destroy on the same instance
    pub cooldown_secs: u64,
    pub lifetime_mins: u64,
    /// prolonging is only allowed this close to the expected stop
    pub prolong_window_mins: u64,
    pub prolong_mins: u64,
    /// unset means an instance can be prolonged forever
    pub max_lifetime_mins: Option<u64>,
    pub sweep_interval_secs: u64,
}

impl Default for Instances {
    fn default() -> Self {
        Self {
            cooldown_secs: 10,
            lifetime_mins: 120,
            prolong_window_mins: 10,
            prolong_mins: 120,
            max_lifetime_mins: None,
            sweep_interval_secs: 30,
        }
    }
}

impl Instances {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn lifetime(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lifetime_mins as i64)
    }

    pub fn prolong_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.prolong_window_mins as i64)
    }

    pub fn prolong(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.prolong_mins as i64)
    }

    pub fn max_lifetime(&self) -> Option<chrono::Duration> {
        self.max_lifetime_mins
            .map(|mins| chrono::Duration::minutes(mins as i64))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Proxy {
    /// platform wide switch, instances are exposed directly when off
    pub enable: bool,
    pub max_connections: i64,
    pub timeout_mins: u64,
    pub capture_dir: PathBuf,
}

impl Default for Proxy {
    fn default() -> Self {
        Self {
            enable: true,
            max_connections: 64,
            timeout_mins: 30,
            capture_dir: PathBuf::from("captures"),
        }
    }
}

impl Proxy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_mins * 60)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Submissions {
    pub queue_capacity: usize,
    pub checker_workers: usize,
}

impl Default for Submissions {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            checker_workers: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Runtime {
    pub runtime_name: String,
    #[serde(default)]
    pub runtime: toml::Table,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            runtime_name: "dummy".to_string(),
            runtime: toml::Table::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub username: String,
    pub password: String,
    pub host: String,
    pub db: String,
}

impl Database {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}/{}",
            self.username, self.password, self.host, self.db
        )
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Root {
    #[serde(default)]
    pub common: Common,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub instances: Instances,
    #[serde(default)]
    pub proxy: Proxy,
    #[serde(default)]
    pub submissions: Submissions,
    #[serde(default)]
    pub runtime: Runtime,
    /// in-memory store when missing
    pub database: Option<Database>,
}

#[derive(FromArgs)]
/// Skansen, challenge instances and flag intake
pub struct Args {
    /// path to toml configuration file
    #[argh(positional)]
    pub toml: String,

    /// enable debug logging
    #[argh(switch)]
    pub debug: bool,
}

impl Args {
    pub fn get_config(&self) -> Result<Root, Report> {
        let toml = std::fs::read_to_string(&self.toml)?;
        Ok(toml::from_str(&toml)?)
    }

    pub fn setup_logging(&self, common: &Common) -> Result<(), Report> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if self.debug {
                "debug,hyper=info,sqlx=warn"
            } else {
                "info"
            }
            .into()
        });

        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish();

        if let Some(url) = &common.webhook {
            tracing::subscriber::set_global_default(subscriber.with(AlertLayer::new(url)))?;
            info!("alerting to webhook {}", url);
        } else {
            tracing::subscriber::set_global_default(subscriber)?;
            info!("no webhook url");
        }

        Ok(())
    }
}
