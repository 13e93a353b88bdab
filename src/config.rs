//! Settings, read from the environment.
//!
//! The variable names follow ChartMuseum's own environment conventions so an
//! existing deployment's settings carry over. `LISTEN_HOST` and `PORT` are
//! read for parity with a long-running deployment but nothing listens on
//! them here.

use anyhow::{anyhow, bail, Context, Result};
use std::{collections::HashMap, str::FromStr, time::Duration};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    pub bucket: String,
    pub prefix: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub sse: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerOptions {
    pub chart_url: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_ca_cert: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub chart_post_form_field_name: String,
    pub prov_post_form_field_name: String,
    pub context_path: String,
    pub enable_api: bool,
    pub disable_delete: bool,
    pub allow_overwrite: bool,
    pub allow_force_overwrite: bool,
    pub anonymous_get: bool,
    pub max_upload_size: usize,
    pub index_limit: usize,
    pub depth: usize,
    pub bearer_auth: bool,
    pub auth_realm: Option<String>,
    pub auth_service: Option<String>,
    pub auth_cert_path: Option<String>,
    pub cors_allow_origin: Option<String>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub cache_interval: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            chart_url: None,
            tls_cert: None,
            tls_key: None,
            tls_ca_cert: None,
            username: None,
            password: None,
            chart_post_form_field_name: "chart".to_owned(),
            prov_post_form_field_name: "prov".to_owned(),
            context_path: String::new(),
            enable_api: true,
            disable_delete: false,
            allow_overwrite: false,
            allow_force_overwrite: true,
            anonymous_get: false,
            max_upload_size: 20 * 1024 * 1024,
            index_limit: 0,
            depth: 0,
            bearer_auth: false,
            auth_realm: None,
            auth_service: None,
            auth_cert_path: None,
            cors_allow_origin: None,
            read_timeout: None,
            write_timeout: None,
            cache_interval: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub debug: bool,
    pub json: bool,
}

impl LogConfig {
    /// Logging comes up before the rest of the configuration is read, so
    /// that configuration errors can be logged.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&Vars(std::env::vars().collect()))
    }

    fn from_vars(env: &Vars) -> Result<Self> {
        Ok(LogConfig {
            debug: env.flag("DEBUG")?
                || env
                    .string("LOG_LEVEL")
                    .is_some_and(|l| l.eq_ignore_ascii_case("debug")),
            json: env.flag("LOG_JSON")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub log: LogConfig,
    pub storage: StorageConfig,
    pub server: ServerOptions,
    pub listen_host: String,
    pub port: u16,
    pub stage_prefix: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let env = Vars(vars);
        let defaults = ServerOptions::default();

        let storage = env.string("STORAGE").unwrap_or_else(|| "amazon".to_owned());
        if storage != "amazon" {
            bail!("unsupported STORAGE backend `{storage}` (only `amazon` is available)");
        }

        let bucket = env
            .string("STORAGE_AMAZON_BUCKET")
            .ok_or_else(|| anyhow!("STORAGE_AMAZON_BUCKET must be set"))?;

        let server = ServerOptions {
            chart_url: env.string("CHART_URL"),
            tls_cert: env.string("TLS_CERT"),
            tls_key: env.string("TLS_KEY"),
            tls_ca_cert: env.string("TLS_CA_CERT"),
            username: env.string("BASIC_AUTH_USER"),
            password: env.string("BASIC_AUTH_PASS"),
            chart_post_form_field_name: env
                .string("CHART_POST_FORM_FIELD_NAME")
                .unwrap_or(defaults.chart_post_form_field_name),
            prov_post_form_field_name: env
                .string("PROV_POST_FORM_FIELD_NAME")
                .unwrap_or(defaults.prov_post_form_field_name),
            context_path: normalize_context_path(&env.string("CONTEXT_PATH").unwrap_or_default()),
            enable_api: !env.flag("DISABLE_API")?,
            disable_delete: env.flag("DISABLE_DELETE")?,
            allow_overwrite: env.flag("ALLOW_OVERWRITE")?,
            allow_force_overwrite: !env.flag("DISABLE_FORCE_OVERWRITE")?,
            anonymous_get: env.flag("AUTH_ANONYMOUS_GET")?,
            max_upload_size: env.parse("MAX_UPLOAD_SIZE")?.unwrap_or(defaults.max_upload_size),
            index_limit: env.parse("INDEX_LIMIT")?.unwrap_or(0),
            depth: env.parse("DEPTH")?.unwrap_or(0),
            bearer_auth: env.flag("BEARER_AUTH")?,
            auth_realm: env.string("AUTH_REALM"),
            auth_service: env.string("AUTH_SERVICE"),
            auth_cert_path: env.string("AUTH_CERT_PATH"),
            cors_allow_origin: env.string("CORS_ALLOW_ORIGIN"),
            read_timeout: env.seconds("READ_TIMEOUT")?,
            write_timeout: env.seconds("WRITE_TIMEOUT")?,
            cache_interval: env.seconds("CACHE_INTERVAL")?,
        };

        Ok(Config {
            log: LogConfig::from_vars(&env)?,
            storage: StorageConfig {
                bucket,
                prefix: env
                    .string("STORAGE_AMAZON_PREFIX")
                    .map(|p| p.trim_matches('/').to_owned())
                    .unwrap_or_default(),
                region: env.string("STORAGE_AMAZON_REGION"),
                endpoint: env.string("STORAGE_AMAZON_ENDPOINT"),
                sse: env.string("STORAGE_AMAZON_SSE"),
            },
            server,
            listen_host: env
                .string("LISTEN_HOST")
                .unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: env.parse("PORT")?.unwrap_or(8080),
            stage_prefix: env.flag("STAGE_PREFIX")?,
        })
    }
}

/// `"charts/"` and `"/charts"` both mean `/charts`; empty means the root.
fn normalize_context_path(raw: &str) -> String {
    let trimmed = raw.trim_matches('/');

    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

struct Vars(HashMap<String, String>);

impl Vars {
    /// Unset and empty are the same thing.
    fn string(&self, name: &str) -> Option<String> {
        self.0
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    }

    fn flag(&self, name: &str) -> Result<bool> {
        let Some(value) = self.string(name) else {
            return Ok(false);
        };

        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("{name}: expected a boolean, got `{value}`"),
        }
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.string(name)
            .map(|v| v.parse().with_context(|| format!("{name}: cannot parse `{v}`")))
            .transpose()
    }

    /// Whole seconds; zero means "no limit".
    fn seconds(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self
            .parse::<u64>(name)?
            .filter(|&s| s > 0)
            .map(Duration::from_secs))
    }
}
