// Configuration File Support
//
// TOML configuration for the gatekeeper with environment variable overrides.
// A missing file yields the defaults; an unreadable or invalid one is an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::break_glass::{BreakGlassPolicy, BREAK_GLASS_HEADER, DEFAULT_MAX_PER_HOUR};
use crate::housekeeping::HousekeepingConfig;
use crate::quota::{PlanRegistry, RatePlan};

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "gatekeeper.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Listener configuration
    pub server: ServerConfig,

    /// Rate plans, assignments, and housekeeping
    pub quota: QuotaConfig,

    /// Emergency override policy
    pub break_glass: BreakGlassConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind: String,

    /// Listen port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.bind))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// Seconds between housekeeping sweeps
    pub sweep_interval_secs: u64,

    /// Extra plans, registered over the built-in tiers
    pub plans: Vec<RatePlan>,

    /// Identity → plan name
    pub assignments: HashMap<String, String>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            plans: Vec::new(),
            assignments: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakGlassConfig {
    /// Overrides allowed per identity in a rolling hour
    pub max_per_hour: u32,

    /// Path prefixes the override applies to
    pub governed_prefixes: Vec<String>,

    /// Header carrying the override reason
    pub header: String,
}

impl Default for BreakGlassConfig {
    fn default() -> Self {
        Self {
            max_per_hour: DEFAULT_MAX_PER_HOUR,
            governed_prefixes: vec!["/fhir/".to_string()],
            header: BREAK_GLASS_HEADER.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or
    /// parsed, or if the result fails validation. If the file does not
    /// exist, the defaults (plus environment overrides) are used.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - GATEKEEPER_LOG_LEVEL
    /// - GATEKEEPER_LOG_FORMAT
    /// - GATEKEEPER_BIND
    /// - GATEKEEPER_PORT
    /// - GATEKEEPER_SWEEP_INTERVAL_SECS
    /// - GATEKEEPER_BREAK_GLASS_MAX_PER_HOUR
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("GATEKEEPER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("GATEKEEPER_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(bind) = std::env::var("GATEKEEPER_BIND") {
            self.server.bind = bind;
        }
        if let Ok(port) = std::env::var("GATEKEEPER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(secs) = std::env::var("GATEKEEPER_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                if secs > 0 {
                    self.quota.sweep_interval_secs = secs;
                }
            }
        }
        if let Ok(max) = std::env::var("GATEKEEPER_BREAK_GLASS_MAX_PER_HOUR") {
            if let Ok(max) = max.parse::<u32>() {
                self.break_glass.max_per_hour = max;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.server.socket_addr()?;

        if self.quota.sweep_interval_secs == 0 {
            anyhow::bail!("Housekeeping sweep interval must be > 0");
        }

        for plan in &self.quota.plans {
            if plan.name.trim().is_empty() {
                anyhow::bail!("Rate plan with empty name in [quota].plans");
            }
        }

        let registry = self.plan_registry();
        for (identity, plan) in &self.quota.assignments {
            if !registry.contains(plan) {
                anyhow::bail!("Identity '{}' is assigned to unknown plan '{}'", identity, plan);
            }
        }

        if self.break_glass.header.trim().is_empty() {
            anyhow::bail!("Break-glass header name must not be empty");
        }
        axum::http::HeaderName::from_bytes(self.break_glass.header.as_bytes())
            .with_context(|| format!("Invalid break-glass header: {}", self.break_glass.header))?;

        Ok(())
    }

    /// Build a registry holding the built-in tiers plus configured plans
    /// and assignments
    pub fn plan_registry(&self) -> PlanRegistry {
        let registry = PlanRegistry::new();
        for plan in &self.quota.plans {
            let mut plan = plan.clone();
            plan.name = plan.name.trim().to_string();
            registry.register_plan(plan);
        }
        for (identity, plan) in &self.quota.assignments {
            // Unknown plans are rejected by validate()
            let _ = registry.assign_plan(identity, plan);
        }
        registry
    }

    pub fn housekeeping(&self) -> HousekeepingConfig {
        HousekeepingConfig {
            sweep_interval: Duration::from_secs(self.quota.sweep_interval_secs),
        }
    }

    pub fn break_glass_policy(&self) -> BreakGlassPolicy {
        BreakGlassPolicy {
            max_per_hour: self.break_glass.max_per_hour,
            governed_prefixes: self.break_glass.governed_prefixes.clone(),
            header: self.break_glass.header.to_lowercase(),
        }
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
