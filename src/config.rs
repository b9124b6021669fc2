// Configuration management for the trading controller

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    /// "live" places orders through the gateway, "sim" fills in-process.
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub db_path: String,
    /// Durable-layer flush interval. Tunable, not a contract.
    pub durable_sync_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub monitor_interval_secs: u64,
    pub strategy_interval_secs: u64,
    pub supervisor_interval_secs: u64,
    pub supervisor_cooldown_secs: u64,
    /// Sleep multiplier applied outside trading hours.
    pub idle_multiplier: u32,
    pub gateway_timeout_secs: u64,
    pub shutdown_join_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Signals older than this are never executed.
    pub staleness_secs: i64,
    /// Same (instrument, kind) is not re-executed inside this window.
    pub reprocess_cooldown_secs: i64,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Profit ratio at or below which a stop-loss signal fires, e.g. -0.075.
    pub stop_loss_ratio: f64,
    /// Profit ratio that arms the dynamic take-profit.
    pub initial_take_profit_ratio: f64,
    /// Retrace from the high-water mark that fires the dynamic take-profit.
    pub take_profit_retrace: f64,
    /// Portion of holdings sold on the initial take-profit.
    pub initial_sell_ratio: f64,
    /// Profit ratio that arms breakout tracking; after it the dynamic
    /// take-profit trails the breakout high with half the retrace.
    pub breakout_ratio: f64,
    pub lot_size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridDefaults {
    pub price_interval: f64,
    pub sell_ratio: f64,
    pub buy_amount: f64,
    pub callback_ratio: f64,
    pub max_investment: f64,
    pub max_deviation: f64,
    pub target_profit: f64,
    pub stop_loss: f64,
    pub max_duration_days: i64,
    /// A grid level cannot refire inside this window.
    pub level_cooldown_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoursConfig {
    /// Trading windows as "HH:MM-HH:MM" strings, in exchange time.
    pub windows: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    pub store: StoreConfig,
    pub loops: LoopConfig,
    pub signals: SignalConfig,
    pub risk: RiskConfig,
    pub grid: GridDefaults,
    pub hours: HoursConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: AccountConfig {
                account_id: "default".to_string(),
                mode: "sim".to_string(),
            },
            store: StoreConfig {
                db_path: "data/gridpilot.db".to_string(),
                durable_sync_secs: 5,
            },
            loops: LoopConfig {
                monitor_interval_secs: 3,
                strategy_interval_secs: 1,
                supervisor_interval_secs: 10,
                supervisor_cooldown_secs: 60,
                idle_multiplier: 20,
                gateway_timeout_secs: 3,
                shutdown_join_secs: 10,
            },
            signals: SignalConfig {
                staleness_secs: 60,
                reprocess_cooldown_secs: 300,
                queue_capacity: 256,
            },
            risk: RiskConfig {
                stop_loss_ratio: -0.075,
                initial_take_profit_ratio: 0.10,
                take_profit_retrace: 0.03,
                initial_sell_ratio: 0.5,
                breakout_ratio: 0.20,
                lot_size: 100.0,
            },
            grid: GridDefaults {
                price_interval: 0.05,
                sell_ratio: 0.2,
                buy_amount: 10_000.0,
                callback_ratio: 0.005,
                max_investment: 50_000.0,
                max_deviation: 0.20,
                target_profit: 0.15,
                stop_loss: -0.10,
                max_duration_days: 90,
                level_cooldown_secs: 60,
            },
            hours: HoursConfig {
                windows: vec!["09:30-11:30".to_string(), "13:00-15:00".to_string()],
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            tracing::info!("created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.durable_sync_secs == 0 {
            return Err(ConfigError::Validation(
                "durable_sync_secs must be greater than 0".to_string(),
            ));
        }

        if self.loops.monitor_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "monitor_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.signals.staleness_secs <= 0 {
            return Err(ConfigError::Validation(
                "staleness_secs must be positive".to_string(),
            ));
        }

        if self.risk.stop_loss_ratio >= 0.0 {
            return Err(ConfigError::Validation(
                "stop_loss_ratio must be negative".to_string(),
            ));
        }

        if self.risk.lot_size <= 0.0 {
            return Err(ConfigError::Validation(
                "lot_size must be positive".to_string(),
            ));
        }

        if self.grid.price_interval <= 0.0 || self.grid.price_interval >= 1.0 {
            return Err(ConfigError::Validation(
                "grid price_interval must be in (0, 1)".to_string(),
            ));
        }

        if self.grid.callback_ratio <= 0.0 {
            return Err(ConfigError::Validation(
                "grid callback_ratio must be positive".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.grid.sell_ratio) {
            return Err(ConfigError::Validation(
                "grid sell_ratio must be in [0, 1]".to_string(),
            ));
        }

        TradingHours::parse(&self.hours.windows)
            .map_err(|e| ConfigError::Validation(format!("hours: {}", e)))?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Trading-hours calendar. Outside the windows, loops stretch their sleep
/// interval; this is a pacing decision only.
#[derive(Debug, Clone)]
pub struct TradingHours {
    windows: Vec<(NaiveTime, NaiveTime)>,
}

impl TradingHours {
    pub fn parse(specs: &[String]) -> Result<Self, String> {
        let mut windows = Vec::with_capacity(specs.len());
        for spec in specs {
            let (start, end) = spec
                .split_once('-')
                .ok_or_else(|| format!("invalid window '{}'", spec))?;
            let start = NaiveTime::parse_from_str(start.trim(), "%H:%M")
                .map_err(|e| format!("invalid start in '{}': {}", spec, e))?;
            let end = NaiveTime::parse_from_str(end.trim(), "%H:%M")
                .map_err(|e| format!("invalid end in '{}': {}", spec, e))?;
            if start >= end {
                return Err(format!("window '{}' ends before it starts", spec));
            }
            windows.push((start, end));
        }
        Ok(Self { windows })
    }

    pub fn is_open(&self, time: NaiveTime) -> bool {
        self.windows
            .iter()
            .any(|(start, end)| time >= *start && time <= *end)
    }
}

/// Hot-reloadable runtime settings shared across the loops.
///
/// Values are typed and validated once at the boundary; loops read them
/// through accessors instead of re-parsing a dictionary on every cycle.
#[derive(Debug)]
pub struct RuntimeSettings {
    trading_enabled: AtomicBool,
    monitor_interval_secs: AtomicU64,
    durable_sync_secs: AtomicU64,
    risk: RwLock<RiskConfig>,
}

/// Keys of the hot-reloadable subset. Anything else requires a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    TradingEnabled,
    MonitorIntervalSecs,
    DurableSyncSecs,
    StopLossRatio,
    InitialTakeProfitRatio,
    TakeProfitRetrace,
}

impl SettingKey {
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "trading_enabled" => Some(SettingKey::TradingEnabled),
            "monitor_interval_secs" => Some(SettingKey::MonitorIntervalSecs),
            "durable_sync_secs" => Some(SettingKey::DurableSyncSecs),
            "stop_loss_ratio" => Some(SettingKey::StopLossRatio),
            "initial_take_profit_ratio" => Some(SettingKey::InitialTakeProfitRatio),
            "take_profit_retrace" => Some(SettingKey::TakeProfitRetrace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::TradingEnabled => "trading_enabled",
            SettingKey::MonitorIntervalSecs => "monitor_interval_secs",
            SettingKey::DurableSyncSecs => "durable_sync_secs",
            SettingKey::StopLossRatio => "stop_loss_ratio",
            SettingKey::InitialTakeProfitRatio => "initial_take_profit_ratio",
            SettingKey::TakeProfitRetrace => "take_profit_retrace",
        }
    }
}

impl RuntimeSettings {
    pub fn new(config: &Config, trading_enabled: bool) -> Self {
        Self {
            trading_enabled: AtomicBool::new(trading_enabled),
            monitor_interval_secs: AtomicU64::new(config.loops.monitor_interval_secs),
            durable_sync_secs: AtomicU64::new(config.store.durable_sync_secs),
            risk: RwLock::new(config.risk.clone()),
        }
    }

    pub fn trading_enabled(&self) -> bool {
        self.trading_enabled.load(Ordering::Relaxed)
    }

    pub fn set_trading_enabled(&self, enabled: bool) {
        self.trading_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn monitor_interval_secs(&self) -> u64 {
        self.monitor_interval_secs.load(Ordering::Relaxed)
    }

    pub fn durable_sync_secs(&self) -> u64 {
        self.durable_sync_secs.load(Ordering::Relaxed)
    }

    pub fn risk(&self) -> RiskConfig {
        self.risk.read().unwrap().clone()
    }

    /// Apply a setting through the typed registry. Returns (old, new) string
    /// renderings for the config change history.
    pub fn apply(&self, key: SettingKey, raw: &str) -> Result<(String, String), ConfigError> {
        match key {
            SettingKey::TradingEnabled => {
                let value: bool = raw
                    .parse()
                    .map_err(|_| ConfigError::Validation(format!("not a bool: {}", raw)))?;
                let old = self.trading_enabled.swap(value, Ordering::Relaxed);
                Ok((old.to_string(), value.to_string()))
            }
            SettingKey::MonitorIntervalSecs => {
                let value = parse_positive_u64(raw)?;
                let old = self.monitor_interval_secs.swap(value, Ordering::Relaxed);
                Ok((old.to_string(), value.to_string()))
            }
            SettingKey::DurableSyncSecs => {
                let value = parse_positive_u64(raw)?;
                let old = self.durable_sync_secs.swap(value, Ordering::Relaxed);
                Ok((old.to_string(), value.to_string()))
            }
            SettingKey::StopLossRatio => {
                let value = parse_f64(raw)?;
                if value >= 0.0 {
                    return Err(ConfigError::Validation(
                        "stop_loss_ratio must be negative".to_string(),
                    ));
                }
                let mut risk = self.risk.write().unwrap();
                let old = risk.stop_loss_ratio;
                risk.stop_loss_ratio = value;
                Ok((old.to_string(), value.to_string()))
            }
            SettingKey::InitialTakeProfitRatio => {
                let value = parse_f64(raw)?;
                if value <= 0.0 {
                    return Err(ConfigError::Validation(
                        "initial_take_profit_ratio must be positive".to_string(),
                    ));
                }
                let mut risk = self.risk.write().unwrap();
                let old = risk.initial_take_profit_ratio;
                risk.initial_take_profit_ratio = value;
                Ok((old.to_string(), value.to_string()))
            }
            SettingKey::TakeProfitRetrace => {
                let value = parse_f64(raw)?;
                if value <= 0.0 {
                    return Err(ConfigError::Validation(
                        "take_profit_retrace must be positive".to_string(),
                    ));
                }
                let mut risk = self.risk.write().unwrap();
                let old = risk.take_profit_retrace;
                risk.take_profit_retrace = value;
                Ok((old.to_string(), value.to_string()))
            }
        }
    }
}

fn parse_positive_u64(raw: &str) -> Result<u64, ConfigError> {
    let value: u64 = raw
        .parse()
        .map_err(|_| ConfigError::Validation(format!("not an integer: {}", raw)))?;
    if value == 0 {
        return Err(ConfigError::Validation("must be greater than 0".to_string()));
    }
    Ok(value)
}

fn parse_f64(raw: &str) -> Result<f64, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::Validation(format!("not a number: {}", raw)))
}
