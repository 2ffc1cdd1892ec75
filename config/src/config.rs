use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::namespace::validate_namespace;
use crate::settings::{GroupqSettings, SETTINGS_FIELDS};

pub const DEFAULT_CONFIG_FILENAME: &str = "groupq.toml";
pub const ENV_CONFIG_KEY: &str = "GROUPQ_CONFIG";

pub fn resolve_config_source(config_path: Option<&str>) -> (Option<String>, String) {
    if let Some(path) = config_path {
        return (Some(path.to_string()), "--config parameter".to_string());
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_KEY)
        && !env_path.is_empty()
    {
        return (Some(env_path), format!("{ENV_CONFIG_KEY} env var"));
    }

    let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
    if default_path.is_file() {
        return (
            Some(default_path.to_string_lossy().to_string()),
            format!("{DEFAULT_CONFIG_FILENAME} in cwd"),
        );
    }

    (None, "not found".to_string())
}

/// Loads settings from the resolved TOML file (if any) with `GROUPQ_*`
/// environment overrides merged on top. Without a file, defaults plus
/// environment are used.
pub fn load_toml_settings(config_path: Option<&str>) -> Result<GroupqSettings> {
    dotenvy::dotenv().ok();

    let (path, _) = resolve_config_source(config_path);
    let file_value = match path {
        Some(path) => {
            let payload = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {path}"))?;
            let toml_value: toml::Value = toml::from_str(&payload)
                .with_context(|| format!("failed to parse TOML at {path}"))?;
            let json_value =
                serde_json::to_value(toml_value).context("failed to convert TOML to JSON")?;
            normalize_toml_payload(json_value)?
        }
        None => Value::Object(Map::new()),
    };

    let merged = deep_merge(file_value, env_overrides()?);
    let settings: GroupqSettings = serde_json::from_value(merged.clone()).map_err(|err| {
        let hint = diagnose_config_error(&merged, &err);
        anyhow::anyhow!("invalid groupq config: {err}{hint}")
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn normalize_toml_payload(payload: Value) -> Result<Value> {
    match payload {
        Value::Object(mut map) => match map.remove("groupq") {
            Some(Value::Object(inner)) => Ok(Value::Object(inner)),
            Some(_) => Err(anyhow::anyhow!("[groupq] must be a TOML table")),
            None => Ok(Value::Object(map)),
        },
        _ => Err(anyhow::anyhow!("groupq config must be a TOML table")),
    }
}

fn env_overrides() -> Result<Value> {
    let mut payload = Map::new();

    set_env_string(&mut payload, "redis_dsn", "GROUPQ_REDIS_DSN");
    set_env_string(&mut payload, "namespace", "GROUPQ_NAMESPACE");
    set_env_int(&mut payload, "job_timeout_ms", "GROUPQ_JOB_TIMEOUT_MS")?;
    set_env_int(&mut payload, "max_attempts", "GROUPQ_MAX_ATTEMPTS")?;
    set_env_int(
        &mut payload,
        "reserve_scan_limit",
        "GROUPQ_RESERVE_SCAN_LIMIT",
    )?;
    set_env_int(
        &mut payload,
        "worker_concurrency",
        "GROUPQ_WORKER_CONCURRENCY",
    )?;
    set_env_int(&mut payload, "poll_interval_ms", "GROUPQ_POLL_INTERVAL_MS")?;
    set_env_int(
        &mut payload,
        "max_poll_interval_ms",
        "GROUPQ_MAX_POLL_INTERVAL_MS",
    )?;
    set_env_bool(&mut payload, "heartbeat_enabled", "GROUPQ_HEARTBEAT_ENABLED")?;
    set_env_int(
        &mut payload,
        "heartbeat_interval_ms",
        "GROUPQ_HEARTBEAT_INTERVAL_MS",
    )?;
    set_env_bool(&mut payload, "reaper_enabled", "GROUPQ_REAPER_ENABLED")?;
    set_env_int(
        &mut payload,
        "reaper_interval_ms",
        "GROUPQ_REAPER_INTERVAL_MS",
    )?;
    set_env_int(&mut payload, "reaper_batch_size", "GROUPQ_REAPER_BATCH_SIZE")?;
    set_env_int(
        &mut payload,
        "base_retry_delay_ms",
        "GROUPQ_BASE_RETRY_DELAY_MS",
    )?;
    set_env_int(
        &mut payload,
        "max_retry_delay_ms",
        "GROUPQ_MAX_RETRY_DELAY_MS",
    )?;
    set_env_float(&mut payload, "retry_jitter", "GROUPQ_RETRY_JITTER")?;
    set_env_int(
        &mut payload,
        "shutdown_grace_period_ms",
        "GROUPQ_SHUTDOWN_GRACE_PERIOD_MS",
    )?;

    Ok(Value::Object(payload))
}

fn set_env_string(map: &mut Map<String, Value>, key: &str, env: &str) {
    if let Ok(value) = std::env::var(env)
        && !value.is_empty()
    {
        map.insert(key.to_string(), Value::String(value));
    }
}

fn set_env_int(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: i64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        map.insert(key.to_string(), Value::Number(parsed.into()));
    }
    Ok(())
}

fn set_env_float(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: f64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        map.insert(
            key.to_string(),
            Value::Number(
                serde_json::Number::from_f64(parsed)
                    .ok_or_else(|| anyhow::anyhow!("Invalid {env} value: {value}"))?,
            ),
        );
    }
    Ok(())
}

fn set_env_bool(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        let parsed = match value.trim().to_ascii_lowercase().as_str() {
            "" => return Ok(()),
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => anyhow::bail!("Invalid {env} value: {value}"),
        };
        map.insert(key.to_string(), Value::Bool(parsed));
    }
    Ok(())
}

fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let entry = base_map.remove(&key);
                let merged = match entry {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay_value) => overlay_value,
    }
}

fn diagnose_config_error(config: &Value, err: &serde_json::Error) -> String {
    let err_msg = err.to_string().to_lowercase();

    if err_msg.contains("unknown field")
        && let Some(obj) = config.as_object()
        && let Some(key) = obj
            .keys()
            .find(|key| !SETTINGS_FIELDS.contains(&key.as_str()))
    {
        return format!(
            "\n\nHint: unknown setting '{key}'. Valid settings are: {}",
            SETTINGS_FIELDS.join(", ")
        );
    }

    if err_msg.contains("invalid type") || err_msg.contains("invalid value") {
        for key in ["worker_concurrency", "reserve_scan_limit", "reaper_batch_size"] {
            if let Some(value) = config.get(key)
                && !value.is_u64()
            {
                return format!(
                    "\n\nHint: {key} must be a positive integer, got: {value}"
                );
            }
        }
    }

    String::new()
}

pub fn validate_settings(settings: &GroupqSettings) -> Result<()> {
    validate_namespace(&settings.namespace)?;

    if settings.job_timeout_ms <= 0 {
        anyhow::bail!(
            "job_timeout_ms must be positive, got {}",
            settings.job_timeout_ms
        );
    }
    if settings.max_attempts < 1 {
        anyhow::bail!(
            "max_attempts must be at least 1, got {}",
            settings.max_attempts
        );
    }
    if settings.worker_concurrency == 0 {
        anyhow::bail!("worker_concurrency must be a positive integer");
    }
    if settings.reserve_scan_limit == 0 {
        anyhow::bail!("reserve_scan_limit must be a positive integer");
    }
    if settings.reaper_batch_size == 0 {
        anyhow::bail!("reaper_batch_size must be a positive integer");
    }

    let job_timeout = settings.job_timeout();
    if let Some(interval) = settings.reaper_interval()
        && interval >= job_timeout
    {
        anyhow::bail!(
            "reaper interval ({}ms) must be shorter than job_timeout_ms ({}ms)",
            interval.as_millis(),
            job_timeout.as_millis()
        );
    }
    if let Some(interval) = settings.heartbeat_interval()
        && interval >= job_timeout
    {
        anyhow::bail!(
            "heartbeat interval ({}ms) must be shorter than job_timeout_ms ({}ms)",
            interval.as_millis(),
            job_timeout.as_millis()
        );
    }

    if !(0.0..1.0).contains(&settings.retry_jitter) {
        anyhow::bail!(
            "retry_jitter must be in [0, 1), got {}",
            settings.retry_jitter
        );
    }
    if settings.max_retry_delay_ms < settings.base_retry_delay_ms {
        anyhow::bail!(
            "max_retry_delay_ms ({}) must not be smaller than base_retry_delay_ms ({})",
            settings.max_retry_delay_ms,
            settings.base_retry_delay_ms
        );
    }

    Ok(())
}
