//! Typed per-model constants read out of an effective configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConfigError, EffectiveConfig, Precision, document::json_type_name};

/// Hyperparameters and hardware constants a benchmark case must declare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConstants {
    /// Training sequence length in tokens.
    pub seqlength: u64,
    /// Padded sequence length handed to the launch script.
    pub padlength: u64,
    /// Micro batch size per device.
    pub batchsize: u64,
    /// Global batch size across all devices.
    pub gbs: u64,
    pub accumulate_steps: u64,
    pub epochs: u64,
    pub precision: Precision,
    pub tensor_parallel: u64,
    pub pipeline_parallel: u64,
    /// Theoretical peak FLOP/s of one device.
    pub theoryflops: f64,
    /// Effective FLOPs per token for one forward + backward pass.
    pub flops_per_token: f64,
}

impl ModelConstants {
    /// Keys that must be present, checked in this order.
    pub const REQUIRED_KEYS: [&'static str; 8] = [
        "seqlength",
        "batchsize",
        "gbs",
        "precision",
        "tensor_parallel",
        "pipeline_parallel",
        "theoryflops",
        "flops_per_token",
    ];

    /// Validate and extract constants, naming the first missing or malformed key.
    pub fn from_config(config: &EffectiveConfig) -> Result<Self, ConfigError> {
        if let Some(missing) = Self::REQUIRED_KEYS
            .iter()
            .find(|key| !config.contains_key(key))
        {
            return Err(ConfigError::MissingConfigKey((*missing).to_string()));
        }

        let seqlength = positive_int(config, "seqlength")?;

        Ok(Self {
            seqlength,
            padlength: optional_int(config, "padlength")?.unwrap_or(seqlength),
            batchsize: positive_int(config, "batchsize")?,
            gbs: positive_int(config, "gbs")?,
            accumulate_steps: optional_int(config, "accumulate_steps")?.unwrap_or(1),
            epochs: optional_int(config, "epochs")?.unwrap_or(1),
            precision: precision(config, "precision")?,
            tensor_parallel: positive_int(config, "tensor_parallel")?,
            pipeline_parallel: positive_int(config, "pipeline_parallel")?,
            theoryflops: positive_float(config, "theoryflops")?,
            flops_per_token: positive_float(config, "flops_per_token")?,
        })
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn required<'a>(config: &'a EffectiveConfig, key: &str) -> Result<&'a Value, ConfigError> {
    config
        .get(key)
        .ok_or_else(|| ConfigError::MissingConfigKey(key.to_string()))
}

fn as_int(key: &str, value: &Value) -> Result<u64, ConfigError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| invalid(key, format!("expected a non-negative integer, got {n}"))),
        // Launch scripts frequently carry numbers as strings.
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| invalid(key, format!("expected a non-negative integer, got \"{s}\""))),
        other => Err(invalid(
            key,
            format!("expected a non-negative integer, got {}", json_type_name(other)),
        )),
    }
}

fn positive_int(config: &EffectiveConfig, key: &str) -> Result<u64, ConfigError> {
    let n = as_int(key, required(config, key)?)?;
    if n == 0 {
        return Err(invalid(key, "must be greater than zero"));
    }
    Ok(n)
}

fn optional_int(config: &EffectiveConfig, key: &str) -> Result<Option<u64>, ConfigError> {
    config.get(key).map(|v| as_int(key, v)).transpose()
}

fn positive_float(config: &EffectiveConfig, key: &str) -> Result<f64, ConfigError> {
    let value = required(config, key)?;
    let x = match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| invalid(key, format!("expected a number, got {n}")))?,
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| invalid(key, format!("expected a number, got \"{s}\"")))?,
        other => {
            return Err(invalid(
                key,
                format!("expected a number, got {}", json_type_name(other)),
            ));
        }
    };
    if !x.is_finite() || x <= 0.0 {
        return Err(invalid(key, format!("must be a positive finite number, got {x}")));
    }
    Ok(x)
}

fn precision(config: &EffectiveConfig, key: &str) -> Result<Precision, ConfigError> {
    match required(config, key)? {
        Value::String(s) => s.parse().map_err(|e: String| invalid(key, e)),
        other => Err(invalid(
            key,
            format!("expected a string, got {}", json_type_name(other)),
        )),
    }
}
