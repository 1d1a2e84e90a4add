//! Framework and precision enums shared by the harness and launch adapters.

use serde::{Deserialize, Serialize};

/// Training framework flavor, which decides the shape of the launch command.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    /// Vendor shell entrypoint taking positional hyperparameters.
    #[default]
    Megatron,
    /// `torchrun` + DeepSpeed with a JSON config file.
    Deepspeed,
}

/// Numeric precision the workload trains in.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Fp16,
    #[default]
    Bf16,
    Fp8,
    Amp,
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Megatron => write!(f, "megatron"),
            Self::Deepspeed => write!(f, "deepspeed"),
        }
    }
}

impl std::str::FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "megatron" | "megatron-lm" => Ok(Self::Megatron),
            "deepspeed" | "ds" => Ok(Self::Deepspeed),
            _ => Err(format!(
                "Unknown framework: '{s}'. Valid options: megatron, deepspeed"
            )),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fp32 => write!(f, "fp32"),
            Self::Fp16 => write!(f, "fp16"),
            Self::Bf16 => write!(f, "bf16"),
            Self::Fp8 => write!(f, "fp8"),
            Self::Amp => write!(f, "amp"),
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Ok(Self::Fp32),
            "fp16" | "f16" | "float16" | "half" => Ok(Self::Fp16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            "fp8" | "f8" => Ok(Self::Fp8),
            "amp" => Ok(Self::Amp),
            _ => Err(format!(
                "Unknown precision: '{s}'. Valid options: fp32, fp16, bf16, fp8, amp"
            )),
        }
    }
}
