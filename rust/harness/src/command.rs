//! Launch command construction.
//!
//! Pure formatting: a [`JobSpec`] plus the effective configuration become the
//! exact argument vector and environment for one node. Nothing here touches
//! the filesystem.

use std::{collections::BTreeMap, fmt, path::PathBuf};

use serde::Serialize;
use xbench_config::{ConfigError, EffectiveConfig, Framework, ModelConstants};

use crate::spec::JobSpec;

/// Program, arguments, environment and working directory of one launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchCommand {
    /// Layer extra environment entries on top; later entries win.
    #[must_use]
    pub fn with_env<I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(extra);
        self
    }

    /// Program followed by its arguments.
    #[must_use]
    pub fn tokens(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cwd) = &self.cwd {
            write!(f, "cd {}; ", cwd.display())?;
        }
        for (k, v) in &self.env {
            write!(f, "{k}={v} ")?;
        }
        write!(f, "{}", self.tokens().join(" "))
    }
}

/// Build the launch command for `spec`'s node.
pub fn build(spec: &JobSpec, config: &EffectiveConfig) -> Result<LaunchCommand, BuildError> {
    let constants = ModelConstants::from_config(config)?;

    let script = spec
        .train_script
        .file_name()
        .ok_or_else(|| BuildError::MissingScriptName(spec.train_script.clone()))?
        .to_string_lossy()
        .into_owned();

    let mut args = match spec.framework {
        Framework::Megatron => megatron_args(spec, &constants, script),
        Framework::Deepspeed => deepspeed_args(spec, &constants, script),
    };
    args.extend(spec.extra_args.iter().cloned());

    let program = match spec.framework {
        Framework::Megatron => "bash",
        Framework::Deepspeed => "torchrun",
    };

    Ok(LaunchCommand {
        program: program.to_string(),
        args,
        env: topology_env(spec),
        cwd: Some(spec.work_dir()),
    })
}

/// `bash <script> <data_dir> <nproc> <nnodes> <node_rank> <addr> <port> <hyperparams…> <adapter>`
fn megatron_args(spec: &JobSpec, c: &ModelConstants, script: String) -> Vec<String> {
    vec![
        script,
        spec.data_dir.display().to_string(),
        spec.nproc.to_string(),
        spec.nnodes.to_string(),
        spec.node_rank.to_string(),
        spec.master_addr.clone(),
        spec.master_port.to_string(),
        c.batchsize.to_string(),
        c.gbs.to_string(),
        c.seqlength.to_string(),
        c.padlength.to_string(),
        c.precision.to_string(),
        c.tensor_parallel.to_string(),
        c.pipeline_parallel.to_string(),
        spec.adapter_path().display().to_string(),
    ]
}

fn deepspeed_args(spec: &JobSpec, c: &ModelConstants, script: String) -> Vec<String> {
    let effective = spec.effective_config_path().display().to_string();
    vec![
        format!("--nproc_per_node={}", spec.nproc),
        format!("--nnodes={}", spec.nnodes),
        format!("--node_rank={}", spec.node_rank),
        format!("--master_addr={}", spec.master_addr),
        format!("--master_port={}", spec.master_port),
        script,
        "--flagperf_config".into(),
        spec.config_file.display().to_string(),
        "--node_rank".into(),
        spec.node_rank.to_string(),
        "--nproc_per_node".into(),
        spec.nproc.to_string(),
        "--nnodes".into(),
        spec.nnodes.to_string(),
        "--seq_length".into(),
        c.seqlength.to_string(),
        "--micro_batch_size".into(),
        c.batchsize.to_string(),
        "--global_batch_size".into(),
        c.gbs.to_string(),
        "--tensor_parallel".into(),
        c.tensor_parallel.to_string(),
        "--pipeline_parallel".into(),
        c.pipeline_parallel.to_string(),
        "--precision".into(),
        c.precision.to_string(),
        "--deepspeed".into(),
        "--deepspeed_config".into(),
        effective,
        "--data_dir".into(),
        spec.data_dir.display().to_string(),
    ]
}

fn topology_env(spec: &JobSpec) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("MASTER_ADDR".to_string(), spec.master_addr.clone()),
        ("MASTER_PORT".to_string(), spec.master_port.to_string()),
        ("NNODES".to_string(), spec.nnodes.to_string()),
        ("NODE_RANK".to_string(), spec.node_rank.to_string()),
        ("NPROC_PER_NODE".to_string(), spec.nproc.to_string()),
        ("WORLD_SIZE".to_string(), spec.world_size().to_string()),
    ]);

    if let Some(var) = &spec.visible_dev_env {
        let devices = (0..spec.nproc)
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        env.insert(var.clone(), devices);
    }

    env
}

/// Parse `export KEY=VALUE` / `KEY=VALUE` statements of a vendor network script.
///
/// Statements are separated by newlines or by `;` outside quotes, so a
/// one-line script such as `export A=0;export B=eth0;` yields both entries.
/// Comments, blank statements and anything that is not an assignment are
/// skipped. One level of matching single or double quotes around the value
/// is removed.
#[must_use]
pub fn parse_env_script(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .flat_map(split_statements)
        .filter_map(parse_assignment)
        .collect()
}

/// Split one line on `;` that are not inside single or double quotes.
fn split_statements(line: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut quote = None;
    let mut start = 0;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, ';') => {
                statements.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    statements.push(&line[start..]);
    statements
}

fn parse_assignment(statement: &str) -> Option<(String, String)> {
    let statement = statement.trim();
    if statement.is_empty() || statement.starts_with('#') {
        return None;
    }
    let assignment = statement
        .strip_prefix("export ")
        .unwrap_or(statement)
        .trim_start();
    let (key, value) = assignment.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(q)
            .and_then(|v| v.strip_suffix(q))
        {
            return inner;
        }
    }
    value
}

/// Errors that can occur when building a launch command.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing required config key `{0}`")]
    MissingConfigKey(String),
    #[error("invalid value for config key `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("train script path {0} has no file name")]
    MissingScriptName(PathBuf),
    #[error(transparent)]
    Config(ConfigError),
}

impl From<ConfigError> for BuildError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::MissingConfigKey(key) => Self::MissingConfigKey(key),
            ConfigError::InvalidValue { key, reason } => Self::InvalidValue { key, reason },
            other => Self::Config(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::spec::tests::sample_spec;

    fn config() -> EffectiveConfig {
        EffectiveConfig::from_json_str(
            &json!({
                "seqlength": 2048,
                "padlength": 2048,
                "batchsize": 1,
                "gbs": 512,
                "precision": "bf16",
                "tensor_parallel": 2,
                "pipeline_parallel": 1,
                "theoryflops": 312e12,
                "flops_per_token": 13.8e9,
                "steps_per_print": 10,
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_megatron_command() {
        let cmd = build(&sample_spec(), &config()).unwrap();
        assert_eq!(cmd.program, "bash");
        assert_eq!(
            cmd.args,
            vec![
                "megatron_pai_main.sh",
                "/mnt/dataset/qwen",
                "8",
                "2",
                "0",
                "10.0.0.1",
                "29501",
                "1",
                "512",
                "2048",
                "2048",
                "bf16",
                "2",
                "1",
                "/cases/nvidia/qwen/training_adapter.sh",
            ]
        );
        assert_eq!(cmd.cwd, Some(PathBuf::from("/bench/qwen/megatron")));
        assert_eq!(cmd.env["WORLD_SIZE"], "16");
        assert_eq!(cmd.env["CUDA_VISIBLE_DEVICES"], "0,1,2,3,4,5,6,7");
    }

    #[test]
    fn test_deepspeed_command() {
        let mut spec = sample_spec();
        spec.framework = Framework::Deepspeed;
        spec.train_script = PathBuf::from("/bench/llama/deepspeed/run_pretraining.py");
        spec.extra_args = vec!["--zero-stage".into(), "3".into()];

        let cmd = build(&spec, &config()).unwrap();
        let line = cmd.tokens().join(" ");
        assert_eq!(cmd.program, "torchrun");
        assert!(line.starts_with(
            "torchrun --nproc_per_node=8 --nnodes=2 --node_rank=0 \
             --master_addr=10.0.0.1 --master_port=29501 run_pretraining.py"
        ));
        assert!(line.contains(
            "run_pretraining.py --flagperf_config /cases/nvidia/qwen/config_A100x2x8.toml"
        ));
        assert!(line.contains(&format!(
            "--deepspeed --deepspeed_config {}",
            spec.effective_config_path().display()
        )));
        assert!(line.contains("--seq_length 2048 --micro_batch_size 1 --global_batch_size 512"));
        assert!(line.ends_with("--data_dir /mnt/dataset/qwen --zero-stage 3"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build(&sample_spec(), &config()).unwrap();
        let b = build(&sample_spec(), &config()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_only_rank_tokens_change_with_node_rank() {
        for framework in [Framework::Megatron, Framework::Deepspeed] {
            let mut rank0 = sample_spec();
            rank0.framework = framework;
            let mut rank1 = rank0.clone();
            rank1.node_rank = 1;

            let a = build(&rank0, &config()).unwrap();
            let b = build(&rank1, &config()).unwrap();
            assert_eq!(a.args.len(), b.args.len());

            for (x, y) in a.args.iter().zip(&b.args) {
                if x != y {
                    assert!(
                        (x == "0" && y == "1") || (x == "--node_rank=0" && y == "--node_rank=1"),
                        "{framework}: unexpected difference {x} vs {y}"
                    );
                }
            }

            let env_diff: Vec<_> = a
                .env
                .iter()
                .filter(|(k, v)| b.env.get(*k) != Some(*v))
                .map(|(k, _)| k.as_str())
                .collect();
            assert_eq!(env_diff, vec!["NODE_RANK"]);
            assert_eq!(a.program, b.program);
            assert_eq!(a.cwd, b.cwd);
        }
    }

    #[test]
    fn test_missing_key_is_named() {
        let mut cfg = config();
        let mut map = cfg.as_map().clone();
        map.remove("tensor_parallel");
        cfg = EffectiveConfig::new(map);

        let err = build(&sample_spec(), &cfg).unwrap_err();
        assert!(matches!(err, BuildError::MissingConfigKey(ref k) if k == "tensor_parallel"));
        assert_eq!(err.to_string(), "missing required config key `tensor_parallel`");
    }

    #[test]
    fn test_parse_env_script() {
        let env = parse_env_script(
            "#!/bin/bash\n\
             # vendor network tuning\n\
             export NCCL_SOCKET_IFNAME=eth0\n\
             export NCCL_IB_DISABLE=\"1\";\n\
             GLOO_SOCKET_IFNAME='eth0'\n\
             echo configuring\n\
             \n",
        );
        assert_eq!(
            env,
            vec![
                ("NCCL_SOCKET_IFNAME".to_string(), "eth0".to_string()),
                ("NCCL_IB_DISABLE".to_string(), "1".to_string()),
                ("GLOO_SOCKET_IFNAME".to_string(), "eth0".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_one_line_env_script() {
        let env = parse_env_script(
            "export NCCL_IB_DISABLE=0;export NCCL_SOCKET_IFNAME=eth0;\n\
             export NCCL_DEBUG_SUBSYS='INIT;NET'; GLOO_SOCKET_IFNAME=eth1\n",
        );
        assert_eq!(
            env,
            vec![
                ("NCCL_IB_DISABLE".to_string(), "0".to_string()),
                ("NCCL_SOCKET_IFNAME".to_string(), "eth0".to_string()),
                ("NCCL_DEBUG_SUBSYS".to_string(), "INIT;NET".to_string()),
                ("GLOO_SOCKET_IFNAME".to_string(), "eth1".to_string()),
            ]
        );
    }

    #[test]
    fn test_with_env_overrides_defaults() {
        let cmd = build(&sample_spec(), &config())
            .unwrap()
            .with_env([("MASTER_PORT".to_string(), "30000".to_string())]);
        assert_eq!(cmd.env["MASTER_PORT"], "30000");
    }
}
