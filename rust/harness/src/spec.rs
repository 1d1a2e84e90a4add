//! Job description parsed from the command line.

use std::path::{Path, PathBuf};

use xbench_config::Framework;

/// Stem of the file the rank-0 process writes the merged configuration to.
/// The case name is appended so cases sharing a train script never collide.
pub const EFFECTIVE_CONFIG_STEM: &str = "effective_config";
/// Base configuration expected next to the train script when none is given.
pub const BASE_CONFIG_FILE: &str = "base_config.json";
/// Vendor adapter script expected next to the vendor config file.
pub const ADAPTER_SCRIPT: &str = "training_adapter.sh";
/// Optional vendor network environment script next to the vendor config file.
pub const NET_SCRIPT: &str = "net.sh";
/// Pid file written into the log directory.
pub const PID_FILE: &str = "launcher.pid";

/// Immutable description of one benchmark run on one node.
#[derive(Debug, Clone, clap::Args)]
pub struct JobSpec {
    /// Accelerator vendor running this case.
    #[arg(long)]
    pub vendor: String,

    /// Benchmark case name.
    #[arg(long)]
    pub case_name: String,

    /// Model name of the case.
    #[arg(long)]
    pub model_name: String,

    /// Framework flavor deciding the launch command shape.
    #[arg(long, value_enum, default_value_t = Framework::Megatron)]
    pub framework: Framework,

    /// Number of nodes in the job.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub nnodes: u32,

    /// Processes (devices) per node.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub nproc: u32,

    /// Rank of this node, below `--nnodes`; rank 0 writes the effective config.
    #[arg(long, default_value_t = 0)]
    pub node_rank: u32,

    /// Address of the rank-0 node.
    #[arg(long, default_value = "127.0.0.1")]
    pub master_addr: String,

    /// Free port on the rank-0 node for the collective backend.
    #[arg(long, default_value_t = 29501)]
    pub master_port: u16,

    /// Repetition index of this case.
    #[arg(long, default_value_t = 1)]
    pub round: u32,

    #[arg(long, default_value = "/mnt/dataset/")]
    pub data_dir: PathBuf,

    #[arg(long, default_value = "./result")]
    pub log_dir: PathBuf,

    /// Vendor config file layered over the base config (JSON or TOML).
    #[arg(long)]
    pub config_file: PathBuf,

    /// Base config; defaults to `base_config.json` next to the train script.
    #[arg(long)]
    pub base_config: Option<PathBuf>,

    /// Launch script (megatron) or training entrypoint (deepspeed).
    #[arg(long)]
    pub train_script: PathBuf,

    /// Name of the accelerator visibility variable, e.g. `CUDA_VISIBLE_DEVICES`.
    #[arg(long)]
    pub visible_dev_env: Option<String>,

    /// Seconds non-zero ranks wait for the effective config to appear.
    #[arg(long, default_value_t = 120)]
    pub ready_timeout_secs: u64,

    /// Trailing arguments the harness does not know, forwarded verbatim to
    /// the training job. A `--` separator is accepted but not required.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub extra_args: Vec<String>,
}

impl JobSpec {
    /// Reject topologies that cannot form a job.
    ///
    /// The CLI already refuses zero counts; this also covers specs built in
    /// code and a node rank outside the job.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.nnodes == 0 || self.nproc == 0 {
            return Err(SpecError::EmptyTopology {
                nnodes: self.nnodes,
                nproc: self.nproc,
            });
        }
        if self.node_rank >= self.nnodes {
            return Err(SpecError::NodeRankOutOfRange {
                node_rank: self.node_rank,
                nnodes: self.nnodes,
            });
        }
        Ok(())
    }

    /// Total number of devices across all nodes.
    #[must_use]
    pub fn world_size(&self) -> u32 {
        self.nnodes * self.nproc
    }

    /// Whether this node writes the shared effective config.
    #[must_use]
    pub fn is_config_writer(&self) -> bool {
        self.node_rank == 0
    }

    /// Working directory of the launched job.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        parent_or_cwd(&self.train_script)
    }

    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        parent_or_cwd(&self.config_file)
    }

    #[must_use]
    pub fn base_config_path(&self) -> PathBuf {
        self.base_config
            .clone()
            .unwrap_or_else(|| self.work_dir().join(BASE_CONFIG_FILE))
    }

    #[must_use]
    pub fn effective_config_path(&self) -> PathBuf {
        let case: String = self
            .case_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.work_dir()
            .join(format!("{EFFECTIVE_CONFIG_STEM}_{case}.json"))
    }

    #[must_use]
    pub fn adapter_path(&self) -> PathBuf {
        self.config_dir().join(ADAPTER_SCRIPT)
    }

    #[must_use]
    pub fn net_script_path(&self) -> PathBuf {
        self.config_dir().join(NET_SCRIPT)
    }

    /// Per-rank combined stdout/stderr log of the training process.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(format!("rank{}.log.txt", self.node_rank))
    }

    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.log_dir.join(format!("rank{}.metrics.json", self.node_rank))
    }

    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.log_dir.join(PID_FILE)
    }
}

/// Topology errors in a [`JobSpec`].
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("job needs at least one node and one process per node (nnodes={nnodes}, nproc={nproc})")]
    EmptyTopology { nnodes: u32, nproc: u32 },
    #[error("node rank {node_rank} is outside a job of {nnodes} node(s)")]
    NodeRankOutOfRange { node_rank: u32, nnodes: u32 },
}

fn parent_or_cwd(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
