use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "gpu-qualify")]
#[command(about = "Qualify an RTX 3090 before buying it")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// CUDA device ordinal to test
    #[arg(long, global = true, default_value_t = 0)]
    pub device: usize,

    /// JSON device profile overriding the RTX 3090 thresholds
    #[arg(long, global = true)]
    pub profile: Option<PathBuf>,

    /// Run against a simulated healthy RTX 3090 instead of real hardware
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Debug-level logs on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Identity, VRAM capacity, compute capability, idle temperature and PCIe link
    Info,

    /// FP32/FP16 matmul throughput and memory bandwidth
    Perf,

    /// Soak most of the free VRAM with elementwise work and count errors
    Vram {
        /// Test duration in minutes
        #[arg(long, default_value_t = 5)]
        duration: u64,

        /// Test size in GB (4-23) or `auto` for 70% of free memory
        #[arg(long, default_value = "20")]
        size: String,
    },

    /// Heat the card with chained matmuls and watch the temperature
    Thermal {
        /// Test duration in minutes
        #[arg(long, default_value_t = 3)]
        duration: u64,

        /// GPU temperature limit in °C
        #[arg(long, default_value_t = 85)]
        limit: u32,
    },

    /// Run every check in order and exit with the worst result
    All {
        /// VRAM test duration in minutes
        #[arg(long, default_value_t = 5)]
        vram_duration: u64,

        /// VRAM test size in GB (4-23) or `auto`
        #[arg(long, default_value = "20")]
        size: String,

        /// Thermal test duration in minutes
        #[arg(long, default_value_t = 3)]
        thermal_duration: u64,

        /// GPU temperature limit in °C
        #[arg(long, default_value_t = 85)]
        limit: u32,
    },
}
