use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sensorimotor_runtime::config::{ConfigError, RuntimeConfig};
use sensorimotor_runtime::motor::{ControllerMode, Direction};

/// Closed-loop runtime for a single sensorimotor
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port of the motor bus
    #[arg(long)]
    port: Option<String>,

    #[arg(long)]
    baudrate: Option<u32>,

    /// Motor ID
    #[arg(long)]
    id: Option<u8>,

    /// Motor is mounted reversed
    #[arg(long)]
    reverse: bool,

    #[arg(long, value_enum)]
    mode: Option<ControllerMode>,

    #[arg(long, allow_negative_numbers = true)]
    target_voltage: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    target_position: Option<f64>,

    /// csl mode, negative releases and positive contracts
    #[arg(long, allow_negative_numbers = true)]
    csl_mode: Option<f64>,

    #[arg(long)]
    csl_feedback: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    limit_low: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    limit_high: Option<f64>,

    /// Proportional gain of the position controller
    #[arg(long)]
    kp: Option<f64>,

    /// |position| at which the controller is disabled
    #[arg(long)]
    disable_angle: Option<f64>,

    #[arg(long)]
    loop_hz: Option<u64>,

    /// Stop after this many cycles
    #[arg(long)]
    cycles: Option<u64>,

    /// Run against a simulated motor
    #[arg(long)]
    simulate: bool,

    /// Only ping the motor and exit
    #[arg(long)]
    ping: bool,
}

impl Args {
    fn into_config(self) -> Result<RuntimeConfig, ConfigError> {
        let mut cfg = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };

        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(baudrate) = self.baudrate {
            cfg.baudrate = baudrate;
        }
        if let Some(id) = self.id {
            cfg.motor_id = id;
        }
        if self.reverse {
            cfg.direction = Direction::Reverse;
        }
        if let Some(mode) = self.mode {
            cfg.mode = mode;
        }
        cfg.target_voltage = self.target_voltage.unwrap_or(cfg.target_voltage);
        cfg.target_position = self.target_position.unwrap_or(cfg.target_position);
        cfg.target_csl_mode = self.csl_mode.unwrap_or(cfg.target_csl_mode);
        cfg.target_csl_feedback = self.csl_feedback.unwrap_or(cfg.target_csl_feedback);
        cfg.limit_low = self.limit_low.unwrap_or(cfg.limit_low);
        cfg.limit_high = self.limit_high.unwrap_or(cfg.limit_high);
        cfg.proportional_gain = self.kp.unwrap_or(cfg.proportional_gain);
        cfg.disable_angle = self.disable_angle.unwrap_or(cfg.disable_angle);
        cfg.loop_hz = self.loop_hz.unwrap_or(cfg.loop_hz);
        if self.cycles.is_some() {
            cfg.cycles = self.cycles;
        }
        cfg.simulate |= self.simulate;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let ping_only = args.ping;
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = sensorimotor_runtime::runtime::run(config, ping_only).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
