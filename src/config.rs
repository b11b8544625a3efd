use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::dataset::insitu::INSITU_NVAR;
use crate::dataset::{AssemblerOptions, InsituOptions};

/// Upsampling algorithm of the decoder
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMethod {
    Nearest,
    #[default]
    Bilinear,
}

impl FromStr for ResizeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nearest" | "nearest_neighbor" => Ok(ResizeMethod::Nearest),
            "bilinear" => Ok(ResizeMethod::Bilinear),
            other => Err(format!("Unknown resize method: {}", other)),
        }
    }
}

impl fmt::Display for ResizeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResizeMethod::Nearest => write!(f, "nearest"),
            ResizeMethod::Bilinear => write!(f, "bilinear"),
        }
    }
}

/// Options of a training run, written to `config.json` in the output directory
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub resize_method: ResizeMethod,
    pub epochs: usize,
    pub batch_size: usize,
    /// Export period in epochs
    pub save_each: usize,
    /// Checkpoint period in epochs (0 disables checkpoints)
    pub save_model_each: usize,
    /// 1-based decoder stages receiving an encoder skip connection
    pub skipconnections: Vec<usize>,
    pub dropout_rate_train: f32,
    /// Use the Kullback-Leibler loss
    pub truth_uncertain: bool,
    pub shuffle_buffer_size: usize,
    /// Number of input channels
    pub nvar: usize,
    /// Channel widths of the encoder stages
    pub enc_ksize_internal: Vec<usize>,
    /// Global gradient norm threshold
    pub clip_grad: f64,
    #[serde(rename = "regularization_L2_beta")]
    pub regularization_l2_beta: f64,
    pub learning_rate: f64,
    /// Epochs over which the learning rate halves; `None` keeps it constant
    pub learning_rate_decay_epoch: Option<f64>,
    /// Batches assembled ahead of the optimizer
    pub prefetch: usize,
    pub obs_err_std: f32,
    pub jitter_std: f32,
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            resize_method: ResizeMethod::Bilinear,
            epochs: 1000,
            batch_size: 50,
            save_each: 10,
            save_model_each: 500,
            skipconnections: vec![1, 2, 3, 4],
            dropout_rate_train: 0.3,
            truth_uncertain: false,
            shuffle_buffer_size: 10,
            nvar: 10,
            enc_ksize_internal: vec![16, 24, 36, 54],
            clip_grad: 5.0,
            regularization_l2_beta: 0.0,
            learning_rate: 1e-3,
            learning_rate_decay_epoch: None,
            prefetch: 2,
            obs_err_std: 1.0,
            jitter_std: 0.05,
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Defaults of the monthly in-situ run: small batches of the 12 months, no
    /// skip connections, L2 regularisation and fewer epochs
    pub fn insitu_defaults() -> Self {
        Self {
            epochs: 200,
            batch_size: 12,
            skipconnections: Vec::new(),
            shuffle_buffer_size: 12,
            nvar: INSITU_NVAR,
            regularization_l2_beta: 0.05,
            ..Self::default()
        }
    }

    /// Learning rate of the 0-based `epoch`: `learning_rate * 0.5^(epoch / decay)`
    pub fn learning_rate_at(&self, epoch: usize) -> f64 {
        match self.learning_rate_decay_epoch {
            Some(decay) => self.learning_rate * 0.5f64.powf(epoch as f64 / decay),
            None => self.learning_rate,
        }
    }

    pub fn assembler_options(&self, train: bool) -> AssemblerOptions {
        AssemblerOptions {
            obs_err_std: self.obs_err_std,
            jitter_std: self.jitter_std,
            train,
            seed: self.seed,
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.epochs == 0 {
            return Err("epochs must be positive".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be positive".to_string());
        }
        if self.save_each == 0 {
            return Err("save_each must be positive".to_string());
        }
        if self.nvar == 0 {
            return Err("nvar must be positive".to_string());
        }
        if self.enc_ksize_internal.is_empty() || self.enc_ksize_internal.contains(&0) {
            return Err("enc_ksize_internal must list positive channel widths".to_string());
        }
        let nstages = self.enc_ksize_internal.len();
        if let Some(l) = self.skipconnections.iter().find(|&&l| l == 0 || l > nstages) {
            return Err(format!(
                "skip connection {} outside decoder stages 1..={}",
                l, nstages
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_rate_train) {
            return Err("dropout_rate_train must be in [0, 1)".to_string());
        }
        if !(self.clip_grad > 0.0) {
            return Err("clip_grad must be positive".to_string());
        }
        if !(self.regularization_l2_beta >= 0.0) {
            return Err("regularization_L2_beta must be non-negative".to_string());
        }
        if !(self.learning_rate > 0.0) {
            return Err("learning_rate must be positive".to_string());
        }
        if let Some(decay) = self.learning_rate_decay_epoch {
            if !(decay > 0.0) {
                return Err("learning_rate_decay_epoch must be positive".to_string());
            }
        }
        if !(self.obs_err_std > 0.0) {
            return Err("obs_err_std must be positive".to_string());
        }
        if !(self.jitter_std >= 0.0) {
            return Err("jitter_std must be non-negative".to_string());
        }
        Ok(())
    }

    /// Build from the training arguments of a subcommand
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, String> {
        Self::from_matches_with(matches, Self::default())
    }

    /// Same as [`TrainingConfig::from_matches`], falling back to `defaults`
    pub fn from_matches_with(matches: &ArgMatches, defaults: Self) -> Result<Self, String> {
        let config = Self {
            resize_method: parse_arg(matches, "resize-method")?.unwrap_or(defaults.resize_method),
            epochs: parse_arg(matches, "epochs")?.unwrap_or(defaults.epochs),
            batch_size: parse_arg(matches, "batch-size")?.unwrap_or(defaults.batch_size),
            save_each: parse_arg(matches, "save-each")?.unwrap_or(defaults.save_each),
            save_model_each: parse_arg(matches, "save-model-each")?.unwrap_or(defaults.save_model_each),
            skipconnections: parse_list(matches, "skipconnections")?.unwrap_or(defaults.skipconnections),
            dropout_rate_train: parse_arg(matches, "dropout")?.unwrap_or(defaults.dropout_rate_train),
            truth_uncertain: matches.get_flag("truth-uncertain"),
            shuffle_buffer_size: parse_arg(matches, "shuffle-buffer-size")?
                .unwrap_or(defaults.shuffle_buffer_size),
            nvar: defaults.nvar,
            enc_ksize_internal: parse_list(matches, "enc-ksize-internal")?
                .unwrap_or(defaults.enc_ksize_internal),
            clip_grad: parse_arg(matches, "clip-grad")?.unwrap_or(defaults.clip_grad),
            regularization_l2_beta: parse_arg(matches, "l2-beta")?.unwrap_or(defaults.regularization_l2_beta),
            learning_rate: parse_arg(matches, "learning-rate")?.unwrap_or(defaults.learning_rate),
            learning_rate_decay_epoch: parse_arg(matches, "learning-rate-decay-epoch")?,
            prefetch: parse_arg(matches, "prefetch")?.unwrap_or(defaults.prefetch),
            obs_err_std: parse_arg(matches, "obs-err-std")?.unwrap_or(defaults.obs_err_std),
            jitter_std: parse_arg(matches, "jitter-std")?.unwrap_or(defaults.jitter_std),
            seed: parse_arg(matches, "seed")?,
        };
        Ok(config)
    }
}

/// Options of the in-situ run not covered by [`TrainingConfig`]
pub fn insitu_options_from_matches(matches: &ArgMatches, lat: &[f64]) -> Result<InsituOptions, String> {
    let defaults = InsituOptions::default().with_grid_jitter(lat);
    Ok(InsituOptions {
        mean_value: parse_arg(matches, "mean-value")?.unwrap_or(defaults.mean_value),
        jitter_std_value: parse_arg(matches, "jitter-std-value")?.unwrap_or(defaults.jitter_std_value),
        gap_radius: parse_arg(matches, "gap-radius")?.unwrap_or(defaults.gap_radius),
        min_gap_count: parse_arg(matches, "min-gap-count")?.unwrap_or(defaults.min_gap_count),
        seed: parse_arg(matches, "seed")?,
        ..defaults
    })
}

/// Parse an optional argument given as a string
fn parse_arg<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, String>
where
    T::Err: fmt::Display,
{
    match matches.try_get_one::<String>(name) {
        Ok(Some(value)) => value
            .parse()
            .map(Some)
            .map_err(|e| format!("Invalid {}: {} ({})", name, value, e)),
        _ => Ok(None),
    }
}

/// Parse an optional comma-separated list
fn parse_list<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<Vec<T>>, String>
where
    T::Err: fmt::Display,
{
    match matches.try_get_one::<String>(name) {
        Ok(Some(value)) if value.trim().is_empty() => Ok(Some(Vec::new())),
        Ok(Some(value)) => value
            .split(',')
            .map(|item| {
                item.trim()
                    .parse()
                    .map_err(|e| format!("Invalid {}: {} ({})", name, item, e))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        _ => Ok(None),
    }
}

fn value_arg(name: &'static str, value_name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).value_name(value_name).help(help)
}

fn training_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("output-dir")
            .short('o')
            .long("output-dir")
            .value_name("DIR")
            .help("Directory for reconstructions and checkpoints")
            .required(true),
    )
    .arg(value_arg("epochs", "COUNT", "Number of training epochs"))
    .arg(value_arg("batch-size", "COUNT", "Samples per minibatch"))
    .arg(value_arg("save-each", "EPOCHS", "Export period in epochs"))
    .arg(value_arg("save-model-each", "EPOCHS", "Checkpoint period in epochs (0 disables)"))
    .arg(value_arg("skipconnections", "LIST", "Decoder stages with skip connections, e.g. 1,2,3,4"))
    .arg(value_arg("dropout", "RATE", "Bottleneck dropout rate during training"))
    .arg(
        Arg::new("truth-uncertain")
            .long("truth-uncertain")
            .help("Use the Kullback-Leibler loss")
            .action(ArgAction::SetTrue),
    )
    .arg(value_arg("shuffle-buffer-size", "COUNT", "Shuffle window of the training stream"))
    .arg(value_arg("enc-ksize-internal", "LIST", "Encoder channel widths, e.g. 16,24,36,54"))
    .arg(value_arg("clip-grad", "NORM", "Global gradient norm threshold"))
    .arg(value_arg("l2-beta", "BETA", "L2 weight regularisation coefficient"))
    .arg(value_arg("learning-rate", "RATE", "Initial learning rate"))
    .arg(value_arg("learning-rate-decay-epoch", "EPOCHS", "Epochs over which the learning rate halves"))
    .arg(value_arg("prefetch", "COUNT", "Batches assembled ahead of the optimizer"))
    .arg(value_arg("resize-method", "METHOD", "Decoder upsampling: nearest or bilinear"))
    .arg(value_arg("obs-err-std", "STD", "Observation error standard deviation"))
    .arg(value_arg("jitter-std", "STD", "Noise added to the value channels in training"))
    .arg(value_arg("seed", "SEED", "Seed of the augmentation random generator"))
}

/// Command line interface
pub fn build_cli() -> Command {
    Command::new("dincae_rust")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Gap filling of gridded geophysical fields with a convolutional auto-encoder")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(training_args(
            Command::new("reconstruct")
                .about("Train on a gridded field and export reconstructions")
                .arg(
                    Arg::new("input")
                        .short('i')
                        .long("input")
                        .value_name("FILE")
                        .help("NetCDF file with lon, lat, time and the variable")
                        .required(true),
                )
                .arg(
                    Arg::new("varname")
                        .short('n')
                        .long("varname")
                        .value_name("NAME")
                        .help("Name of the gridded variable")
                        .required(true),
                ),
        ))
        .subcommand(training_args(
            Command::new("insitu")
                .about("Train on binned in-situ observations and export monthly reconstructions")
                .arg(
                    Arg::new("obs")
                        .long("obs")
                        .value_name("FILE")
                        .help("NetCDF file with obslon, obslat, obsdepth, obstime and the variable")
                        .required(true),
                )
                .arg(
                    Arg::new("mask")
                        .long("mask")
                        .value_name("FILE")
                        .help("NetCDF file with lon, lat and mask")
                        .required(true),
                )
                .arg(
                    Arg::new("varname")
                        .short('n')
                        .long("varname")
                        .value_name("NAME")
                        .help("Name of the observed variable")
                        .required(true),
                )
                .arg(
                    Arg::new("cv")
                        .long("cv")
                        .value_name("FILE")
                        .help("Independent observations for the cross-validation RMS"),
                )
                .arg(value_arg("mean-value", "VALUE", "Constant background field"))
                .arg(value_arg("jitter-std-value", "STD", "Noise added to binned observations"))
                .arg(value_arg("gap-radius", "DEGREES", "Radius of the synthetic gap"))
                .arg(value_arg("min-gap-count", "COUNT", "Observed cells a synthetic gap must cover")),
        ))
        .subcommand(
            Command::new("cvrms")
                .about("Monthly RMS of a reconstruction against independent observations")
                .arg(
                    Arg::new("reconstruction")
                        .short('r')
                        .long("reconstruction")
                        .value_name("FILE")
                        .help("Exported reconstruction (data-*.nc)")
                        .required(true),
                )
                .arg(
                    Arg::new("obs")
                        .long("obs")
                        .value_name("FILE")
                        .help("NetCDF file with the independent observations")
                        .required(true),
                )
                .arg(
                    Arg::new("varname")
                        .short('n')
                        .long("varname")
                        .value_name("NAME")
                        .help("Name of the observed variable")
                        .required(true),
                ),
        )
}

/// Required path argument
pub fn path_arg(matches: &ArgMatches, name: &str) -> Result<PathBuf, String> {
    matches
        .get_one::<String>(name)
        .map(PathBuf::from)
        .ok_or_else(|| format!("Missing argument: {}", name))
}

/// Required string argument
pub fn string_arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str, String> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| format!("Missing argument: {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.enc_ksize_internal, vec![16, 24, 36, 54]);
        assert_eq!(config.learning_rate_at(5000), config.learning_rate);
    }

    #[test]
    fn test_learning_rate_decay() {
        let config = TrainingConfig {
            learning_rate_decay_epoch: Some(50.0),
            ..TrainingConfig::default()
        };
        // the first epoch (index 0) runs at the base rate
        assert_eq!(config.learning_rate_at(0), 1e-3);
        assert!((config.learning_rate_at(50) - 5e-4).abs() < 1e-12);
        assert!((config.learning_rate_at(100) - 2.5e-4).abs() < 1e-12);
    }

    #[test]
    fn test_skip_connection_out_of_range() {
        let config = TrainingConfig {
            skipconnections: vec![5],
            ..TrainingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_matches() {
        let matches = build_cli()
            .try_get_matches_from([
                "dincae_rust",
                "reconstruct",
                "-i",
                "sst.nc",
                "-n",
                "sst",
                "-o",
                "out",
                "--epochs",
                "20",
                "--skipconnections",
                "2,3",
                "--resize-method",
                "nearest",
                "--truth-uncertain",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "reconstruct");

        let config = TrainingConfig::from_matches(sub).unwrap();
        assert_eq!(config.epochs, 20);
        assert_eq!(config.skipconnections, vec![2, 3]);
        assert_eq!(config.resize_method, ResizeMethod::Nearest);
        assert!(config.truth_uncertain);
        assert_eq!(config.batch_size, 50);
        assert_eq!(path_arg(sub, "input").unwrap(), PathBuf::from("sst.nc"));
    }

    #[test]
    fn test_insitu_defaults() {
        let matches = build_cli()
            .try_get_matches_from([
                "dincae_rust",
                "insitu",
                "--obs",
                "obs.nc",
                "--mask",
                "mask.nc",
                "-n",
                "sst",
                "-o",
                "out",
                "--learning-rate",
                "0.0005",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "insitu");

        let config = TrainingConfig::from_matches_with(sub, TrainingConfig::insitu_defaults()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.epochs, 200);
        assert_eq!(config.batch_size, 12);
        assert!(config.skipconnections.is_empty());
        assert_eq!(config.regularization_l2_beta, 0.05);
        assert_eq!(config.shuffle_buffer_size, 12);
        assert_eq!(config.nvar, INSITU_NVAR);
        assert_eq!(config.learning_rate, 5e-4);

        // explicit arguments still win
        let matches = build_cli()
            .try_get_matches_from([
                "dincae_rust", "insitu", "--obs", "obs.nc", "--mask", "mask.nc", "-n", "sst", "-o", "out",
                "--batch-size", "4", "--skipconnections", "1,2",
            ])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let config = TrainingConfig::from_matches_with(sub, TrainingConfig::insitu_defaults()).unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.skipconnections, vec![1, 2]);
    }

    #[test]
    fn test_json_option_names() {
        let json = serde_json::to_string(&TrainingConfig::default()).unwrap();
        assert!(json.contains("\"regularization_L2_beta\":0.0"));
        assert!(json.contains("\"resize_method\":\"bilinear\""));
        let back: TrainingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TrainingConfig::default());
    }
}
