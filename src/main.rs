use clap::ArgMatches;
use dincae_rust::{
    config::{build_cli, insitu_options_from_matches, path_arg, string_arg, TrainingConfig},
    data_io::{load_gridded_field, load_grid_mask, load_observations, MeanField},
    dataset::{InsituOptions, InsituSource, SampleAssembler, SampleSource},
    training::{default_device, reconstruct, ExportGrid, TrainingSummary},
    validation::monthly_cv_rms_files,
};
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    let matches = build_cli().get_matches();
    init_logging(matches.get_flag("verbose"));

    let result = match matches.subcommand() {
        Some(("reconstruct", sub_matches)) => run_gridded(sub_matches),
        Some(("insitu", sub_matches)) => run_insitu(sub_matches),
        Some(("cvrms", sub_matches)) => run_cvrms(sub_matches),
        _ => Err("Please specify a subcommand. Use --help for more information.".to_string()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn run_gridded(matches: &ArgMatches) -> Result<(), String> {
    let input = path_arg(matches, "input")?;
    let varname = string_arg(matches, "varname")?;
    let outdir = path_arg(matches, "output-dir")?;
    let mut config = TrainingConfig::from_matches(matches)?;

    let field = load_gridded_field(&input, varname).map_err(|e| e.to_string())?;
    info!(
        "{} timesteps, {:.1}% of valid pixels observed",
        field.time.len(),
        100.0 * field.coverage()
    );
    let mean = MeanField::from_field(&field);

    let train = SampleAssembler::new(&field, &mean, config.assembler_options(true)).map_err(|e| e.to_string())?;
    let test = SampleAssembler::new(&field, &mean, config.assembler_options(false)).map_err(|e| e.to_string())?;
    config.nvar = train.nvar();

    let grid = ExportGrid {
        lon: &field.lon,
        lat: &field.lat,
        mask: &field.mask,
        mean: &mean,
    };
    let device = default_device().map_err(|e| e.to_string())?;
    let summary = reconstruct(&grid, &train, &test, &outdir, &config, &device).map_err(|e| e.to_string())?;
    report(&summary);
    Ok(())
}

fn run_insitu(matches: &ArgMatches) -> Result<(), String> {
    let obs_path = path_arg(matches, "obs")?;
    let mask_path = path_arg(matches, "mask")?;
    let varname = string_arg(matches, "varname")?;
    let outdir = path_arg(matches, "output-dir")?;
    let mut config = TrainingConfig::from_matches_with(matches, TrainingConfig::insitu_defaults())?;

    let grid_mask = load_grid_mask(&mask_path).map_err(|e| e.to_string())?;
    let observations = load_observations(&obs_path, varname).map_err(|e| e.to_string())?;
    info!("{} observations of {}", observations.len(), varname);

    let options = insitu_options_from_matches(matches, &grid_mask.lat)?;
    let train = InsituSource::new(
        &observations,
        &grid_mask,
        InsituOptions {
            train: true,
            ..options
        },
    )
    .map_err(|e| e.to_string())?;
    let test = InsituSource::new(
        &observations,
        &grid_mask,
        InsituOptions {
            train: false,
            ..options
        },
    )
    .map_err(|e| e.to_string())?;
    config.nvar = train.nvar();

    let mean = test.mean_field();
    let grid = ExportGrid {
        lon: &grid_mask.lon,
        lat: &grid_mask.lat,
        mask: &grid_mask.mask,
        mean: &mean,
    };
    let device = default_device().map_err(|e| e.to_string())?;
    let summary = reconstruct(&grid, &train, &test, &outdir, &config, &device).map_err(|e| e.to_string())?;
    report(&summary);

    if let Ok(Some(cv)) = matches.try_get_one::<String>("cv") {
        match &summary.last_export {
            Some(export) => {
                let result = monthly_cv_rms_files(export, Path::new(cv), varname).map_err(|e| e.to_string())?;
                println!("CV RMS: {}", format_rms(result.total));
            }
            None => warn!("No reconstruction exported, skipping cross-validation"),
        }
    }
    Ok(())
}

fn run_cvrms(matches: &ArgMatches) -> Result<(), String> {
    let recon = path_arg(matches, "reconstruction")?;
    let obs = path_arg(matches, "obs")?;
    let varname = string_arg(matches, "varname")?;

    let result = monthly_cv_rms_files(&recon, &obs, varname).map_err(|e| e.to_string())?;
    for (m, rms) in result.monthly.iter().enumerate() {
        println!("{:2} {}", m + 1, format_rms(*rms));
    }
    println!("total {}", format_rms(result.total));
    Ok(())
}

fn report(summary: &TrainingSummary) {
    if let Some(path) = &summary.last_export {
        println!("Last reconstruction: {}", path.display());
    }
    if let Some(loss) = summary.last_train_loss {
        println!("Final training loss: {:.5}", loss);
    }
    if let Some(rms) = summary.last_test_rms {
        println!("Final test RMS: {:.5}", rms);
    }
}

fn format_rms(rms: Option<f64>) -> String {
    rms.map_or_else(|| "n/a".to_string(), |r| format!("{:.4}", r))
}
