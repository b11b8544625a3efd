use dincae_rust::config::TrainingConfig;
use dincae_rust::data_io::common::{checkpoint_filename, config_filename, export_filename};
use dincae_rust::data_io::reader::{open_netcdf_file, read_masked_field};
use dincae_rust::data_io::{GriddedField, MeanField};
use dincae_rust::dataset::{AssemblerOptions, SampleAssembler, SampleSource};
use dincae_rust::time_utils::{decode_cf_times, Calendar};
use dincae_rust::training::{reconstruct, ExportGrid};
use candle_core::Device;
use ndarray::{s, Array2, Array3};
use tempfile::tempdir;

fn daily(ntime: usize) -> Vec<dincae_rust::CalendarDate> {
    let offsets: Vec<f64> = (0..ntime).map(|t| t as f64).collect();
    decode_cf_times(&offsets, "days since 2010-06-01", Calendar::Standard).unwrap()
}

/// 4x4x3 field: slice 0 fully observed, slice 1 fully missing, slice 2 half observed
fn scenario_field() -> GriddedField {
    let data = Array3::from_shape_fn((4, 4, 3), |(i, j, t)| match t {
        0 => 20.0 + i as f32 - j as f32,
        1 => f32::NAN,
        _ if i < 2 => 18.0 + j as f32,
        _ => f32::NAN,
    });
    GriddedField::new(
        vec![0.0, 0.25, 0.5, 0.75],
        vec![30.0, 30.25, 30.5, 30.75],
        daily(3),
        data,
        Array2::from_elem((4, 4), true),
    )
    .unwrap()
}

#[test]
fn test_missing_slice_has_empty_target_and_input() {
    let field = scenario_field();
    let mean = MeanField::from_field(&field);
    let assembler = SampleAssembler::new(&field, &mean, AssemblerOptions::default()).unwrap();
    assert_eq!(assembler.len(), 3);
    assert_eq!(assembler.nvar(), 10);

    let sample = assembler.sample(1).unwrap();
    assert_eq!(sample.target.dim(), (4, 4, 2));
    assert!(sample.target.iter().all(|&v| v == 0.0));
    assert!(sample.input.slice(s![.., .., 0..2]).iter().all(|&v| v == 0.0));

    // neighbours of the missing slice are the observed slices
    assert!(sample.input.slice(s![.., .., 7]).iter().all(|&w| w == 1.0));
    assert_eq!(sample.input.slice(s![.., .., 9]).iter().filter(|&&w| w == 1.0).count(), 8);
}

#[test]
fn test_observed_slice_carries_scaled_anomaly() {
    let field = scenario_field();
    let mean = MeanField::from_field(&field);
    let options = AssemblerOptions {
        obs_err_std: 2.0,
        ..AssemblerOptions::default()
    };
    let assembler = SampleAssembler::new(&field, &mean, options).unwrap();
    let sample = assembler.sample(0).unwrap();

    for i in 0..4 {
        for j in 0..4 {
            let anomaly = field.data[[i, j, 0]] - mean.values[[i, j]];
            assert!((sample.target[[i, j, 0]] - anomaly / 4.0).abs() < 1e-6);
            assert_eq!(sample.target[[i, j, 1]], 0.25);
        }
    }
    assert_eq!(sample.input.slice(s![.., .., 0..2]), sample.target.view());
    // rescaled coordinates span [-1, 1]
    assert_eq!(sample.input[[0, 0, 2]], -1.0);
    assert_eq!(sample.input[[3, 0, 2]], 1.0);
    assert_eq!(sample.input[[0, 3, 3]], 1.0);
}

#[test]
fn test_evaluation_samples_are_reproducible() {
    let field = scenario_field();
    let mean = MeanField::from_field(&field);
    let assembler = SampleAssembler::new(&field, &mean, AssemblerOptions::default()).unwrap();
    for t in 0..3 {
        assert_eq!(assembler.sample(t).unwrap(), assembler.sample(t).unwrap());
    }
    assert!(assembler.sample(3).is_err());
}

#[test]
fn test_training_keeps_target_untouched() {
    let field = scenario_field();
    let mean = MeanField::from_field(&field);
    let options = AssemblerOptions {
        train: true,
        seed: Some(5),
        ..AssemblerOptions::default()
    };
    let train = SampleAssembler::new(&field, &mean, options).unwrap();
    let eval = SampleAssembler::new(&field, &mean, AssemblerOptions::default()).unwrap();
    for t in 0..3 {
        assert_eq!(train.sample(t).unwrap().target, eval.sample(t).unwrap().target);
    }
}

/// 8x8 field with a moving front and random-looking clouds
fn cloudy_field(ntime: usize) -> GriddedField {
    let data = Array3::from_shape_fn((8, 8, ntime), |(i, j, t)| {
        if (i * 7 + j * 3 + t * 5) % 6 == 0 {
            f32::NAN
        } else {
            15.0 + 0.5 * i as f32 - 0.2 * j as f32 + 0.1 * t as f32
        }
    });
    let mut mask = Array2::from_elem((8, 8), true);
    mask[[7, 7]] = false;
    GriddedField::new(
        (0..8).map(|i| 10.0 + 0.25 * i as f64).collect(),
        (0..8).map(|j| 40.0 + 0.25 * j as f64).collect(),
        daily(ntime),
        data,
        mask,
    )
    .unwrap()
}

#[test]
fn test_reconstruct_writes_exports_and_checkpoints() {
    let dir = tempdir().unwrap();
    let field = cloudy_field(5);
    let mean = MeanField::from_field(&field);

    let config = TrainingConfig {
        epochs: 2,
        batch_size: 2,
        save_each: 1,
        save_model_each: 2,
        enc_ksize_internal: vec![4, 6],
        skipconnections: vec![1, 2],
        shuffle_buffer_size: 3,
        seed: Some(42),
        ..TrainingConfig::default()
    };
    let train = SampleAssembler::new(&field, &mean, config.assembler_options(true)).unwrap();
    let test = SampleAssembler::new(&field, &mean, config.assembler_options(false)).unwrap();
    let grid = ExportGrid {
        lon: &field.lon,
        lat: &field.lat,
        mask: &field.mask,
        mean: &mean,
    };

    let summary = reconstruct(&grid, &train, &test, dir.path(), &config, &Device::Cpu).unwrap();

    assert_eq!(summary.last_export, Some(export_filename(dir.path(), 2)));
    assert!(summary.last_train_loss.unwrap().is_finite());
    assert!(export_filename(dir.path(), 1).exists());
    assert!(checkpoint_filename(dir.path(), 2).exists());
    assert!(!checkpoint_filename(dir.path(), 1).exists());

    let saved: TrainingConfig =
        serde_json::from_str(&std::fs::read_to_string(config_filename(dir.path())).unwrap()).unwrap();
    assert_eq!(saved, config);

    let file = open_netcdf_file(export_filename(dir.path(), 2)).unwrap();
    let mean_rec = read_masked_field(&file, "mean_rec", 8, 8).unwrap();
    let sigma_rec = read_masked_field(&file, "sigma_rec", 8, 8).unwrap();
    assert_eq!(mean_rec.dim(), (8, 8, 5));
    for ((i, j, _), &v) in mean_rec.indexed_iter() {
        if (i, j) == (7, 7) {
            assert!(v.is_nan());
        } else {
            assert!(v.is_finite());
            assert!(sigma_rec[[i, j, 0]] > 0.0);
        }
    }
}

#[test]
fn test_reconstruct_rejects_channel_mismatch() {
    let dir = tempdir().unwrap();
    let field = cloudy_field(2);
    let mean = MeanField::from_field(&field);
    let config = TrainingConfig {
        nvar: 6,
        epochs: 1,
        ..TrainingConfig::default()
    };
    let source = SampleAssembler::new(&field, &mean, AssemblerOptions::default()).unwrap();
    let grid = ExportGrid {
        lon: &field.lon,
        lat: &field.lat,
        mask: &field.mask,
        mean: &mean,
    };
    assert!(reconstruct(&grid, &source, &source, dir.path(), &config, &Device::Cpu).is_err());
}
