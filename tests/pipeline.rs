use driver_skill::factors::N_FACTORS;
use driver_skill::features::catalog_names;
use driver_skill::output::{read_aggregates, AGGREGATES_JSON, DIAGNOSTICS_JSON, FEATURES_CSV, SCORES_CSV, VALIDATION_JSON};
use driver_skill::source::LocalFileSource;
use driver_skill::validation::ValidationReport;
use driver_skill::{FactorCalibration, Pipeline, PipelineConfig, PipelineError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

const DRIVERS: u32 = 10;
const LAPS: u32 = 18;

struct Skill {
    pace: f64,
    spread: f64,
    wear: f64,
}

fn skills() -> Vec<Skill> {
    (0..DRIVERS)
        .map(|d| {
            let t = d as f64;
            Skill { pace: 0.2 * t, spread: 0.15 + 0.08 * ((t * 1.7).sin() + 1.0), wear: 0.01 + 0.004 * ((t * 2.3).cos() + 1.0) }
        })
        .collect()
}

fn clock(seconds: f64) -> String {
    let ms = (seconds * 1000.0).round() as u64;
    format!("{}:{:02}.{:03}", ms / 60_000, (ms % 60_000) / 1000, ms % 1000)
}

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("driver_skill_it_{}_{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_race(dir: &Path, seed: u64, with_telemetry: bool) {
    fs::create_dir_all(dir).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let skills = skills();

    // qualifying: one flying lap, a bit noisy
    let mut quali: Vec<(u32, f64)> =
        skills.iter().enumerate().map(|(d, s)| (d as u32 + 1, 94.0 + s.pace + rng.gen_range(-0.3..0.3))).collect();
    quali.sort_by(|a, b| a.1.total_cmp(&b.1));
    let mut q = String::from("POSITION;NUMBER;BEST_LAP_TIME\n");
    let mut grid = vec![0u32; DRIVERS as usize + 1];
    for (pos, (number, t)) in quali.iter().enumerate() {
        grid[*number as usize] = pos as u32 + 1;
        writeln!(q, "{};{};{}", pos + 1, number, clock(*t)).unwrap();
    }
    fs::write(dir.join("qualifying.csv"), q).unwrap();

    let mut laps = String::from("NUMBER; LAP_NUMBER; LAP_TIME; S1_SECONDS; S2_SECONDS; S3_SECONDS; ELAPSED; FLAG_AT_FL\n");
    let mut totals = Vec::new();
    for (d, s) in skills.iter().enumerate() {
        let number = d as u32 + 1;
        let mut elapsed = 0.4 * grid[number as usize] as f64;
        for lap in 1..=LAPS {
            let caution = lap == 6;
            let mut t = 95.0 + s.pace + s.wear * lap as f64 + s.spread * rng.gen_range(-1.0..1.0);
            if caution {
                t += 20.0;
            }
            elapsed += t;
            let s1 = 0.3 * t + rng.gen_range(-0.1..0.1);
            let s2 = 0.35 * t + rng.gen_range(-0.1..0.1);
            let s3 = t - s1 - s2;
            let flag = if caution { "FCY" } else { "GF" };
            writeln!(laps, "{};{};{};{:.3};{:.3};{:.3};{};{}", number, lap, clock(t), s1, s2, s3, clock(elapsed), flag).unwrap();
        }
        totals.push((number, elapsed));
    }
    fs::write(dir.join("laps.csv"), laps).unwrap();

    totals.sort_by(|a, b| a.1.total_cmp(&b.1));
    let mut results = String::from("POSITION;NUMBER;STATUS;LAPS\n");
    for (pos, (number, _)) in totals.iter().enumerate() {
        writeln!(results, "{};{};Classified;{}", pos + 1, number, LAPS).unwrap();
    }
    fs::write(dir.join("results.csv"), results).unwrap();

    if with_telemetry {
        write_telemetry(dir, &mut rng, &skills);
    }
}

// one corner per lap at samples 60..110 with a braking zone in front of it
fn write_telemetry(dir: &Path, rng: &mut StdRng, skills: &[Skill]) {
    let mut out = String::from("vehicle_number,lap,distance,speed,throttle,brake,steering,accel_long,accel_lat,timestamp\n");
    for (d, s) in skills.iter().enumerate() {
        let mut time = 0.0;
        for lap in 1..=4u32 {
            let brake_at = 40 + (s.spread * 10.0 * rng.gen_range(-1.0..1.0)).round() as i64;
            for i in 0..200i64 {
                time += 0.04;
                let in_corner = (60..110).contains(&i);
                let braking = i >= brake_at && i < 60;
                let dip = if in_corner { 1.0 - ((i - 85) as f64 / 25.0).powi(2) } else { 0.0 };
                let speed = 160.0 - (45.0 + 2.0 * s.pace) * dip;
                let throttle = if in_corner || braking { 20.0 + 10.0 * s.spread * rng.gen_range(0.0..1.0) } else { 100.0 };
                let brake = if braking { 45.0 } else { 0.0 };
                let steering = if in_corner { 50.0 + s.spread * rng.gen_range(-5.0..5.0) } else { rng.gen_range(-1.0..1.0) };
                let long = if braking { -0.9 } else if in_corner { 0.0 } else { 0.3 - 0.02 * d as f64 };
                let lat = if in_corner { 1.3 - 0.02 * s.pace } else { 0.05 };
                writeln!(
                    out,
                    "{},{},{},{:.2},{:.1},{},{:.2},{},{},{:.2}",
                    d + 1,
                    lap,
                    i,
                    speed + rng.gen_range(-0.5..0.5),
                    throttle,
                    brake,
                    steering,
                    long,
                    lat,
                    time
                )
                .unwrap();
            }
        }
    }
    fs::write(dir.join("telemetry.csv"), out).unwrap();
}

fn write_season(root: &Path) {
    write_race(&root.join("barber").join("r1"), 1, true);
    write_race(&root.join("barber").join("r2"), 2, false);
    write_race(&root.join("sonoma").join("r1"), 3, false);
}

#[test]
fn calibrate_then_run_writes_every_artifact() {
    let root = scratch("season");
    write_season(&root.join("data"));
    let cfg = PipelineConfig::default();
    let source = LocalFileSource::new(root.join("data"));
    let pipeline = Pipeline::new(&source, &cfg);

    let cal_path = root.join("calibration.json");
    pipeline.calibrate().unwrap().save(&cal_path).unwrap();
    let cal = FactorCalibration::load(&cal_path).unwrap();
    assert_eq!(cal.factors.len(), N_FACTORS);

    let outcome = pipeline.run(&cal).unwrap();
    assert_eq!(outcome.features.rows.len(), 3 * DRIVERS as usize);
    assert_eq!(outcome.features.names, catalog_names());
    assert_eq!(outcome.aggregates.drivers.len(), DRIVERS as usize);
    for d in &outcome.aggregates.drivers {
        assert_eq!(d.races, 3);
        for p in d.percentiles() {
            assert!((0.0..=100.0).contains(&p));
        }
    }

    let out = root.join("out");
    let written = outcome.write(&out).unwrap();
    assert_eq!(written.len(), 5);
    for name in [FEATURES_CSV, SCORES_CSV, AGGREGATES_JSON, VALIDATION_JSON, DIAGNOSTICS_JSON] {
        assert!(out.join(name).is_file(), "{} missing", name);
    }
    // only the artifacts remain: no lock, no staging directory
    assert_eq!(fs::read_dir(&out).unwrap().count(), 5);

    let scores = fs::read_to_string(out.join(SCORES_CSV)).unwrap();
    let header: Vec<&str> = scores.lines().next().unwrap().split(',').collect();
    assert_eq!(header.len(), 3 + N_FACTORS);
    assert_eq!(scores.lines().count(), 1 + 3 * DRIVERS as usize);

    let report: ValidationReport = serde_json::from_str(&fs::read_to_string(out.join(VALIDATION_JSON)).unwrap()).unwrap();
    assert_eq!(report.n_drivers, DRIVERS as usize);
    if let Some(oos) = report.out_of_sample_r2 {
        assert!(oos <= report.in_sample_r2 + 1e-9);
    }

    let back = read_aggregates(&out.join(AGGREGATES_JSON)).unwrap();
    assert_eq!(back.drivers.len(), DRIVERS as usize);
    assert_eq!(back.factor_names, outcome.aggregates.factor_names);

    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn telemetry_features_only_where_telemetry_exists() {
    let root = scratch("telemetry");
    write_season(&root);
    let cfg = PipelineConfig::default();
    let source = LocalFileSource::new(&root);
    let pipeline = Pipeline::new(&source, &cfg);
    let races = pipeline.load_races().unwrap();
    let table = pipeline.build_feature_table(&races);

    let steer = table.names.iter().position(|n| n == "steering_smoothness").unwrap();
    let qual = table.names.iter().position(|n| n == "qualifying_gap_pct").unwrap();
    for row in &table.rows {
        assert!(row.values[qual].is_some());
        if row.race_id == "barber/r1" {
            assert!(row.values[steer].is_some(), "driver {} lacks telemetry features", row.driver);
        } else {
            assert!(row.values[steer].is_none());
        }
    }
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn locked_output_keeps_previous_artifacts() {
    let root = scratch("locked");
    write_season(&root.join("data"));
    let cfg = PipelineConfig::default();
    let source = LocalFileSource::new(root.join("data"));
    let pipeline = Pipeline::new(&source, &cfg);
    let cal = pipeline.calibrate().unwrap();
    let outcome = pipeline.run(&cal).unwrap();

    let out = root.join("out");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join(AGGREGATES_JSON), "{}").unwrap();
    fs::write(out.join(".lock"), "").unwrap();
    assert!(matches!(outcome.write(&out), Err(PipelineError::Locked(_))));
    assert_eq!(fs::read_to_string(out.join(AGGREGATES_JSON)).unwrap(), "{}");

    fs::remove_file(out.join(".lock")).unwrap();
    outcome.write(&out).unwrap();
    assert_ne!(fs::read_to_string(out.join(AGGREGATES_JSON)).unwrap(), "{}");
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn too_few_races_is_fatal_not_defaulted() {
    let root = scratch("tiny");
    let dir = root.join("barber").join("r1");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("results.csv"), "POSITION;NUMBER;STATUS;LAPS\n1;7;Classified;3\n").unwrap();
    let cfg = PipelineConfig::default();
    let source = LocalFileSource::new(&root);
    let err = Pipeline::new(&source, &cfg).calibrate().unwrap_err();
    assert!(matches!(err, PipelineError::InsufficientPopulation(_)), "{}", err);
    fs::remove_dir_all(&root).unwrap();
}
