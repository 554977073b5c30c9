use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

fn valid_store_json(clip: &str) -> String {
    format!(
        r#"
{{
  "version": 1,
  "next_id": 3,
  "settings": {{ "alarms_enabled": true }},
  "schedules": [
    {{
      "id": 1,
      "trigger_time_ms": 4102444800000,
      "repeat_interval_ms": 86400000,
      "audio": [ {{ "file_path": {clip:?}, "display_name": "morning" }} ]
    }},
    {{
      "id": 2,
      "trigger_time_ms": 1000,
      "repeat_interval_ms": 5400000,
      "audio": [ {{ "file_path": "/does/not/exist.wav", "display_name": "gone" }} ]
    }}
  ]
}}
"#
    )
}

fn write_wav(path: &std::path::Path) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
    for i in 0..800 {
        writer.write_sample((i % 64) as i16 * 100).expect("write sample");
    }
    writer.finalize().expect("finalize wav");
}

#[test]
fn check_summarises_valid_store() {
    let dir = tempdir().expect("tempdir");
    let clip = dir.path().join("morning.wav");
    fs::write(&clip, b"RIFF").expect("write clip");
    let store = dir.path().join("schedules.json");
    fs::write(&store, valid_store_json(&clip.display().to_string())).expect("write json");

    let mut cmd = cargo_bin_cmd!("selftalker");
    cmd.arg("--check")
        .arg("--store")
        .arg(store)
        .assert()
        .success()
        .stdout(predicate::str::contains("Schedules: 2"))
        .stdout(predicate::str::contains("Daily"))
        .stdout(predicate::str::contains("Every 1h 30m"))
        .stdout(predicate::str::contains("missing: /does/not/exist.wav"))
        .stdout(predicate::str::contains("(reconciled)"));
}

#[test]
fn check_can_render_twelve_hour_times() {
    let dir = tempdir().expect("tempdir");
    let clip = dir.path().join("morning.wav");
    fs::write(&clip, b"RIFF").expect("write clip");
    let store = dir.path().join("schedules.json");
    fs::write(&store, valid_store_json(&clip.display().to_string())).expect("write json");

    let mut cmd = cargo_bin_cmd!("selftalker");
    cmd.arg("--check")
        .arg("--twelve-hour")
        .arg("--store")
        .arg(store)
        .assert()
        .success()
        .stdout(predicate::str::contains(" AM").or(predicate::str::contains(" PM")));
}

#[test]
fn check_treats_missing_store_as_empty() {
    let dir = tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("selftalker");
    cmd.arg("--check")
        .arg("--store")
        .arg(dir.path().join("absent.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Schedules: 0"));
}

#[test]
fn malformed_json_fails_with_clear_error() {
    let dir = tempdir().expect("tempdir");
    let store = dir.path().join("schedules.json");
    fs::write(&store, "{ not-valid-json ").expect("write invalid json");

    let mut cmd = cargo_bin_cmd!("selftalker");
    cmd.arg("--check")
        .arg("--store")
        .arg(store)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid JSON"));
}

#[test]
fn unsupported_version_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let store = dir.path().join("schedules.json");
    fs::write(&store, r#"{ "version": 9, "schedules": [] }"#).expect("write json");

    let mut cmd = cargo_bin_cmd!("selftalker");
    cmd.arg("--check")
        .arg("--store")
        .arg(store)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn play_skips_missing_file_and_exits_cleanly() {
    let dir = tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("selftalker");
    cmd.arg("--play")
        .arg(dir.path().join("missing.wav"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Played 0 file(s), 1 failed"));
}

#[test]
fn play_reports_completed_and_failed_counts() {
    let dir = tempdir().expect("tempdir");
    let first = dir.path().join("first.wav");
    let second = dir.path().join("second.wav");
    write_wav(&first);
    write_wav(&second);

    let mut cmd = cargo_bin_cmd!("selftalker");
    cmd.arg("--play")
        .arg(&first)
        .arg(dir.path().join("missing.wav"))
        .arg(&second)
        .assert()
        .success()
        .stdout(predicate::str::contains("Played 2 file(s), 1 failed"));
}

#[test]
fn invalid_log_filter_is_reported() {
    let dir = tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("selftalker");
    cmd.arg("--check")
        .arg("--store")
        .arg(dir.path().join("absent.json"))
        .arg("--log-filter")
        .arg("selftalker=loud")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid --log-filter"));
}
