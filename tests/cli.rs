use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::str;

/// Runs geoipenv with `args`, feeding `input` on stdin. Color is always off
/// and any ambient config variable is cleared.
fn run_geoipenv(input: &str, args: &[&str]) -> Output {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("geoipenv").unwrap();
    cmd.env_remove("GEOIPENV_CONFIG")
        .env_remove("RUST_LOG")
        .arg("--color")
        .arg("never")
        .args(args)
        .write_stdin(input)
        .output()
        .expect("failed to execute")
}

fn stdout(output: &Output) -> &str {
    str::from_utf8(&output.stdout).expect("Failed to read stdout as UTF-8")
}

fn stderr(output: &Output) -> &str {
    str::from_utf8(&output.stderr).expect("Failed to read stderr as UTF-8")
}

fn write_config(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("geoip.conf");
    fs::write(&path, text).unwrap();
    path
}

/// A missing database still binds the evaluated address.
#[test]
fn missing_database_binds_only_address() {
    let output = run_geoipenv("81.2.69.142\n", &["--db", "/nonexistent/City.mmdb"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "GEOIP_ADDR=81.2.69.142\n");
}

const TEST_DB: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/maxmind/GeoIPEnv-Test.mmdb");

#[test]
fn maxmind_file_records_are_bound() {
    let output = run_geoipenv("81.2.69.142\n192.0.2.1\n2001:db8::1\n", &["--db", TEST_DB]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(
        stdout(&output),
        "GEOIP_ADDR=81.2.69.142\n\
         GEOIP_LATITUDE=51.50000\n\
         GEOIP_LONGITUDE=-0.13000\n\
         GEOIP_TIME_ZONE=Europe/London\n\
         GEOIP_COUNTRY_CODE=GB\n\
         GEOIP_COUNTRY_NAME=United Kingdom\n\
         GEOIP_CITY=London\n\
         \n\
         GEOIP_ADDR=192.0.2.1\n\
         \n\
         GEOIP_ADDR=2001:db8::1\n"
    );
}

#[test]
fn list_databases_reports_usable_paths() {
    let output = run_geoipenv("", &["--list-databases", "--db", TEST_DB]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), format!("✓ {TEST_DB}\n"));
}

#[test]
fn requests_are_separated_by_blank_lines() {
    let output = run_geoipenv(
        "81.2.69.142\n\n  2001:db8::1  \n",
        &["--db", "/nonexistent/City.mmdb"],
    );
    assert!(output.status.success());
    assert_eq!(
        stdout(&output),
        "GEOIP_ADDR=81.2.69.142\n\nGEOIP_ADDR=2001:db8::1\n"
    );
}

#[test]
fn json_prints_one_object_per_address() {
    let output = run_geoipenv(
        "81.2.69.142\n10.0.0.1\n",
        &["--json", "--db", "/nonexistent/City.mmdb"],
    );
    assert!(output.status.success());
    let objects: Vec<serde_json::Value> = stdout(&output)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(
        objects,
        [
            serde_json::json!({"GEOIP_ADDR": "81.2.69.142"}),
            serde_json::json!({"GEOIP_ADDR": "10.0.0.1"}),
        ]
    );
}

#[test]
fn disabled_config_prints_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "MaxMindDBEnable Off\n");
    let output = run_geoipenv("81.2.69.142\n", &["-c", config.to_str().unwrap()]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "");
}

#[test]
fn config_is_read_from_the_environment() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "MaxMindDBEnable On\nMaxMindDBFile /nonexistent/City.mmdb\n",
    );
    #[allow(deprecated)]
    let output = Command::cargo_bin("geoipenv")
        .unwrap()
        .env("GEOIPENV_CONFIG", &config)
        .args(["--color", "never"])
        .write_stdin("81.2.69.142\n")
        .output()
        .expect("failed to execute");
    assert!(output.status.success());
    assert_eq!(stdout(&output), "GEOIP_ADDR=81.2.69.142\n");
}

/// Only requests under the location get variables.
#[test]
fn location_sections_follow_the_uri() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "<Location /geo>\n\
         MaxMindDBEnable On\n\
         MaxMindDBFile /nonexistent/City.mmdb\n\
         </Location>\n",
    );
    let config = config.to_str().unwrap();

    let inside = run_geoipenv("81.2.69.142\n", &["-c", config, "--uri", "/geo/map"]);
    assert_eq!(stdout(&inside), "GEOIP_ADDR=81.2.69.142\n");

    let outside = run_geoipenv("81.2.69.142\n", &["-c", config, "--uri", "/other"]);
    assert!(outside.status.success());
    assert_eq!(stdout(&outside), "");
}

#[test]
fn virtual_hosts_are_selected_by_host() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "MaxMindDBEnable Off\n\
         <VirtualHost shop.example>\n\
         MaxMindDBEnable On\n\
         MaxMindDBFile /nonexistent/City.mmdb\n\
         </VirtualHost>\n",
    );
    let config = config.to_str().unwrap();

    let shop = run_geoipenv("81.2.69.142\n", &["-c", config, "--host", "shop.example:8443"]);
    assert_eq!(stdout(&shop), "GEOIP_ADDR=81.2.69.142\n");

    let other = run_geoipenv("81.2.69.142\n", &["-c", config, "--host", "other.example"]);
    assert_eq!(stdout(&other), "");
}

#[test]
fn invalid_database_file_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("bad.mmdb");
    fs::write(&db, b"definitely not a maxmind database").unwrap();
    let output = run_geoipenv("81.2.69.142\n", &["--db", db.to_str().unwrap()]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "GEOIP_ADDR=81.2.69.142\n");
}

#[test]
fn addresses_are_read_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let ips = dir.path().join("ips.txt");
    fs::write(&ips, "81.2.69.142\n").unwrap();
    let output = run_geoipenv(
        "",
        &["--db", "/nonexistent/City.mmdb", ips.to_str().unwrap()],
    );
    assert_eq!(stdout(&output), "GEOIP_ADDR=81.2.69.142\n");
}

#[test]
fn list_databases_reports_unavailable_paths() {
    let output = run_geoipenv("", &["--list-databases", "--db", "/nonexistent/City.mmdb"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "✗ /nonexistent/City.mmdb\n");
}

#[test]
fn bad_config_fails_with_location() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "MaxMindDBEnable On\nGeoIPEnable On\n");
    let output = run_geoipenv("81.2.69.142\n", &["-c", config.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(
        stderr(&output).contains("geoip.conf:2: unknown directive GeoIPEnable"),
        "stderr: {}",
        stderr(&output)
    );
}

#[test]
fn enable_without_database_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "MaxMindDBEnable On\n");
    let output = run_geoipenv("", &["-c", config.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("MaxMindDBEnable On without MaxMindDBFile"));
}

#[test]
fn missing_configuration_is_an_error() {
    let output = run_geoipenv("81.2.69.142\n", &[]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("no configuration"));
}

#[test]
fn missing_input_file_is_an_error() {
    let output = run_geoipenv(
        "",
        &["--db", "/nonexistent/City.mmdb", "/nonexistent/ips.txt"],
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("/nonexistent/ips.txt"));
}
