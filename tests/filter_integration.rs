use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

const CITIES: &str = concat!(
    r#"{"type":"Feature","geometry":{"type":"Point","coordinates":[77.59,12.97]},"properties":{"name":"Bengaluru","population":8443675}}"#,
    "\n",
    r#"{"type":"Feature","geometry":{"type":"Point","coordinates":[78.48,17.38]},"properties":{"name":"Hyderabad","population":6809970}}"#,
    "\n",
);

fn build_archive(dir: &TempDir, content: &str) -> PathBuf {
    let entry = dir.path().join("cities.geojsonl");
    std::fs::write(&entry, content).unwrap();
    let archive = dir.path().join("cities.7z");
    sevenz_rust::compress_to_path(&entry, &archive).unwrap();
    archive
}

fn read_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn geosieve() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_geosieve"));
    command.env_remove("RUST_LOG");
    command
}

#[test]
fn bounds_keep_only_features_inside() {
    let dir = TempDir::new().unwrap();
    let archive = build_archive(&dir, CITIES);
    let output = dir.path().join("out.geojsonl");

    let status = geosieve()
        .arg("filter")
        .arg("--input")
        .arg(&archive)
        .arg("--output")
        .arg(&output)
        .arg("--bounds")
        .arg("77,12,78,13")
        .arg("--quiet")
        .status()
        .expect("failed to execute process");

    assert!(status.success());
    let features = read_lines(&output);
    assert_eq!(features.len(), 1);
    assert_eq!(features[0]["properties"]["name"], "Bengaluru");
    assert_eq!(features[0]["geometry"]["type"], "Point");
}

#[test]
fn pass_through_writes_every_feature_as_geojson() {
    let dir = TempDir::new().unwrap();
    let archive = build_archive(&dir, CITIES);
    let output = dir.path().join("out.geojson");

    let status = geosieve()
        .args(["filter", "-q", "-i"])
        .arg(&archive)
        .arg("-o")
        .arg(&output)
        .status()
        .expect("failed to execute process");

    assert!(status.success());
    let content = std::fs::read_to_string(&output).unwrap();
    let collection: Value = serde_json::from_str(&content).unwrap();
    assert_eq!(collection["type"], "FeatureCollection");
    let features = collection["features"].as_array().unwrap();
    assert_eq!(features.len(), 2);
    assert_eq!(features[1]["properties"]["population"], 6809970);
}

#[test]
fn invalid_bounds_fail_without_output() {
    let dir = TempDir::new().unwrap();
    let archive = build_archive(&dir, CITIES);
    let output = dir.path().join("out.geojsonl");

    let result = geosieve()
        .args(["filter", "-q", "-b", "78,12,77,13", "-i"])
        .arg(&archive)
        .arg("-o")
        .arg(&output)
        .output()
        .expect("failed to execute process");

    assert!(!result.status.success());
    assert!(!output.exists());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("Invalid --bounds"), "{stderr}");
}

#[test]
fn unknown_output_extension_needs_format() {
    let dir = TempDir::new().unwrap();
    let archive = build_archive(&dir, CITIES);
    let output = dir.path().join("out.shp");

    let status = geosieve()
        .args(["filter", "-q", "-i"])
        .arg(&archive)
        .arg("-o")
        .arg(&output)
        .status()
        .expect("failed to execute process");

    assert!(!status.success());
    assert!(!output.exists());
}

#[test]
fn reads_split_archives() {
    let dir = TempDir::new().unwrap();
    let archive = build_archive(&dir, CITIES);
    let bytes = std::fs::read(&archive).unwrap();
    let third = bytes.len() / 3 + 1;
    for (index, part) in bytes.chunks(third).enumerate() {
        std::fs::write(dir.path().join(format!("split.7z.{:03}", index + 1)), part).unwrap();
    }
    let output = dir.path().join("out.ndjson");

    let status = geosieve()
        .args(["filter", "-q", "-b", "77,12,78,13", "-i"])
        .arg(dir.path().join("split.7z.001"))
        .arg("-o")
        .arg(&output)
        .status()
        .expect("failed to execute process");

    assert!(status.success());
    let features = read_lines(&output);
    assert_eq!(features.len(), 1);
    assert_eq!(features[0]["properties"]["name"], "Bengaluru");
}

#[test]
fn filter_file_selects_polygon_by_property() {
    let dir = TempDir::new().unwrap();
    let archive = build_archive(&dir, CITIES);
    let filter_file = dir.path().join("states.geojson");
    std::fs::write(
        &filter_file,
        r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","properties":{"name":"Karnataka"},
             "geometry":{"type":"Polygon","coordinates":[[[74,11.5],[78.6,11.5],[78.6,18.5],[74,18.5],[74,11.5]]]}},
            {"type":"Feature","properties":{"name":"Telangana"},
             "geometry":{"type":"Polygon","coordinates":[[[77.2,15.8],[81.8,15.8],[81.8,19.9],[77.2,19.9],[77.2,15.8]]]}}
        ]}"#,
    )
    .unwrap();
    let output = dir.path().join("out.geojsonl");

    let ambiguous = geosieve()
        .args(["filter", "-q", "-i"])
        .arg(&archive)
        .arg("-o")
        .arg(&output)
        .arg("-f")
        .arg(&filter_file)
        .status()
        .expect("failed to execute process");
    assert!(!ambiguous.success());
    assert!(!output.exists());

    let status = geosieve()
        .args(["filter", "-q", "--pick-filter-feature-kv", "name=Telangana", "-i"])
        .arg(&archive)
        .arg("-o")
        .arg(&output)
        .arg("-f")
        .arg(&filter_file)
        .status()
        .expect("failed to execute process");
    assert!(status.success());
    let features = read_lines(&output);
    assert_eq!(features.len(), 1);
    assert_eq!(features[0]["properties"]["name"], "Hyderabad");
}

#[test]
fn writes_geopackage_layer() {
    let dir = TempDir::new().unwrap();
    let archive = build_archive(&dir, CITIES);
    let output = dir.path().join("south.gpkg");

    let status = geosieve()
        .args(["filter", "-q", "-b", "77,12,78,13", "-i"])
        .arg(&archive)
        .arg("-o")
        .arg(&output)
        .status()
        .expect("failed to execute process");

    assert!(status.success());
    let conn = rusqlite::Connection::open(&output).unwrap();
    let names: Vec<String> = conn
        .prepare("SELECT name FROM south")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(names, vec!["Bengaluru"]);
    let population: i64 = conn
        .query_row("SELECT population FROM south", [], |row| row.get(0))
        .unwrap();
    assert_eq!(population, 8443675);
}
