#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    _dir: TempDir,
    config: PathBuf,
    image: PathBuf,
}

fn workspace() -> Workspace {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("segctl.toml");
    fs::write(
        &config,
        "[segment]\nsize = 131072\n\n[btree]\nfanout = 3\n",
    )
    .expect("write config");
    let image = dir.path().join("store.seg");
    Workspace {
        _dir: dir,
        config,
        image,
    }
}

fn segctl(ws: &Workspace) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("segctl");
    cmd.arg("--config").arg(&ws.config).env_remove("SEGCTL_LOG");
    cmd
}

fn json_output(ws: &Workspace, args: &[&str], image: &Path) -> Value {
    let output = segctl(ws)
        .args(["--format", "json"])
        .args(args)
        .arg(image)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn format_put_get_list_and_delete() {
    let ws = workspace();
    segctl(&ws).arg("format").arg(&ws.image).assert().success();
    assert_eq!(fs::metadata(&ws.image).expect("image").len(), 131_072);

    for (key, value) in [("beta", "2"), ("alpha", "1"), ("gamma", "3")] {
        segctl(&ws)
            .arg("put")
            .arg(&ws.image)
            .args([key, value])
            .assert()
            .success();
    }

    let output = segctl(&ws)
        .arg("get")
        .arg(&ws.image)
        .arg("alpha")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&output).trim(), "1");

    let list = json_output(&ws, &["list"], &ws.image);
    let keys: Vec<&str> = list
        .as_array()
        .expect("array")
        .iter()
        .map(|pair| pair["key"].as_str().expect("key"))
        .collect();
    assert_eq!(keys, ["alpha", "beta", "gamma"]);

    segctl(&ws)
        .arg("del")
        .arg(&ws.image)
        .arg("beta")
        .assert()
        .success();
    let output = segctl(&ws)
        .arg("get")
        .arg(&ws.image)
        .arg("beta")
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("not found"));

    let dict = json_output(&ws, &["dict"], &ws.image);
    assert_eq!(dict[0]["name"], "segctl.kv");
}

#[test]
fn put_refuses_to_replace_without_overwrite() {
    let ws = workspace();
    segctl(&ws).arg("format").arg(&ws.image).assert().success();
    segctl(&ws).arg("put").arg(&ws.image).args(["k", "v1"]).assert().success();
    segctl(&ws)
        .arg("put")
        .arg(&ws.image)
        .args(["k", "v2"])
        .assert()
        .failure()
        .code(1);
    segctl(&ws)
        .arg("put")
        .arg(&ws.image)
        .args(["k", "v2", "--overwrite"])
        .assert()
        .success();

    let output = segctl(&ws)
        .args(["--format", "json", "get"])
        .arg(&ws.image)
        .arg("k")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let pair: Value = serde_json::from_slice(&output).expect("json");
    assert_eq!(pair["value"], "v2");
}

#[test]
fn hex_keys_and_values_round_trip() {
    let ws = workspace();
    segctl(&ws).arg("format").arg(&ws.image).assert().success();
    segctl(&ws)
        .arg("put")
        .arg(&ws.image)
        .args(["00ff", "deadbeef", "--hex"])
        .assert()
        .success();
    let output = segctl(&ws)
        .args(["--format", "json", "get"])
        .arg(&ws.image)
        .args(["00ff", "--hex"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let pair: Value = serde_json::from_slice(&output).expect("json");
    assert_eq!(pair["key"], "0x00ff");
    assert_eq!(pair["value_hex"], "deadbeef");
}

#[test]
fn stats_and_verify_report_json() {
    let ws = workspace();
    segctl(&ws).arg("format").arg(&ws.image).assert().success();
    segctl(&ws).arg("put").arg(&ws.image).args(["k", "v"]).assert().success();

    let stats = json_output(&ws, &["stats"], &ws.image);
    assert_eq!(stats["segment"]["size"], 131_072);
    assert_eq!(stats["dictionary"]["entries"], 1);
    assert_eq!(stats["dictionary"]["trees"][0]["summary"]["items"], 1);

    let verify = json_output(&ws, &["verify", "--level", "full"], &ws.image);
    assert_eq!(verify["success"], true);
    assert_eq!(verify["level"], "full");
    assert_eq!(verify["counts"]["trees_checked"], 1);
}

#[test]
fn verify_exits_with_two_on_damage() {
    let ws = workspace();
    segctl(&ws).arg("format").arg(&ws.image).assert().success();
    let mut bytes = fs::read(&ws.image).expect("read image");
    bytes[0] ^= 0xff;
    fs::write(&ws.image, bytes).expect("write image");

    segctl(&ws)
        .arg("verify")
        .arg(&ws.image)
        .assert()
        .failure()
        .code(2);
}

#[test]
fn format_refuses_existing_file_and_missing_config() {
    let ws = workspace();
    segctl(&ws).arg("format").arg(&ws.image).assert().success();
    segctl(&ws).arg("format").arg(&ws.image).assert().failure().code(1);

    cargo_bin_cmd!("segctl")
        .arg("--config")
        .arg(ws.image.with_extension("absent.toml"))
        .arg("stats")
        .arg(&ws.image)
        .assert()
        .failure()
        .code(1);
}
