mod common;

use assert_cmd::cargo::cargo_bin_cmd;
use common::*;
use modeloci::archive::ArchiveReader;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn stdout_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 stdout")
}

fn stderr_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8(assert.get_output().stderr.clone()).expect("utf8 stderr")
}

fn pack_demo(parent: &Path) -> std::path::PathBuf {
    let src = parent.join("model");
    fs::create_dir_all(&src).unwrap();
    write_tree(&src, &[("a.txt", b"hello"), ("sub/b.txt", b"world")]);
    let assert = cargo_bin_cmd!("modeloci")
        .args(["pack", "--model-dir"])
        .arg(&src)
        .args(["--name", "demo", "--version", "1.0.0", "--metadata", r#"{"task": "demo"}"#])
        .assert()
        .success();
    let output = stdout_of(&assert);
    assert!(output.contains("Packaged model:"), "pack output: {output}");
    assert!(output.contains("demo-1.0.0.tar"), "pack output: {output}");
    parent.canonicalize().unwrap().join("demo-1.0.0.tar")
}

#[test]
fn pack_inspect_unpack() {
    let dir = tempdir().unwrap();
    let archive = pack_demo(dir.path());
    assert!(archive.is_file());

    let assert = cargo_bin_cmd!("modeloci")
        .arg("inspect")
        .arg("--archive")
        .arg(&archive)
        .assert()
        .success();
    let output = stdout_of(&assert);
    assert!(output.contains("Model    : demo"), "inspect output: {output}");
    assert!(output.contains("Framework: pytorch"), "inspect output: {output}");
    assert!(output.contains(r#"Metadata : {"task":"demo"}"#), "inspect output: {output}");
    assert!(output.contains("Layers (2):"), "inspect output: {output}");
    assert!(output.contains("sub/b.txt"), "inspect output: {output}");
    assert!(output.contains("All layers verified."), "inspect output: {output}");

    let out = dir.path().join("out");
    let assert = cargo_bin_cmd!("modeloci")
        .arg("unpack")
        .arg("--archive")
        .arg(&archive)
        .arg("--output")
        .arg(&out)
        .assert()
        .success();
    assert!(stdout_of(&assert).contains("Model    : demo v1.0.0"));
    assert_eq!(fs::read(out.join("sub/b.txt")).unwrap(), b"world");
}

#[test]
fn inspect_exits_one_on_tampered_layer() {
    let dir = tempdir().unwrap();
    let archive = pack_demo(dir.path());
    let manifest = ArchiveReader::open(&archive).unwrap().manifest().unwrap();
    corrupt_blob(&archive, manifest.layers()[0].digest());

    let assert = cargo_bin_cmd!("modeloci")
        .arg("inspect")
        .arg("--archive")
        .arg(&archive)
        .assert()
        .code(1);
    let output = stdout_of(&assert);
    assert!(output.contains("FAIL"), "inspect output: {output}");
    assert!(output.contains("OK"), "inspect output: {output}");
    assert!(stderr_of(&assert).contains("WARNING: some layers failed verification!"));
}

#[test]
fn input_errors_exit_two() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("not-a-dir.txt");
    fs::write(&file, b"x").unwrap();

    let assert = cargo_bin_cmd!("modeloci")
        .args(["pack", "--model-dir"])
        .arg(&file)
        .args(["--name", "m", "--version", "1"])
        .assert()
        .code(2);
    assert!(stderr_of(&assert).contains("is not a directory"));

    let assert = cargo_bin_cmd!("modeloci")
        .args(["pack", "--model-dir"])
        .arg(dir.path())
        .args(["--name", "m", "--version", "1", "--metadata", "{oops"])
        .assert()
        .code(2);
    assert!(stderr_of(&assert).contains("Error: invalid JSON for --metadata"));
    assert!(!dir.path().join("m-1.tar").exists());
}

#[test]
fn archive_name_outside_parent_exits_two() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("parent/model");
    write_tree(&src, &[("a.txt", b"a")]);

    for name in ["../escaped", "a/b"] {
        let assert = cargo_bin_cmd!("modeloci")
            .args(["pack", "--model-dir"])
            .arg(&src)
            .args(["--name", name, "--version", "1"])
            .assert()
            .code(2);
        assert!(
            stderr_of(&assert).contains("must be a single file name"),
            "stderr: {}",
            stderr_of(&assert)
        );
    }
    assert!(!dir.path().join("escaped-1.tar").exists());
    assert!(!dir.path().join("parent/a").exists());
}

fn pack_with(src: &Path, extra: &[&str]) -> Vec<u8> {
    cargo_bin_cmd!("modeloci")
        .args(["pack", "--model-dir"])
        .arg(src)
        .args(["--name", "tuned", "--version", "2"])
        .args(extra)
        .assert()
        .success();
    fs::read(src.parent().unwrap().join("tuned-2.tar")).unwrap()
}

#[test]
fn pack_options_shape_the_archive() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("model");
    let text = "hello ".repeat(200);
    write_tree(&src, &[("a.txt", text.as_bytes()), ("sub/b.txt", b"world")]);
    let archive = dir.path().join("tuned-2.tar");
    let media = ["--media-type", "a.txt=application/vnd.example.text"];

    let stored = pack_with(&src, &[&["--compression-level", "0"][..], &media[..]].concat());
    let stored_layer = ArchiveReader::open(&archive).unwrap().manifest().unwrap().layers()[0].size();

    let serial = pack_with(
        &src,
        &[&["--jobs", "1", "--compression-level", "9"][..], &media[..]].concat(),
    );
    let parallel = pack_with(
        &src,
        &[&["--jobs", "4", "--compression-level", "9", "--max-file-size", "4096"][..], &media[..]]
            .concat(),
    );
    assert_eq!(serial, parallel);
    assert_ne!(stored, serial);

    let manifest = ArchiveReader::open(&archive).unwrap().manifest().unwrap();
    let layers = manifest.layers();
    assert_eq!(layers[0].media_type().to_string(), "application/vnd.example.text");
    assert_eq!(
        layers[1].media_type().to_string(),
        "application/vnd.oci.image.layer.v1.tar+gzip"
    );
    assert!(layers[0].size() < stored_layer);

    cargo_bin_cmd!("modeloci")
        .arg("inspect")
        .arg("--archive")
        .arg(&archive)
        .assert()
        .success();
}

#[test]
fn pack_option_limits_exit_two() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("model");
    write_tree(&src, &[("big.bin", &[7u8; 64][..])]);

    let assert = cargo_bin_cmd!("modeloci")
        .args(["pack", "--model-dir"])
        .arg(&src)
        .args(["--name", "m", "--version", "1", "--max-file-size", "16"])
        .assert()
        .code(2);
    assert!(stderr_of(&assert).contains("per-file ceiling"));
    assert!(!dir.path().join("m-1.tar").exists());

    for bad in [
        &["--compression-level", "12"][..],
        &["--media-type", "no-separator"][..],
        &["--media-type", "=application/x"][..],
    ] {
        cargo_bin_cmd!("modeloci")
            .args(["pack", "--model-dir"])
            .arg(&src)
            .args(["--name", "m", "--version", "1"])
            .args(bad)
            .assert()
            .code(2);
    }
}

#[test]
fn format_and_security_errors_have_distinct_codes() {
    let dir = tempdir().unwrap();
    let (config, manifest) = empty_model_members();

    let foreign = raw_container(dir.path(), "foreign.tar", &[("readme.txt", b"hi")]);
    cargo_bin_cmd!("modeloci")
        .arg("unpack")
        .arg("--archive")
        .arg(&foreign)
        .arg("--output")
        .arg(dir.path().join("a"))
        .assert()
        .code(3);

    let evil = raw_container(
        dir.path(),
        "evil.tar",
        &[
            ("config.json", config.as_slice()),
            ("manifest.json", manifest.as_slice()),
            ("../evil.txt", b"x"),
        ],
    );
    let assert = cargo_bin_cmd!("modeloci")
        .arg("unpack")
        .arg("--archive")
        .arg(&evil)
        .arg("--output")
        .arg(dir.path().join("b"))
        .assert()
        .code(4);
    assert!(stderr_of(&assert).contains("escapes the output directory"));
    assert!(!dir.path().join("evil.txt").exists());
}

#[test]
fn add_layer_rebuild_manifest() {
    let dir = tempdir().unwrap();
    let archive = pack_demo(dir.path());
    let extra = dir.path().join("extra.bin");
    fs::write(&extra, b"more weights").unwrap();

    let assert = cargo_bin_cmd!("modeloci")
        .arg("add-layer")
        .arg("--archive")
        .arg(&archive)
        .arg("--file")
        .arg(&extra)
        .assert()
        .success();
    let descriptor: serde_json::Value = {
        let output = stdout_of(&assert);
        let json_end = output.rfind('}').unwrap() + 1;
        serde_json::from_str(&output[..json_end]).unwrap()
    };
    assert_eq!(
        descriptor["annotations"]["org.opencontainers.image.title"],
        "extra.bin"
    );
    let manifest = ArchiveReader::open(&archive).unwrap().manifest().unwrap();
    assert_eq!(manifest.layers().len(), 2);

    cargo_bin_cmd!("modeloci")
        .arg("add-layer")
        .arg("--archive")
        .arg(&archive)
        .arg("--file")
        .arg(&extra)
        .arg("--rebuild-manifest")
        .assert()
        .success();
    let manifest = ArchiveReader::open(&archive).unwrap().manifest().unwrap();
    assert_eq!(manifest.layers().len(), 3);
    assert_eq!(
        manifest.layers()[2].digest().to_string(),
        descriptor["digest"].as_str().unwrap()
    );
}
