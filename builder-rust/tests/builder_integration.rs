use std::{
    fs::{self, File},
    path::Path,
    process::Command,
};

fn builder() -> Command {
    Command::new(env!("CARGO_BIN_EXE_shipwright-builder"))
}

fn write_manifest(dir: &Path, executable: &str) -> std::path::PathBuf {
    fs::create_dir_all(dir.join("build").join("plugins")).unwrap();
    fs::write(dir.join("build").join("app.bin"), "binary").unwrap();
    fs::write(dir.join("build").join("plugins").join("a.dll"), "a").unwrap();
    fs::write(dir.join("build").join("plugins").join("b.dll"), "b").unwrap();
    let manifest = dir.join("shipwright.manifest.toml");
    fs::write(
        &manifest,
        format!(
            r#"
[app]
id = "App_setup"
name = "App"
version = "1.0.0"
executable = "{executable}"

[[files]]
source = "build/app.bin"
dest = "{{app}}"

[[files]]
source = "build/plugins"
dest = "{{app}}/plugins"
recursive = true
"#
        ),
    )
    .unwrap();
    manifest
}

#[test]
fn build_writes_archive_with_index() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(tmp.path(), "{app}/app.bin");
    let out_dir = tmp.path().join("dist");

    let status = builder()
        .arg("build")
        .arg("--manifest")
        .arg(&manifest)
        .arg("--out-dir")
        .arg(&out_dir)
        .status()
        .unwrap();
    assert!(status.success());

    let artifact = out_dir.join("App-1.0.0-setup.zip");
    let mut archive = zip::ZipArchive::new(File::open(&artifact).unwrap()).unwrap();
    let index: serde_json::Value =
        serde_json::from_reader(archive.by_name("package.json").unwrap()).unwrap();
    assert_eq!(index["app"]["id"], "App_setup");
    let payloads: Vec<&str> = index["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["payload"].as_str().unwrap())
        .collect();
    assert_eq!(
        payloads,
        vec![
            "payload/app/app.bin",
            "payload/app/plugins/a.dll",
            "payload/app/plugins/b.dll"
        ]
    );
    assert!(archive.by_name("payload/app/plugins/b.dll").is_ok());
}

#[test]
fn relative_paths_resolve_against_working_directory() {
    let tmp = tempfile::tempdir().unwrap();
    write_manifest(tmp.path(), "{app}/app.bin");

    let output = builder()
        .current_dir(tmp.path())
        .args(["build", "-o", "out"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(tmp.path().join("out").join("App-1.0.0-setup.zip").exists());
}

#[test]
fn check_reports_summary_without_writing() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(tmp.path(), "{app}/app.bin");

    let output = builder().arg("check").arg("-m").arg(&manifest).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("App 1.0.0 (App_setup): 3 files"), "{stdout}");
    assert!(!tmp.path().join("dist").exists());
}

#[test]
fn invalid_manifest_fails_with_usage_code() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(tmp.path(), "{fonts}/app.bin");

    let output = builder()
        .arg("build")
        .arg("--manifest")
        .arg(&manifest)
        .arg("--out-dir")
        .arg(tmp.path().join("dist"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("executable"));
    assert!(!tmp.path().join("dist").exists());
}
