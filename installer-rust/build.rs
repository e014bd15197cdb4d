use std::{
    fs, io,
    path::{Path, PathBuf},
};

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
    let assets_dir = PathBuf::from(manifest_dir).join("assets");
    println!("cargo:rerun-if-changed={}", assets_dir.display());

    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows") {
        return;
    }
    if let Err(err) = embed_resources(&assets_dir) {
        panic!("failed to embed version resource: {err}");
    }
}

fn embed_resources(assets_dir: &Path) -> io::Result<()> {
    let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let description = std::env::var("CARGO_PKG_DESCRIPTION").unwrap_or_default();

    let mut res = winres::WindowsResource::new();
    if let Some(icon_path) = first_icon(assets_dir) {
        res.set_icon(icon_path.to_string_lossy().as_ref());
    }
    res.set("ProductName", "Shipwright Setup");
    res.set("InternalName", "shipwright-installer");
    if !description.is_empty() {
        res.set("FileDescription", &description);
    }
    if !version.is_empty() {
        res.set("FileVersion", &version);
        res.set("ProductVersion", &version);
    }
    res.compile()?;
    Ok(())
}

fn first_icon(assets_dir: &Path) -> Option<PathBuf> {
    let mut ico_paths: Vec<PathBuf> = fs::read_dir(assets_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|e| e.eq_ignore_ascii_case("ico"))
                .unwrap_or(false)
        })
        .collect();
    ico_paths.sort();
    ico_paths.first().cloned()
}
