#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;

use assert_cmd::assert::Assert;
use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;
use zip::write::FileOptions;
use zip::ZipWriter;

pub fn parse_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("valid json")
}

/// `bx` pointed at `root` with a clean environment.
pub fn bx(root: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("bx");
    cmd.env_remove("BX_CACHE_PATH")
        .env_remove("BX_TRUSTED_CA")
        .env_remove("BX_EXEC_PERMISSION")
        .env_remove("BX_PROXY_AUTH")
        .env("BX_CACHE_LOCKING", "1")
        .arg("--cache-root")
        .arg(root);
    cmd
}

pub fn write_bundle(path: &Path, version: &str, extra: &[(&str, &[u8])]) {
    let file = File::create(path).expect("create bundle");
    let mut zip = ZipWriter::new(file);
    let opts = FileOptions::default();
    let manifest = format!(
        "Manifest-Version: 1.0\r\nBundle-SymbolicName: demo\r\nBundle-Version: {version}\r\nBundle-ClassPath: .,lib/util.jar\r\n\r\n"
    );
    zip.start_file("META-INF/MANIFEST.MF", opts).expect("manifest");
    zip.write_all(manifest.as_bytes()).expect("manifest");
    zip.start_file("App.class", opts).expect("class");
    zip.write_all(version.as_bytes()).expect("class");
    for (name, bytes) in extra {
        zip.start_file(*name, opts).expect("entry");
        zip.write_all(bytes).expect("entry");
    }
    zip.finish().expect("finish bundle");
}

pub fn jar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        zip.start_file(*name, FileOptions::default()).expect("entry");
        zip.write_all(bytes).expect("entry");
    }
    zip.finish().expect("finish jar").into_inner()
}
