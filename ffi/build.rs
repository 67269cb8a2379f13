use std::{env, fs, path::PathBuf};

const HEADER: &str = "uthread.h";

fn main() {
    let crate_dir = PathBuf::from(
        env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo for build scripts"),
    );

    println!("cargo::rerun-if-changed=bindgen.toml");
    println!("cargo::rerun-if-changed=src");

    let config = cbindgen::Config::from_file(crate_dir.join("bindgen.toml"))
        .expect("bindgen.toml is missing or malformed");

    let include_dir = crate_dir.join("include");
    fs::create_dir_all(&include_dir).expect("cannot create the include directory");

    cbindgen::Builder::new()
        .with_config(config)
        .with_crate(&crate_dir)
        .generate()
        .expect("cannot generate the C header for uthread-ffi")
        .write_to_file(include_dir.join(HEADER));
}
