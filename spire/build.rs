use glob::glob;
use prost_build::compile_protos;

fn main() {
    // Store records, compiled into `$OUT_DIR/store.rs`.
    let protos: Vec<String> = glob("protos/*.proto")
        .expect("failed to glob protos")
        .filter_map(|entry| entry.ok())
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    // rerun-if-changed takes no globs, so every schema is listed. Templates are
    // read by askama at compile time and need the same treatment.
    for path in protos.iter().map(String::as_str).chain(["templates"].iter().copied()) {
        println!("cargo:rerun-if-changed={}", path);
    }

    compile_protos(&protos, &["protos".into()]).expect("failed to compile store protos");
}
