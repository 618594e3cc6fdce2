use prost_build::compile_protos;

fn main() {
    println!("cargo:rerun-if-changed=src/messages.proto");
    compile_protos(&["src/messages.proto"], &["src"])
        .expect("failed to build protos");
}
