use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_files = ["./proto/stats_command.proto"];
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));

    // Client only.
    tonic_build::configure()
        .build_server(false)
        .out_dir(out_dir)
        .compile_protos(&proto_files, &["./proto"])?;

    rerun(&proto_files);

    Ok(())
}

fn rerun(proto_files: &[&str]) {
    for proto_file in proto_files {
        println!("cargo:rerun-if-changed={proto_file}");
    }
}
