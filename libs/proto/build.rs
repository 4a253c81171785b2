use std::io::Result;
use std::path::PathBuf;

/// Generated code under `src/gen` is checked in so ordinary builds do not
/// need `protoc`. Set `IMGSWEEP_REGEN_PROTO=1` to regenerate it.
fn main() -> Result<()> {
    let proto_root = PathBuf::from("../../api/proto");

    let protos = ["runtime/v1/api.proto", "runtime/v1alpha2/api.proto"];

    for proto in &protos {
        println!(
            "cargo:rerun-if-changed={}",
            proto_root.join(proto).display()
        );
    }
    println!("cargo:rerun-if-env-changed=IMGSWEEP_REGEN_PROTO");

    if std::env::var_os("IMGSWEEP_REGEN_PROTO").is_none() {
        return Ok(());
    }

    let proto_paths: Vec<PathBuf> = protos.iter().map(|p| proto_root.join(p)).collect();

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("src/gen")
        .compile_protos(&proto_paths, &[&proto_root])?;

    Ok(())
}
