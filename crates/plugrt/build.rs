use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so builds don't depend on a system install
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    let proto_dir = PathBuf::from("proto");

    let protos = [
        proto_dir.join("grpc_controller.proto"),
        proto_dir.join("grpc_stdio.proto"),
        proto_dir.join("health.proto"),
    ];

    for proto in &protos {
        if !proto.exists() {
            panic!("Proto file not found: {}", proto.display());
        }
    }

    // Clients are built too: the host side and our integration tests use them
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&protos, &[&proto_dir])?;

    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto.display());
    }
    println!("cargo:rerun-if-changed=build.rs");

    Ok(())
}
