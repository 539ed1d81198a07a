fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Broker gateway schema lives at the workspace root
    let proto_root = "../proto";
    let ambassador_proto = format!("{proto_root}/ambassador/v1/ambassador.proto");

    println!("cargo:rerun-if-changed={ambassador_proto}");
    println!("cargo:rerun-if-env-changed=EDGEPROXY_REGENERATE_PROTO");

    // The generated file is checked in; regenerating needs protoc
    if std::env::var_os("EDGEPROXY_REGENERATE_PROTO").is_none() {
        return Ok(());
    }
    if !std::path::Path::new(&ambassador_proto).exists() {
        println!("cargo:warning=Proto source not found, using pre-generated file");
        return Ok(());
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .bytes(["."])
        .out_dir("src/proto")
        .compile_protos(&[&ambassador_proto], &[proto_root])?;

    Ok(())
}
