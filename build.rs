fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the vendored protoc when the host has none
    if std::env::var("PROTOC").is_err() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        std::env::set_var("PROTOC", protoc);
    }

    println!("cargo:rerun-if-changed=proto/cluster.proto");
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/cluster.proto"], &["proto/"])?;
    Ok(())
}
