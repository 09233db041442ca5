fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Prefer a system protoc when one is configured; otherwise use the vendored binary.
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single-threaded at this point.
        unsafe {
            std::env::set_var("PROTOC", protoc);
        }
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/headunit/afm/v1/lifecycle.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/headunit/afm/v1/lifecycle.proto");
    println!("cargo:rerun-if-changed=proto");

    Ok(())
}
