fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the vendored protoc when none is configured
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Only the client side of the synchronizer services is needed
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile(
            &["proto/installapp.proto", "proto/readynotify.proto"],
            &["proto"],
        )?;

    println!("cargo:rerun-if-changed=proto/installapp.proto");
    println!("cargo:rerun-if-changed=proto/readynotify.proto");

    Ok(())
}
