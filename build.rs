fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/ln_loop/v1/server.proto"], &["proto"])?;

    Ok(())
}
