fn main() -> std::io::Result<()> {
    let proto = "proto/proto.proto";
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile(&[proto], &["proto"])?;
    println!("cargo:rerun-if-changed={}", proto);
    Ok(())
}
