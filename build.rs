use std::io::Result;

fn main() -> Result<()> {
    // The gateway implements only the server side of the service in
    // production; the client stub is generated too so the integration
    // tests can drive a real `NanoLinkServiceClient` against an in-process
    // server instead of hand-rolling protobuf framing.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/nanolink.proto"], &["proto/"])?;

    Ok(())
}
