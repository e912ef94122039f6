/// Builds the gRPC client and server stubs for the `JumanppJumandic` service
/// using `tonic-build`'s manual service builder.
///
/// The message types are declared by hand with `prost` derives in
/// `src/common/proto.rs`, so this build step only needs to emit the service
/// plumbing. No `protoc` binary is required at build time.
///
/// # Methods
///
/// - `LatticeDump` / `LatticeDumpWithFeatures`: unary analysis.
/// - `LatticeDumpStream` / `LatticeDumpWithFeaturesStream`: bidirectional
///   streaming analysis.
///
/// # Output
///
/// Generated code will be accessible in Rust via:
///
/// ```rust,ignore
/// include!(concat!(env!("OUT_DIR"), "/jumanpp.grpc.JumanppJumandic.rs"));
/// ```
///
/// This file contains both the `jumanpp_jumandic_server` and the
/// `jumanpp_jumandic_client` modules.
use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic_prost::ProstCodec";
const REQUEST: &str = "crate::proto::AnalysisRequest";
const REPLY: &str = "crate::proto::LatticeDump";

fn unary(name: &str, route: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(REQUEST)
        .output_type(REPLY)
        .codec_path(CODEC)
        .build()
}

fn bidi(name: &str, route: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(REQUEST)
        .output_type(REPLY)
        .codec_path(CODEC)
        .client_streaming()
        .server_streaming()
        .build()
}

fn main() {
    let service = Service::builder()
        .name("JumanppJumandic")
        .package("jumanpp.grpc")
        .method(unary("lattice_dump", "LatticeDump"))
        .method(unary("lattice_dump_with_features", "LatticeDumpWithFeatures"))
        .method(bidi("lattice_dump_stream", "LatticeDumpStream"))
        .method(bidi(
            "lattice_dump_with_features_stream",
            "LatticeDumpWithFeaturesStream",
        ))
        .build();

    Builder::new().compile(&[service]);
}
