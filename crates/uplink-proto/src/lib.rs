// Re-export compiled gRPC protos.
//
// All `.proto` files live in this crate so the hub, the connector and tests
// share a single Rust type source.

pub mod local {
    tonic::include_proto!("local");
}

pub mod external {
    tonic::include_proto!("external");
}
