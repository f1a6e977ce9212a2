pub mod v1 {
    tonic::include_proto!("ln_loop.v1");
}
