#[cfg(feature = "hub")]
#[tokio::main]
async fn main() {
    if let Err(err) = ridewatch::server::run().await {
        tracing::error!(?err, "hub exited with error");
        std::process::exit(1);
    }
}

#[cfg(not(feature = "hub"))]
fn main() {
    eprintln!("ridewatch-hub was built without the `hub` feature");
    std::process::exit(1);
}
