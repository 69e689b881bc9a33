use fleetdiag_server::core::ClusterApp;

#[tokio::main]
async fn main() {
    std::process::exit(ClusterApp::run().await);
}
