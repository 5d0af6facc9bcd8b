#[tokio::main(flavor = "multi_thread")]
async fn main() {
    env_logger::init();

    if let Err(e) = tabminal::run().await {
        log::error!("tabminal exited with error: {e}");
        std::process::exit(1);
    }
}
