#[tokio::main]
async fn main() {
    if let Err(e) = spyglass::init().await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
