#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolgate::run().await
}
