#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tunefetch::run().await
}
