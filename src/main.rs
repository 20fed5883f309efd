#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mindtype_lib::run().await
}
