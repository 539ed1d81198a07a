#[tokio::main]
async fn main() -> anyhow::Result<()> {
    edgeproxy_runtime::run().await
}
