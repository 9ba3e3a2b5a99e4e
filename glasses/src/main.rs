mod host;
mod script;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
