mod host;
mod session;
mod timers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
