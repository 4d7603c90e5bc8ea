use anyhow::Result;
use strand_broker::BrokerServer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    strand_log::init();
    let mut listen = "0.0.0.0:5680".to_string();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => {
                listen = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--listen needs an address"))?;
            }
            other => {
                return Err(anyhow::anyhow!("unknown argument {}", other));
            }
        }
    }
    let server = BrokerServer::bind(&listen).await?;
    info!(addr = %server.local_addr(), "broker listening");
    server.serve().await?;
    Ok(())
}
