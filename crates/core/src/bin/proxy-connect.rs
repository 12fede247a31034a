use std::{sync::Arc, time::Instant};

use clap::Parser;
use proxy_connect::{
    config::{set_logger, ConnectArgs},
    pipeline::Channel,
    promise::Outcome,
    transport::TcpTransport,
    HandshakeCoordinator,
};

const TRANSPORT: &str = "tcp";
const COORDINATOR: &str = "proxy-coordinator";

async fn run(args: ConnectArgs) -> anyhow::Result<()> {
    let config = args.build()?;
    let channel = Channel::new();
    channel
        .pipeline()
        .add_last(TRANSPORT, Arc::new(TcpTransport::new()))?;
    channel.pipeline().add_last(
        COORDINATOR,
        Arc::new(HandshakeCoordinator::new(config.handshake())),
    )?;

    tracing::info!(proxy = %config.proxy_address, target = %args.target, "Connecting through proxy");
    let started = Instant::now();
    let outcome = channel
        .connect_timeout(
            args.target.clone(),
            args.local_address,
            config.connect_timeout,
        )
        .wait()
        .await;
    let result = match outcome {
        Outcome::Success(()) => {
            println!(
                "tunnel to {} via {} established in {:?}",
                args.target,
                config.proxy_address,
                started.elapsed()
            );
            Ok(())
        }
        Outcome::Failure(cause) => Err(anyhow::anyhow!(
            "connect to {} via {} failed: {cause}",
            args.target,
            config.proxy_address
        )),
        Outcome::Cancelled => Err(anyhow::anyhow!(
            "connect to {} via {} timed out after {:?}",
            args.target,
            config.proxy_address,
            config.connect_timeout
        )),
    };
    channel.close()?;
    channel.sync().await?;
    result
}

fn main() -> anyhow::Result<()> {
    let args = ConnectArgs::parse();
    set_logger(args.log_level);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}
