use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::time::{Instant, sleep, timeout};
use tracing::{info, warn};

use replicated_cas::{
    Fetch, Node, NodeConfig,
    cli::{Cli, Command, DemoArgs, ServeArgs},
};

const DEMO_KEY: &str = "doc";
const DEMO_PAYLOAD: &[u8] = b"inside file";
const DEMO_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Demo(args) => demo(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = NodeConfig::new(args.listen.to_string(), args.root);
    config.transform = args.transform.into();
    config.bootstrap = args.peer;

    let node = Node::new(config);
    let addr = node.start().await.context("failed to start node")?;
    info!("node listening on {}", addr);

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    node.shutdown().await;
    Ok(())
}

/// Two nodes on ephemeral ports: the second dials the first, stores a blob,
/// the first drops its replica and fetches it back over the network.
async fn demo(args: DemoArgs) -> Result<()> {
    let first = Node::new(NodeConfig::new("127.0.0.1:0", args.root.join("first")));
    let first_addr = first.start().await.context("failed to start first node")?;

    let mut config = NodeConfig::new("127.0.0.1:0", args.root.join("second"));
    config.bootstrap = vec![first_addr.to_string()];
    let second = Node::new(config);
    second.start().await.context("failed to start second node")?;

    wait_for(|| first.peer_count() == 1, "first node to register its peer").await?;

    let size = second.store(DEMO_KEY, DEMO_PAYLOAD).await?;
    println!("stored {DEMO_KEY} ({size} bytes) on second node");

    let replica = wait_for_replica(&first).await?;
    println!("first node holds replica: {replica}");

    first.delete(DEMO_KEY).await?;
    let fetched = read_fetch(first.get(DEMO_KEY).await?).await?;
    println!("fetched {DEMO_KEY} back from peer: {fetched}");

    first.clear().await?;
    second.clear().await?;
    second.shutdown().await;
    first.shutdown().await;
    Ok(())
}

async fn read_fetch(fetch: Fetch) -> Result<String> {
    let mut file = match fetch {
        Fetch::Local { file, .. } => file,
        Fetch::Remote(remote) => {
            let (_, file) = timeout(DEMO_TIMEOUT, remote.wait())
                .await
                .context("timed out waiting for peers")??;
            file
        }
    };
    let mut contents = String::new();
    file.read_to_string(&mut contents).await?;
    Ok(contents)
}

/// Polls until the whole payload landed; the file shows up before its bytes do.
async fn wait_for_replica(node: &Node) -> Result<String> {
    let deadline = Instant::now() + DEMO_TIMEOUT;
    loop {
        if node.has(DEMO_KEY).await? {
            let contents = read_fetch(node.get(DEMO_KEY).await?).await?;
            if contents.as_bytes() == DEMO_PAYLOAD {
                return Ok(contents);
            }
        }
        if Instant::now() > deadline {
            bail!("replica never reached the first node");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for<F>(mut condition: F, description: &str) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + DEMO_TIMEOUT;
    while !condition() {
        if Instant::now() > deadline {
            bail!("timed out waiting for {description}");
        }
        sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
