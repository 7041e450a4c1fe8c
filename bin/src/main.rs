use std::{io, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::runtime::Builder;
use tracing::{debug, error, info};
use zk_ultralight::{Connection, ConnectionRegistry, SessionFactory};

mod config;
mod tools;

use config::{
    cli::{self, Command, Parser},
    trace,
};
use tools::NodeFilter;

fn main() -> Result<()> {
    // parses from cli or environment var
    let dotenv = dotenv::dotenv();
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let rt = Builder::new_multi_thread()
        .thread_name("zkul-worker")
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let result = start(config).await;
        if let Err(err) = &result {
            error!(?err, "exited with error");
        }
        result
    })
}

async fn start(config: cli::Config) -> Result<()> {
    if let Command::Demo { name } = &config.command {
        let events = tools::demo(name).await?;
        return print_json(&events);
    }

    let registry = ConnectionRegistry::new(backend()?);
    let cxn = registry
        .get(config.urls.as_slice(), config.connection_options())
        .await;
    info!(servers = cxn.servers(), "using cluster");

    let result = run(&cxn, config.command).await;
    registry.shutdown().await;
    result
}

async fn run(cxn: &Connection, command: Command) -> Result<()> {
    match command {
        Command::Lock {
            name,
            owner,
            hold_ms,
        } => {
            let node = cxn
                .lock(&name, owner)
                .await
                .with_context(|| format!("failed to lock {name}"))?;
            info!(lock = name, node, hold_ms, "holding lock");
            print_json(&serde_json::json!({ "lock": name, "node": node }))?;
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            cxn.unlock(&name)
                .await
                .with_context(|| format!("failed to unlock {name}"))
        }
        Command::Ephemerals { roots } => {
            cxn.wait_connected().await?;
            let session = cxn.session().await?;
            print_json(&tools::walk(session.as_ref(), &roots, NodeFilter::Ephemeral).await?)
        }
        Command::NonEphemerals { roots } => {
            cxn.wait_connected().await?;
            let session = cxn.session().await?;
            print_json(&tools::walk(session.as_ref(), &roots, NodeFilter::NonEphemeralLeaf).await?)
        }
        Command::Rm => {
            let paths: Vec<String> = serde_json::from_reader(io::stdin().lock())
                .context("expected a JSON array of node paths on stdin")?;
            cxn.wait_connected().await?;
            let session = cxn.session().await?;
            tools::remove_all(session.as_ref(), &paths).await
        }
        Command::Demo { name } => print_json(&tools::demo(&name).await?),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(feature = "zookeeper")]
fn backend() -> Result<Arc<dyn SessionFactory>> {
    Ok(Arc::new(zk_ultralight::ZooKeeperFactory))
}

#[cfg(not(feature = "zookeeper"))]
fn backend() -> Result<Arc<dyn SessionFactory>> {
    anyhow::bail!("zkul was built without the `zookeeper` feature; only `demo` is available")
}
