use anyhow::{bail, Context, Result};
use clap::Parser;
use rtftp::options::ReqOptions;
use rtftp::{Client, ClientConfig, FsHandler, Server, ServerConfig};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;

#[derive(Parser, Debug)]
#[command(name = "rtftp", about = "TFTP server and client")]
struct Args {
    /// Server address: the bind address in server mode, the remote address
    /// in client mode.
    #[arg(long, default_value = "0.0.0.0:69")]
    addr: String,

    /// Run as a server.
    #[arg(long)]
    svr: bool,

    /// Fetch a file from the server.
    #[arg(long)]
    get: bool,

    /// Send a file to the server.
    #[arg(long)]
    put: bool,

    /// Source file: the remote name for --get, the local path for --put.
    #[arg(long)]
    src: Option<String>,

    /// Destination file: the local path for --get, the remote name for
    /// --put. Defaults to the source name.
    #[arg(long)]
    dst: Option<String>,

    /// Directory the server serves files from.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Request a block size from the server.
    #[arg(long)]
    blksize: Option<u16>,

    /// Negotiate the transfer size: ask for it on --get, announce it on
    /// --put.
    #[arg(long)]
    tsize: bool,
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("cannot resolve {addr}"))?
        .next()
        .with_context(|| format!("{addr} resolves to no address"))
}

async fn run_server(args: &Args) -> Result<()> {
    let addr = resolve(&args.addr)?;
    let handler = Arc::new(FsHandler::new(&args.root));
    let server = Arc::new(Server::new(addr, handler, ServerConfig::default())?);
    log::info!("serving {} on {addr}", args.root.display());

    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    server.close();
    runner.await??;
    Ok(())
}

async fn run_get(args: &Args) -> Result<()> {
    let Some(src) = &args.src else {
        bail!("invalid command, please set the source file name");
    };
    let dst = args.dst.clone().unwrap_or_else(|| src.clone());

    let options = ReqOptions {
        block_size: args.blksize,
        timeout: None,
        tsize: args.tsize.then_some(0),
    };
    let mut client = Client::new(
        resolve(&args.addr)?,
        ClientConfig {
            options,
            ..ClientConfig::default()
        },
    )?;

    let mut f = File::create(&dst).await?;
    let n = client.get(src, &mut f).await?;
    println!("fetched {src} ({n} bytes) into {dst}");
    Ok(())
}

async fn run_put(args: &Args) -> Result<()> {
    let Some(src) = &args.src else {
        bail!("invalid command, please set the source file name");
    };
    let dst = args.dst.clone().unwrap_or_else(|| src.clone());

    let mut f = File::open(src).await?;
    let tsize = if args.tsize {
        Some(f.metadata().await?.len())
    } else {
        None
    };
    let options = ReqOptions {
        block_size: args.blksize,
        timeout: None,
        tsize,
    };
    let mut client = Client::new(
        resolve(&args.addr)?,
        ClientConfig {
            options,
            ..ClientConfig::default()
        },
    )?;

    let n = client.put(&dst, &mut f).await?;
    println!("sent {src} ({n} bytes) as {dst}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.svr {
        run_server(&args).await
    } else if args.get {
        run_get(&args).await
    } else if args.put {
        run_put(&args).await
    } else {
        bail!("invalid command: pass one of --svr, --get or --put");
    }
}
