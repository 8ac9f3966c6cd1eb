use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::path::PathTransform;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a storage node until Ctrl-C.
    Serve(ServeArgs),
    /// Replicate and fetch back a blob between two local nodes.
    Demo(DemoArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to listen on for peers.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Directory holding this node's blobs.
    #[arg(long)]
    pub root: PathBuf,

    /// Peers to dial on startup, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub peer: Vec<String>,

    /// How keys map to paths on disk.
    #[arg(long, value_enum, default_value_t = Layout::Cas)]
    pub transform: Layout,
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Parent directory for the two demo stores.
    #[arg(long, default_value = "demo-data")]
    pub root: PathBuf,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Sharded SHA-1 directories.
    Cas,
    /// `<key>/<key>`.
    Identity,
}

impl From<Layout> for PathTransform {
    fn from(layout: Layout) -> Self {
        match layout {
            Layout::Cas => PathTransform::ContentAddressed,
            Layout::Identity => PathTransform::Identity,
        }
    }
}
