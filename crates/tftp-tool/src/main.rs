//! Command-line TFTP client and server.

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{Client, Progress, TftpServer, TftpServerConfig, TransferConfig};

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP client and server with blksize/tsize/timeout option support",
    example = "Download a file:\n  {command_name} get 192.168.1.10 disk.img",
    example = "Upload with a larger block size:\n  {command_name} put 192.168.1.10:69 disk.img --block-size 8192",
    example = "Serve a directory:\n  {command_name} serve --bind 0.0.0.0:6969 --root ./tftp_root"
)]
struct Cli {
    #[argh(subcommand)]
    command: Command,

    #[argh(option, short = 'b', description = "block size to negotiate", default = "4096")]
    block_size: u16,

    #[argh(option, short = 't', description = "per-packet timeout in seconds", default = "5")]
    timeout: u64,

    #[argh(option, short = 'r', description = "retries before giving up", default = "5")]
    retries: u16,

    #[argh(switch, description = "read and write files inline on the network task")]
    no_parallel_io: bool,

    #[argh(switch, short = 'q', description = "suppress the progress display")]
    quiet: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Get(GetArgs),
    Put(PutArgs),
    Serve(ServeArgs),
}

/// Download a file from a TFTP server
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "get")]
struct GetArgs {
    #[argh(positional, description = "server, as host or host:port (port 69 assumed)")]
    peer: String,

    #[argh(positional, description = "remote filename")]
    filename: String,

    #[argh(option, short = 'o', description = "local output path (defaults to the remote name)")]
    output: Option<PathBuf>,
}

/// Upload a file to a TFTP server
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "put")]
struct PutArgs {
    #[argh(positional, description = "server, as host or host:port (port 69 assumed)")]
    peer: String,

    #[argh(positional, description = "local file to send")]
    file: PathBuf,

    #[argh(option, short = 'n', description = "remote filename (defaults to the local name)")]
    remote_name: Option<String>,
}

/// Serve a directory over TFTP
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "serve")]
struct ServeArgs {
    #[argh(option, description = "bind address", default = "\"0.0.0.0:6969\".to_string()")]
    bind: String,

    #[argh(option, description = "directory to serve", default = "PathBuf::from(\"./tftp_root\")")]
    root: PathBuf,
}

impl Cli {
    fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            block_size: self.block_size,
            timeout: Duration::from_secs(self.timeout),
            max_retries: self.retries,
            parallel_io: !self.no_parallel_io,
            ..Default::default()
        }
    }
}

fn progress_printer() -> Box<dyn FnMut(&mut Progress) + Send> {
    Box::new(|progress| {
        if progress.total_bytes > 0 {
            eprint!(
                "\r{} / {} bytes ({:.1}%)",
                progress.transferred_bytes,
                progress.total_bytes,
                progress.transferred_bytes as f64 / progress.total_bytes as f64 * 100.0
            );
        } else {
            eprint!("\r{} bytes", progress.transferred_bytes);
        }
    })
}

fn report_rate(bytes: u64, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    eprintln!(
        "\n{} bytes in {:.3}s ({:.2} MB/s)",
        bytes,
        secs,
        bytes as f64 / secs / 1e6
    );
}

async fn get(cli: &Cli, args: &GetArgs) -> Result<()> {
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&args.filename));
    let sink = File::create(&output)
        .with_context(|| format!("cannot create {}", output.display()))?;

    let client = Client::new(cli.transfer_config());
    let started = std::time::Instant::now();
    let received = if cli.quiet {
        client.receive(&args.peer, &args.filename, sink).await?
    } else {
        client
            .receive_with_progress(
                &args.peer,
                &args.filename,
                sink,
                progress_printer(),
                Duration::from_millis(250),
            )
            .await?
    };
    report_rate(received, started.elapsed());
    Ok(())
}

async fn put(cli: &Cli, args: &PutArgs) -> Result<()> {
    let remote_name = match &args.remote_name {
        Some(name) => name.clone(),
        None => args
            .file
            .file_name()
            .context("local path has no file name")?
            .to_string_lossy()
            .into_owned(),
    };

    let source =
        File::open(&args.file).with_context(|| format!("cannot open {}", args.file.display()))?;
    let size = source.metadata()?.len();

    let client = Client::new(cli.transfer_config());
    let started = std::time::Instant::now();
    if cli.quiet {
        client.send(&args.peer, &remote_name, source).await?;
    } else {
        client
            .send_with_progress(
                &args.peer,
                &remote_name,
                source,
                progress_printer(),
                Duration::from_millis(250),
            )
            .await?;
    }
    report_rate(size, started.elapsed());
    Ok(())
}

async fn serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    anyhow::ensure!(args.root.is_dir(), "root {} is not a directory", args.root.display());

    let mut server = TftpServer::new(TftpServerConfig {
        bind_address: args.bind.clone(),
        root_directory: args.root.clone(),
        transfer: cli.transfer_config(),
    });
    server.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli: Cli = argh::from_env();
    let result = match &cli.command {
        Command::Get(args) => get(&cli, args).await,
        Command::Put(args) => put(&cli, args).await,
        Command::Serve(args) => serve(&cli, args).await,
    };

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
