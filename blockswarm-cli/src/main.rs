use std::{net::SocketAddr, path::PathBuf, time::Duration};

use blockswarm::{
    conf::Conf,
    metainfo::Metainfo,
    store::FilePersister,
    Client,
};
use flexi_logger::{FileSpec, Logger};
use structopt::StructOpt;
use tokio::{signal, time};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(StructOpt, Debug)]
pub struct Args {
    /// The path to the transfer's metainfo file.
    ///
    /// When seeding and the file doesn't exist, it is created from the
    /// seeded content.
    #[structopt(short, long)]
    metainfo: PathBuf,

    /// Seed the content at this path instead of downloading.
    #[structopt(long)]
    seed: Option<PathBuf>,

    /// Where to write the downloaded content once complete.
    #[structopt(short, long)]
    output: Option<PathBuf>,

    /// The socket address on which to listen for new connections.
    #[structopt(short, long)]
    listen: Option<SocketAddr>,

    /// A comma separated list of <ip>:<port> pairs of peers to connect to.
    #[structopt(short, long, use_delimiter = true)]
    peers: Vec<SocketAddr>,

    /// The directory in which the transfer's progress is saved.
    #[structopt(long, default_value = "/tmp/blockswarm")]
    state_dir: PathBuf,

    /// The piece length of a metainfo created for seeding.
    #[structopt(long, default_value = "262144")]
    piece_len: u32,

    /// Exit once the download completes rather than keep seeding it.
    #[structopt(short, long)]
    quit_after_complete: bool,

    /// Log to files in this directory instead of stderr.
    #[structopt(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::from_args();

    let logger = Logger::try_with_env_or_str("info")?;
    let logger = match &args.log_dir {
        Some(dir) => logger.log_to_file(FileSpec::default().directory(dir)),
        None => logger,
    };
    let _logger = logger.start()?;

    let metainfo = load_metainfo(&args).await?;
    log::info!(
        "Transfer {} ({} bytes in {} piece(s)), info hash {}",
        metainfo.name,
        metainfo.download_len,
        metainfo.piece_count(),
        hex::encode(&metainfo.info_hash)
    );

    let mut conf = Conf::new(&args.state_dir);
    if let Some(listen) = args.listen {
        conf.engine.listen_addr = listen;
    }
    tokio::fs::create_dir_all(&conf.engine.state_dir).await?;
    let persister = FilePersister::new(&conf.engine.state_dir, &metainfo.info_hash)?;

    let client = Client::new(conf, metainfo, persister)?;
    if let Some(path) = &args.seed {
        let count = client.seed_from(path).await?;
        log::info!("Seeding {} piece(s) from {:?}", count, path);
    }

    let listen_addr = client.start().await?;
    log::info!("Listening on {}", listen_addr);

    for addr in args.peers.iter().copied() {
        if let Err(e) = client.connect(addr).await {
            log::warn!("Cannot connect to {}: {}", addr, e);
        }
    }

    let is_seeding = args.seed.is_some();
    let mut is_complete = client.is_complete().await;
    if is_complete && !is_seeding {
        on_complete(&client, &args).await?;
        if args.quit_after_complete {
            client.shutdown().await;
            return Ok(());
        }
    }

    let mut progress = time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                log::info!("Interrupted");
                break;
            }
            _ = client.wait_for_completion(), if !is_complete => {
                is_complete = true;
                on_complete(&client, &args).await?;
                if args.quit_after_complete {
                    break;
                }
            }
            _ = progress.tick() => {
                let have = client.have().await;
                log::info!(
                    "Have {}/{} piece(s), {} peer(s)",
                    have.count_ones(),
                    have.len(),
                    client.peer_count().await
                );
            }
        }
    }

    client.shutdown().await;

    Ok(())
}

/// Reads the metainfo file, or creates it from the seeded content if it
/// doesn't exist yet.
async fn load_metainfo(args: &Args) -> Result<Metainfo> {
    match &args.seed {
        Some(content_path) if !args.metainfo.exists() => {
            let content = tokio::fs::read(content_path).await?;
            let name = content_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "content".into());
            let metainfo = Metainfo::create(name, &content, args.piece_len, None)?;
            tokio::fs::write(&args.metainfo, metainfo.to_bytes()?).await?;
            log::info!("Created metainfo {:?}", args.metainfo);
            Ok(metainfo)
        }
        _ => {
            let buf = tokio::fs::read(&args.metainfo).await?;
            Ok(Metainfo::from_bytes(&buf)?)
        }
    }
}

async fn on_complete(client: &Client, args: &Args) -> Result<()> {
    log::info!("Download complete");
    if let Some(output) = &args.output {
        client.write_content(output).await?;
        log::info!("Wrote content to {:?}", output);
    }
    Ok(())
}
