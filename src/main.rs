//! `rstc` - a small BitTorrent client CLI.
//!
//! Mirrors the reference client's subcommand set one-for-one: `decode`,
//! `info`, `peers`, `handshake`, `download`, and `download_piece`. Logging is
//! initialized once, before any subcommand runs, the way the reference
//! client's `PersistentPreRunE` set up its logger ahead of every command.
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use rstorrent::output::Output;
use rstorrent::peer::handshake::Handshake;
use rstorrent::peer::session::{PeerSession, PieceTask};
use rstorrent::torrent::file::TorrentFile;
use rstorrent::tracker::Client as TrackerClient;
use rstorrent::scheduler::SchedulerError;
use rstorrent::{bencode, logging, scheduler};
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rstc", about = "A small BitTorrent client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decodes a bencoded string and prints it as JSON.
    Decode { bencoded: String },
    /// Prints a torrent file's metadata.
    Info { torrent_file: PathBuf },
    /// Announces to the tracker and prints the discovered peers.
    Peers { torrent_file: PathBuf },
    /// Performs the peer handshake and prints the replied peer ID.
    Handshake {
        torrent_file: PathBuf,
        peer_addr: String,
    },
    /// Downloads the whole torrent, fanning out across all discovered peers.
    Download {
        #[arg(short, long)]
        out: PathBuf,
        torrent_file: PathBuf,
    },
    /// Downloads a single piece from any one peer.
    DownloadPiece {
        #[arg(short, long)]
        out: PathBuf,
        torrent_file: PathBuf,
        piece_index: usize,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = logging::init() {
        eprintln!("warning: failed to initialize logging: {e}");
    }

    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Decode { bencoded } => decode(&bencoded),
        Commands::Info { torrent_file } => info(&torrent_file),
        Commands::Peers { torrent_file } => peers(&torrent_file).await,
        Commands::Handshake {
            torrent_file,
            peer_addr,
        } => handshake(&torrent_file, &peer_addr).await,
        Commands::Download { out, torrent_file } => download(&torrent_file, &out).await,
        Commands::DownloadPiece {
            out,
            torrent_file,
            piece_index,
        } => download_piece(&torrent_file, piece_index, &out).await,
    }
}

fn decode(bencoded: &str) -> Result<()> {
    let value = bencode::decoder::decode(bencoded.as_bytes()).context("decoding bencoded value")?;
    println!("{}", value.to_json());
    Ok(())
}

fn load_torrent(path: &PathBuf) -> Result<TorrentFile> {
    let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    TorrentFile::parse(&raw).context("parsing torrent file")
}

fn info(torrent_file: &PathBuf) -> Result<()> {
    let torrent = load_torrent(torrent_file)?;

    println!("Tracker URL: {}", torrent.announce);
    println!("File Length: {}", torrent.total_length());
    println!("Info Hash: {}", hex::encode(torrent.info_hash));
    println!("Piece Length: {}", torrent.info.piece_length);
    println!("Piece Hashes:");
    for hash in &torrent.pieces_hash {
        println!("{}", hex::encode(hash));
    }
    Ok(())
}

async fn peers(torrent_file: &PathBuf) -> Result<()> {
    let torrent = load_torrent(torrent_file)?;
    let client = TrackerClient::new(6881)?;
    let response = client.announce(&torrent).await?;
    for peer in response.peers {
        println!("{}:{}", peer.ip, peer.port);
    }
    Ok(())
}

async fn handshake(torrent_file: &PathBuf, peer_addr: &str) -> Result<()> {
    let torrent = load_torrent(torrent_file)?;
    let peer_id = random_peer_id();

    let (_stream, reply) =
        Handshake::do_handshake(peer_addr.to_string(), torrent.info_hash, peer_id).await?;
    println!("Peer ID: {}", hex::encode(reply.peer_id));
    Ok(())
}

async fn download(torrent_file: &PathBuf, out: &PathBuf) -> Result<()> {
    let torrent = load_torrent(torrent_file)?;
    let peer_id = random_peer_id();
    let client = TrackerClient::new(6881)?;
    let response = client.announce(&torrent).await?;
    if response.peers.is_empty() {
        bail!("tracker returned no peers");
    }

    let outcome = scheduler::download(&torrent, response.peers, torrent.info_hash, peer_id)
        .await
        .map_err(|e| match e {
            SchedulerError::NoProgress {
                completed,
                total,
                failed,
            } => anyhow::anyhow!(
                "download stalled: only {} of {} pieces collected (gave up on {:?})",
                completed,
                total,
                failed
            ),
        })?;

    if torrent.info.is_directory {
        // Multiple files: OUT is the directory they're assembled under.
        let output = Output::new(out.as_path());
        output.prepare(&torrent)?;
        for piece in &outcome.pieces {
            output.write_piece(&torrent, piece.index, &piece.data)?;
        }
    } else {
        // Single file: OUT is the destination file itself, exactly like
        // `download_piece`'s -o argument.
        if let Some(parent) = out.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
        }
        let mut buffer = vec![0u8; torrent.total_length() as usize];
        for piece in &outcome.pieces {
            let start = piece.index * torrent.info.piece_length as usize;
            buffer[start..start + piece.data.len()].copy_from_slice(&piece.data);
        }
        fs::write(out, &buffer).with_context(|| format!("writing {}", out.display()))?;
    }

    println!("Downloaded {} to {}", torrent_file.display(), out.display());
    Ok(())
}

async fn download_piece(torrent_file: &PathBuf, piece_index: usize, out: &PathBuf) -> Result<()> {
    let torrent = load_torrent(torrent_file)?;
    if piece_index >= torrent.num_pieces() {
        bail!(
            "piece index {} out of range (torrent has {} pieces)",
            piece_index,
            torrent.num_pieces()
        );
    }

    let peer_id = random_peer_id();
    let client = TrackerClient::new(6881)?;
    let response = client.announce(&torrent).await?;
    let peer = response
        .peers
        .first()
        .context("tracker returned no peers")?;

    let mut session = PeerSession::connect(peer, torrent.info_hash, peer_id)
        .await
        .context("connecting to peer")?;
    session
        .read_initial_state()
        .await
        .context("reading peer's initial state")?;

    let task = PieceTask {
        index: piece_index,
        length: torrent.piece_size(piece_index) as usize,
        hash: torrent.pieces_hash[piece_index],
    };
    let result = session
        .download_piece(&task)
        .await
        .context("downloading piece")?;

    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
    }
    fs::write(out, &result.data).with_context(|| format!("writing {}", out.display()))?;

    println!("Piece {} downloaded to {}", piece_index, out.display());
    Ok(())
}

fn random_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    peer_id
}
