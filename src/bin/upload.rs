use anyhow::{Context, Result, bail};
use clap::Parser;
use hcloud_upload::services::{
    chunk_reader::DEFAULT_CHUNK_SIZE,
    upload_client::{ChunkUploadClient, HttpUploadApi},
    upload_queue::{FileStatus, UploadQueue},
};
use std::{env, path::PathBuf, time::Duration};
use tracing_subscriber::EnvFilter;

/// Upload files to a relay server in chunks.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked upload client")]
struct Args {
    /// Relay base URL (overrides HCLOUD_SERVER)
    #[arg(long)]
    server: Option<String>,

    /// Transport session credential (overrides HCLOUD_SESSION)
    #[arg(long)]
    session: Option<String>,

    /// Chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    /// Upload id to use; only valid with a single file
    #[arg(long)]
    upload_id: Option<String>,

    /// Files to upload, in order
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let server = args
        .server
        .or_else(|| env::var("HCLOUD_SERVER").ok())
        .unwrap_or_else(|| "http://127.0.0.1:3001".into());
    let session = match args.session.or_else(|| env::var("HCLOUD_SESSION").ok()) {
        Some(session) if !session.is_empty() => session,
        _ => bail!("a session is required (--session or HCLOUD_SESSION)"),
    };
    if args.upload_id.is_some() && args.files.len() > 1 {
        bail!("--upload-id can only be used with a single file");
    }

    let api = HttpUploadApi::new(&server).context("building HTTP client")?;
    let client = ChunkUploadClient::new(api, session).with_chunk_size(args.chunk_size);
    let queue = UploadQueue::new(client);

    let mut upload_id = args.upload_id;
    for path in args.files {
        match upload_id.take() {
            Some(id) => queue.enqueue_with_id(path, id),
            None => queue.enqueue(path),
        };
    }

    let run = queue.run();
    tokio::pin!(run);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let results = loop {
        tokio::select! {
            results = &mut run => break results,
            _ = ticker.tick() => {
                for file in queue.files() {
                    if file.status == FileStatus::Uploading {
                        eprintln!("{} {:>3}%", file.path.display(), file.progress);
                    }
                }
            }
        }
    };

    let mut failed = 0;
    for file in &results {
        match (&file.status, &file.file_id, &file.error) {
            (FileStatus::Success, Some(file_id), _) => {
                println!("ok    {}  fileId={}", file.path.display(), file_id)
            }
            (_, _, error) => {
                failed += 1;
                println!(
                    "error {}  {}",
                    file.path.display(),
                    error.as_deref().unwrap_or("upload failed")
                );
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} uploads failed", failed, results.len());
    }
    Ok(())
}
