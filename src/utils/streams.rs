// src/utils/streams.rs
use std::path::PathBuf;
use anyhow::{anyhow, Result};
use log::debug;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}


/// Drains a child pipe line by line into `tx`.
/// Keeps reading after the receiver is gone so the child never blocks on a
/// full pipe.
///
/// # Arguments
///
/// * `reader` - stdout or stderr of a spawned child.
/// * `tx` - Sender feeding the log writer.
///
/// # Returns
/// JoinHandle that resolves once the pipe reaches EOF.
pub fn spawn_line_forwarder<R>(reader: R, tx: mpsc::Sender<String>) -> JoinHandle<Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut segments = BufReader::new(reader).split(b'\n');
        let mut receiver_alive = true;
        while let Some(segment) = segments.next_segment().await? {
            if !receiver_alive {
                continue;
            }
            let line = String::from_utf8_lossy(&segment).trim_end_matches('\r').to_string();
            if tx.send(line).await.is_err() {
                receiver_alive = false;
            }
        }
        Ok(())
    })
}


/// Appends every received line to `log_path`, echoing to the console when
/// `echo` is set. Ends when all senders are dropped.
pub fn spawn_log_writer(log_path: PathBuf, rx: mpsc::Receiver<String>, echo: bool) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| anyhow!("Failed to open log {}: {}", log_path.display(), e))?;
        let mut writer = BufWriter::new(file);
        let mut lines = ReceiverStream::new(rx);

        while let Some(line) = lines.next().await {
            if echo {
                println!("{}", line);
            }
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        Ok(())
    })
}


/// Copies a child's stdout byte for byte into `path`.
pub fn spawn_file_sink<R>(mut reader: R, path: PathBuf) -> JoinHandle<Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let file = File::create(&path)
            .await
            .map_err(|e| anyhow!("Failed to create {}: {}", path.display(), e))?;
        let mut writer = BufWriter::new(file);
        let bytes = tokio::io::copy(&mut reader, &mut writer).await?;
        writer.flush().await?;
        debug!("Wrote {} bytes to {}", bytes, path.display());
        Ok(())
    })
}


/// Collects every line a child writes on one of its streams.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let mut collected = Vec::new();
    match stream {
        ChildStream::Stdout => {
            let stdout = child.stdout.take().ok_or_else(|| anyhow!("Child stdout not captured"))?;
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                collected.push(line);
            }
        }
        ChildStream::Stderr => {
            let stderr = child.stderr.take().ok_or_else(|| anyhow!("Child stderr not captured"))?;
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                collected.push(line);
            }
        }
    }
    Ok(collected)
}
