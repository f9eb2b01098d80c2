//! Async client for the daemon socket.
//!
//! The daemon uses it to probe for an already running instance before taking
//! over the socket path.
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use std::io;
use std::path::Path;

use crate::command::{Command, Response};

#[derive(Debug, Error)]
pub enum Error {
    #[error("service not running")]
    ServiceNotRunning,
    #[error("daemon closed the connection")]
    Closed,
    #[error("failed serializing command: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(socket_path: &Path) -> Result<Self, Error> {
        check_path(socket_path)?;
        let stream = UnixStream::connect(socket_path).await?;
        let (read, writer) = stream.into_split();
        Ok(Client {
            reader: BufReader::new(read),
            writer,
        })
    }

    pub async fn send(&mut self, cmd: &Command) -> Result<(), Error> {
        push_command(&mut self.writer, cmd).await
    }

    pub async fn recv(&mut self) -> Result<Response, Error> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(Error::Closed);
            }
            if !line.trim().is_empty() {
                return serde_json::from_str(line.trim()).map_err(Error::from);
            }
        }
    }

    /// Sends `cmd` and waits for its reply, skipping interleaved events.
    pub async fn request(&mut self, cmd: &Command) -> Result<Option<Response>, Error> {
        self.send(cmd).await?;
        if !cmd.expects_reply() {
            return Ok(None);
        }
        loop {
            let resp = self.recv().await?;
            if !resp.is_event() {
                return Ok(Some(resp));
            }
        }
    }
}

pub async fn process_cmd(socket_path: &Path, cmd: &Command) -> Result<Option<Response>, Error> {
    let mut client = Client::connect(socket_path).await?;
    client.request(cmd).await
}

fn check_path(socket_path: &Path) -> Result<(), Error> {
    match socket_path.try_exists() {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::ServiceNotRunning),
        Err(x) => Err(x.into()),
    }
}

async fn push_command(socket: &mut OwnedWriteHalf, cmd: &Command) -> Result<(), Error> {
    let mut line = serde_json::to_string(cmd)?;
    line.push('\n');
    socket.write_all(line.as_bytes()).await?;
    socket.flush().await.map_err(Error::from)
}
