//! Blocking client side of the daemon socket, used by the command line tool.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::command::{Command, Response};

pub mod root;

#[derive(Debug, Error)]
pub enum Error {
    #[error("service not running")]
    ServiceNotRunning,
    #[error("error accessing socket at `{socket_path}`: {error}")]
    SocketPathIO { socket_path: PathBuf, error: io::Error },
    #[error("error connecting socket at `{socket_path:?}`: {error:?}")]
    ConnectSocketIO { socket_path: PathBuf, error: io::Error },
    #[error("failed serializing command: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("error writing to socket at: {0}")]
    WriteSocketIO(io::Error),
    #[error("error reading from socket: {0}")]
    ReadSocketIO(io::Error),
    #[error("daemon closed the connection")]
    Closed,
}

pub const DEFAULT_PATH: &str = "/var/run/mozillavpn/daemon.sock";
pub const ENV_VAR: &str = "MOZILLAVPN_SOCKET_PATH";

/// Connected client. Events broadcast by the daemon arrive on the same stream.
pub struct Client {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Client {
    pub fn connect(socket_path: &Path, read_timeout: Duration) -> Result<Self, Error> {
        check_path(socket_path)?;
        let stream = UnixStream::connect(socket_path).map_err(|x| Error::ConnectSocketIO {
            socket_path: socket_path.to_path_buf(),
            error: x,
        })?;
        stream.set_read_timeout(Some(read_timeout)).map_err(Error::ReadSocketIO)?;
        let writer = stream.try_clone().map_err(Error::WriteSocketIO)?;
        Ok(Client {
            reader: BufReader::new(stream),
            writer,
        })
    }

    pub fn send(&mut self, cmd: &Command) -> Result<(), Error> {
        let mut line = serde_json::to_string(cmd)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(Error::WriteSocketIO)
    }

    /// Next message from the daemon, reply or event.
    pub fn recv(&mut self) -> Result<Response, Error> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self.reader.read_line(&mut line).map_err(Error::ReadSocketIO)?;
            if read == 0 {
                return Err(Error::Closed);
            }
            if !line.trim().is_empty() {
                return serde_json::from_str(line.trim()).map_err(Error::from);
            }
        }
    }

    /// Sends `cmd` and waits for its reply, skipping interleaved events.
    /// Commands without a reply return `None` right after sending.
    pub fn request(&mut self, cmd: &Command) -> Result<Option<Response>, Error> {
        self.send(cmd)?;
        if !cmd.expects_reply() {
            return Ok(None);
        }
        loop {
            let resp = self.recv()?;
            if !resp.is_event() {
                return Ok(Some(resp));
            }
        }
    }
}

fn check_path(socket_path: &Path) -> Result<(), Error> {
    match socket_path.try_exists() {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::ServiceNotRunning),
        Err(x) => Err(Error::SocketPathIO {
            socket_path: socket_path.to_path_buf(),
            error: x,
        }),
    }
}
