//! Framed pipe channel: two FIFOs carrying newline-delimited JSON frames
//! between the supervisor and a worker process.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use serde_json::Value;
use tempfile::TempDir;

use crate::error::{Result, SupervisorError};

/// Layout of the two FIFOs that make up one channel.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub pipe_dir: PathBuf,
    pub pipe_in_name: String,
    pub pipe_out_name: String,
}

impl PipeConfig {
    pub fn new(pipe_dir: PathBuf) -> Self {
        PipeConfig {
            pipe_dir,
            pipe_in_name: "pipe_in".to_string(),
            pipe_out_name: "pipe_out".to_string(),
        }
    }

    pub fn pipe_in_path(&self) -> PathBuf {
        self.pipe_dir.join(&self.pipe_in_name)
    }

    pub fn pipe_out_path(&self) -> PathBuf {
        self.pipe_dir.join(&self.pipe_out_name)
    }
}

#[cfg(unix)]
fn make_fifo(path: &std::path::Path) -> Result<()> {
    use nix::sys::stat::Mode;
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600)).map_err(|e| {
        SupervisorError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("mkfifo {}: {e}", path.display()),
        ))
    })
}

#[cfg(not(unix))]
fn make_fifo(_path: &std::path::Path) -> Result<()> {
    Err(SupervisorError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "named pipe channel is only supported on unix",
    )))
}

fn write_frame(writer: &mut File, value: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(value).map_err(|e| {
        SupervisorError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("encode frame: {e}"),
        ))
    })?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

fn read_frame(reader: &mut BufReader<File>) -> Result<Option<Value>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line.trim_end_matches('\n')).map_err(|e| {
        SupervisorError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("decode frame: {e}"),
        ))
    })?;
    Ok(Some(value))
}

/// Supervisor-side end of the channel. Created before the worker is
/// spawned; `connect` performs the blocking handshake once the worker has
/// opened its complementary ends.
pub struct NamedPipeServer {
    _temp_dir: TempDir,
    config: PipeConfig,
    writer: Option<File>,
    reader: Option<BufReader<File>>,
}

impl NamedPipeServer {
    /// Create a fresh private temp directory and the two FIFOs inside it.
    pub fn setup() -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("modelsup_")
            .tempdir()
            .map_err(SupervisorError::Io)?;
        let config = PipeConfig::new(temp_dir.path().to_path_buf());
        make_fifo(&config.pipe_in_path())?;
        make_fifo(&config.pipe_out_path())?;
        Ok(NamedPipeServer {
            _temp_dir: temp_dir,
            config,
            writer: None,
            reader: None,
        })
    }

    pub fn pipe_dir(&self) -> &std::path::Path {
        &self.config.pipe_dir
    }

    /// Open both FIFO ends. Blocks until the worker opens the
    /// complementary ends — this is the connection handshake.
    pub fn connect(&mut self) -> Result<()> {
        let writer = OpenOptions::new().write(true).open(self.config.pipe_in_path())?;
        let reader = File::open(self.config.pipe_out_path())?;
        self.writer = Some(writer);
        self.reader = Some(BufReader::new(reader));
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some() && self.reader.is_some()
    }

    pub fn send(&mut self, value: &Value) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SupervisorError::ChannelNotConnected {
                name: "server".to_string(),
            })?;
        write_frame(writer, value)
    }

    pub fn recv(&mut self) -> Result<Value> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SupervisorError::ChannelNotConnected {
                name: "server".to_string(),
            })?;
        read_frame(reader)?.ok_or_else(|| SupervisorError::ChannelClosed {
            name: "server".to_string(),
        })
    }

    /// Send `{"message": message, "data": data}` and return the decoded
    /// reply. Callers are expected to hold the supervisor's per-channel
    /// mutex around this call so concurrent requests are strictly ordered.
    pub fn request(&mut self, message: &str, data: Value) -> Result<Value> {
        let frame = serde_json::json!({ "message": message, "data": data });
        self.send(&frame)?;
        self.recv()
    }

    /// Close both ends. Closing a FIFO never fails in a way worth
    /// reporting, so this simply drops both file handles.
    pub fn close(mut self) {
        self.writer = None;
        self.reader = None;
    }
}

/// Worker-side end of the channel; opens the complementary ends in
/// reversed order to avoid a mutual-open deadlock with the server.
pub struct NamedPipeClient {
    reader: Option<BufReader<File>>,
    writer: Option<File>,
}

impl NamedPipeClient {
    pub fn connect(config: &PipeConfig) -> Result<Self> {
        let reader = File::open(config.pipe_in_path())?;
        let writer = OpenOptions::new().write(true).open(config.pipe_out_path())?;
        Ok(NamedPipeClient {
            reader: Some(BufReader::new(reader)),
            writer: Some(writer),
        })
    }

    /// Returns `None` on end-of-stream (the supervisor closed its end).
    pub fn recv(&mut self) -> Result<Option<Value>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SupervisorError::ChannelNotConnected {
                name: "client".to_string(),
            })?;
        read_frame(reader)
    }

    pub fn send(&mut self, value: &Value) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SupervisorError::ChannelNotConnected {
                name: "client".to_string(),
            })?;
        write_frame(writer, value)
    }

    pub fn close(mut self) {
        self.writer = None;
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn server_and_client_roundtrip_request_reply() {
        let mut server = NamedPipeServer::setup().unwrap();
        let config = PipeConfig::new(server.pipe_dir().to_path_buf());

        let handle = thread::spawn(move || {
            let mut client = NamedPipeClient::connect(&config).unwrap();
            let req = client.recv().unwrap().unwrap();
            assert_eq!(req["message"], "echo");
            client
                .send(&serde_json::json!({"echoed": req["data"]["message"]}))
                .unwrap();
            client.close();
        });

        server.connect().unwrap();
        let reply = server
            .request("echo", serde_json::json!({"message": "hello"}))
            .unwrap();
        assert_eq!(reply["echoed"], "hello");

        handle.join().unwrap();
    }

    #[test]
    fn recv_on_unconnected_server_errors() {
        let mut server = NamedPipeServer::setup().unwrap();
        let err = server.recv().unwrap_err();
        assert!(matches!(err, SupervisorError::ChannelNotConnected { .. }));
    }
}
