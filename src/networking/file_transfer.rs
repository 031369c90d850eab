use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::discovery::DiscoveryResponder;
use crate::config::Config;
use crate::crypto::{self, SessionKeys, BLOCK_SIZE, IV_SIZE, KEY_SIZE};
use crate::error::{Result, TransferError};
use crate::progress::ProgressIndicator;

/// Longest plaintext filename accepted on either side
pub const MAX_FILENAME_LEN: usize = 255;
/// Largest encrypted filename frame: the longest name padded to whole cipher blocks
pub const MAX_FILENAME_FRAME: usize = (MAX_FILENAME_LEN / BLOCK_SIZE + 1) * BLOCK_SIZE;

/// Receive-side protocol states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    BoundAndListening,
    Connected,
    ReceivedKey,
    ReceivedIv,
    ReceivedFilename,
    ReceivedContent,
    Done,
    Error,
}

/// Send-side protocol states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    KeysGenerated,
    Connected,
    KeySent,
    IvSent,
    FilenameSent,
    ContentSent,
    Done,
    Error,
}

/// Summary of a completed transfer
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Name shown to the user: the received/sent file's base name
    pub file_name: String,
    /// Local path that was read or written
    pub path: PathBuf,
    pub bytes_transferred: u64,
    pub elapsed_seconds: f32,
    pub throughput_mbps: f32,
}

impl TransferReport {
    fn new(file_name: String, path: PathBuf, bytes_transferred: u64, started: Instant) -> Self {
        let elapsed_seconds = started.elapsed().as_secs_f32();
        let throughput_mbps = if elapsed_seconds > 0.0 {
            (bytes_transferred as f32 / elapsed_seconds) / (1024.0 * 1024.0)
        } else {
            0.0
        };

        Self {
            file_name,
            path,
            bytes_transferred,
            elapsed_seconds,
            throughput_mbps,
        }
    }
}

/// Write the encrypted filename as a big-endian u32 length followed by the bytes
fn write_filename_frame<W: Write>(writer: &mut W, cipher_text: &[u8]) -> io::Result<()> {
    let len = cipher_text.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(cipher_text)
}

/// Read a frame written by [`write_filename_frame`], rejecting lengths outside `1..=limit`
fn read_filename_frame<R: Read>(reader: &mut R, limit: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .map_err(|e| TransferError::connection("failed to receive the file name", e))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > limit {
        return Err(TransferError::Protocol(format!(
            "file name frame of {} bytes is outside 1..={}",
            len, limit
        )));
    }

    let mut frame = vec![0u8; len];
    reader
        .read_exact(&mut frame)
        .map_err(|e| TransferError::connection("failed to receive the file name", e))?;
    Ok(frame)
}

/// Reduce a received filename to its final path component
fn sanitize_filename(raw: &[u8]) -> Result<String> {
    if raw.len() > MAX_FILENAME_LEN {
        return Err(TransferError::InvalidFile(format!(
            "file name of {} bytes exceeds {} bytes",
            raw.len(),
            MAX_FILENAME_LEN
        )));
    }

    let name = String::from_utf8_lossy(raw);
    let name = name.trim_end_matches('\0');

    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| TransferError::InvalidFile(format!("unusable file name '{}'", name)))
}

/// Destination file that is deleted again unless the transfer commits it
struct PartialFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    committed: bool,
}

impl PartialFile {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            TransferError::file(format!("failed to write received file {}", path.display()), e)
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            committed: false,
        })
    }

    fn commit(mut self) -> Result<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| TransferError::file("failed to write received file", e))?;
        }
        self.committed = true;
        Ok(self.path.clone())
    }
}

impl Write for PartialFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "file already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        // Close the handle before removing so this also works on Windows
        drop(self.writer.take());
        match fs::remove_file(&self.path) {
            Ok(()) => warn!("Removed partially received file {}", self.path.display()),
            Err(e) => warn!(
                "Failed to remove partially received file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Single-shot receiver: accepts exactly one connection, then stops
pub struct TransferServer {
    config: Config,
    listener: TcpListener,
    state: ServerState,
}

impl TransferServer {
    /// Bind the transfer port on all interfaces
    pub fn bind(config: Config) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.transfer_port));
        let listener = TcpListener::bind(addr).map_err(|e| {
            TransferError::connection(format!("failed to bind the socket to {}", addr), e)
        })?;

        let mut server = Self {
            config,
            listener,
            state: ServerState::Idle,
        };
        server.transition(ServerState::BoundAndListening);
        info!("File transfer server listening on {}", server.local_addr()?);

        Ok(server)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TransferError::connection("failed to read listener address", e))
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Wait for one sender, answering discovery queries meanwhile, and write
    /// the received file to `output` (a file path, or a directory to place
    /// the sender's file name in). Without `output` the sender's file name is
    /// used in the current directory. A server receives at most one file.
    pub fn receive(&mut self, output: Option<&Path>) -> Result<TransferReport> {
        if self.state != ServerState::BoundAndListening {
            return Err(TransferError::Protocol(format!(
                "server cannot receive again from state {:?}",
                self.state
            )));
        }

        let result = self.receive_one(output);
        if let Err(e) = &result {
            warn!("File receive failed: {}", e);
            self.transition(ServerState::Error);
        }
        result
    }

    fn receive_one(&mut self, output: Option<&Path>) -> Result<TransferReport> {
        let (mut stream, peer) = self.accept_while_answering_discovery()?;
        let started = Instant::now();
        info!("New file transfer connection from {}", peer);
        self.transition(ServerState::Connected);

        // Declared before the spinner so an unfinished file is removed after it stops
        let mut partial: Option<PartialFile> = None;
        let progress = ProgressIndicator::start("Receiving", self.config.spinner_interval);

        let mut key = [0u8; KEY_SIZE];
        stream
            .read_exact(&mut key)
            .map_err(|e| TransferError::connection("failed to receive the key", e))?;
        self.transition(ServerState::ReceivedKey);

        let mut iv = [0u8; IV_SIZE];
        stream
            .read_exact(&mut iv)
            .map_err(|e| TransferError::connection("failed to receive IV", e))?;
        self.transition(ServerState::ReceivedIv);

        let frame = read_filename_frame(&mut stream, MAX_FILENAME_FRAME)?;
        let file_name = sanitize_filename(&crypto::decode(&frame, &key, &iv)?)?;
        self.transition(ServerState::ReceivedFilename);

        let destination = match output {
            Some(path) if path.is_dir() => path.join(&file_name),
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(&file_name),
        };
        debug!("Writing {} to {}", file_name, destination.display());

        let file = partial.insert(PartialFile::create(&destination)?);
        let bytes = crypto::decode_stream(&mut stream, self.config.buffer_size, &key, &iv, file)
            .map_err(TransferError::from_inbound_stream)?;

        progress.finish();
        let path = match partial.take() {
            Some(file) => file.commit()?,
            None => destination,
        };
        self.transition(ServerState::ReceivedContent);
        self.transition(ServerState::Done);

        let shown_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(file_name);
        let report = TransferReport::new(shown_name, path, bytes, started);
        info!(
            "File received: {} ({} bytes, {:.2} MB/s)",
            report.file_name, report.bytes_transferred, report.throughput_mbps
        );

        Ok(report)
    }

    /// Block in accept while a discovery responder runs on a helper thread.
    /// The responder is cancelled and joined as soon as accept returns.
    fn accept_while_answering_discovery(&mut self) -> Result<(TcpStream, SocketAddr)> {
        let cancel = Arc::new(AtomicBool::new(false));

        let responder = match DiscoveryResponder::bind(&self.config)
            .and_then(|responder| responder.spawn(cancel.clone()))
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Not answering discovery queries while waiting: {}", e);
                None
            }
        };

        let accepted = self.listener.accept();

        cancel.store(true, Ordering::Release);
        if let Some(handle) = responder {
            match handle.join() {
                Ok(answered) => debug!("Discovery responder answered {} queries", answered),
                Err(_) => warn!("Discovery responder thread panicked"),
            }
        }

        accepted.map_err(|e| TransferError::connection("failed to accept incoming connection", e))
    }

    fn transition(&mut self, next: ServerState) {
        debug!("Server state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Sender side of the transfer protocol
pub struct TransferClient {
    config: Config,
    state: ClientState,
}

impl TransferClient {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: ClientState::Idle,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Encrypt and send `path` to the server at `dest_ip`. A client sends at
    /// most one file.
    pub fn send_file(&mut self, dest_ip: &str, path: &Path) -> Result<TransferReport> {
        if self.state != ClientState::Idle {
            return Err(TransferError::Protocol(format!(
                "client cannot send again from state {:?}",
                self.state
            )));
        }

        let result = self.send_one(dest_ip, path);
        if let Err(e) = &result {
            warn!("File send failed: {}", e);
            self.transition(ClientState::Error);
        }
        result
    }

    fn send_one(&mut self, dest_ip: &str, path: &Path) -> Result<TransferReport> {
        let started = Instant::now();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TransferError::InvalidFile(format!("invalid file path {}", path.display()))
            })?;
        if file_name.len() > MAX_FILENAME_LEN {
            return Err(TransferError::InvalidFile(format!(
                "file name of {} bytes exceeds {} bytes",
                file_name.len(),
                MAX_FILENAME_LEN
            )));
        }

        let ip: Ipv4Addr = dest_ip.trim().parse().map_err(|_| {
            TransferError::Protocol(format!("invalid server IP address format '{}'", dest_ip))
        })?;

        let mut file = File::open(path).map_err(|e| {
            TransferError::file(format!("failed to read the file {}", path.display()), e)
        })?;
        let metadata = file.metadata().map_err(|e| {
            TransferError::file(format!("failed to read the file {}", path.display()), e)
        })?;
        if !metadata.is_file() {
            return Err(TransferError::InvalidFile(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let keys = SessionKeys::generate()?;
        self.transition(ClientState::KeysGenerated);

        let addr = SocketAddrV4::new(ip, self.config.transfer_port);
        let mut stream = TcpStream::connect(addr).map_err(|e| {
            TransferError::connection(format!("failed to connect to the server at {}", addr), e)
        })?;
        info!("Connected to {}", addr);
        self.transition(ClientState::Connected);

        stream
            .write_all(&keys.key)
            .map_err(|e| TransferError::connection("failed to send the key to the server", e))?;
        self.transition(ClientState::KeySent);

        stream
            .write_all(&keys.iv)
            .map_err(|e| TransferError::connection("failed to send IV to the server", e))?;
        self.transition(ClientState::IvSent);

        let progress = ProgressIndicator::start("Sending", self.config.spinner_interval);

        let cipher_name = crypto::encode(file_name.as_bytes(), &keys.key, &keys.iv)?;
        write_filename_frame(&mut stream, &cipher_name).map_err(|e| {
            TransferError::connection("failed to send the file name to the server", e)
        })?;
        self.transition(ClientState::FilenameSent);

        let bytes = crypto::encode_stream(
            &mut file,
            self.config.buffer_size,
            &keys.key,
            &keys.iv,
            &mut stream,
        )
        .map_err(TransferError::from_outbound_stream)?;

        stream
            .shutdown(Shutdown::Write)
            .map_err(|e| TransferError::connection("failed to close the connection", e))?;
        self.transition(ClientState::ContentSent);

        progress.finish();
        self.transition(ClientState::Done);

        let report = TransferReport::new(file_name, path.to_path_buf(), bytes, started);
        info!(
            "File transfer complete: {} ({} bytes, {:.2} MB/s)",
            path.display(),
            report.bytes_transferred,
            report.throughput_mbps
        );

        Ok(report)
    }

    fn transition(&mut self, next: ClientState) {
        debug!("Client state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
