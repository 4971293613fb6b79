//! Blocking remote access to a data directory.
//!
//! # Frame Format
//!
//! ```text
//! ┌──────────┬──────────┬─────────────────┐
//! │ len: u32 │ crc: u32 │ body: JSON      │
//! │ LE       │ LE       │ (len bytes)     │
//! └──────────┴──────────┴─────────────────┘
//! ```
//!
//! The client opens one connection per request and sends one [`Request`]
//! frame. The server answers with any number of [`Response`] frames and
//! always terminates the stream with [`Response::End`]. A failure on the
//! server side is reported as [`Response::Error`] before the end marker.

use crate::error::{DlsError, Result};
use crate::reader::channel::ChannelInfo;
use crate::reader::chunk::{ChunkInfo, FetchSummary};
use crate::reader::data::{Data, DataSink};
use crate::reader::dir::Directory;
use crate::store::message::Message;
use crate::store::Time;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default socket timeout of the client.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Client settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Read and write timeout; `None` blocks indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

/// A request to a directory server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request")]
pub enum Request {
    /// List the job ids.
    ListJobs,
    /// List the channels of a job.
    ListChannels {
        /// Job id.
        job: u32,
    },
    /// List the chunks of a channel.
    ListChunks {
        /// Job id.
        job: u32,
        /// Channel directory index.
        channel: u32,
    },
    /// Fetch values of a channel.
    FetchData {
        /// Job id.
        job: u32,
        /// Channel directory index.
        channel: u32,
        /// Inclusive start.
        start: Time,
        /// Exclusive end.
        end: Time,
        /// Level selection, 0 for raw values.
        min_values: u32,
        /// Keep every n-th value.
        decimation: u32,
    },
    /// Load the messages of a job.
    LoadMessages {
        /// Job id.
        job: u32,
        /// Inclusive start.
        start: Time,
        /// Exclusive end.
        end: Time,
    },
}

/// One frame of a server answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response")]
pub enum Response {
    /// Job ids.
    Jobs {
        /// Ids in ascending order.
        jobs: Vec<u32>,
    },
    /// Channels of a job.
    Channels {
        /// Channels in index order.
        channels: Vec<ChannelInfo>,
    },
    /// One chunk of a channel.
    Chunk {
        /// The chunk.
        chunk: ChunkInfo,
    },
    /// One block of values.
    Data {
        /// The block.
        data: Data,
    },
    /// One job message.
    Message {
        /// The message.
        message: Message,
    },
    /// Totals of a data fetch.
    Summary {
        /// The totals.
        summary: FetchSummary,
    },
    /// The request failed.
    Error {
        /// Error text.
        message: String,
    },
    /// End of the answer.
    End,
}

/// Writes one frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let body =
        serde_json::to_vec(value).map_err(|e| DlsError::Remote(format!("encode frame: {}", e)))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(DlsError::Remote(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    let crc = crc32fast::hash(&body);
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(&body)?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` if the peer closed the connection
/// before a new frame began.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(DlsError::Remote(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }

    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let expected = u32::from_le_bytes(crc_buf);

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let actual = crc32fast::hash(&body);
    if actual != expected {
        return Err(DlsError::Remote(format!(
            "frame checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| DlsError::Remote(format!("decode frame: {}", e)))
}

/// Client of a directory server.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    addr: String,
    config: RemoteConfig,
}

impl RemoteClient {
    /// Creates a client for the server at `addr` (`host:port`). No
    /// connection is made until the first request.
    pub fn new(addr: impl Into<String>, config: RemoteConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }

    /// Server address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends `request` and passes every response frame before the end
    /// marker to `on_response`.
    fn request(
        &self,
        request: &Request,
        mut on_response: impl FnMut(Response) -> Result<()>,
    ) -> Result<()> {
        let stream = TcpStream::connect(&self.addr)
            .map_err(|e| DlsError::Remote(format!("connect to {}: {}", self.addr, e)))?;
        stream.set_read_timeout(self.config.timeout)?;
        stream.set_write_timeout(self.config.timeout)?;

        let mut writer = BufWriter::new(&stream);
        write_frame(&mut writer, request)?;
        writer.flush()?;
        drop(writer);

        let mut reader = BufReader::new(&stream);
        let mut failure = None;
        loop {
            match read_frame::<_, Response>(&mut reader)? {
                None => {
                    return Err(DlsError::Remote(format!(
                        "{} closed the connection before the end of the answer",
                        self.addr
                    )))
                }
                Some(Response::End) => break,
                Some(Response::Error { message }) => failure = Some(message),
                Some(response) => {
                    if failure.is_none() {
                        on_response(response)?;
                    }
                }
            }
        }
        match failure {
            Some(message) => Err(DlsError::Remote(message)),
            None => Ok(()),
        }
    }

    fn unexpected(&self, response: &Response) -> DlsError {
        DlsError::Remote(format!("unexpected answer from {}: {:?}", self.addr, response))
    }

    /// Ids of the jobs on the server.
    pub fn list_jobs(&self) -> Result<Vec<u32>> {
        let mut jobs = Vec::new();
        self.request(&Request::ListJobs, |response| match response {
            Response::Jobs { jobs: listed } => {
                jobs.extend(listed);
                Ok(())
            }
            other => Err(self.unexpected(&other)),
        })?;
        Ok(jobs)
    }

    /// Channels of `job`.
    pub fn list_channels(&self, job: u32) -> Result<Vec<ChannelInfo>> {
        let mut channels = Vec::new();
        self.request(&Request::ListChannels { job }, |response| match response {
            Response::Channels { channels: listed } => {
                channels.extend(listed);
                Ok(())
            }
            other => Err(self.unexpected(&other)),
        })?;
        Ok(channels)
    }

    /// Chunks of a channel.
    pub fn list_chunks(&self, job: u32, channel: u32) -> Result<Vec<ChunkInfo>> {
        let mut chunks = Vec::new();
        self.request(&Request::ListChunks { job, channel }, |response| {
            match response {
                Response::Chunk { chunk } => {
                    chunks.push(chunk);
                    Ok(())
                }
                other => Err(self.unexpected(&other)),
            }
        })?;
        Ok(chunks)
    }

    /// Fetches values of a channel into `sink`.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch_data(
        &self,
        job: u32,
        channel: u32,
        start: Time,
        end: Time,
        min_values: u32,
        decimation: u32,
        sink: &mut dyn DataSink,
    ) -> Result<FetchSummary> {
        let request = Request::FetchData {
            job,
            channel,
            start,
            end,
            min_values,
            decimation,
        };
        let mut summary = FetchSummary::default();
        self.request(&request, |response| match response {
            Response::Data { data } => {
                sink.deliver(data);
                Ok(())
            }
            Response::Summary { summary: total } => {
                summary = total;
                Ok(())
            }
            other => Err(self.unexpected(&other)),
        })?;
        Ok(summary)
    }

    /// Messages of `job` in `[start, end)`.
    pub fn load_messages(&self, job: u32, start: Time, end: Time) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        self.request(&Request::LoadMessages { job, start, end }, |response| {
            match response {
                Response::Message { message } => {
                    messages.push(message);
                    Ok(())
                }
                other => Err(self.unexpected(&other)),
            }
        })?;
        Ok(messages)
    }
}

/// Forwards data blocks to the connection. The first write error stops
/// forwarding and is reported after the fetch.
struct FrameSink<'a, W: Write> {
    writer: &'a mut W,
    error: Option<DlsError>,
}

impl<W: Write> DataSink for FrameSink<'_, W> {
    fn deliver(&mut self, data: Data) -> Option<Data> {
        if self.error.is_some() {
            return Some(data);
        }
        let response = Response::Data { data };
        if let Err(e) = write_frame(self.writer, &response) {
            self.error = Some(e);
        }
        match response {
            Response::Data { data } => Some(data),
            _ => None,
        }
    }
}

fn answer<W: Write>(request: &Request, directory: &Directory, writer: &mut W) -> Result<()> {
    match *request {
        Request::ListJobs => {
            let jobs = directory.job_ids()?;
            write_frame(writer, &Response::Jobs { jobs })
        }
        Request::ListChannels { job } => {
            let mut job = directory.job(job)?;
            job.fetch_channels()?;
            let channels = job.channels().map(|c| c.info().clone()).collect();
            write_frame(writer, &Response::Channels { channels })
        }
        Request::ListChunks { job, channel } => {
            let mut job = directory.job(job)?;
            job.fetch_channels()?;
            let channel = job
                .channel_mut(channel)
                .ok_or_else(|| DlsError::ChannelNotFound(format!("channel{}", channel)))?;
            channel.fetch_chunks()?;
            for chunk in channel.chunk_infos() {
                write_frame(writer, &Response::Chunk { chunk })?;
            }
            Ok(())
        }
        Request::FetchData {
            job,
            channel,
            start,
            end,
            min_values,
            decimation,
        } => {
            let mut job = directory.job(job)?;
            job.fetch_channels()?;
            let channel = job
                .channel_mut(channel)
                .ok_or_else(|| DlsError::ChannelNotFound(format!("channel{}", channel)))?;
            channel.fetch_chunks()?;
            let mut sink = FrameSink {
                writer: &mut *writer,
                error: None,
            };
            let summary = channel.fetch_data(start, end, min_values, decimation, &mut sink)?;
            if let Some(e) = sink.error {
                return Err(e);
            }
            write_frame(writer, &Response::Summary { summary })
        }
        Request::LoadMessages { job, start, end } => {
            for message in directory.job(job)?.load_messages(start, end)? {
                write_frame(writer, &Response::Message { message })?;
            }
            Ok(())
        }
    }
}

/// Answers requests on `stream` until the client closes it.
pub fn serve_connection(stream: TcpStream, directory: &Directory) -> Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown peer".to_string());
    let mut reader = BufReader::new(&stream);
    let mut writer = BufWriter::new(&stream);

    while let Some(request) = read_frame::<_, Request>(&mut reader)? {
        debug!("{}: {:?}", peer, request);
        if let Err(e) = answer(&request, directory, &mut writer) {
            warn!("{}: request failed: {}", peer, e);
            write_frame(
                &mut writer,
                &Response::Error {
                    message: e.to_string(),
                },
            )?;
        }
        write_frame(&mut writer, &Response::End)?;
        writer.flush()?;
    }
    debug!("{}: closed", peer);
    Ok(())
}

/// Serves `directory` to every client connecting to `listener`, one
/// connection at a time.
pub fn serve(listener: &TcpListener, directory: &Directory) -> Result<()> {
    info!("Serving {} on {}", directory, listener.local_addr()?);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = serve_connection(stream, directory) {
                    warn!("Connection failed: {}", e);
                }
            }
            Err(e) => warn!("Accept failed: {}", e),
        }
    }
    Ok(())
}
