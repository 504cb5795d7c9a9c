//! Minimal FTP client for probing and streaming retrievals.
//!
//! Speaks just enough of the protocol for the engine: login (anonymous
//! by default), binary mode, passive data connections, `SIZE`/`MDTM`
//! probes, and `REST` + `RETR` for resumable retrieval. Range requests
//! carry only a start offset - FTP has no upper bound, so the worker
//! stops reading once its segment is full. Proxied FTP is not supported.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};
use url::Url;

use super::client::{ByteStream, RequestConfig, ResponseInfo};
use super::error::DownloadError;

/// Default FTP control port.
const DEFAULT_PORT: u16 = 21;

/// Read buffer for the data connection.
const DATA_BUFFER_SIZE: usize = 64 * 1024;

/// One FTP server reply: 3-digit code plus text.
#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn is_positive(&self) -> bool {
        self.code < 400
    }
}

/// Control connection with the command/reply plumbing.
struct Control {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: OwnedWriteHalf,
    url: String,
    receive_timeout: Duration,
}

impl Control {
    /// Connects and logs in according to the URL and config credentials.
    async fn connect(config: &RequestConfig, url: &Url) -> Result<Self, DownloadError> {
        let host = url
            .host_str()
            .ok_or_else(|| DownloadError::invalid_url(&config.url))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let stream = timeout(config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DownloadError::timeout(&config.url))?
            .map_err(|e| {
                DownloadError::ftp(&config.url, format!("connect failed: {e}"))
            })?;

        let (read_half, write_half) = stream.into_split();
        let mut control = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            url: config.url.to_string(),
            receive_timeout: config.receive_timeout,
        };

        let greeting = control.read_reply().await?;
        if greeting.code != 220 {
            return Err(DownloadError::ftp(&control.url, greeting.text));
        }

        // Credentials: explicit config first, then URL userinfo, then
        // anonymous.
        let (user, pass) = if !config.username.is_empty() {
            (config.username.clone(), config.password.clone())
        } else if !url.username().is_empty() {
            (
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            )
        } else {
            ("anonymous".to_string(), "accel@".to_string())
        };

        let reply = control.command(&format!("USER {user}")).await?;
        let reply = if reply.code == 331 {
            control.command(&format!("PASS {pass}")).await?
        } else {
            reply
        };
        if reply.code != 230 {
            return Err(DownloadError::ftp(&control.url, reply.text));
        }

        let reply = control.command("TYPE I").await?;
        if !reply.is_positive() {
            return Err(DownloadError::ftp(&control.url, reply.text));
        }

        debug!(host, port, "FTP session established");
        Ok(control)
    }

    /// Sends one command and reads the reply.
    async fn command(&mut self, cmd: &str) -> Result<Reply, DownloadError> {
        self.writer
            .write_all(format!("{cmd}\r\n").as_bytes())
            .await
            .map_err(|e| DownloadError::ftp(&self.url, format!("send failed: {e}")))?;
        self.read_reply().await
    }

    /// Reads one (possibly multiline) reply.
    async fn read_reply(&mut self) -> Result<Reply, DownloadError> {
        let first = self.read_line().await?;
        if first.len() < 4 {
            return Err(DownloadError::ftp(&self.url, format!("short reply: {first}")));
        }
        let code: u16 = first[..3]
            .parse()
            .map_err(|_| DownloadError::ftp(&self.url, format!("bad reply: {first}")))?;

        let mut text = first.clone();
        // Multiline replies run until a line starting `<code><space>`.
        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                let line = self.read_line().await?;
                let done = line.starts_with(&terminator);
                text.push('\n');
                text.push_str(&line);
                if done {
                    break;
                }
            }
        }

        Ok(Reply { code, text })
    }

    async fn read_line(&mut self) -> Result<String, DownloadError> {
        let mut line = String::new();
        let read = timeout(self.receive_timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| DownloadError::timeout(&self.url))?
            .map_err(|e| DownloadError::ftp(&self.url, format!("read failed: {e}")))?;
        if read == 0 {
            return Err(DownloadError::ftp(&self.url, "control connection closed"));
        }
        Ok(line.trim_end().to_string())
    }

    /// Enters passive mode and connects the data socket.
    async fn open_data_connection(
        &mut self,
        connect_timeout: Duration,
    ) -> Result<TcpStream, DownloadError> {
        let reply = self.command("PASV").await?;
        if reply.code != 227 {
            return Err(DownloadError::ftp(&self.url, reply.text));
        }

        let (addr, port) = parse_pasv(&reply.text)
            .ok_or_else(|| DownloadError::ftp(&self.url, format!("bad PASV reply: {}", reply.text)))?;

        timeout(connect_timeout, TcpStream::connect((addr, port)))
            .await
            .map_err(|_| DownloadError::timeout(&self.url))?
            .map_err(|e| DownloadError::ftp(&self.url, format!("data connect failed: {e}")))
    }
}

/// Parses the `(h1,h2,h3,h4,p1,p2)` tuple from a 227 reply.
fn parse_pasv(text: &str) -> Option<(Ipv4Addr, u16)> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let mut numbers = text[open + 1..close]
        .split(',')
        .map(|part| part.trim().parse::<u8>());

    let mut next = || numbers.next()?.ok();
    let (h1, h2, h3, h4) = (next()?, next()?, next()?, next()?);
    let (p1, p2) = (next()?, next()?);

    Some((
        Ipv4Addr::new(h1, h2, h3, h4),
        u16::from(p1) << 8 | u16::from(p2),
    ))
}

/// Converts an `MDTM` timestamp (`YYYYMMDDHHMMSS`) into an HTTP-date
/// string so it can serve as a Last-Modified validator.
fn mdtm_to_http_date(mdtm: &str) -> Option<String> {
    if mdtm.len() < 14 || !mdtm.is_char_boundary(14) {
        return None;
    }
    let (y, mo, d, h, mi, s) = (
        mdtm[0..4].parse::<i64>().ok()?,
        mdtm[4..6].parse::<u32>().ok()?,
        mdtm[6..8].parse::<u32>().ok()?,
        mdtm[8..10].parse::<u64>().ok()?,
        mdtm[10..12].parse::<u64>().ok()?,
        mdtm[12..14].parse::<u64>().ok()?,
    );
    if !(1..=12).contains(&mo) || !(1..=31).contains(&d) {
        return None;
    }

    // Days since the unix epoch, via the civil-date algorithm.
    let year = if mo <= 2 { y - 1 } else { y };
    let era = year.div_euclid(400);
    let yoe = (year - era * 400) as u64;
    let mp = u64::from((mo + 9) % 12);
    let doy = (153 * mp + 2) / 5 + u64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe as i64 - 719_468;
    if days < 0 {
        return None;
    }

    let secs = days as u64 * 86_400 + h * 3_600 + mi * 60 + s;
    let time = std::time::UNIX_EPOCH + Duration::from_secs(secs);
    Some(httpdate::fmt_http_date(time))
}

/// FTP client instance, pooled alongside its HTTP sibling.
///
/// Each operation runs a fresh session; FTP servers routinely drop idle
/// control connections, so there is nothing worth keeping warm.
#[derive(Debug, Default)]
pub struct FtpClient;

impl FtpClient {
    /// Creates a client.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Probes a file: size via `SIZE`, mtime via `MDTM`, resume support
    /// via `REST 0`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the session cannot be established
    /// or the file does not exist.
    #[instrument(skip(self, config), fields(url = %config.url))]
    pub async fn probe(&self, config: &RequestConfig) -> Result<ResponseInfo, DownloadError> {
        let url = Url::parse(&config.url).map_err(|_| DownloadError::invalid_url(&config.url))?;
        let path = url.path().to_string();
        let mut control = Control::connect(config, &url).await?;

        let size_reply = control.command(&format!("SIZE {path}")).await?;
        let content_length = if size_reply.code == 213 {
            size_reply.text[3..].trim().parse::<i64>().unwrap_or(-1)
        } else if size_reply.code == 550 {
            // Missing file maps onto the engine's not-found handling.
            return Err(DownloadError::ftp(&config.url, size_reply.text));
        } else {
            -1
        };

        let mdtm_reply = control.command(&format!("MDTM {path}")).await?;
        let last_modified = if mdtm_reply.code == 213 {
            mdtm_to_http_date(mdtm_reply.text[3..].trim()).unwrap_or_default()
        } else {
            String::new()
        };

        let rest_reply = control.command("REST 0").await?;
        let accept_ranges = rest_reply.code == 350;
        if accept_ranges {
            // Clear the restart marker we just set.
            let _ = control.command("REST 0").await;
        }

        let _ = control.command("QUIT").await;

        Ok(ResponseInfo {
            status: 200,
            content_length,
            content_type: String::new(),
            disposition_filename: None,
            accept_ranges,
            etag: String::new(),
            last_modified,
            final_url: config.url.clone(),
        })
    }

    /// Starts a retrieval at `config.range_start` (0 or -1 = from the
    /// beginning) and returns the data stream.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the session, `REST`, or `RETR`
    /// fails.
    #[instrument(skip(self, config), fields(url = %config.url, range_start = config.range_start))]
    pub async fn get(
        &self,
        config: &RequestConfig,
    ) -> Result<(ResponseInfo, ByteStream), DownloadError> {
        let url = Url::parse(&config.url).map_err(|_| DownloadError::invalid_url(&config.url))?;
        let path = url.path().to_string();
        let mut control = Control::connect(config, &url).await?;

        let data = control.open_data_connection(config.connect_timeout).await?;

        if config.range_start > 0 {
            let reply = control.command(&format!("REST {}", config.range_start)).await?;
            if reply.code != 350 {
                warn!(code = reply.code, "server refused REST, restarting from zero");
                return Err(DownloadError::ftp(&config.url, reply.text));
            }
        }

        let reply = control.command(&format!("RETR {path}")).await?;
        if !(reply.code == 125 || reply.code == 150) {
            return Err(DownloadError::ftp(&config.url, reply.text));
        }

        let info = ResponseInfo {
            status: if config.range_start > 0 { 206 } else { 200 },
            content_length: -1,
            content_type: String::new(),
            disposition_filename: None,
            accept_ranges: true,
            etag: String::new(),
            last_modified: String::new(),
            final_url: config.url.clone(),
        };

        let stream = data_stream(data, control, config.receive_timeout);
        Ok((info, stream))
    }
}

/// Wraps the data socket in a chunk stream. The control connection rides
/// along in the stream state so the session stays open until the stream
/// is dropped or drained.
fn data_stream(data: TcpStream, control: Control, receive_timeout: Duration) -> ByteStream {
    struct State {
        data: TcpStream,
        control: Control,
        receive_timeout: Duration,
        done: bool,
    }

    let state = State {
        data,
        control,
        receive_timeout,
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        let mut buf = vec![0u8; DATA_BUFFER_SIZE];
        let read = match timeout(state.receive_timeout, state.data.read(&mut buf)).await {
            Err(_) => {
                state.done = true;
                let url = state.control.url.clone();
                return Some((Err(DownloadError::timeout(url)), state));
            }
            Ok(Err(e)) => {
                state.done = true;
                let url = state.control.url.clone();
                return Some((
                    Err(DownloadError::ftp(url, format!("data read failed: {e}"))),
                    state,
                ));
            }
            Ok(Ok(read)) => read,
        };

        if read == 0 {
            // EOF: collect the 226 transfer-complete reply politely.
            state.done = true;
            let _ = state.control.read_reply().await;
            let _ = state.control.command("QUIT").await;
            return None;
        }

        buf.truncate(read);
        Some((Ok(Bytes::from(buf)), state))
    })
    .boxed()
}
