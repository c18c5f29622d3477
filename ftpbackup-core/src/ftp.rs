use std::fmt;
use std::net::IpAddr;
use std::ops::Range;
use std::time::Duration;

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::session::{Connector, RemoteSession, SessionError};

pub const DEFAULT_PORT: u16 = 21;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(120);
const EMPTY_LISTING_REPLIES: [u16; 2] = [450, 550];

#[derive(Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    /// Upper bound on waiting for a single control-channel reply line.
    pub reply_timeout: Duration,
}

impl FtpConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: password.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("reply_timeout", &self.reply_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FtpConnector {
    config: FtpConfig,
}

impl FtpConnector {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }
}

impl Connector for FtpConnector {
    type Session = FtpSession;

    async fn connect(&self) -> Result<FtpSession, SessionError> {
        FtpSession::connect(&self.config).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

/// Control connection of one logged-in FTP session (passive mode, binary type).
pub struct FtpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: IpAddr,
    reply_timeout: Duration,
}

impl FtpSession {
    pub async fn connect(config: &FtpConfig) -> Result<Self, SessionError> {
        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| SessionError::Timeout(config.connect_timeout))??;
        let peer = stream.peer_addr()?.ip();
        let (read_half, write_half) = stream.into_split();
        let mut session = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
            reply_timeout: config.reply_timeout,
        };

        session.expect_reply(&[220]).await?;
        session.login(&config.username, &config.password).await?;
        session.command("TYPE I", &[200]).await?;
        Ok(session)
    }

    /// Sends one command line and waits for a reply whose code is in `accepted`.
    pub async fn command(&mut self, line: &str, accepted: &[u16]) -> Result<Reply, SessionError> {
        self.send(line).await?;
        self.expect_reply(accepted).await
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<(), SessionError> {
        let reply = self
            .command(&format!("USER {username}"), &[230, 331])
            .await?;
        if reply.code == 331 {
            self.command(&format!("PASS {password}"), &[202, 230])
                .await?;
        }
        Ok(())
    }

    async fn send(&mut self, line: &str) -> Result<(), SessionError> {
        if line.contains(|c: char| c == '\r' || c == '\n') {
            return Err(SessionError::InvalidArgument(
                "command contains a line break".to_string(),
            ));
        }
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn expect_reply(&mut self, accepted: &[u16]) -> Result<Reply, SessionError> {
        let reply = self.read_reply().await?;
        if accepted.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(SessionError::Reply {
                code: reply.code,
                message: reply.message,
            })
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, SessionError> {
        let first = self.read_line().await?;
        let (code, multiline, text) = split_reply_line(&first)?;
        let mut message = text.to_string();
        if multiline {
            loop {
                let line = self.read_line().await?;
                message.push('\n');
                match split_reply_line(&line) {
                    Ok((end, false, text)) if end == code => {
                        message.push_str(text);
                        break;
                    }
                    _ => message.push_str(&line),
                }
            }
        }
        Ok(Reply { code, message })
    }

    async fn read_line(&mut self) -> Result<String, SessionError> {
        let limit = self.reply_timeout;
        let mut line = String::new();
        let read = tokio::time::timeout(limit, self.reader.read_line(&mut line))
            .await
            .map_err(|_| SessionError::Timeout(limit))??;
        if read == 0 {
            return Err(SessionError::Closed);
        }
        Ok(line.trim_end_matches(|c: char| c == '\r' || c == '\n').to_string())
    }

    async fn open_data_connection(&mut self) -> Result<TcpStream, SessionError> {
        let reply = self.command("PASV", &[227]).await?;
        let port = parse_pasv_port(&reply.message)?;
        // The advertised host is ignored: servers behind NAT report private addresses.
        let limit = self.reply_timeout;
        let stream = tokio::time::timeout(limit, TcpStream::connect((self.peer, port)))
            .await
            .map_err(|_| SessionError::Timeout(limit))??;
        Ok(stream)
    }
}

impl RemoteSession for FtpSession {
    async fn change_directory(&mut self, path: &str) -> Result<(), SessionError> {
        self.command(&format!("CWD {path}"), &[200, 250]).await?;
        Ok(())
    }

    async fn current_directory(&mut self) -> Result<String, SessionError> {
        let reply = self.command("PWD", &[257]).await?;
        parse_quoted_path(&reply.message)
    }

    async fn list_names(&mut self, path: &str) -> Result<Vec<String>, SessionError> {
        let mut data = self.open_data_connection().await?;
        self.send(&format!("NLST {path}")).await?;
        let reply = self.read_reply().await?;
        match reply.code {
            125 | 150 => {}
            // Servers answer NLST of an empty directory with "no files found".
            code if EMPTY_LISTING_REPLIES.contains(&code) => return Ok(Vec::new()),
            code => {
                return Err(SessionError::Reply {
                    code,
                    message: reply.message,
                });
            }
        }
        let mut raw = Vec::new();
        let received = data.read_to_end(&mut raw).await;
        drop(data);
        let finished = self.expect_reply(&[226, 250]).await;
        received?;
        finished?;
        Ok(parse_name_list(&String::from_utf8_lossy(&raw)))
    }

    async fn retrieve<W>(&mut self, path: &str, sink: &mut W) -> Result<u64, SessionError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut data = self.open_data_connection().await?;
        self.command(&format!("RETR {path}"), &[125, 150]).await?;
        let copied = tokio::io::copy(&mut data, sink).await;
        drop(data);
        // Always drain the completion reply so the control channel stays in step.
        let finished = self.expect_reply(&[226, 250]).await;
        let bytes = copied?;
        finished?;
        Ok(bytes)
    }

    async fn file_size(&mut self, path: &str) -> Result<u64, SessionError> {
        let reply = self.command(&format!("SIZE {path}"), &[213]).await?;
        reply
            .message
            .trim()
            .parse::<u64>()
            .map_err(|_| SessionError::Malformed(format!("SIZE reply: {}", reply.message)))
    }

    async fn modified_time(&mut self, path: &str) -> Result<OffsetDateTime, SessionError> {
        let reply = self.command(&format!("MDTM {path}"), &[213]).await?;
        parse_mdtm(reply.message.trim())
    }

    async fn close(mut self) -> Result<(), SessionError> {
        let result = self.command("QUIT", &[221]).await;
        let _ = self.writer.shutdown().await;
        result.map(|_| ())
    }
}

/// Splits `"250-text"` / `"250 text"` into code, continuation flag and text.
fn split_reply_line(line: &str) -> Result<(u16, bool, &str), SessionError> {
    let malformed = || SessionError::Malformed(line.to_string());
    let digits = line
        .get(..3)
        .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(malformed)?;
    let code = digits.parse::<u16>().map_err(|_| malformed())?;
    let rest = &line[3..];
    Ok((code, rest.starts_with('-'), rest.get(1..).unwrap_or("")))
}

fn parse_pasv_port(message: &str) -> Result<u16, SessionError> {
    let malformed = || SessionError::Malformed(format!("PASV reply: {message}"));
    let start = message
        .find('(')
        .map(|i| i + 1)
        .or_else(|| message.find(|c: char| c.is_ascii_digit()))
        .ok_or_else(malformed)?;
    let tail = &message[start..];
    let end = tail.find(')').unwrap_or(tail.len());
    let fields = tail[..end]
        .split(',')
        .map(|field| field.trim().trim_end_matches('.').parse::<u8>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| malformed())?;
    match fields.as_slice() {
        [_, _, _, _, high, low] => Ok(u16::from(*high) << 8 | u16::from(*low)),
        _ => Err(malformed()),
    }
}

/// Extracts the path from a 257 reply, honouring `""` escapes.
fn parse_quoted_path(message: &str) -> Result<String, SessionError> {
    let malformed = || SessionError::Malformed(format!("PWD reply: {message}"));
    let Some(start) = message.find('"') else {
        return message
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(malformed);
    };
    let mut path = String::new();
    let mut chars = message[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                path.push('"');
                continue;
            }
            return Ok(path);
        }
        path.push(c);
    }
    Err(malformed())
}

fn parse_name_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.trim_end_matches('/'))
        .filter_map(|line| line.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses an MDTM value (`YYYYMMDDHHMMSS[.sss]`, always UTC).
pub fn parse_mdtm(value: &str) -> Result<OffsetDateTime, SessionError> {
    let malformed = || SessionError::Malformed(format!("MDTM reply: {value}"));
    let digits = value
        .get(..14)
        .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(malformed)?;
    let field = |range: Range<usize>| digits[range].parse::<u16>().map_err(|_| malformed());

    let millis = match value[14..].strip_prefix('.') {
        Some(fraction) => {
            let fraction: String = fraction.chars().take(3).collect();
            format!("{fraction:0<3}").parse::<u16>().map_err(|_| malformed())?
        }
        None => 0,
    };
    let month = Month::try_from(field(4..6)? as u8).map_err(|_| malformed())?;
    let date = Date::from_calendar_date(i32::from(field(0..4)?), month, field(6..8)? as u8)
        .map_err(|_| malformed())?;
    let time = Time::from_hms_milli(
        field(8..10)? as u8,
        field(10..12)? as u8,
        field(12..14)? as u8,
        millis,
    )
    .map_err(|_| malformed())?;
    Ok(PrimitiveDateTime::new(date, time).assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn splits_single_and_multiline_reply_lines() {
        assert_eq!(
            split_reply_line("250 Directory changed").unwrap(),
            (250, false, "Directory changed")
        );
        assert_eq!(
            split_reply_line("220-Welcome").unwrap(),
            (220, true, "Welcome")
        );
        assert_eq!(split_reply_line("226").unwrap(), (226, false, ""));
        assert!(split_reply_line("hello").is_err());
    }

    #[test]
    fn parses_pasv_port_with_and_without_parentheses() {
        assert_eq!(
            parse_pasv_port("Entering Passive Mode (192,168,1,10,195,80).").unwrap(),
            195 * 256 + 80
        );
        assert_eq!(
            parse_pasv_port("Entering Passive Mode 10,0,0,1,4,1").unwrap(),
            1025
        );
        assert!(parse_pasv_port("Entering Passive Mode").is_err());
        assert!(parse_pasv_port("(1,2,3,4,5)").is_err());
    }

    #[test]
    fn parses_quoted_pwd_reply() {
        assert_eq!(
            parse_quoted_path("\"/public_html\" is the current directory").unwrap(),
            "/public_html"
        );
        assert_eq!(
            parse_quoted_path("\"/odd \"\"name\"\"\" is current").unwrap(),
            "/odd \"name\""
        );
        assert!(parse_quoted_path("\"/unterminated").is_err());
    }

    #[test]
    fn name_list_is_reduced_to_bare_names() {
        let names = parse_name_list("index.html\r\nimg/\r\n/site/css/main.css\r\n\r\n");
        assert_eq!(names, vec!["index.html", "img", "main.css"]);
    }

    #[test]
    fn parses_mdtm_timestamps() {
        assert_eq!(
            parse_mdtm("20240102030405").unwrap(),
            datetime!(2024-01-02 03:04:05 UTC)
        );
        assert_eq!(
            parse_mdtm("20240102030405.25").unwrap(),
            datetime!(2024-01-02 03:04:05.250 UTC)
        );
        assert!(parse_mdtm("2024010203").is_err());
        assert!(parse_mdtm("20241302030405").is_err());
    }

    #[test]
    fn debug_output_redacts_password() {
        let config = FtpConfig::new("ftp.example.com", "user", "hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert_eq!(config.port, DEFAULT_PORT);
    }
}
