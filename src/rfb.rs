//! Minimal Remote Framebuffer (VNC) client.
//!
//! Speaks RFB 3.3/3.7/3.8 with None or VNC authentication, asks the server for
//! 32bpp true-colour pixels in Raw encoding and keeps an RGBA copy of the
//! remote framebuffer. Only what a desktop driver needs: full-frame captures,
//! key events and pointer events.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

const SECURITY_NONE: u8 = 1;
const SECURITY_VNC_AUTH: u8 = 2;

const ENCODING_RAW: i32 = 0;
const ENCODING_DESKTOP_SIZE: i32 = -223;

const MSG_SET_PIXEL_FORMAT: u8 = 0;
const MSG_SET_ENCODINGS: u8 = 2;
const MSG_FB_UPDATE_REQUEST: u8 = 3;
const MSG_KEY_EVENT: u8 = 4;
const MSG_POINTER_EVENT: u8 = 5;

const MAX_REASON_LEN: u32 = 64 * 1024;
const MAX_RESIZE_ROUNDS: usize = 3;
/// Largest framebuffer edge accepted from a server.
pub const MAX_DIMENSION: u16 = 8192;

#[derive(Debug, Error)]
pub enum RfbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Version {
    V3_3,
    V3_7,
    V3_8,
}

/// A full RGBA copy of the remote screen.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

pub struct RfbClient<S> {
    stream: BufStream<S>,
    width: u16,
    height: u16,
    name: String,
    framebuffer: Vec<u8>,
}

impl RfbClient<TcpStream> {
    pub async fn connect(
        host: &str,
        port: u16,
        password: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, RfbError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                RfbError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;
        tokio::time::timeout(timeout, Self::handshake(stream, password))
            .await
            .map_err(|_| RfbError::Protocol("handshake timed out".into()))?
    }
}

impl<S> RfbClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the RFB handshake over an already-open stream.
    pub async fn handshake(stream: S, password: Option<&str>) -> Result<Self, RfbError> {
        let mut stream = BufStream::new(stream);

        let mut banner = [0u8; 12];
        stream.read_exact(&mut banner).await?;
        let version = parse_version(&banner)?;
        let reply: &[u8; 12] = match version {
            Version::V3_3 => b"RFB 003.003\n",
            Version::V3_7 => b"RFB 003.007\n",
            Version::V3_8 => b"RFB 003.008\n",
        };
        stream.write_all(reply).await?;
        stream.flush().await?;
        debug!(?version, "rfb version negotiated");

        let security = negotiate_security(&mut stream, version, password.is_some()).await?;
        if security == SECURITY_VNC_AUTH {
            let password = password
                .ok_or_else(|| RfbError::Auth("server requires a password".into()))?;
            let mut challenge = [0u8; 16];
            stream.read_exact(&mut challenge).await?;
            stream
                .write_all(&vnc_auth_response(password, &challenge))
                .await?;
            stream.flush().await?;
        }
        if security == SECURITY_VNC_AUTH || version == Version::V3_8 {
            let result = stream.read_u32().await?;
            if result != 0 {
                let reason = if version == Version::V3_8 {
                    read_reason(&mut stream).await?
                } else {
                    "security handshake rejected".to_string()
                };
                return Err(RfbError::Auth(reason));
            }
        }

        // ClientInit: shared session
        stream.write_u8(1).await?;
        stream.flush().await?;

        let width = stream.read_u16().await?;
        let height = stream.read_u16().await?;
        check_dimensions(width, height)?;
        let mut server_format = [0u8; 16];
        stream.read_exact(&mut server_format).await?;
        let name = read_reason(&mut stream).await?;
        debug!(width, height, %name, "rfb server init");

        let mut client = Self {
            stream,
            width,
            height,
            name,
            framebuffer: vec![0; width as usize * height as usize * 4],
        };
        client.set_pixel_format().await?;
        client
            .set_encodings(&[ENCODING_RAW, ENCODING_DESKTOP_SIZE])
            .await?;
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width as u32, self.height as u32)
    }

    /// Request a full (non-incremental) update and return the resulting frame.
    pub async fn capture(&mut self) -> Result<Frame, RfbError> {
        for _ in 0..MAX_RESIZE_ROUNDS {
            self.request_update(false).await?;
            let resized = self.read_until_update().await?;
            if !resized {
                break;
            }
            debug!(width = self.width, height = self.height, "remote desktop resized");
        }
        Ok(Frame {
            width: self.width as u32,
            height: self.height as u32,
            rgba: self.framebuffer.clone(),
        })
    }

    pub async fn key_event(&mut self, keysym: u32, down: bool) -> Result<(), RfbError> {
        let mut msg = Vec::with_capacity(8);
        msg.push(MSG_KEY_EVENT);
        msg.push(down as u8);
        msg.extend_from_slice(&[0, 0]);
        msg.extend_from_slice(&keysym.to_be_bytes());
        self.send(&msg).await
    }

    pub async fn pointer_event(&mut self, button_mask: u8, x: u32, y: u32) -> Result<(), RfbError> {
        let x = x.min(self.width.saturating_sub(1) as u32) as u16;
        let y = y.min(self.height.saturating_sub(1) as u32) as u16;
        let mut msg = Vec::with_capacity(6);
        msg.push(MSG_POINTER_EVENT);
        msg.push(button_mask);
        msg.extend_from_slice(&x.to_be_bytes());
        msg.extend_from_slice(&y.to_be_bytes());
        self.send(&msg).await
    }

    async fn set_pixel_format(&mut self) -> Result<(), RfbError> {
        let mut msg = vec![MSG_SET_PIXEL_FORMAT, 0, 0, 0];
        // 32bpp, depth 24, little-endian, true colour, 8 bits per channel, xRGB
        msg.extend_from_slice(&[32, 24, 0, 1]);
        msg.extend_from_slice(&255u16.to_be_bytes());
        msg.extend_from_slice(&255u16.to_be_bytes());
        msg.extend_from_slice(&255u16.to_be_bytes());
        msg.extend_from_slice(&[16, 8, 0, 0, 0, 0]);
        self.send(&msg).await
    }

    async fn set_encodings(&mut self, encodings: &[i32]) -> Result<(), RfbError> {
        let mut msg = vec![MSG_SET_ENCODINGS, 0];
        msg.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
        for e in encodings {
            msg.extend_from_slice(&e.to_be_bytes());
        }
        self.send(&msg).await
    }

    async fn request_update(&mut self, incremental: bool) -> Result<(), RfbError> {
        let mut msg = vec![MSG_FB_UPDATE_REQUEST, incremental as u8];
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&self.width.to_be_bytes());
        msg.extend_from_slice(&self.height.to_be_bytes());
        self.send(&msg).await
    }

    async fn send(&mut self, msg: &[u8]) -> Result<(), RfbError> {
        self.stream.write_all(msg).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Consume server messages until one framebuffer update has been applied.
    /// Returns whether the desktop size changed during that update.
    async fn read_until_update(&mut self) -> Result<bool, RfbError> {
        loop {
            let kind = self.stream.read_u8().await?;
            match kind {
                0 => return self.read_framebuffer_update().await,
                1 => {
                    // SetColourMapEntries: unused with true colour
                    self.skip(1 + 2).await?;
                    let count = self.stream.read_u16().await?;
                    self.skip(count as u64 * 6).await?;
                }
                2 => {}
                3 => {
                    self.skip(3).await?;
                    let len = self.stream.read_u32().await?;
                    self.skip(len as u64).await?;
                }
                other => {
                    return Err(RfbError::Protocol(format!(
                        "unexpected server message type {other}"
                    )))
                }
            }
        }
    }

    async fn read_framebuffer_update(&mut self) -> Result<bool, RfbError> {
        self.skip(1).await?;
        let rects = self.stream.read_u16().await?;
        let mut resized = false;
        for _ in 0..rects {
            let x = self.stream.read_u16().await?;
            let y = self.stream.read_u16().await?;
            let w = self.stream.read_u16().await?;
            let h = self.stream.read_u16().await?;
            let encoding = self.stream.read_i32().await?;
            match encoding {
                ENCODING_RAW => {
                    check_rect(x, y, w, h, self.width, self.height)?;
                    let mut pixels = vec![0u8; w as usize * h as usize * 4];
                    self.stream.read_exact(&mut pixels).await?;
                    self.blit(x, y, w, h, &pixels)?;
                }
                ENCODING_DESKTOP_SIZE => {
                    check_dimensions(w, h)?;
                    self.width = w;
                    self.height = h;
                    self.framebuffer = vec![0; w as usize * h as usize * 4];
                    resized = true;
                }
                other => {
                    return Err(RfbError::Protocol(format!(
                        "server sent unsupported encoding {other}"
                    )))
                }
            }
        }
        Ok(resized)
    }

    fn blit(&mut self, x: u16, y: u16, w: u16, h: u16, pixels: &[u8]) -> Result<(), RfbError> {
        check_rect(x, y, w, h, self.width, self.height)?;
        let fw = self.width as usize;
        let (x, y, w, h) = (x as usize, y as usize, w as usize, h as usize);
        for row in 0..h {
            for col in 0..w {
                let src = (row * w + col) * 4;
                let dst = ((y + row) * fw + x + col) * 4;
                // little-endian xRGB: bytes are B, G, R, X
                self.framebuffer[dst] = pixels[src + 2];
                self.framebuffer[dst + 1] = pixels[src + 1];
                self.framebuffer[dst + 2] = pixels[src];
                self.framebuffer[dst + 3] = 0xff;
            }
        }
        Ok(())
    }

    async fn skip(&mut self, n: u64) -> Result<(), RfbError> {
        let copied = tokio::io::copy(&mut (&mut self.stream).take(n), &mut tokio::io::sink()).await?;
        if copied != n {
            return Err(RfbError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(())
    }
}

fn check_dimensions(width: u16, height: u16) -> Result<(), RfbError> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(RfbError::Protocol(format!(
            "framebuffer {width}x{height} exceeds {MAX_DIMENSION}x{MAX_DIMENSION}"
        )));
    }
    Ok(())
}

fn check_rect(x: u16, y: u16, w: u16, h: u16, fw: u16, fh: u16) -> Result<(), RfbError> {
    let (x, y, w, h) = (x as usize, y as usize, w as usize, h as usize);
    if x + w > fw as usize || y + h > fh as usize {
        return Err(RfbError::Protocol(format!(
            "rectangle {w}x{h}+{x}+{y} outside {fw}x{fh} framebuffer"
        )));
    }
    Ok(())
}

fn parse_version(banner: &[u8; 12]) -> Result<Version, RfbError> {
    let text = std::str::from_utf8(banner)
        .map_err(|_| RfbError::Protocol("non-ascii protocol banner".into()))?;
    let rest = text
        .strip_prefix("RFB ")
        .and_then(|r| r.strip_suffix('\n'))
        .ok_or_else(|| RfbError::Protocol(format!("bad protocol banner {text:?}")))?;
    let (major, minor) = rest
        .split_once('.')
        .ok_or_else(|| RfbError::Protocol(format!("bad protocol banner {text:?}")))?;
    let major: u32 = major
        .parse()
        .map_err(|_| RfbError::Protocol(format!("bad major version {major:?}")))?;
    let minor: u32 = minor
        .parse()
        .map_err(|_| RfbError::Protocol(format!("bad minor version {minor:?}")))?;
    Ok(match (major, minor) {
        (3, 0..=6) => Version::V3_3,
        (3, 7) => Version::V3_7,
        (m, _) if m >= 3 => Version::V3_8,
        _ => {
            return Err(RfbError::Protocol(format!(
                "unsupported protocol version {major}.{minor}"
            )))
        }
    })
}

async fn negotiate_security<S>(
    stream: &mut BufStream<S>,
    version: Version,
    have_password: bool,
) -> Result<u8, RfbError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if version == Version::V3_3 {
        let kind = stream.read_u32().await?;
        return match kind {
            0 => Err(RfbError::Auth(read_reason(stream).await?)),
            1 => Ok(SECURITY_NONE),
            2 => Ok(SECURITY_VNC_AUTH),
            other => Err(RfbError::Protocol(format!("unsupported security type {other}"))),
        };
    }

    let count = stream.read_u8().await?;
    if count == 0 {
        return Err(RfbError::Auth(read_reason(stream).await?));
    }
    let mut offered = vec![0u8; count as usize];
    stream.read_exact(&mut offered).await?;
    let chosen = if have_password && offered.contains(&SECURITY_VNC_AUTH) {
        SECURITY_VNC_AUTH
    } else if offered.contains(&SECURITY_NONE) {
        SECURITY_NONE
    } else if offered.contains(&SECURITY_VNC_AUTH) {
        SECURITY_VNC_AUTH
    } else {
        return Err(RfbError::Protocol(format!(
            "no supported security type among {offered:?}"
        )));
    };
    stream.write_u8(chosen).await?;
    stream.flush().await?;
    Ok(chosen)
}

async fn read_reason<R: AsyncRead + Unpin>(stream: &mut R) -> Result<String, RfbError> {
    let len = stream.read_u32().await?;
    if len > MAX_REASON_LEN {
        return Err(RfbError::Protocol(format!("string of {len} bytes is too long")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// DES-encrypt the 16-byte challenge with the password as key.
///
/// VNC uses the first 8 password bytes with the bit order of every byte
/// reversed.
pub fn vnc_auth_response(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let mut key = [0u8; 8];
    for (slot, b) in key.iter_mut().zip(password.as_bytes()) {
        *slot = b.reverse_bits();
    }
    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut out = *challenge;
    for block in out.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    out
}
