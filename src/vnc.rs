use async_trait::async_trait;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::agent::{
    BackendError, ConnectionError, Connector, DisplayController, MouseButton, Screenshot,
    ScrollDirection,
};
use crate::coords::PixelPoint;
use crate::keys::{self, XK_CONTROL_L, XK_DELETE, XK_LEFT, XK_PAGE_DOWN, XK_PAGE_UP, XK_RETURN, XK_RIGHT};
use crate::rfb::{Frame, RfbClient, RfbError};

const DEFAULT_PORT: u16 = 5900;
/// One discrete scroll event per this much magnitude.
const SCROLL_STEP: u32 = 400;
pub const DEFAULT_SCROLL_MAGNITUDE: u32 = 800;

/// Split a vncdotool-style address into host and TCP port.
///
/// `host::port` is a raw port, `host:N` is display N (5900 + N), a bare host
/// means display 0.
pub fn parse_address(address: &str) -> Result<(String, u16), ConnectionError> {
    let invalid = || ConnectionError::InvalidAddress(address.to_string());
    let address = address.trim();
    if address.is_empty() {
        return Err(invalid());
    }

    // [v6::addr]:display and [v6::addr]::port
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail {
            "" => DEFAULT_PORT,
            t if t.starts_with("::") => t[2..].parse().map_err(|_| invalid())?,
            t if t.starts_with(':') => display_port(&t[1..]).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    if let Some((host, port)) = address.split_once("::") {
        let port = port.parse().map_err(|_| invalid())?;
        return Ok((non_empty(host).ok_or_else(invalid)?, port));
    }
    if let Some((host, display)) = address.rsplit_once(':') {
        let port = display_port(display).ok_or_else(invalid)?;
        return Ok((non_empty(host).ok_or_else(invalid)?, port));
    }
    Ok((address.to_string(), DEFAULT_PORT))
}

fn display_port(display: &str) -> Option<u16> {
    let n: u16 = display.parse().ok()?;
    DEFAULT_PORT.checked_add(n)
}

fn non_empty(host: &str) -> Option<String> {
    (!host.is_empty()).then(|| host.to_string())
}

pub fn encode_png(frame: &Frame) -> Result<Vec<u8>, String> {
    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(&frame.rgba, frame.width, frame.height, ColorType::Rgba8)
        .map_err(|e| format!("png encode: {e}"))?;
    Ok(png)
}

fn button_mask(button: MouseButton) -> u8 {
    match button {
        MouseButton::Left => 1,
        MouseButton::Middle => 2,
        MouseButton::Right => 4,
    }
}

/// Display Controller over an RFB session.
pub struct VncDisplay<S = TcpStream> {
    client: RfbClient<S>,
}

impl VncDisplay<TcpStream> {
    pub async fn connect(
        address: &str,
        password: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let (host, port) = parse_address(address)?;
        let client = RfbClient::connect(&host, port, password, timeout)
            .await
            .map_err(|e| connection_error(address, e))?;
        let (width, height) = client.dimensions();
        info!(%address, width, height, desktop = client.name(), "connected to VNC server");
        Ok(Self { client })
    }
}

impl<S> VncDisplay<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn from_client(client: RfbClient<S>) -> Self {
        Self { client }
    }

    async fn tap(&mut self, keysym: u32, primitive: &str) -> Result<(), BackendError> {
        self.key(keysym, true, primitive).await?;
        self.key(keysym, false, primitive).await
    }

    async fn key(&mut self, keysym: u32, down: bool, primitive: &str) -> Result<(), BackendError> {
        self.client
            .key_event(keysym, down)
            .await
            .map_err(|e| BackendError::new(primitive, e))
    }

    async fn pointer(&mut self, mask: u8, at: PixelPoint, primitive: &str) -> Result<(), BackendError> {
        self.client
            .pointer_event(mask, at.x, at.y)
            .await
            .map_err(|e| BackendError::new(primitive, e))
    }

    async fn chord(&mut self, keysyms: &[u32], primitive: &str) -> Result<(), BackendError> {
        for &k in keysyms {
            self.key(k, true, primitive).await?;
        }
        for &k in keysyms.iter().rev() {
            self.key(k, false, primitive).await?;
        }
        Ok(())
    }
}

fn connection_error(address: &str, e: RfbError) -> ConnectionError {
    let address = address.to_string();
    match e {
        RfbError::Io(e) => ConnectionError::Unreachable {
            address,
            cause: e.to_string(),
        },
        RfbError::Auth(reason) => ConnectionError::AuthRejected { address, reason },
        RfbError::Protocol(cause) => ConnectionError::Protocol { address, cause },
    }
}

#[async_trait]
impl<S> DisplayController for VncDisplay<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn capture(&mut self) -> Result<Screenshot, BackendError> {
        let frame = self
            .client
            .capture()
            .await
            .map_err(|e| BackendError::new("capture", e))?;
        let png = encode_png(&frame).map_err(|e| BackendError::new("capture", e))?;
        debug!(width = frame.width, height = frame.height, bytes = png.len(), "captured frame");
        Ok(Screenshot::new(png, frame.width, frame.height))
    }

    async fn pointer_move(&mut self, at: PixelPoint) -> Result<(), BackendError> {
        self.pointer(0, at, "pointer_move").await
    }

    async fn click(&mut self, at: PixelPoint, button: MouseButton) -> Result<(), BackendError> {
        let mask = button_mask(button);
        self.pointer(0, at, "click").await?;
        self.pointer(mask, at, "click").await?;
        self.pointer(0, at, "click").await
    }

    async fn double_click(&mut self, at: PixelPoint) -> Result<(), BackendError> {
        self.pointer(0, at, "double_click").await?;
        for _ in 0..2 {
            self.pointer(1, at, "double_click").await?;
            self.pointer(0, at, "double_click").await?;
        }
        Ok(())
    }

    async fn drag(&mut self, from: PixelPoint, to: PixelPoint) -> Result<(), BackendError> {
        self.pointer(0, from, "drag").await?;
        self.pointer(1, from, "drag").await?;
        self.pointer(1, to, "drag").await?;
        self.pointer(0, to, "drag").await
    }

    async fn type_text(
        &mut self,
        text: &str,
        press_enter: bool,
        clear_first: bool,
    ) -> Result<(), BackendError> {
        if clear_first {
            self.chord(&[XK_CONTROL_L, 'a' as u32], "type_text").await?;
            self.tap(XK_DELETE, "type_text").await?;
        }
        for c in text.chars() {
            self.tap(keys::keysym_for_char(c), "type_text").await?;
        }
        if press_enter {
            self.tap(XK_RETURN, "type_text").await?;
        }
        Ok(())
    }

    async fn key_combo(&mut self, combo: &str) -> Result<(), BackendError> {
        // resolve every name before touching the keyboard
        let keysyms = keys::parse_combo(combo).map_err(|e| BackendError::new("key_combo", e))?;
        self.chord(&keysyms, "key_combo").await
    }

    async fn scroll(
        &mut self,
        direction: ScrollDirection,
        magnitude: u32,
    ) -> Result<(), BackendError> {
        let keysym = match direction {
            ScrollDirection::Up => XK_PAGE_UP,
            ScrollDirection::Down => XK_PAGE_DOWN,
            ScrollDirection::Left => XK_LEFT,
            ScrollDirection::Right => XK_RIGHT,
        };
        for _ in 0..scroll_repeats(magnitude) {
            self.tap(keysym, "scroll").await?;
        }
        Ok(())
    }
}

pub fn scroll_repeats(magnitude: u32) -> u32 {
    (magnitude / SCROLL_STEP).max(1)
}

/// Connects to VNC servers over TCP.
#[derive(Clone, Debug)]
pub struct VncConnector {
    pub timeout: Duration,
}

impl Default for VncConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Connector for VncConnector {
    async fn connect(
        &self,
        address: &str,
        password: Option<&str>,
    ) -> Result<Box<dyn DisplayController>, ConnectionError> {
        let display = VncDisplay::connect(address, password, self.timeout).await?;
        Ok(Box::new(display))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{XK_ALT_L, XK_TAB};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[test]
    fn address_forms() {
        assert_eq!(parse_address("desk").unwrap(), ("desk".into(), 5900));
        assert_eq!(parse_address("desk:1").unwrap(), ("desk".into(), 5901));
        assert_eq!(parse_address("10.0.0.5::5999").unwrap(), ("10.0.0.5".into(), 5999));
        assert_eq!(parse_address("[::1]:2").unwrap(), ("::1".into(), 5902));
        assert_eq!(parse_address("[::1]::6000").unwrap(), ("::1".into(), 6000));
        assert!(parse_address("desk:abc").is_err());
        assert!(parse_address(":1").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn scroll_repetitions() {
        assert_eq!(scroll_repeats(0), 1);
        assert_eq!(scroll_repeats(399), 1);
        assert_eq!(scroll_repeats(DEFAULT_SCROLL_MAGNITUDE), 2);
        assert_eq!(scroll_repeats(1300), 3);
    }

    #[test]
    fn png_has_signature_and_dimensions() {
        let frame = Frame {
            width: 3,
            height: 2,
            rgba: vec![200; 3 * 2 * 4],
        };
        let png = encode_png(&frame).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
    }

    /// Handshake a display against an in-memory server, then hand back the
    /// server end with the client setup messages already consumed.
    async fn display_pair() -> (VncDisplay<DuplexStream>, DuplexStream) {
        let (client_io, mut server) = duplex(64 * 1024);
        let server_side = tokio::spawn(async move {
            server.write_all(b"RFB 003.008\n").await.unwrap();
            let mut version = [0u8; 12];
            server.read_exact(&mut version).await.unwrap();
            server.write_all(&[1, 1]).await.unwrap();
            server.read_u8().await.unwrap();
            server.write_u32(0).await.unwrap();
            server.read_u8().await.unwrap();
            server.write_u16(100).await.unwrap();
            server.write_u16(50).await.unwrap();
            server.write_all(&[0u8; 16]).await.unwrap();
            server.write_u32(0).await.unwrap();
            // SetPixelFormat + SetEncodings(2)
            let mut setup = [0u8; 20 + 4 + 8];
            server.read_exact(&mut setup).await.unwrap();
            server
        });
        let client = RfbClient::handshake(client_io, None).await.unwrap();
        (VncDisplay::from_client(client), server_side.await.unwrap())
    }

    async fn read_keys(server: &mut DuplexStream, n: usize) -> Vec<(bool, u32)> {
        let mut out = Vec::new();
        for _ in 0..n {
            let mut msg = [0u8; 8];
            server.read_exact(&mut msg).await.unwrap();
            assert_eq!(msg[0], 4);
            out.push((msg[1] == 1, u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]])));
        }
        out
    }

    async fn read_pointers(server: &mut DuplexStream, n: usize) -> Vec<(u8, u16, u16)> {
        let mut out = Vec::new();
        for _ in 0..n {
            let mut msg = [0u8; 6];
            server.read_exact(&mut msg).await.unwrap();
            assert_eq!(msg[0], 5);
            out.push((
                msg[1],
                u16::from_be_bytes([msg[2], msg[3]]),
                u16::from_be_bytes([msg[4], msg[5]]),
            ));
        }
        out
    }

    #[tokio::test]
    async fn click_moves_before_pressing() {
        let (mut display, mut server) = display_pair().await;
        display
            .click(PixelPoint { x: 10, y: 20 }, MouseButton::Right)
            .await
            .unwrap();
        assert_eq!(
            read_pointers(&mut server, 3).await,
            vec![(0, 10, 20), (4, 10, 20), (0, 10, 20)]
        );
    }

    #[tokio::test]
    async fn drag_presses_at_source_and_releases_at_destination() {
        let (mut display, mut server) = display_pair().await;
        display
            .drag(PixelPoint { x: 1, y: 2 }, PixelPoint { x: 30, y: 40 })
            .await
            .unwrap();
        assert_eq!(
            read_pointers(&mut server, 4).await,
            vec![(0, 1, 2), (1, 1, 2), (1, 30, 40), (0, 30, 40)]
        );
    }

    #[tokio::test]
    async fn chord_releases_in_reverse_order() {
        let (mut display, mut server) = display_pair().await;
        display.key_combo("alt+tab").await.unwrap();
        assert_eq!(
            read_keys(&mut server, 4).await,
            vec![(true, XK_ALT_L), (true, XK_TAB), (false, XK_TAB), (false, XK_ALT_L)]
        );
    }

    #[tokio::test]
    async fn unknown_key_sends_nothing() {
        let (mut display, mut server) = display_pair().await;
        let err = display.key_combo("ctrl+nosuchkey").await.unwrap_err();
        assert_eq!(err.primitive, "key_combo");
        // the next message on the wire is the pointer event, not a key press
        display.pointer_move(PixelPoint { x: 5, y: 5 }).await.unwrap();
        assert_eq!(read_pointers(&mut server, 1).await, vec![(0, 5, 5)]);
    }

    #[tokio::test]
    async fn type_text_clears_and_submits() {
        let (mut display, mut server) = display_pair().await;
        display.type_text("hi", true, true).await.unwrap();
        let events = read_keys(&mut server, 4 + 2 + 4 + 2).await;
        assert_eq!(
            events,
            vec![
                (true, XK_CONTROL_L),
                (true, 'a' as u32),
                (false, 'a' as u32),
                (false, XK_CONTROL_L),
                (true, XK_DELETE),
                (false, XK_DELETE),
                (true, 'h' as u32),
                (false, 'h' as u32),
                (true, 'i' as u32),
                (false, 'i' as u32),
                (true, XK_RETURN),
                (false, XK_RETURN),
            ]
        );
    }

    #[tokio::test]
    async fn scroll_down_uses_page_down() {
        let (mut display, mut server) = display_pair().await;
        display.scroll(ScrollDirection::Down, 800).await.unwrap();
        assert_eq!(
            read_keys(&mut server, 4).await,
            vec![
                (true, XK_PAGE_DOWN),
                (false, XK_PAGE_DOWN),
                (true, XK_PAGE_DOWN),
                (false, XK_PAGE_DOWN)
            ]
        );
    }
}
