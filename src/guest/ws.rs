//! Emulated `ws` client, host side.
//!
//! RFC 6455 framing, masking, fragmentation, and the ping/pong and close
//! handshakes all ride on tungstenite underneath; the bridge exposes
//! connect/send/close plus event callbacks the event loop pumps from the
//! non-blocking stream. The `WebSocketServer` class throws `ENOTSUP` in the
//! guest shim.

use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Function, Object, Persistent, Value};
use tungstenite::client::IntoClientRequest;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::Message;

use crate::sandbox::bridge::{throw_code, value_to_bytes};
use crate::sandbox::state::{GuestCell, GuestWebSocket};

use super::GuestModule;

fn set_nonblocking(socket: &mut tungstenite::WebSocket<MaybeTlsStream<std::net::TcpStream>>) {
    match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            stream.set_nonblocking(true).ok();
        }
        MaybeTlsStream::Rustls(tls) => {
            tls.get_mut().set_nonblocking(true).ok();
        }
        _ => {}
    }
}

/// Emulated `ws` module.
pub struct WsModule;

impl GuestModule for WsModule {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        let st = state.clone();
        ops.set(
            "connect",
            Func::from(
                move |ctx: Ctx<'js>, url: String, protocols: Opt<Vec<String>>| -> rquickjs::Result<f64> {
                    if st.borrow().remaining().is_zero() {
                        return Err(throw_code(&ctx, "ETIMEDOUT", "invocation deadline reached"));
                    }
                    let mut request = url
                        .clone()
                        .into_client_request()
                        .map_err(|e| throw_code(&ctx, "EINVAL", &format!("'{}': {}", url, e)))?;
                    if let Some(protocols) = protocols.0 {
                        if !protocols.is_empty() {
                            let joined = protocols.join(", ");
                            request.headers_mut().insert(
                                "Sec-WebSocket-Protocol",
                                joined.parse().map_err(|_| {
                                    throw_code(&ctx, "EINVAL", "invalid subprotocol list")
                                })?,
                            );
                        }
                    }

                    let (mut socket, _response) = tungstenite::connect(request).map_err(|e| {
                        throw_code(&ctx, "ECONNREFUSED", &format!("websocket connect: {}", e))
                    })?;
                    set_nonblocking(&mut socket);

                    let mut guard = st.borrow_mut();
                    let id = guard.next_io_id();
                    guard.websockets.insert(
                        id,
                        GuestWebSocket {
                            socket,
                            on_message: None,
                            on_close: None,
                            on_error: None,
                            open: true,
                        },
                    );
                    Ok(id as f64)
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "send",
            Func::from(
                move |ctx: Ctx<'js>, id: f64, data: Value<'js>, binary: bool| -> rquickjs::Result<()> {
                    let message = if binary {
                        Message::Binary(value_to_bytes(&ctx, &data)?)
                    } else if let Some(s) = data.as_string() {
                        Message::Text(s.to_string()?)
                    } else {
                        Message::Text(String::from_utf8_lossy(&value_to_bytes(&ctx, &data)?).into_owned())
                    };
                    let mut guard = st.borrow_mut();
                    let socket = guard
                        .websockets
                        .get_mut(&(id as u64))
                        .ok_or_else(|| throw_code(&ctx, "EBADF", "websocket is closed"))?;
                    socket
                        .socket
                        .send(message)
                        .map_err(|e| throw_code(&ctx, "EPIPE", &format!("websocket send: {}", e)))
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "close",
            Func::from(
                move |_ctx: Ctx<'js>, id: f64, code: Opt<u16>, reason: Opt<String>| {
                    let mut guard = st.borrow_mut();
                    if let Some(socket) = guard.websockets.get_mut(&(id as u64)) {
                        let frame = CloseFrame {
                            code: CloseCode::from(code.0.unwrap_or(1000)),
                            reason: reason.0.unwrap_or_default().into(),
                        };
                        socket.socket.close(Some(frame)).ok();
                        socket.socket.flush().ok();
                    }
                },
            ),
        )?;

        for event in ["message", "close", "error"] {
            let st = state.clone();
            let op_name = format!("on{}{}", event[..1].to_ascii_uppercase(), &event[1..]);
            ops.set(
                op_name.as_str(),
                Func::from(
                    move |ctx: Ctx<'js>, id: f64, callback: Function<'js>| -> rquickjs::Result<()> {
                        let saved = Persistent::save(&ctx, callback);
                        let mut guard = st.borrow_mut();
                        let socket = guard
                            .websockets
                            .get_mut(&(id as u64))
                            .ok_or_else(|| throw_code(&ctx, "EBADF", "unknown websocket"))?;
                        match event {
                            "message" => socket.on_message = Some(saved),
                            "close" => socket.on_close = Some(saved),
                            _ => socket.on_error = Some(saved),
                        }
                        Ok(())
                    },
                ),
            )?;
        }

        Ok(ops)
    }
}
