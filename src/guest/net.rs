//! Emulated `net` and `tls` modules, host side.
//!
//! Outgoing sockets only: connect, write, half-close, and event callbacks
//! that the event loop pumps by polling the non-blocking stream. TLS wraps
//! the same socket table through rustls with the webpki CA bundle; the peer
//! certificate is retrievable after the handshake. Servers throw `ENOTSUP`
//! in the guest shim.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use once_cell::sync::Lazy;
use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Function, Object, Persistent};

use crate::sandbox::bridge::{io_error_code, throw_code, value_to_bytes};
use crate::sandbox::state::{GuestCell, GuestSocket, SocketStream};

use super::GuestModule;

/// Connect timeout floor; the invocation deadline still wins when shorter.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static TLS_CONFIG: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

fn resolve_addr(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address found"))
}

fn connect_socket<'js>(
    ctx: &Ctx<'js>,
    state: &GuestCell,
    host: &str,
    port: u16,
    tls: bool,
    servername: Option<String>,
) -> rquickjs::Result<u64> {
    let remaining = state.borrow().remaining();
    if remaining.is_zero() {
        return Err(throw_code(ctx, "ETIMEDOUT", "invocation deadline reached"));
    }
    let timeout = remaining.min(CONNECT_TIMEOUT);

    let addr = resolve_addr(host, port)
        .map_err(|e| throw_code(ctx, "ENOTFOUND", &format!("{} {}", e, host)))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| throw_code(ctx, io_error_code(&e), &format!("connect {}:{}", host, port)))?;
    tcp.set_nodelay(true).ok();

    let (stream, peer_cert_der) = if tls {
        let name = servername.unwrap_or_else(|| host.to_string());
        let server_name = rustls::pki_types::ServerName::try_from(name.clone())
            .map_err(|_| throw_code(ctx, "EINVAL", &format!("invalid servername '{}'", name)))?;
        let connection = rustls::ClientConnection::new(TLS_CONFIG.clone(), server_name)
            .map_err(|e| throw_code(ctx, "EPROTO", &e.to_string()))?;
        let mut stream = rustls::StreamOwned::new(connection, tcp);

        // Drive the handshake to completion so the peer certificate is
        // available before `connect`/`secureConnect` fires.
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|e| throw_code(ctx, "EPROTO", &format!("tls handshake: {}", e)))?;
        }
        let der = stream
            .conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());
        stream.sock.set_nonblocking(true).ok();
        (SocketStream::Tls(Box::new(stream)), der)
    } else {
        tcp.set_nonblocking(true).ok();
        (SocketStream::Tcp(tcp), None)
    };

    let mut guard = state.borrow_mut();
    let id = guard.next_io_id();
    guard.sockets.insert(
        id,
        GuestSocket {
            stream,
            on_data: None,
            on_end: None,
            on_error: None,
            open: true,
            peer_cert_der,
        },
    );
    Ok(id)
}

/// Write the whole buffer, riding out `WouldBlock` on the non-blocking
/// stream until the deadline says otherwise.
fn write_all(state: &GuestCell, id: u64, bytes: &[u8]) -> std::io::Result<()> {
    let mut written = 0usize;
    while written < bytes.len() {
        if state.borrow().remaining().is_zero() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "deadline reached mid-write",
            ));
        }
        let mut guard = state.borrow_mut();
        let socket = guard.sockets.get_mut(&id).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "socket closed")
        })?;
        let result = match &mut socket.stream {
            SocketStream::Tcp(tcp) => tcp.write(&bytes[written..]),
            SocketStream::Tls(tls) => tls.write(&bytes[written..]),
        };
        drop(guard);
        match result {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "socket refused bytes",
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn set_socket_callback<'js>(
    ctx: &Ctx<'js>,
    state: &GuestCell,
    id: u64,
    which: &str,
    callback: Function<'js>,
) -> rquickjs::Result<()> {
    let saved = Persistent::save(ctx, callback);
    let mut guard = state.borrow_mut();
    let socket = guard
        .sockets
        .get_mut(&id)
        .ok_or_else(|| throw_code(ctx, "EBADF", "unknown socket"))?;
    match which {
        "data" => socket.on_data = Some(saved),
        "end" => socket.on_end = Some(saved),
        "error" => socket.on_error = Some(saved),
        _ => return Err(throw_code(ctx, "EINVAL", "unknown socket event")),
    }
    Ok(())
}

/// Emulated `net` module.
pub struct NetModule;

impl GuestModule for NetModule {
    fn name(&self) -> &'static str {
        "net"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        let st = state.clone();
        ops.set(
            "connect",
            Func::from(
                move |ctx: Ctx<'js>,
                      host: String,
                      port: u16,
                      tls: bool,
                      servername: Opt<String>|
                      -> rquickjs::Result<f64> {
                    connect_socket(&ctx, &st, &host, port, tls, servername.0).map(|id| id as f64)
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "write",
            Func::from(
                move |ctx: Ctx<'js>, id: f64, data: rquickjs::Value<'js>| -> rquickjs::Result<()> {
                    let bytes = value_to_bytes(&ctx, &data)?;
                    write_all(&st, id as u64, &bytes)
                        .map_err(|e| throw_code(&ctx, io_error_code(&e), &e.to_string()))
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "end",
            Func::from(move |id: f64| {
                let mut guard = st.borrow_mut();
                if let Some(socket) = guard.sockets.get_mut(&(id as u64)) {
                    match &mut socket.stream {
                        SocketStream::Tcp(tcp) => {
                            tcp.shutdown(Shutdown::Write).ok();
                        }
                        SocketStream::Tls(tls) => {
                            tls.conn.send_close_notify();
                            let _ = tls.conn.complete_io(&mut tls.sock);
                            tls.sock.shutdown(Shutdown::Write).ok();
                        }
                    }
                }
            }),
        )?;

        let st = state.clone();
        ops.set(
            "destroy",
            Func::from(move |id: f64| {
                st.borrow_mut().sockets.remove(&(id as u64));
            }),
        )?;

        for event in ["data", "end", "error"] {
            let st = state.clone();
            let op_name = format!(
                "on{}{}",
                event[..1].to_ascii_uppercase(),
                &event[1..]
            );
            ops.set(
                op_name.as_str(),
                Func::from(
                    move |ctx: Ctx<'js>, id: f64, callback: Function<'js>| -> rquickjs::Result<()> {
                        set_socket_callback(&ctx, &st, id as u64, event, callback)
                    },
                ),
            )?;
        }

        let st = state.clone();
        ops.set(
            "peerCertificate",
            Func::from(
                move |ctx: Ctx<'js>, id: f64| -> rquickjs::Result<Option<Object<'js>>> {
                    let guard = st.borrow();
                    let Some(socket) = guard.sockets.get(&(id as u64)) else {
                        return Ok(None);
                    };
                    let Some(der) = &socket.peer_cert_der else {
                        return Ok(None);
                    };
                    let cert = Object::new(ctx)?;
                    cert.set("raw", base64::engine::general_purpose::STANDARD.encode(der))?;
                    cert.set("byteLength", der.len())?;
                    Ok(Some(cert))
                },
            ),
        )?;

        Ok(ops)
    }
}

/// Emulated `tls` module: shares the socket table; only the CA-bundle view
/// is its own.
pub struct TlsModule;

impl GuestModule for TlsModule {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, _state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;
        ops.set(
            "rootSubjects",
            Func::from(|| -> Vec<String> {
                webpki_roots::TLS_SERVER_ROOTS
                    .iter()
                    .map(|anchor| {
                        base64::engine::general_purpose::STANDARD.encode(anchor.subject.as_ref())
                    })
                    .collect()
            }),
        )?;
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::state::{DeadlineState, GuestState};
    use rquickjs::{Context, Runtime};
    use std::io::Read;
    use std::time::Instant;

    #[test]
    fn test_connect_write_to_local_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buffer = Vec::new();
            conn.read_to_end(&mut buffer).unwrap();
            buffer
        });

        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let state = GuestState::new(
            "fn-test".into(),
            std::env::temp_dir(),
            vec![],
            DeadlineState::new(Instant::now() + Duration::from_secs(10)),
            Duration::from_secs(5),
        );
        context.with(|ctx| {
            let ops = NetModule.ops(&ctx, &state).unwrap();
            ctx.globals().set("__net", ops).unwrap();
            ctx.eval::<(), _>(&*format!(
                r#"
                const id = __net.connect('127.0.0.1', {}, false);
                __net.write(id, 'ping');
                __net.end(id);
                "#,
                addr.port()
            ))
            .unwrap();
        });

        assert_eq!(server.join().unwrap(), b"ping");
    }

    #[test]
    fn test_tls_root_bundle_nonempty() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let state = GuestState::new(
            "fn-test".into(),
            std::env::temp_dir(),
            vec![],
            DeadlineState::new(Instant::now() + Duration::from_secs(10)),
            Duration::from_secs(5),
        );
        context.with(|ctx| {
            let ops = TlsModule.ops(&ctx, &state).unwrap();
            ctx.globals().set("__tls", ops).unwrap();
            let count: usize = ctx.eval("__tls.rootSubjects().length").unwrap();
            assert!(count > 50);
        });
    }
}
