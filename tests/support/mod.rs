//! Test support: a minimal in-process EPMD.
//!
//! Serves just enough of the EPMD protocol for two nodes to find each
//! other: ALIVE2 registration (held while the socket lives), PORT_PLEASE2
//! lookup, NAMES listing and STOP.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};

const TAG_NAMES_REQ: u8 = 110;
const TAG_STOP_REQ: u8 = 115;
const TAG_PORT2_RESP: u8 = 119;
const TAG_ALIVE2_REQ: u8 = 120;
const TAG_ALIVE2_RESP: u8 = 121;
const TAG_PORT_PLEASE2_REQ: u8 = 122;

type Registry = Arc<Mutex<HashMap<String, u16>>>;

pub struct MiniEpmd {
    port: u16,
    handle: tokio::task::JoinHandle<()>,
}

impl MiniEpmd {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let port = listener.local_addr().expect("no local addr").port();
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let handle = tokio::spawn(async move {
            let mut creation: u16 = 0;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                creation = creation.wrapping_add(1).max(1);
                tokio::spawn(serve(stream, Arc::clone(&registry), creation));
            }
        });
        Self { port, handle }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for MiniEpmd {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream, registry: Registry, creation: u16) {
    let Ok(len) = stream.read_u16().await else {
        return;
    };
    let mut buf = vec![0; usize::from(len)];
    if stream.read_exact(&mut buf).await.is_err() || buf.is_empty() {
        return;
    }
    match buf[0] {
        TAG_ALIVE2_REQ => {
            let port = u16::from_be_bytes([buf[1], buf[2]]);
            let nlen = usize::from(u16::from_be_bytes([buf[9], buf[10]]));
            let name = String::from_utf8_lossy(&buf[11..11 + nlen]).into_owned();
            registry.lock().unwrap().insert(name.clone(), port);

            let mut resp = vec![TAG_ALIVE2_RESP, 0];
            resp.extend_from_slice(&creation.to_be_bytes());
            if stream.write_all(&resp).await.is_err() {
                registry.lock().unwrap().remove(&name);
                return;
            }
            // The registration lives exactly as long as this socket.
            let mut byte = [0; 1];
            let _ = stream.read(&mut byte).await;
            registry.lock().unwrap().remove(&name);
        }
        TAG_PORT_PLEASE2_REQ => {
            let name = String::from_utf8_lossy(&buf[1..]).into_owned();
            let entry = registry.lock().unwrap().get(&name).copied();
            let resp = match entry {
                Some(port) => {
                    let mut r = vec![TAG_PORT2_RESP, 0];
                    r.extend_from_slice(&port.to_be_bytes());
                    r.push(72); // hidden node
                    r.push(0); // tcp/ipv4
                    r.extend_from_slice(&5u16.to_be_bytes());
                    r.extend_from_slice(&5u16.to_be_bytes());
                    r.extend_from_slice(&(name.len() as u16).to_be_bytes());
                    r.extend_from_slice(name.as_bytes());
                    r.extend_from_slice(&0u16.to_be_bytes());
                    r
                }
                None => vec![TAG_PORT2_RESP, 1],
            };
            let _ = stream.write_all(&resp).await;
        }
        TAG_NAMES_REQ => {
            let text: String = registry
                .lock()
                .unwrap()
                .iter()
                .map(|(name, port)| format!("name {} at port {}\n", name, port))
                .collect();
            let mut resp = Vec::new();
            resp.extend_from_slice(&4369u32.to_be_bytes());
            resp.extend_from_slice(text.as_bytes());
            let _ = stream.write_all(&resp).await;
        }
        TAG_STOP_REQ => {
            let name = String::from_utf8_lossy(&buf[1..]).into_owned();
            let removed = registry.lock().unwrap().remove(&name).is_some();
            let resp: &[u8] = if removed { b"STOPPED" } else { b"NOEXIST" };
            let _ = stream.write_all(resp).await;
        }
        _ => {}
    }
}
