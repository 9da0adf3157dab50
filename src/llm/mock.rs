use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::VisionModel;
use crate::error::ModelError;
use crate::raster::PageImage;

/// Scripted model: queued results per page, then a fallback response.
pub(crate) struct MockModel {
    scripted: Mutex<HashMap<u32, VecDeque<Result<String, ModelError>>>>,
    fallback: String,
    calls: AtomicUsize,
}

impl MockModel {
    pub(crate) fn new(fallback: &str) -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            fallback: fallback.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn respond(self, page_index: u32, result: Result<String, ModelError>) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .entry(page_index)
            .or_default()
            .push_back(result);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VisionModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    fn extract(&self, image: &PageImage, _prompt: &str) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut scripted = self.scripted.lock().unwrap();
        match scripted
            .get_mut(&image.page_index)
            .and_then(VecDeque::pop_front)
        {
            Some(result) => result,
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Serves exactly one HTTP response on a loopback port. The join handle yields
/// the raw request text.
pub(crate) fn serve_once(status: u16, body: &str, delay: Duration) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let body = body.to_string();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let request = read_request(&mut stream);
        thread::sleep(delay);
        let response = format!(
            "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.flush();
        request
    });

    (format!("http://{address}"), handle)
}

/// Accepts one connection, reads the request and then writes `partial` before
/// closing the socket. An empty `partial` hangs up without any response.
pub(crate) fn serve_hangup(partial: &str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let partial = partial.to_string();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let request = read_request(&mut stream);
        let _ = stream.write_all(partial.as_bytes());
        let _ = stream.flush();
        request
    });

    (format!("http://{address}"), handle)
}

/// Loopback address with nothing listening on it.
pub(crate) fn closed_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{address}")
}

fn read_request(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let count = stream.read(&mut buffer).unwrap_or(0);
        if count == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..count]);

        let Some(header_end) = data.windows(4).position(|window| window == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&data[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if data.len() >= header_end + 4 + content_length {
            break;
        }
    }

    String::from_utf8_lossy(&data).into_owned()
}
