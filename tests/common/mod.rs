//! Shared fixtures: an in-memory distribution host and a recording device

#![allow(dead_code)]

use laiska_lib::engine::device::{DeviceControl, StatusSignal};
use laiska_lib::engine::updater::download::{BaseUrl, Connector, Fetcher, RetryPolicy, Transport};
use laiska_lib::engine::updater::{DeviceLayout, OtaContext};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const BASE_URL: &str = "https://files.example.com/fw/";

pub fn sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Default)]
struct HostState {
    files: HashMap<String, Vec<u8>>,
    /// Remaining forced failures per path
    failures: HashMap<String, u32>,
    requests: Vec<String>,
}

/// Static file host reachable through `Connector`
#[derive(Clone, Default)]
pub struct FileHost {
    state: Arc<Mutex<HostState>>,
}

impl FileHost {
    pub fn put(&self, path: &str, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_vec());
    }

    /// Reset the connection mid-body on the next `times` requests for `path`
    pub fn fail(&self, path: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(path.to_string(), times);
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_for(&self, path: &str) -> usize {
        self.requests().iter().filter(|p| p.as_str() == path).count()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    fn respond(&self, request: &[u8]) -> Vec<io::Result<Vec<u8>>> {
        let request = String::from_utf8_lossy(request);
        let target = request.split_whitespace().nth(1).unwrap_or_default();
        let path = target
            .trim_start_matches("/fw/")
            .trim_end_matches("?raw=True")
            .to_string();

        let mut state = self.state.lock().unwrap();
        state.requests.push(path.clone());

        if let Some(remaining) = state.failures.get_mut(&path) {
            if *remaining > 0 {
                *remaining -= 1;
                return vec![
                    Ok(b"HTTP/1.1 200 OK\r\n\r\n".to_vec()),
                    Err(io::Error::from(io::ErrorKind::ConnectionReset)),
                ];
            }
        }

        match state.files.get(&path) {
            Some(body) => {
                let mut response = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_vec();
                response.extend_from_slice(body);
                vec![Ok(response)]
            }
            None => vec![Ok(b"HTTP/1.1 404 Not Found\r\n\r\n404: Not Found".to_vec())],
        }
    }
}

struct HostStream {
    host: FileHost,
    request: Vec<u8>,
    response: Option<Vec<io::Result<Vec<u8>>>>,
    current: Cursor<Vec<u8>>,
}

impl Read for HostStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.response.is_none() {
            let mut parts = self.host.respond(&self.request);
            parts.reverse();
            self.response = Some(parts);
        }
        loop {
            let n = self.current.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            match self.response.as_mut().and_then(|r| r.pop()) {
                Some(Ok(next)) => self.current = Cursor::new(next),
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
    }
}

impl Write for HostStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.request.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connector for FileHost {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Transport>> {
        assert_eq!((host, port), ("files.example.com", 443));
        Ok(Box::new(HostStream {
            host: self.clone(),
            request: Vec::new(),
            response: None,
            current: Cursor::new(Vec::new()),
        }))
    }
}

/// Records signal and device calls in order
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<&'static str>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }
}

impl StatusSignal for Recorder {
    fn update_in_progress(&self) {
        self.push("in_progress");
    }

    fn update_succeeded(&self) {
        self.push("succeeded");
    }

    fn update_failed(&self) {
        self.push("failed");
    }
}

impl DeviceControl for Recorder {
    fn reset(&self) {
        self.push("reset");
    }
}

pub struct Node {
    pub dir: TempDir,
    pub host: FileHost,
    pub ctx: OtaContext,
}

impl Node {
    pub fn layout(&self) -> &DeviceLayout {
        &self.ctx.layout
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn read(&self, rel: &str) -> Vec<u8> {
        fs::read(self.root().join(rel)).unwrap()
    }
}

/// Manifest JSON for `(local path, content)` pairs served from `src/<path>`
pub fn manifest_json(version: u32, files: &[(&str, &[u8])], dirs: &[&str], excluded: &[&str]) -> String {
    let files: Vec<_> = files
        .iter()
        .map(|(path, content)| {
            serde_json::json!({
                "repository": format!("src/{}", path),
                "pico": path,
                "check": sha256(content),
            })
        })
        .collect();
    serde_json::json!({
        "version": version,
        "files_included": files,
        "directories_included": dirs,
        "files_excluded": excluded,
    })
    .to_string()
}

/// Device at version 1 with `main.py` and `lib/sensor.py` installed, plus a host
/// serving version 2 of the same files and a new `lib/extra.py`.
pub fn node_with_release() -> Node {
    let v1_main: &[u8] = b"print('v1')";
    let v1_sensor: &[u8] = b"SENSOR = 1";
    let v2_main: &[u8] = b"print('v2')";
    let v2_sensor: &[u8] = b"SENSOR = 2";
    let v2_extra: &[u8] = b"EXTRA = True";

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir(root.join("lib")).unwrap();
    fs::write(root.join("main.py"), v1_main).unwrap();
    fs::write(root.join("lib/sensor.py"), v1_sensor).unwrap();
    fs::write(root.join("legacy.py"), b"old helper").unwrap();
    fs::write(
        root.join("version.json"),
        manifest_json(1, &[("main.py", v1_main), ("lib/sensor.py", v1_sensor)], &["lib"], &[]),
    )
    .unwrap();

    let host = FileHost::default();
    host.put(
        "version.json",
        manifest_json(
            2,
            &[("main.py", v2_main), ("lib/sensor.py", v2_sensor), ("lib/extra.py", v2_extra)],
            &["lib"],
            &["legacy.py"],
        )
        .as_bytes(),
    );
    host.put("src/main.py", v2_main);
    host.put("src/lib/sensor.py", v2_sensor);
    host.put("src/lib/extra.py", v2_extra);

    let fetcher = Fetcher::new(
        Box::new(host.clone()),
        BaseUrl::parse(BASE_URL).unwrap(),
        RetryPolicy::immediate(),
        Arc::new(Recorder::default()),
    )
    .with_chunk_size(5);
    let ctx = OtaContext::new(DeviceLayout::new(root), fetcher);

    Node { dir, host, ctx }
}
