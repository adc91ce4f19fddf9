#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tokio::net::TcpListener;

use starbreeder_sdk::batch::{RetryPolicy, TransferBatch};
use starbreeder_sdk::executor::ModuleExecutor;
use starbreeder_sdk::orchestrator::Orchestrator;
use starbreeder_sdk::scratch::ScratchSpace;
use starbreeder_sdk::transfer::HttpTransport;
use starbreeder_sdk::{Config, Module, ModuleContext, ModuleResult};

pub const CONFIG: &str = r#"
initialize:
  root_individuals:
    alpha: {method: random}
    beta: {method: random}
    gamma: {method: random, params: {seed: 3}}
evaluate:
  phenotype:
    fitness: {name: fitness.json, content_type: application/json}
    trace: {name: trace.txt, content_type: text/plain}
generate:
  population_size: 4
selection:
  tournament: 2
"#;

#[derive(Default)]
struct StoreState {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    content_types: Mutex<HashMap<String, String>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl StoreState {
    fn attempt(&self, route: String) {
        *self.attempts.lock().unwrap().entry(route).or_default() += 1;
    }
}

pub struct ObjectStore {
    addr: SocketAddr,
    state: Arc<StoreState>,
}

impl ObjectStore {
    pub async fn start() -> Self {
        let state = Arc::new(StoreState::default());
        let app = Router::new()
            .route("/objects/{key}", get(get_object).put(put_object))
            .route("/status/{code}", get(fixed_status).put(fixed_status))
            .route("/slow/{key}", get(slow).put(slow))
            .route("/drip/{chunks}/{delay_ms}", get(drip))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self, key: &str) -> String {
        format!("http://{}/objects/{key}", self.addr)
    }

    pub fn status_url(&self, code: u16) -> String {
        format!("http://{}/status/{code}", self.addr)
    }

    pub fn slow_url(&self, key: &str) -> String {
        format!("http://{}/slow/{key}", self.addr)
    }

    // Streams `chunks` KiB, one per `delay`, so the body keeps arriving for a long time.
    pub fn drip_url(&self, chunks: usize, delay: Duration) -> String {
        format!("http://{}/drip/{chunks}/{}", self.addr, delay.as_millis())
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.state
            .objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.objects.lock().unwrap().get(key).cloned()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.state.content_types.lock().unwrap().get(key).cloned()
    }

    pub fn attempts(&self, route: &str) -> usize {
        self.state
            .attempts
            .lock()
            .unwrap()
            .get(route)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.state.attempts.lock().unwrap().values().sum()
    }
}

async fn get_object(State(state): State<Arc<StoreState>>, Path(key): Path<String>) -> Response {
    state.attempt(format!("GET {key}"));
    match state.objects.lock().unwrap().get(&key).cloned() {
        Some(bytes) => bytes.into_response(),
        None => (StatusCode::NOT_FOUND, "NoSuchKey").into_response(),
    }
}

async fn put_object(
    State(state): State<Arc<StoreState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.attempt(format!("PUT {key}"));
    if let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        state
            .content_types
            .lock()
            .unwrap()
            .insert(key.clone(), content_type.to_string());
    }
    state.objects.lock().unwrap().insert(key, body.to_vec());
    StatusCode::OK
}

async fn fixed_status(State(state): State<Arc<StoreState>>, Path(code): Path<u16>) -> StatusCode {
    state.attempt(format!("status {code}"));
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn slow(Path(_key): Path<String>) -> StatusCode {
    tokio::time::sleep(Duration::from_secs(30)).await;
    StatusCode::OK
}

pub const DRIP_CHUNK: usize = 1024;

async fn drip(Path((chunks, delay_ms)): Path<(usize, u64)>) -> Response {
    let stream = futures::stream::unfold(0usize, move |sent| async move {
        if sent == chunks {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Some((Ok::<_, std::io::Error>(Bytes::from(vec![b'x'; DRIP_CHUNK])), sent + 1))
    });
    Body::from_stream(stream).into_response()
}

pub fn genotype_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("genotype/{name}"), *data)
            .unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn archive_entries(bytes: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(bytes);
    archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
    Sleep(Duration),
    // Works in small steps for up to the given time, stopping once the request is cancelled.
    Cooperative(Duration),
    Parentage(Vec<Vec<usize>>),
}

pub struct MockModule {
    behavior: Behavior,
    calls: AtomicUsize,
    evaluated: Mutex<Vec<usize>>,
}

impl MockModule {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            evaluated: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn evaluated(&self) -> Vec<usize> {
        self.evaluated.lock().unwrap().clone()
    }

    fn enter(&self, context: &ModuleContext) -> ModuleResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Fail => Err("scripted module failure".into()),
            Behavior::Panic => panic!("scripted module panic"),
            Behavior::Sleep(duration) => {
                std::thread::sleep(*duration);
                Ok(())
            }
            Behavior::Cooperative(duration) => {
                let step = Duration::from_millis(5);
                let mut elapsed = Duration::ZERO;
                while elapsed < *duration {
                    context.check()?;
                    std::thread::sleep(step);
                    elapsed += step;
                }
                Ok(())
            }
            Behavior::Succeed | Behavior::Parentage(_) => Ok(()),
        }
    }
}

impl Module for MockModule {
    fn name(&self) -> &str {
        "mock"
    }

    fn initialize(
        &self,
        genotype_dirs: &BTreeMap<String, Utf8PathBuf>,
        _config: &Config,
        _params: Option<&Value>,
        context: &ModuleContext,
    ) -> ModuleResult<()> {
        self.enter(context)?;
        for (key, dir) in genotype_dirs {
            std::fs::write(dir.join("seed.txt"), key)?;
        }
        Ok(())
    }

    fn evaluate(
        &self,
        genotype_dirs: &[Utf8PathBuf],
        phenotype_dirs: &[Utf8PathBuf],
        config: &Config,
        _params: Option<&Value>,
        context: &ModuleContext,
    ) -> ModuleResult<()> {
        self.enter(context)?;
        self.evaluated.lock().unwrap().push(genotype_dirs.len());
        for (genotype, phenotype) in genotype_dirs.iter().zip(phenotype_dirs) {
            let seed = std::fs::read_to_string(genotype.join("seed.txt"))?;
            for file in config.evaluate.phenotype.values() {
                std::fs::write(phenotype.join(&file.name), format!("{{\"seed\": \"{seed}\"}}"))?;
            }
        }
        Ok(())
    }

    fn generate(
        &self,
        parent_dirs: &[Utf8PathBuf],
        child_dirs: &[Utf8PathBuf],
        _config: &Config,
        _params: Option<&Value>,
        context: &ModuleContext,
    ) -> ModuleResult<Vec<Vec<usize>>> {
        self.enter(context)?;
        for (index, child) in child_dirs.iter().enumerate() {
            std::fs::write(child.join("child.txt"), format!("child {index}"))?;
        }
        match &self.behavior {
            Behavior::Parentage(parentage) => Ok(parentage.clone()),
            _ => Ok((0..child_dirs.len())
                .map(|index| vec![index % parent_dirs.len().max(1)])
                .collect()),
        }
    }
}

pub struct Workspace {
    _temp: tempfile::TempDir,
    pub module_dir: Utf8PathBuf,
    pub scratch_base: Utf8PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let module_dir = root.join("module");
        std::fs::create_dir_all(module_dir.join("configs")).unwrap();
        std::fs::write(module_dir.join("configs/default.yaml"), CONFIG).unwrap();
        let scratch_base = root.join("scratch");
        std::fs::create_dir_all(&scratch_base).unwrap();
        Self {
            _temp: temp,
            module_dir,
            scratch_base,
        }
    }

    pub fn configs_dir(&self) -> Utf8PathBuf {
        self.module_dir.join("configs")
    }

    pub fn orchestrator(&self, module: Arc<MockModule>) -> Orchestrator {
        self.orchestrator_with_base(module, &self.scratch_base)
    }

    pub fn orchestrator_with_base(&self, module: Arc<MockModule>, base: &Utf8Path) -> Orchestrator {
        let transport = HttpTransport::new(Duration::from_secs(5), 512).unwrap();
        let retry = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
        };
        let transfers = TransferBatch::new(Arc::new(transport), 4, retry);
        let executor = ModuleExecutor::new(2, Duration::from_millis(500));
        Orchestrator::new(
            module,
            self.configs_dir(),
            ScratchSpace::new(base),
            transfers,
            executor,
        )
    }

    pub fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(&self.scratch_base).unwrap().next().is_none()
    }

    // For cleanup that finishes on a background thread.
    pub async fn scratch_empties_within(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.scratch_is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.scratch_is_empty()
    }
}
