use std::net::SocketAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct Settings {
    #[arg(long, env = "STARBREEDER_BIND", default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    #[arg(long, env = "STARBREEDER_MODULE_DIR", default_value = ".", help = "Directory holding configs/")]
    pub module_dir: Utf8PathBuf,

    #[arg(long, env = "STARBREEDER_SCRATCH_DIR", help = "Base for per-request scratch roots")]
    pub scratch_dir: Option<Utf8PathBuf>,

    #[arg(long, env = "HTTP_TIMEOUT", default_value_t = 60)]
    pub http_timeout_secs: u64,

    #[arg(long, env = "STARBREEDER_TRANSFER_CONCURRENCY", default_value_t = 16)]
    pub transfer_concurrency: usize,

    #[arg(long, env = "STARBREEDER_TRANSFER_RETRIES", default_value_t = 2)]
    pub transfer_retries: usize,

    #[arg(long, env = "STARBREEDER_CHUNK_SIZE", default_value_t = 64 * 1024)]
    pub chunk_size: usize,

    #[arg(long, env = "STARBREEDER_MODULE_WORKERS")]
    pub module_workers: Option<usize>,

    #[arg(long, env = "STARBREEDER_REQUEST_TIMEOUT", default_value_t = 3600, help = "Request deadline in seconds, 0 disables it")]
    pub request_timeout_secs: u64,

    #[arg(long, env = "STARBREEDER_MODULE_GRACE", default_value_t = 10)]
    pub module_grace_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            module_dir: Utf8PathBuf::from("."),
            scratch_dir: None,
            http_timeout_secs: 60,
            transfer_concurrency: 16,
            transfer_retries: 2,
            chunk_size: 64 * 1024,
            module_workers: None,
            request_timeout_secs: 3600,
            module_grace_secs: 10,
        }
    }
}

impl Settings {
    pub fn configs_dir(&self) -> Utf8PathBuf {
        self.module_dir.join("configs")
    }

    pub fn scratch_base(&self) -> Utf8PathBuf {
        self.scratch_dir.clone().unwrap_or_else(|| {
            Utf8PathBuf::from_path_buf(std::env::temp_dir())
                .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn module_workers(&self) -> usize {
        self.module_workers
            .filter(|workers| *workers > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            })
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn module_grace(&self) -> Duration {
        Duration::from_secs(self.module_grace_secs)
    }
}
