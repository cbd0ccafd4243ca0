use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

#[cfg(feature = "tch-backend")]
use std::path::PathBuf;

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::rewriter::GenerationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub backend: BackendKind,
    pub model_id: String,
    pub endpoint_url: Option<String>,
    pub api_key: Option<String>,
    pub base_max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub warmup: bool,
    #[cfg(feature = "tch-backend")]
    pub module_path: PathBuf,
    #[cfg(feature = "tch-backend")]
    pub tokenizer_path: PathBuf,
    #[cfg(feature = "tch-backend")]
    pub model_repo: Option<String>,
    #[cfg(feature = "tch-backend")]
    pub eos_token_id: i64,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let backend = match env::var("BACKEND").as_deref() {
            Ok("local") => BackendKind::Local,
            Ok("remote") => BackendKind::Remote,
            Ok(other) => anyhow::bail!("unknown BACKEND '{other}', expected 'local' or 'remote'"),
            Err(_) => default_backend(),
        };

        let model_id =
            env::var("MODEL_ID").unwrap_or_else(|_| "Qwen/Qwen2.5-0.5B-Instruct-GGUF".to_string());
        let endpoint_url = env::var("ENDPOINT_URL").ok();
        let api_key = env::var("HF_API_KEY").ok();

        let base_max_tokens = env::var("BASE_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);
        let temperature = env::var("TEMPERATURE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.5);
        let top_p = env::var("TOP_P")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.95);
        let warmup = env::var("WARMUP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(true);

        #[cfg(feature = "tch-backend")]
        let module_path = PathBuf::from(
            env::var("MODULE_PATH").unwrap_or_else(|_| "models/generator.ts".to_string()),
        );
        #[cfg(feature = "tch-backend")]
        let tokenizer_path = PathBuf::from(
            env::var("TOKENIZER_PATH").unwrap_or_else(|_| "models/tokenizer.json".to_string()),
        );
        #[cfg(feature = "tch-backend")]
        let model_repo = env::var("MODEL_REPO").ok();
        #[cfg(feature = "tch-backend")]
        let eos_token_id = env::var("EOS_TOKEN_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50256);
        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = env::var("DEVICE").unwrap_or_else(|_| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            backend,
            model_id,
            endpoint_url,
            api_key,
            base_max_tokens,
            temperature,
            top_p,
            warmup,
            #[cfg(feature = "tch-backend")]
            module_path,
            #[cfg(feature = "tch-backend")]
            tokenizer_path,
            #[cfg(feature = "tch-backend")]
            model_repo,
            #[cfg(feature = "tch-backend")]
            eos_token_id,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }

    pub fn generation(&self) -> GenerationConfig {
        GenerationConfig {
            base_max_tokens: self.base_max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            ..GenerationConfig::default()
        }
    }
}

fn default_backend() -> BackendKind {
    if cfg!(feature = "tch-backend") {
        BackendKind::Local
    } else {
        BackendKind::Remote
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
