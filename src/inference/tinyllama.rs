use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache, Config as ModelConfig, Llama, LlamaConfig};
use candle_transformers::utils::apply_repeat_penalty;
use hf_hub::api::sync::Api;
use tokenizers::Tokenizer;
use tracing::info;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::{fs, sync::Arc};
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::conversation::EOS_TOKEN;
use crate::inference::{Generate, GenerationParams};

// ---------------------------------------------------------
// PUBLIC SERVICE
// ---------------------------------------------------------
/// One-time-loaded TinyLlama handle. Weights are immutable; the mutex only
/// serializes device compute, and every generation call owns its KV cache.
pub struct TinyLlamaService {
    model: Mutex<Llama>,
    tokenizer: Arc<Tokenizer>,
    config: ModelConfig,
    device: Device,
    dtype: DType,
    eos_token_id: u32,
}

struct SnapshotFiles {
    tokenizer: PathBuf,
    config: PathBuf,
    weights: Vec<PathBuf>,
}

impl TinyLlamaService {
    /// Load from the configured local snapshot dir, or pull the snapshot
    /// from the Hub by repo id.
    pub fn load(cfg: &ServerConfig) -> Result<Self> {
        match &cfg.model_dir {
            Some(dir) => Self::from_local_dir(dir),
            None => Self::from_hub(&cfg.model_id),
        }
    }

    pub fn from_local_dir(snapshot_dir: &Path) -> Result<Self> {
        println!("📁 Snapshot: {}", snapshot_dir.display());
        Self::from_files(local_snapshot_files(snapshot_dir)?)
    }

    pub fn from_hub(model_id: &str) -> Result<Self> {
        println!("📥 Fetching {model_id} from the Hugging Face Hub...");
        Self::from_files(hub_snapshot_files(model_id)?)
    }

    fn from_files(files: SnapshotFiles) -> Result<Self> {
        let device = Device::cuda_if_available(0)?;
        let dtype = if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        };
        println!("🔌 TinyLlama → {device:?} ({dtype:?})");

        // ---- Load tokenizer ----
        let tokenizer = Arc::new(
            Tokenizer::from_file(&files.tokenizer)
                .map_err(|e| anyhow!("Tokenizer error: {e}"))?,
        );

        let eos_token_id = tokenizer
            .token_to_id(EOS_TOKEN)
            .or_else(|| tokenizer.token_to_id("<eos>"))
            .unwrap_or(u32::MAX);

        // ---- Load config ----
        let llama_cfg: LlamaConfig = serde_json::from_slice(&fs::read(&files.config)?)
            .context("model config.json parse error")?;
        let config = llama_cfg.into_config(false);

        // ---- mmap the model weights ----
        println!("📦 Found {} weight file(s)", files.weights.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        println!("🚀 TinyLlama loaded, ready to chat");

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            config,
            device,
            dtype,
            eos_token_id,
        })
    }

    // -----------------------------------------------------
    // Generation
    // -----------------------------------------------------
    /// Run the decode loop over a fully rendered prompt and return the whole
    /// decoded sequence (special tokens skipped). Reply extraction happens
    /// upstream against the chat markup.
    pub async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let enc = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        let mut tokens = enc.get_ids().to_vec();
        let prompt_len = tokens.len();

        // Fresh KV cache per request; nothing mutable is shared across
        // concurrent generations.
        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;

        let seed = params.seed.unwrap_or_else(clock_seed);
        let mut lp = LogitsProcessor::new(seed, Some(params.temperature), Some(params.top_p));

        let mut pos = 0usize;

        for _ in 0..params.max_new_tokens {
            let ctx: &[u32] = if pos == 0 {
                &tokens
            } else {
                std::slice::from_ref(tokens.last().unwrap())
            };

            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;

            let logits = {
                let m = self.model.lock().await;
                m.forward(&input, pos, &mut cache)?
                    .squeeze(0)?
                    .to_dtype(DType::F32)?
            };

            pos += ctx.len();

            let logits = if params.repeat_penalty == 1.0 {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(params.repeat_last_n);
                apply_repeat_penalty(&logits, params.repeat_penalty, &tokens[start_at..])?
            };

            let next_id = lp.sample(&logits)?;
            tokens.push(next_id);

            if next_id == self.eos_token_id {
                break;
            }

            tokio::task::yield_now().await;
        }

        info!(
            prompt_tokens = prompt_len,
            new_tokens = tokens.len() - prompt_len,
            "generation finished"
        );

        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {e}"))?;

        Ok(text)
    }
}

impl Generate for TinyLlamaService {
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        params: &'a GenerationParams,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(TinyLlamaService::generate(self, prompt, params))
    }
}

// ---------------------------------------------------------
// Snapshot resolution
// ---------------------------------------------------------
fn local_snapshot_files(dir: &Path) -> Result<SnapshotFiles> {
    let single = dir.join("model.safetensors");
    let weights = if single.exists() {
        vec![single]
    } else {
        shard_paths(dir)?
    };

    Ok(SnapshotFiles {
        tokenizer: dir.join("tokenizer.json"),
        config: dir.join("config.json"),
        weights,
    })
}

fn shard_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    let index_json: serde_json::Value = serde_json::from_slice(
        &fs::read(&index_path)
            .with_context(|| format!("no model.safetensors or index under {}", dir.display()))?,
    )?;

    let shards = shard_names(&index_json)?
        .into_iter()
        .map(|name| dir.join(name))
        .collect();
    Ok(shards)
}

fn hub_snapshot_files(model_id: &str) -> Result<SnapshotFiles> {
    let api = Api::new()?;
    let repo = api.model(model_id.to_string());

    let tokenizer = repo.get("tokenizer.json")?;
    let config = repo.get("config.json")?;

    let weights = match repo.get("model.safetensors") {
        Ok(single) => vec![single],
        Err(_) => {
            let index_path = repo.get("model.safetensors.index.json")?;
            let index_json: serde_json::Value = serde_json::from_slice(&fs::read(&index_path)?)?;
            shard_names(&index_json)?
                .into_iter()
                .map(|name| Ok(repo.get(&name)?))
                .collect::<Result<Vec<_>>>()?
        }
    };

    Ok(SnapshotFiles {
        tokenizer,
        config,
        weights,
    })
}

fn shard_names(index_json: &serde_json::Value) -> Result<Vec<String>> {
    let names: BTreeSet<String> = index_json["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("safetensors index: weight_map is not an object"))?
        .values()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("invalid shard entry in safetensors index"))
        })
        .collect::<Result<_>>()?;
    Ok(names.into_iter().collect())
}

fn clock_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{extract_reply, PromptTemplate};

    fn local_snapshot() -> Option<PathBuf> {
        let snapshot = PathBuf::from("models/tinyllama");
        if snapshot.join("model.safetensors").exists() {
            Some(snapshot)
        } else {
            eprintln!(
                "tinyllama snapshot missing under {}, skipping test",
                snapshot.display()
            );
            None
        }
    }

    #[tokio::test]
    async fn fixed_seed_generation_is_deterministic() {
        let Some(snapshot) = local_snapshot() else {
            return;
        };
        let svc = TinyLlamaService::from_local_dir(&snapshot).expect("failed to load model");
        let template = PromptTemplate::load(None).unwrap();
        let prompt = template
            .render(&[crate::conversation::ChatTurn::user("Say hi")])
            .unwrap();

        let params = GenerationParams {
            max_new_tokens: 16,
            seed: Some(42),
            ..Default::default()
        };

        let first = svc.generate(&prompt, &params).await.expect("generation failed");
        let second = svc.generate(&prompt, &params).await.expect("generation failed");
        assert_eq!(first, second);
        assert!(!extract_reply(&first).is_empty());
    }
}
