//! GPT-2 style decoder family.
//!
//! Top-level children, in order: `wte`, `wpe`, `drop`, `h.0` .. `h.{n-1}`,
//! `ln_f`, `lm_head`. Parameter names follow the Hugging Face GPT-2 checkpoint
//! layout, so `model.safetensors` files load without renaming.

use super::{
    ensure_on, route, Activation, Architecture, DecoderLayout, DeviceLink, LanguageModel,
    ParameterStore,
};
use crate::device::DeviceRole;
use crate::errors::{EngineError, Result};
use crate::tensor_ops::{
    embed_tokens, gelu, layer_norm, linear, matmul, softmax, Lcg, Tensor1D, Tensor2D,
};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_layer_norm_epsilon() -> f32 {
    1e-5
}

/// Hyperparameters, read from the checkpoint's `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f32,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.n_positions == 0 || self.n_embd == 0 || self.n_head == 0 {
            return Err(EngineError::Load(format!(
                "decoder config has a zero dimension: {:?}",
                self
            )));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(EngineError::Load(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        Ok(())
    }

    /// Every parameter name with its checkpoint shape.
    fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let n = self.n_embd;
        let mut shapes = vec![
            ("wte.weight".to_string(), vec![self.vocab_size, n]),
            ("wpe.weight".to_string(), vec![self.n_positions, n]),
        ];

        for i in 0..self.n_layer {
            let p = format!("h.{}", i);
            shapes.extend([
                (format!("{}.ln_1.weight", p), vec![n]),
                (format!("{}.ln_1.bias", p), vec![n]),
                (format!("{}.attn.c_attn.weight", p), vec![n, 3 * n]),
                (format!("{}.attn.c_attn.bias", p), vec![3 * n]),
                (format!("{}.attn.c_proj.weight", p), vec![n, n]),
                (format!("{}.attn.c_proj.bias", p), vec![n]),
                (format!("{}.ln_2.weight", p), vec![n]),
                (format!("{}.ln_2.bias", p), vec![n]),
                (format!("{}.mlp.c_fc.weight", p), vec![n, 4 * n]),
                (format!("{}.mlp.c_fc.bias", p), vec![4 * n]),
                (format!("{}.mlp.c_proj.weight", p), vec![4 * n, n]),
                (format!("{}.mlp.c_proj.bias", p), vec![n]),
            ]);
        }

        shapes.extend([
            ("ln_f.weight".to_string(), vec![n]),
            ("ln_f.bias".to_string(), vec![n]),
            ("lm_head.weight".to_string(), vec![self.vocab_size, n]),
        ]);

        shapes
    }
}

#[derive(Debug, Clone)]
struct Dense {
    /// `[in, out]`
    weight: Tensor2D,
    bias: Tensor1D,
}

impl Dense {
    fn forward(&self, x: &Tensor2D) -> Result<Tensor2D> {
        linear(x, &self.weight, Some(&self.bias))
    }
}

#[derive(Debug, Clone)]
struct Norm {
    gamma: Tensor1D,
    beta: Tensor1D,
}

impl Norm {
    fn identity(len: usize) -> Self {
        Self {
            gamma: Tensor1D::new(vec![1.0; len]),
            beta: Tensor1D::zeros(len),
        }
    }
}

#[derive(Debug, Clone)]
struct Block {
    ln_1: Norm,
    c_attn: Dense,
    attn_proj: Dense,
    ln_2: Norm,
    c_fc: Dense,
    mlp_proj: Dense,
}

/// Moves an activation toward the device a sub-module lives on.
type Router<'a> = dyn FnMut(Activation, DeviceRole, &str) -> Result<Activation> + 'a;

/// Host-memory GPT-2 decoder.
pub struct ReferenceDecoder {
    config: DecoderConfig,
    wte: Tensor2D,
    wpe: Tensor2D,
    blocks: Vec<Block>,
    ln_f: Norm,
    /// `[n_embd, vocab]`
    lm_head: Tensor2D,
    params: ParameterStore,
}

impl ReferenceDecoder {
    /// Deterministic Xavier-initialized weights.
    pub fn seeded(config: DecoderConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = Lcg::new(seed);
        let n = config.n_embd;

        let mut matrix = |rows: usize, cols: usize| -> Result<Tensor2D> {
            let data = (0..rows * cols)
                .map(|_| rng.xavier_uniform(rows, cols))
                .collect();
            Tensor2D::new(data, rows, cols)
        };

        let wte = matrix(config.vocab_size, n)?;
        let wpe = matrix(config.n_positions, n)?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for _ in 0..config.n_layer {
            blocks.push(Block {
                ln_1: Norm::identity(n),
                c_attn: Dense {
                    weight: matrix(n, 3 * n)?,
                    bias: Tensor1D::zeros(3 * n),
                },
                attn_proj: Dense {
                    weight: matrix(n, n)?,
                    bias: Tensor1D::zeros(n),
                },
                ln_2: Norm::identity(n),
                c_fc: Dense {
                    weight: matrix(n, 4 * n)?,
                    bias: Tensor1D::zeros(4 * n),
                },
                mlp_proj: Dense {
                    weight: matrix(4 * n, n)?,
                    bias: Tensor1D::zeros(n),
                },
            });
        }

        let lm_head = matrix(n, config.vocab_size)?;

        Ok(Self::assemble(config, wte, wpe, blocks, Norm::identity(n), lm_head))
    }

    /// Load F32 weights from a safetensors buffer.
    ///
    /// A `transformer.` name prefix is accepted. A missing `lm_head.weight` means
    /// the head is tied to the token embeddings.
    pub fn from_safetensors(config: DecoderConfig, bytes: &[u8]) -> Result<Self> {
        config.validate()?;
        let tensors = SafeTensors::deserialize(bytes)
            .map_err(|e| EngineError::Load(format!("safetensors: {}", e)))?;

        let mut table = WeightTable::default();
        for (name, view) in tensors.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(EngineError::Load(format!(
                    "tensor '{}' has dtype {:?}, only F32 is supported",
                    name,
                    view.dtype()
                )));
            }
            let data = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            let key = name.strip_prefix("transformer.").unwrap_or(&name).to_string();
            table.0.insert(key, (view.shape().to_vec(), data));
        }

        let n = config.n_embd;
        let wte = table.matrix("wte.weight", config.vocab_size, n)?;
        let wpe = table.matrix("wpe.weight", config.n_positions, n)?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            let p = format!("h.{}", i);
            blocks.push(Block {
                ln_1: table.norm(&format!("{}.ln_1", p), n)?,
                c_attn: table.dense(&format!("{}.attn.c_attn", p), n, 3 * n)?,
                attn_proj: table.dense(&format!("{}.attn.c_proj", p), n, n)?,
                ln_2: table.norm(&format!("{}.ln_2", p), n)?,
                c_fc: table.dense(&format!("{}.mlp.c_fc", p), n, 4 * n)?,
                mlp_proj: table.dense(&format!("{}.mlp.c_proj", p), 4 * n, n)?,
            });
        }

        let ln_f = table.norm("ln_f", n)?;
        let lm_head = if table.0.contains_key("lm_head.weight") {
            table.matrix("lm_head.weight", config.vocab_size, n)?.transpose()
        } else {
            tracing::debug!("No lm_head.weight, tying output projection to wte");
            wte.transpose()
        };

        Ok(Self::assemble(config, wte, wpe, blocks, ln_f, lm_head))
    }

    fn assemble(
        config: DecoderConfig,
        wte: Tensor2D,
        wpe: Tensor2D,
        blocks: Vec<Block>,
        ln_f: Norm,
        lm_head: Tensor2D,
    ) -> Self {
        let mut params = ParameterStore::new();
        for (name, shape) in config.parameter_shapes() {
            let numel = shape.iter().product::<usize>() as u64;
            params.register(name, numel, DeviceRole::Primary);
        }

        Self {
            config,
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            params,
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Serialize every weight in checkpoint layout.
    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let mut named: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        let mut push = |name: String, shape: Vec<usize>, data: &[f32]| {
            let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
            named.push((name, shape, bytes));
        };

        push("wte.weight".into(), vec![self.wte.rows, self.wte.cols], &self.wte.data);
        push("wpe.weight".into(), vec![self.wpe.rows, self.wpe.cols], &self.wpe.data);
        for (i, block) in self.blocks.iter().enumerate() {
            let p = format!("h.{}", i);
            for (name, norm) in [("ln_1", &block.ln_1), ("ln_2", &block.ln_2)] {
                push(format!("{}.{}.weight", p, name), vec![norm.gamma.len()], &norm.gamma.data);
                push(format!("{}.{}.bias", p, name), vec![norm.beta.len()], &norm.beta.data);
            }
            for (name, dense) in [
                ("attn.c_attn", &block.c_attn),
                ("attn.c_proj", &block.attn_proj),
                ("mlp.c_fc", &block.c_fc),
                ("mlp.c_proj", &block.mlp_proj),
            ] {
                push(
                    format!("{}.{}.weight", p, name),
                    vec![dense.weight.rows, dense.weight.cols],
                    &dense.weight.data,
                );
                push(format!("{}.{}.bias", p, name), vec![dense.bias.len()], &dense.bias.data);
            }
        }
        push("ln_f.weight".into(), vec![self.ln_f.gamma.len()], &self.ln_f.gamma.data);
        push("ln_f.bias".into(), vec![self.ln_f.beta.len()], &self.ln_f.beta.data);
        let head = self.lm_head.transpose();
        push("lm_head.weight".into(), vec![head.rows, head.cols], &head.data);

        let views = named
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .map(|view| (name.clone(), view))
                    .map_err(|e| EngineError::Serialization(format!("{}: {}", name, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        safetensors::serialize(views, &None)
            .map_err(|e| EngineError::Serialization(format!("safetensors: {}", e)))
    }

    fn home(&self, module: &str) -> Result<DeviceRole> {
        self.params.device_of(module).ok_or_else(|| {
            EngineError::Structure(format!("module '{}' is not on a single device", module))
        })
    }

    fn block_index(&self, module: &str) -> Option<usize> {
        module
            .strip_prefix("h.")?
            .parse::<usize>()
            .ok()
            .filter(|i| *i < self.blocks.len())
    }

    /// One transformer block. Each sub-layer runs where its parameters live and
    /// the residual joins it there.
    fn run_block(&self, idx: usize, x: Activation, route_to: &mut Router<'_>) -> Result<Activation> {
        let block = &self.blocks[idx];
        let eps = self.config.layer_norm_epsilon;

        let ln_1 = format!("h.{}.ln_1", idx);
        let attn = format!("h.{}.attn", idx);
        let ln_1_dev = self.home(&ln_1)?;
        let attn_dev = self.home(&attn)?;

        let x = route_to(x, ln_1_dev, &ln_1)?;
        let normed = layer_norm(&x.tensor, &block.ln_1.gamma, &block.ln_1.beta, eps)?;
        let normed = route_to(Activation::new(normed, ln_1_dev), attn_dev, &attn)?;
        let attended = self.attention(block, &normed.tensor)?;
        let residual = route_to(x, attn_dev, &attn)?;
        let x = Activation::new(residual.tensor.add(&attended)?, attn_dev);

        let ln_2 = format!("h.{}.ln_2", idx);
        let mlp = format!("h.{}.mlp", idx);
        let ln_2_dev = self.home(&ln_2)?;
        let mlp_dev = self.home(&mlp)?;

        let x = route_to(x, ln_2_dev, &ln_2)?;
        let normed = layer_norm(&x.tensor, &block.ln_2.gamma, &block.ln_2.beta, eps)?;
        let normed = route_to(Activation::new(normed, ln_2_dev), mlp_dev, &mlp)?;
        let hidden = block.mlp_proj.forward(&gelu(&block.c_fc.forward(&normed.tensor)?))?;
        let residual = route_to(x, mlp_dev, &mlp)?;

        Ok(Activation::new(residual.tensor.add(&hidden)?, mlp_dev))
    }

    /// Causal multi-head self-attention.
    fn attention(&self, block: &Block, x: &Tensor2D) -> Result<Tensor2D> {
        let n = self.config.n_embd;
        let heads = self.config.n_head;
        let d = n / heads;
        let seq = x.rows;
        let scale = 1.0 / (d as f32).sqrt();

        let qkv = block.c_attn.forward(x)?;
        let mut merged = vec![0.0f32; seq * n];

        for h in 0..heads {
            let q = qkv.column_slice(h * d, (h + 1) * d)?;
            let k = qkv.column_slice(n + h * d, n + (h + 1) * d)?;
            let v = qkv.column_slice(2 * n + h * d, 2 * n + (h + 1) * d)?;

            let mut scores = matmul(&q, &k.transpose())?;
            for i in 0..seq {
                for j in 0..seq {
                    let cell = &mut scores.data[i * seq + j];
                    *cell = if j > i { f32::NEG_INFINITY } else { *cell * scale };
                }
            }

            let out = matmul(&softmax(&scores), &v)?;
            for i in 0..seq {
                merged[i * n + h * d..i * n + (h + 1) * d].copy_from_slice(out.row(i));
            }
        }

        block.attn_proj.forward(&Tensor2D::new(merged, seq, n)?)
    }
}

/// Checkpoint tensors by name, consumed as the model is assembled.
#[derive(Default)]
struct WeightTable(HashMap<String, (Vec<usize>, Vec<f32>)>);

impl WeightTable {
    fn take(&mut self, name: &str, shape: &[usize]) -> Result<Vec<f32>> {
        let (found, data) = self
            .0
            .remove(name)
            .ok_or_else(|| EngineError::Load(format!("checkpoint is missing '{}'", name)))?;
        if found != shape {
            return Err(EngineError::Load(format!(
                "'{}' has shape {:?}, expected {:?}",
                name, found, shape
            )));
        }
        Ok(data)
    }

    fn matrix(&mut self, name: &str, rows: usize, cols: usize) -> Result<Tensor2D> {
        let data = self.take(name, &[rows, cols])?;
        Tensor2D::new(data, rows, cols)
    }

    fn vector(&mut self, name: &str, len: usize) -> Result<Tensor1D> {
        Ok(Tensor1D::new(self.take(name, &[len])?))
    }

    fn dense(&mut self, module: &str, inputs: usize, outputs: usize) -> Result<Dense> {
        Ok(Dense {
            weight: self.matrix(&format!("{}.weight", module), inputs, outputs)?,
            bias: self.vector(&format!("{}.bias", module), outputs)?,
        })
    }

    fn norm(&mut self, module: &str, len: usize) -> Result<Norm> {
        Ok(Norm {
            gamma: self.vector(&format!("{}.weight", module), len)?,
            beta: self.vector(&format!("{}.bias", module), len)?,
        })
    }
}

impl LanguageModel for ReferenceDecoder {
    fn family(&self) -> &str {
        "gpt2"
    }

    fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.params
    }

    fn children(&self) -> Vec<String> {
        let mut children = vec!["wte".to_string(), "wpe".to_string(), "drop".to_string()];
        children.extend((0..self.blocks.len()).map(|i| format!("h.{}", i)));
        children.push("ln_f".to_string());
        children.push("lm_head".to_string());
        children
    }

    fn architecture(&self) -> Architecture {
        Architecture::Decoder(DecoderLayout {
            embeddings: "wte".to_string(),
            pos_embeddings: Some("wpe".to_string()),
            layers: (0..self.blocks.len()).map(|i| format!("h.{}", i)).collect(),
            final_norm: "ln_f".to_string(),
            output_projection: "lm_head".to_string(),
        })
    }

    fn embed(&self, module: &str, indices: &[u32], device: DeviceRole) -> Result<Activation> {
        let table = match module {
            "wte" => &self.wte,
            "wpe" => &self.wpe,
            other => {
                return Err(EngineError::Structure(format!(
                    "'{}' is not an embedding module",
                    other
                )))
            }
        };
        ensure_on(&self.params, module, device)?;
        Ok(Activation::new(embed_tokens(table, indices)?, device))
    }

    fn forward_module(&self, module: &str, input: Activation) -> Result<Activation> {
        if let Some(idx) = self.block_index(module) {
            let mut strict = |act: Activation, to: DeviceRole, name: &str| {
                if act.device == to {
                    Ok(act)
                } else {
                    Err(EngineError::DeviceMismatch {
                        module: name.to_string(),
                        expected: to.to_string(),
                        found: act.device.to_string(),
                    })
                }
            };
            return self.run_block(idx, input, &mut strict);
        }

        match module {
            "ln_f" => {
                ensure_on(&self.params, module, input.device)?;
                let normed = layer_norm(
                    &input.tensor,
                    &self.ln_f.gamma,
                    &self.ln_f.beta,
                    self.config.layer_norm_epsilon,
                )?;
                Ok(Activation::new(normed, input.device))
            }
            "lm_head" => {
                ensure_on(&self.params, module, input.device)?;
                Ok(Activation::new(matmul(&input.tensor, &self.lm_head)?, input.device))
            }
            // Dropout is inactive at inference time.
            "drop" => Ok(input),
            "wte" | "wpe" => Err(EngineError::Structure(format!(
                "'{}' is an embedding lookup and takes indices",
                module
            ))),
            other => Err(EngineError::Structure(format!("unknown module '{}'", other))),
        }
    }

    fn forward_logits(&self, ids: &[u32], link: &dyn DeviceLink) -> Result<Tensor1D> {
        if ids.is_empty() {
            return Err(EngineError::Tensor("empty input sequence".to_string()));
        }

        let wte_dev = self.home("wte")?;
        let wpe_dev = self.home("wpe")?;
        let positions: Vec<u32> = (0..ids.len() as u32).collect();

        let tokens = Activation::new(embed_tokens(&self.wte, ids)?, wte_dev);
        let pos = Activation::new(embed_tokens(&self.wpe, &positions)?, wpe_dev);
        let pos = route(link, pos, wte_dev)?;
        let mut x = Activation::new(tokens.tensor.add(&pos.tensor)?, wte_dev);

        let mut routed = |act: Activation, to: DeviceRole, _module: &str| route(link, act, to);
        for idx in 0..self.blocks.len() {
            x = self.run_block(idx, x, &mut routed)?;
        }

        let ln_f_dev = self.home("ln_f")?;
        let x = route(link, x, ln_f_dev)?;
        let normed = layer_norm(
            &x.tensor,
            &self.ln_f.gamma,
            &self.ln_f.beta,
            self.config.layer_norm_epsilon,
        )?;

        let head_dev = self.home("lm_head")?;
        let last = route(link, Activation::new(normed.last_row()?, ln_f_dev), head_dev)?;
        let logits = matmul(&last.tensor, &self.lm_head)?;

        Ok(Tensor1D::new(logits.data))
    }
}
