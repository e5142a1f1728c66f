//! Scripted backend shared by the integration tests.
//!
//! Tokenizes one token per whitespace-separated word and, after the prompt,
//! "predicts" a fixed script of tokens followed by end-of-generation. Every
//! runtime, model and context transition is appended to an event log so
//! tests can check ordering.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use neural_gauge::inference::llama_ffi::{
    Backend, BackendContext, BackendModel, ContextParams, LlamaError, ModelParams, TokenId,
};

pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
pub const WORD: TokenId = 3;
pub const POISON: TokenId = 4;
pub const N_VOCAB: usize = 64;

pub type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    pub events: EventLog,
    /// Loadable paths and the weight size each one reports.
    models: Arc<Mutex<HashMap<PathBuf, u64>>>,
    script: Arc<Vec<(TokenId, String)>>,
}

impl ScriptedBackend {
    /// A backend whose models answer every prompt with `pieces`.
    pub fn new(pieces: &[&str]) -> Self {
        let script = pieces
            .iter()
            .enumerate()
            .map(|(i, p)| (10 + i as TokenId, p.to_string()))
            .collect();
        Self {
            events: EventLog::default(),
            models: Arc::default(),
            script: Arc::new(script),
        }
    }

    pub fn with_model(self, path: &str, size_bytes: u64) -> Self {
        self.models.lock().insert(PathBuf::from(path), size_bytes);
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    fn log(&self, event: String) {
        self.events.lock().push(event);
    }
}

pub struct ScriptedModel {
    name: String,
    size_bytes: u64,
    script: Arc<Vec<(TokenId, String)>>,
    events: EventLog,
}

pub struct ScriptedContext {
    name: String,
    n_ctx: u32,
    filled: u32,
    steps: usize,
    logits: Vec<f32>,
    script: Arc<Vec<(TokenId, String)>>,
    events: EventLog,
}

impl Backend for ScriptedBackend {
    type Model = ScriptedModel;
    type Context = ScriptedContext;

    fn init(&self) {
        self.log("init".into());
    }

    fn free(&self) {
        self.log("free".into());
    }

    fn load_model(&self, path: &Path, _params: &ModelParams) -> Result<ScriptedModel, LlamaError> {
        let size_bytes = self
            .models
            .lock()
            .get(path)
            .copied()
            .ok_or_else(|| LlamaError::ModelLoadFailed(format!("no such model {}", path.display())))?;

        let name = path.display().to_string();
        self.log(format!("load_model {name}"));
        Ok(ScriptedModel {
            name,
            size_bytes,
            script: self.script.clone(),
            events: self.events.clone(),
        })
    }

    fn new_context(
        &self,
        model: &ScriptedModel,
        params: &ContextParams,
    ) -> Result<ScriptedContext, LlamaError> {
        if params.n_ctx == 0 {
            return Err(LlamaError::ContextFailed("n_ctx must be positive".into()));
        }
        self.log(format!("new_context {}", model.name));
        Ok(ScriptedContext {
            name: model.name.clone(),
            n_ctx: params.n_ctx,
            filled: 0,
            steps: 0,
            logits: Vec::new(),
            script: model.script.clone(),
            events: self.events.clone(),
        })
    }
}

impl BackendModel for ScriptedModel {
    fn n_vocab(&self) -> usize {
        N_VOCAB
    }

    fn tokenize(&self, text: &str, add_bos: bool, _special: bool) -> Result<Vec<TokenId>, LlamaError> {
        if text.contains('\0') {
            return Err(LlamaError::TokenizeFailed("interior NUL".into()));
        }
        let mut tokens: Vec<TokenId> = Vec::new();
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(
            text.split_whitespace()
                .map(|word| if word == "boom" { POISON } else { WORD }),
        );
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<String, LlamaError> {
        match token {
            BOS | EOS => Ok(String::new()),
            WORD => Ok("w".into()),
            POISON => Ok("boom".into()),
            _ => self
                .script
                .iter()
                .find(|(id, _)| *id == token)
                .map(|(_, piece)| piece.clone())
                .ok_or_else(|| LlamaError::PieceFailed {
                    token,
                    reason: "not in script".into(),
                }),
        }
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.events.lock().push(format!("drop_model {}", self.name));
    }
}

impl BackendContext for ScriptedContext {
    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn decode(&mut self, tokens: &[TokenId], pos: u32) -> Result<(), LlamaError> {
        self.events
            .lock()
            .push(format!("decode {}@{pos}", tokens.len()));

        if tokens.contains(&POISON) {
            return Err(LlamaError::DecodeFailed("poisoned batch".into()));
        }
        if pos != self.filled || pos as usize + tokens.len() > self.n_ctx as usize {
            return Err(LlamaError::DecodeFailed(format!(
                "batch of {} at {pos} does not fit",
                tokens.len()
            )));
        }

        self.filled += tokens.len() as u32;
        let next = if pos == 0 {
            self.steps = 0;
            self.script.first()
        } else {
            self.steps += 1;
            self.script.get(self.steps)
        };

        self.logits = vec![0.0; N_VOCAB];
        let target = next.map_or(EOS, |(id, _)| *id);
        self.logits[target as usize] = 1.0;
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn kv_cache_clear(&mut self) {
        self.filled = 0;
        self.logits.clear();
    }

    fn state_size(&self) -> usize {
        self.n_ctx as usize * 1024
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.events.lock().push(format!("drop_context {}", self.name));
    }
}
